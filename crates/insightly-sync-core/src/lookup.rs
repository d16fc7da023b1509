//! Name columns for related records, e.g. the organisation behind an
//! opportunity's `ORGANISATION_ID`.

use std::collections::HashSet;

use serde_json::Value;
use tracing::debug;

use crate::api::{InsightlyClient, Record};
use crate::config::ExportSettings;
use crate::export::field_value;

/// Id as the API addresses it, or `None` for blanks
fn related_id(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

/// Append every lookup column configured for `entity` to `records`.
///
/// Records without an id get an empty name, so the column exists on every
/// row.
pub async fn add_lookup_columns(
    client: &InsightlyClient,
    entity: &str,
    records: &mut [Record],
    settings: &ExportSettings,
) {
    for lookup in settings.lookups.iter().filter(|l| l.applies_to(entity)) {
        let ids: Vec<Option<String>> = records
            .iter()
            .map(|record| field_value(record, &lookup.field).and_then(related_id))
            .collect();
        let unique: HashSet<String> = ids.iter().flatten().cloned().collect();
        debug!(entity, field = %lookup.field, related = unique.len(), "Resolving lookup column");

        let names = client
            .lookup_names(&lookup.entity, unique, &lookup.name_fields, settings.max_concurrent_lookups)
            .await;

        for (record, id) in records.iter_mut().zip(ids) {
            let name = id.and_then(|id| names.get(&id).cloned()).unwrap_or_default();
            record.insert(lookup.column.clone(), Value::String(name));
        }
    }
}
