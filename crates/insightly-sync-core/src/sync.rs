//! One sync run: export Insightly entities, then deliver them to Microsoft 365.
//!
//! The two targets fail independently. An Insightly failure still lets the
//! Graph target authenticate and resolve its folders, and a Graph failure
//! never discards what was exported. The outcome of each is reported in
//! [`SyncResult`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::api::{ApiError, DriveItem, GraphClient, InsightlyClient};
use crate::auth::{AuthenticationError, TokenCache, TokenRefresher};
use crate::config::{Config, CredentialSet, SyncSettings};
use crate::export::{export_records, ExportError, ExportFile};
use crate::lookup::add_lookup_columns;

/// HTTP request timeout in seconds.
/// Large Insightly pages can take close to a minute.
const REQUEST_TIMEOUT_SECS: u64 = 60;

const CONNECT_TIMEOUT_SECS: u64 = 10;

const USER_AGENT: &str = concat!("insightly-sync/", env!("CARGO_PKG_VERSION"));

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Authentication(#[from] AuthenticationError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error("Failed to read export {}: {source}", path.display())]
    ReadExport {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of one target
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TargetStatus {
    Succeeded { detail: String },
    Failed { error: String },
}

impl TargetStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, TargetStatus::Succeeded { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub insightly: TargetStatus,
    pub graph: TargetStatus,
    /// Export files delivered to every configured folder
    pub uploaded: Vec<String>,
    /// Directory holding this run's exports. Removed once everything in it
    /// was uploaded.
    pub export_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncResult {
    pub fn is_success(&self) -> bool {
        self.insightly.is_success() && self.graph.is_success()
    }

    pub fn all_failed(&self) -> bool {
        !self.insightly.is_success() && !self.graph.is_success()
    }
}

/// What the Insightly side produced, including per-entity failures
struct InsightlyOutcome {
    exports: Vec<ExportFile>,
    failures: Vec<(String, SyncError)>,
}

pub struct SyncClient {
    settings: SyncSettings,
    tokens: TokenCache,
    graph: GraphClient,
    insightly: InsightlyClient,
    /// Distinguishes runs started within the same millisecond
    runs: AtomicU64,
}

impl SyncClient {
    /// Build a client with the default HTTP stack
    pub fn new(config: Config) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self::with_http_client(config, client))
    }

    /// Build a client sharing an existing connection pool
    pub fn with_http_client(config: Config, client: Client) -> Self {
        let Config { credentials, settings } = config;
        let credentials: Arc<CredentialSet> = Arc::new(credentials);

        let refresher = TokenRefresher::new(client.clone(), &settings, &credentials.tenant_id);
        let graph = GraphClient::new(client.clone(), &settings.graph_base_url);
        let insightly = InsightlyClient::new(client, &settings.insightly_base_url, credentials.api_key.clone())
            .with_paging(settings.page_size, settings.max_concurrent_pages);
        let tokens = TokenCache::new(refresher, credentials);

        Self {
            settings,
            tokens,
            graph,
            insightly,
            runs: AtomicU64::new(0),
        }
    }

    pub fn tokens(&self) -> &TokenCache {
        &self.tokens
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Run both targets and report each outcome. Never fails as a whole.
    pub async fn sync(&self) -> SyncResult {
        let started_at = Utc::now();
        let export_dir = self.run_dir(started_at);
        info!(entities = ?self.settings.entities, export_dir = %export_dir.display(), "Sync starting");

        let outcome = self.run_insightly(&export_dir).await;
        let insightly = if outcome.failures.is_empty() {
            TargetStatus::Succeeded {
                detail: format!(
                    "Exported {} of {} entities ({} rows)",
                    outcome.exports.len(),
                    self.settings.entities.len(),
                    outcome.exports.iter().map(|e| e.rows).sum::<usize>()
                ),
            }
        } else {
            TargetStatus::Failed {
                error: outcome
                    .failures
                    .iter()
                    .map(|(entity, e)| format!("{}: {}", entity, e))
                    .collect::<Vec<_>>()
                    .join("; "),
            }
        };

        let (graph, uploaded) = match self.run_graph(&outcome.exports).await {
            Ok((detail, uploaded)) => (TargetStatus::Succeeded { detail }, uploaded),
            Err((e, uploaded)) => {
                error!(error = %e, "Graph target failed");
                // Graph refused a token we still consider valid
                if matches!(e, SyncError::Api(ApiError::Unauthorized(_))) {
                    self.tokens.invalidate().await;
                }
                (TargetStatus::Failed { error: e.to_string() }, uploaded)
            }
        };

        if let Err(e) = tokio::fs::remove_dir(&export_dir).await {
            // Still holds exports that were not delivered, or was never created
            debug!(path = %export_dir.display(), error = %e, "Export directory kept");
        }

        let result = SyncResult {
            insightly,
            graph,
            uploaded,
            export_dir,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            insightly_ok = result.insightly.is_success(),
            graph_ok = result.graph.is_success(),
            uploaded = result.uploaded.len(),
            elapsed_ms = (result.finished_at - started_at).num_milliseconds(),
            "Sync finished"
        );
        result
    }

    /// Each run writes into its own directory so concurrent runs on a
    /// shared client never touch each other's files.
    fn run_dir(&self, started_at: DateTime<Utc>) -> PathBuf {
        let seq = self.runs.fetch_add(1, Ordering::Relaxed);
        self.settings.output_dir().join(format!(
            "insightly-sync-{}-{}-{}",
            started_at.format("%Y%m%dT%H%M%S%3f"),
            std::process::id(),
            seq
        ))
    }

    async fn run_insightly(&self, dir: &Path) -> InsightlyOutcome {
        let mut exports = Vec::new();
        let mut failures = Vec::new();

        for entity in &self.settings.entities {
            match self.export_entity(entity, dir).await {
                Ok(Some(file)) => exports.push(file),
                Ok(None) => {}
                Err(e) => {
                    error!(entity = %entity, error = %e, "Insightly export failed");
                    failures.push((entity.clone(), e));
                }
            }
        }

        InsightlyOutcome { exports, failures }
    }

    async fn export_entity(&self, entity: &str, dir: &Path) -> Result<Option<ExportFile>, SyncError> {
        let mut records = self.insightly.fetch_all(entity).await?;
        add_lookup_columns(&self.insightly, entity, &mut records, &self.settings.export).await;
        Ok(export_records(entity, &records, dir, &self.settings.export)?)
    }

    /// Graph side. On error, also returns what was uploaded before it.
    async fn run_graph(&self, exports: &[ExportFile]) -> Result<(String, Vec<String>), (SyncError, Vec<String>)> {
        let token = self
            .tokens
            .access_token()
            .await
            .map_err(|e| (SyncError::from(e), Vec::new()))?;

        if self.settings.share_links.is_empty() {
            let user = self
                .graph
                .me(&token.value)
                .await
                .map_err(|e| (SyncError::from(e), Vec::new()))?;
            warn!("No share links configured, exports are not uploaded");
            return Ok((
                format!(
                    "Authenticated as {}; no share links configured",
                    user.user_principal_name.or(user.display_name).unwrap_or(user.id)
                ),
                Vec::new(),
            ));
        }

        let mut folders: Vec<DriveItem> = Vec::new();
        for link in &self.settings.share_links {
            let folder = self
                .graph
                .resolve_share(&token.value, link)
                .await
                .map_err(|e| (SyncError::from(e), Vec::new()))?;
            folders.push(folder);
        }

        if exports.is_empty() {
            info!(folders = folders.len(), "Nothing to upload");
            return Ok((
                format!("Resolved {} folder(s); nothing to upload", folders.len()),
                Vec::new(),
            ));
        }

        let mut uploaded = Vec::new();
        let mut first_error: Option<SyncError> = None;
        for export in exports {
            match self.upload_export(&token.value, &folders, export).await {
                Ok(()) => {
                    uploaded.push(export.file_name());
                    if let Err(e) = tokio::fs::remove_file(&export.path).await {
                        warn!(path = %export.path.display(), error = %e, "Failed to remove uploaded export");
                    }
                }
                Err(e) => {
                    error!(file = %export.file_name(), error = %e, "Upload failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err((e, uploaded)),
            None => Ok((
                format!("Uploaded {} file(s) to {} folder(s)", uploaded.len(), folders.len()),
                uploaded,
            )),
        }
    }

    async fn upload_export(&self, token: &str, folders: &[DriveItem], export: &ExportFile) -> Result<(), SyncError> {
        let contents = tokio::fs::read(&export.path)
            .await
            .map_err(|source| SyncError::ReadExport {
                path: export.path.clone(),
                source,
            })?;
        let file_name = export.file_name();
        for folder in folders {
            self.graph
                .upload_into_folder(token, folder, &file_name, contents.clone())
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_status_serializes_with_tag() {
        let ok = serde_json::to_value(TargetStatus::Succeeded { detail: "done".into() }).unwrap();
        assert_eq!(ok, serde_json::json!({"status": "succeeded", "detail": "done"}));
        let failed = serde_json::to_value(TargetStatus::Failed { error: "boom".into() }).unwrap();
        assert_eq!(failed, serde_json::json!({"status": "failed", "error": "boom"}));
    }

    #[test]
    fn test_run_dirs_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            credentials: CredentialSet {
                client_id: "c".to_string(),
                tenant_id: "t".to_string(),
                refresh_token: "r".to_string(),
                api_key: "k".to_string(),
                client_secret: None,
            },
            settings: SyncSettings {
                output_dir: Some(dir.path().to_path_buf()),
                ..SyncSettings::default()
            },
        };
        let client = SyncClient::with_http_client(config, Client::new());
        let now = Utc::now();
        let first = client.run_dir(now);
        let second = client.run_dir(now);
        assert_ne!(first, second);
        assert!(first.starts_with(dir.path()));
    }

    #[test]
    fn test_result_flags() {
        let now = Utc::now();
        let mut result = SyncResult {
            insightly: TargetStatus::Succeeded { detail: String::new() },
            graph: TargetStatus::Failed { error: "x".into() },
            uploaded: Vec::new(),
            export_dir: PathBuf::new(),
            started_at: now,
            finished_at: now,
        };
        assert!(!result.is_success());
        assert!(!result.all_failed());
        result.insightly = TargetStatus::Failed { error: "y".into() };
        assert!(result.all_failed());
    }
}
