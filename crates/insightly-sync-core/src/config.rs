//! Configuration loading.
//!
//! Secrets come from a YAML file (`env.yaml` by default) and from the process
//! environment. A non-empty environment variable always wins over the file, so
//! local development can use the file while the function host injects the
//! same keys as app settings.
//!
//! ```yaml
//! CLIENT_ID: 00000000-0000-0000-0000-000000000000
//! TENANT_ID: contoso.onmicrosoft.com
//! REFRESH_TOKEN: 0.AAAA...
//! INSIGHTLY_API_KEY: abcd-1234
//! settings:
//!   share_links:
//!     - https://contoso.sharepoint.com/:f:/s/Team/Eggs...
//!   entities: [Organisations, Opportunities]
//!   export:
//!     date_format: "%m/%d/%Y"
//!     lookups:
//!       - field: ORGANISATION_ID
//!         entity: Organisations
//!         name_fields: [ORGANISATION_NAME]
//!         column: Organisation Name
//!         applies_to: [Opportunities]
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::format::{Item, StrftimeItems};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::utils::redact;

/// Application name used for the fallback config directory
const APP_NAME: &str = "insightly-sync";

/// Config file name, matching what the function app ships with
pub const CONFIG_FILE: &str = "env.yaml";

pub const CLIENT_ID: &str = "CLIENT_ID";
pub const TENANT_ID: &str = "TENANT_ID";
pub const REFRESH_TOKEN: &str = "REFRESH_TOKEN";
pub const INSIGHTLY_API_KEY: &str = "INSIGHTLY_API_KEY";
pub const CLIENT_SECRET: &str = "CLIENT_SECRET";

/// Keys that must resolve to a non-empty value.
pub const REQUIRED_KEYS: [&str; 4] = [CLIENT_ID, TENANT_ID, REFRESH_TOKEN, INSIGHTLY_API_KEY];

pub const DEFAULT_INSIGHTLY_BASE_URL: &str = "https://api.na1.insightly.com/v3.1";
pub const DEFAULT_GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";
pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

/// Insightly timestamps reformatted in exports unless configured otherwise
pub const DEFAULT_DATE_COLUMNS: [&str; 2] = ["DATE_CREATED_UTC", "DATE_UPDATED_UTC"];

/// e.g. `05-Mar-24 2:07 PM`
pub const DEFAULT_DATE_FORMAT: &str = "%d-%b-%y %-I:%M %p";

/// Parallel single-record requests when resolving lookup columns.
const DEFAULT_MAX_CONCURRENT_LOOKUPS: usize = 10;

/// Insightly caps `top` at 500 records per page.
const DEFAULT_PAGE_SIZE: usize = 500;

/// Parallel page requests per entity.
const DEFAULT_MAX_CONCURRENT_PAGES: usize = 10;

#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Missing required configuration: {}", .0.join(", "))]
    MissingKeys(Vec<String>),

    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid setting `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// The four required secrets plus the optional confidential-client secret.
///
/// Loaded once at startup and never mutated afterwards.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialSet {
    pub client_id: String,
    pub tenant_id: String,
    pub refresh_token: String,
    pub api_key: String,
    pub client_secret: Option<String>,
}

impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSet")
            .field("client_id", &self.client_id)
            .field("tenant_id", &self.tenant_id)
            .field("refresh_token", &redact(&self.refresh_token))
            .field("api_key", &redact(&self.api_key))
            .field("client_secret", &self.client_secret.as_deref().map(redact))
            .finish()
    }
}

/// Non-secret knobs. Everything has a default, so the section may be omitted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncSettings {
    pub insightly_base_url: String,
    pub graph_base_url: String,
    pub authority_host: String,
    pub scopes: Vec<String>,
    /// OneDrive/SharePoint folder share URLs that receive the exports
    pub share_links: Vec<String>,
    /// Insightly endpoints to export, e.g. `Organisations`
    pub entities: Vec<String>,
    pub output_dir: Option<PathBuf>,
    pub page_size: usize,
    pub max_concurrent_pages: usize,
    pub export: ExportSettings,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            insightly_base_url: DEFAULT_INSIGHTLY_BASE_URL.to_string(),
            graph_base_url: DEFAULT_GRAPH_BASE_URL.to_string(),
            authority_host: DEFAULT_AUTHORITY_HOST.to_string(),
            scopes: vec![
                "https://graph.microsoft.com/.default".to_string(),
                "offline_access".to_string(),
            ],
            share_links: Vec::new(),
            entities: vec!["Organisations".to_string(), "Opportunities".to_string()],
            output_dir: None,
            page_size: DEFAULT_PAGE_SIZE,
            max_concurrent_pages: DEFAULT_MAX_CONCURRENT_PAGES,
            export: ExportSettings::default(),
        }
    }
}

/// How records are shaped into workbook columns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExportSettings {
    /// Columns holding Insightly timestamps (`YYYY-MM-DD HH:MM:SS`)
    pub date_columns: Vec<String>,
    /// chrono `strftime` pattern applied to `date_columns`
    pub date_format: String,
    pub lookups: Vec<LookupColumn>,
    pub max_concurrent_lookups: usize,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            date_columns: DEFAULT_DATE_COLUMNS.iter().map(|c| c.to_string()).collect(),
            date_format: DEFAULT_DATE_FORMAT.to_string(),
            lookups: Vec::new(),
            max_concurrent_lookups: DEFAULT_MAX_CONCURRENT_LOOKUPS,
        }
    }
}

/// Adds a column holding the display name of a related record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LookupColumn {
    /// Field holding the related id. Custom field names are accepted too.
    pub field: String,
    /// Entity the id points at, e.g. `Contacts`
    pub entity: String,
    /// Joined with a space to form the name
    pub name_fields: Vec<String>,
    /// Header of the added column
    pub column: String,
    /// Source entities this applies to; empty means every entity
    #[serde(default)]
    pub applies_to: Vec<String>,
}

impl LookupColumn {
    pub fn applies_to(&self, entity: &str) -> bool {
        self.applies_to.is_empty() || self.applies_to.iter().any(|e| e == entity)
    }
}

impl SyncSettings {
    /// Directory exports are written to before upload
    pub fn output_dir(&self) -> PathBuf {
        self.output_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.page_size == 0 {
            return Err(ConfigurationError::Invalid {
                key: "page_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.max_concurrent_pages == 0 {
            return Err(ConfigurationError::Invalid {
                key: "max_concurrent_pages",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.export.max_concurrent_lookups == 0 {
            return Err(ConfigurationError::Invalid {
                key: "export.max_concurrent_lookups",
                reason: "must be greater than zero".to_string(),
            });
        }
        if StrftimeItems::new(&self.export.date_format).any(|item| matches!(item, Item::Error)) {
            return Err(ConfigurationError::Invalid {
                key: "export.date_format",
                reason: format!("`{}` is not a valid date format", self.export.date_format),
            });
        }
        if self.scopes.iter().all(|s| s.trim().is_empty()) {
            return Err(ConfigurationError::Invalid {
                key: "scopes",
                reason: "at least one scope is required".to_string(),
            });
        }
        Ok(())
    }
}

/// On-disk shape of `env.yaml`.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(flatten)]
    secrets: HashMap<String, serde_yaml::Value>,
    #[serde(default)]
    settings: Option<SyncSettings>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub credentials: CredentialSet,
    pub settings: SyncSettings,
}

impl Config {
    /// Load from `path` (if it exists) and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// Load using a custom environment lookup.
    pub fn load_with<F>(path: Option<&Path>, env: F) -> Result<Self, ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file = match path {
            Some(path) if path.exists() => {
                debug!(path = %path.display(), "Reading config file");
                Self::read_file(path)?
            }
            Some(path) => {
                debug!(path = %path.display(), "Config file not found, using environment only");
                ConfigFile::default()
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file, env)
    }

    /// Parse YAML text directly. Mostly useful for tests and embedded configs.
    pub fn from_yaml_str<F>(yaml: &str, env: F) -> Result<Self, ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file = Self::parse(yaml, Path::new("<inline>"))?;
        Self::resolve(file, env)
    }

    /// First existing candidate: `./env.yaml`, then the user config dir.
    pub fn default_path() -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILE);
        if local.exists() {
            return Some(local);
        }
        dirs::config_dir()
            .map(|dir| dir.join(APP_NAME).join(CONFIG_FILE))
            .filter(|path| path.exists())
    }

    fn read_file(path: &Path) -> Result<ConfigFile, ConfigurationError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigurationError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents, path)
    }

    fn parse(contents: &str, path: &Path) -> Result<ConfigFile, ConfigurationError> {
        let parse_err = |source| ConfigurationError::Parse {
            path: path.to_path_buf(),
            source,
        };
        // Blank and comment-only files are a null document, not a map
        let document: serde_yaml::Value = serde_yaml::from_str(contents).map_err(parse_err)?;
        if document.is_null() {
            return Ok(ConfigFile::default());
        }
        serde_yaml::from_value(document).map_err(parse_err)
    }

    fn resolve<F>(file: ConfigFile, env: F) -> Result<Self, ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| -> Option<String> {
            env(key)
                .filter(|v| !v.trim().is_empty())
                .or_else(|| file.secrets.get(key).and_then(yaml_scalar))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut values: HashMap<&str, String> = HashMap::new();
        let mut missing = Vec::new();
        for key in REQUIRED_KEYS {
            match lookup(key) {
                Some(value) => {
                    values.insert(key, value);
                }
                None => missing.push(key.to_string()),
            }
        }
        if !missing.is_empty() {
            return Err(ConfigurationError::MissingKeys(missing));
        }

        let mut take = |key: &str| values.remove(key).unwrap_or_default();
        let credentials = CredentialSet {
            client_id: take(CLIENT_ID),
            tenant_id: take(TENANT_ID),
            refresh_token: take(REFRESH_TOKEN),
            api_key: take(INSIGHTLY_API_KEY),
            client_secret: lookup(CLIENT_SECRET),
        };

        let settings = file.settings.unwrap_or_default();
        settings.validate()?;

        debug!(
            tenant_id = %credentials.tenant_id,
            confidential = credentials.client_secret.is_some(),
            entities = settings.entities.len(),
            share_links = settings.share_links.len(),
            "Configuration loaded"
        );

        Ok(Self {
            credentials,
            settings,
        })
    }
}

/// YAML scalars may come through as numbers or booleans; treat them as text.
fn yaml_scalar(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
