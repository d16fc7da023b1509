//! Core library for insightly-sync.
//!
//! Loads credentials, keeps a Microsoft identity access token fresh, and
//! moves Insightly CRM exports (Excel workbooks) into a OneDrive/SharePoint folder via
//! Microsoft Graph.
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use insightly_sync_core::{Config, SyncClient};
//!
//! let config = Config::load(Config::default_path().as_deref())?;
//! let client = SyncClient::new(config)?;
//! let result = client.sync().await;
//! println!("{}", serde_json::to_string_pretty(&result)?);
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod export;
pub mod lookup;
pub mod sync;
pub mod utils;

pub use api::ApiError;
pub use auth::{AccessToken, AuthenticationError, TokenCache, TokenRefresher};
pub use config::{Config, ConfigurationError, CredentialSet, ExportSettings, LookupColumn, SyncSettings};
pub use export::{ExportError, ExportFile};
pub use sync::{SyncClient, SyncError, SyncResult, TargetStatus};
