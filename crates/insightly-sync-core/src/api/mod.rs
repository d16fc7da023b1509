//! REST API clients for the two sync targets.
//!
//! - `InsightlyClient`: paged reads from the Insightly CRM, authenticated
//!   with the static API key
//! - `GraphClient`: OneDrive/SharePoint share resolution and uploads through
//!   Microsoft Graph, authenticated with a bearer access token

pub mod error;
pub mod graph;
pub mod insightly;

pub use error::ApiError;
pub use graph::{encode_share_url, DriveItem, GraphClient, GraphUser};
pub use insightly::{InsightlyClient, Record};
