//! Microsoft Graph calls used by the sync: resolve a OneDrive/SharePoint
//! folder from its share link, and upload files into it.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::ApiError;

/// Graph addresses a sharing URL as `u!` + unpadded base64url of the URL.
pub fn encode_share_url(share_url: &str) -> String {
    format!("u!{}", URL_SAFE_NO_PAD.encode(share_url.as_bytes()))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ItemReference {
    #[serde(default)]
    pub drive_id: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriveItem {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub web_url: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub parent_reference: Option<ItemReference>,
}

impl DriveItem {
    /// Drive holding this item, as reported by its parent reference
    pub fn drive_id(&self) -> Option<&str> {
        self.parent_reference
            .as_ref()
            .and_then(|p| p.drive_id.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphUser {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub user_principal_name: Option<String>,
}

#[derive(Clone)]
pub struct GraphClient {
    client: Client,
    base_url: String,
}

impl GraphClient {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| ApiError::InvalidResponse(format!("Invalid Graph base URL {}: {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidResponse(format!("Graph base URL {} cannot hold a path", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Signed-in user; a cheap call proving the token works
    pub async fn me(&self, token: &str) -> Result<GraphUser, ApiError> {
        let response = self
            .client
            .get(self.url(&["me"])?)
            .bearer_auth(token)
            .send()
            .await?;
        let response = ApiError::check(response).await?;
        let text = response.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse user: {}", e)))
    }

    /// Resolve a share link to the drive item (folder) it points at
    pub async fn resolve_share(&self, token: &str, share_url: &str) -> Result<DriveItem, ApiError> {
        let share_id = encode_share_url(share_url);
        debug!(share_id = %share_id, "Resolving share link");

        let response = self
            .client
            .get(self.url(&["shares", share_id.as_str(), "driveItem"])?)
            .bearer_auth(token)
            .send()
            .await?;
        let response = ApiError::check(response).await?;
        let text = response.text().await?;
        let item: DriveItem = serde_json::from_str(&text)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse drive item: {}", e)))?;

        info!(
            name = item.name.as_deref().unwrap_or(""),
            item_id = %item.id,
            drive_id = item.drive_id().unwrap_or(""),
            "Shared folder resolved"
        );
        Ok(item)
    }

    /// Create or replace `file_name` inside `folder`.
    ///
    /// Simple upload, suitable for files up to 250 MB.
    pub async fn upload_into_folder(
        &self,
        token: &str,
        folder: &DriveItem,
        file_name: &str,
        contents: Vec<u8>,
    ) -> Result<DriveItem, ApiError> {
        let drive_id = folder.drive_id().ok_or_else(|| {
            ApiError::InvalidResponse(format!("Folder {} has no parent drive id", folder.id))
        })?;

        let item_segment = format!("{}:", folder.id);
        let name_segment = format!("{}:", file_name);
        let url = self.url(&["drives", drive_id, "items", item_segment.as_str(), name_segment.as_str(), "content"])?;

        let size = contents.len();
        let response = self
            .client
            .put(url)
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(contents)
            .send()
            .await?;
        let response = ApiError::check(response).await?;
        let text = response.text().await?;
        let item: DriveItem = serde_json::from_str(&text)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse uploaded item: {}", e)))?;

        info!(file = file_name, bytes = size, item_id = %item.id, "Uploaded file");
        Ok(item)
    }
}
