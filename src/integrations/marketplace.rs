use serde_json::{Value, json};
use tracing::info;

use super::AssetRef;
use crate::{bridge::Bridge, errors::ToolError};

const SEARCH_COUNT: u32 = 10;

/// Marketplace search: take the best downloadable hit for the query,
/// download it, and let the host import it.
pub struct MarketplaceAdapter {
    bridge: Bridge,
}

impl MarketplaceAdapter {
    pub fn new(bridge: Bridge) -> Self {
        Self { bridge }
    }

    pub async fn search_and_import(&self, query: &str) -> Result<AssetRef, ToolError> {
        let found = self
            .bridge
            .send(
                "search_sketchfab_models",
                json!({ "query": query, "count": SEARCH_COUNT, "downloadable": true }),
            )
            .await?;

        let (uid, name) = pick_downloadable(&found).ok_or(ToolError::NoAssetFound)?;
        info!(query, model = %name, "downloading marketplace model");

        self.bridge
            .send("download_sketchfab_model", json!({ "uid": uid }))
            .await
            .map_err(|e| match e {
                crate::errors::BridgeError::Remote(msg) => ToolError::ImportFailed(msg),
                other => other.into(),
            })?;

        Ok(AssetRef {
            name,
            source: "marketplace",
            asset_type: "model".to_string(),
        })
    }
}

/// First hit that is actually downloadable; catalog hits without a uid
/// are unusable and skipped.
fn pick_downloadable(found: &Value) -> Option<(String, String)> {
    let results = found
        .get("results")
        .and_then(Value::as_array)
        .or_else(|| found.as_array())?;
    results.iter().find_map(|hit| {
        let downloadable = hit
            .get("isDownloadable")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !downloadable {
            return None;
        }
        let uid = hit.get("uid").and_then(Value::as_str)?;
        let name = hit
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(uid)
            .to_string();
        Some((uid.to_string(), name))
    })
}
