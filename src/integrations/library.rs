use serde_json::{Value, json};
use tracing::info;

use super::AssetRef;
use crate::{bridge::Bridge, errors::ToolError};

/// Asset classes the public library serves, with sensible download
/// defaults per class. HDRIs want the HDR format; textures come as
/// tiling JPG sets; models arrive as glTF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibraryAssetType {
    Models,
    Textures,
    Hdris,
}

impl LibraryAssetType {
    pub fn wire_name(self) -> &'static str {
        match self {
            LibraryAssetType::Models => "models",
            LibraryAssetType::Textures => "textures",
            LibraryAssetType::Hdris => "hdris",
        }
    }

    fn download_defaults(self) -> (&'static str, &'static str) {
        match self {
            LibraryAssetType::Models => ("2k", "gltf"),
            LibraryAssetType::Textures => ("2k", "jpg"),
            LibraryAssetType::Hdris => ("2k", "hdr"),
        }
    }
}

/// Free asset library: search within one asset class and download the
/// first match with class-appropriate defaults.
pub struct LibraryAdapter {
    bridge: Bridge,
}

impl LibraryAdapter {
    pub fn new(bridge: Bridge) -> Self {
        Self { bridge }
    }

    pub async fn search_and_import(
        &self,
        query: &str,
        asset_type: LibraryAssetType,
    ) -> Result<AssetRef, ToolError> {
        let stripped = strip_category_keywords(query);
        let found = self
            .bridge
            .send(
                "search_polyhaven_assets",
                json!({ "query": stripped, "asset_type": asset_type.wire_name() }),
            )
            .await?;

        let (id, name) = first_asset(&found).ok_or(ToolError::NoAssetFound)?;
        let (resolution, file_format) = asset_type.download_defaults();
        info!(query = %stripped, asset = %id, "downloading library asset");

        self.bridge
            .send(
                "download_polyhaven_asset",
                json!({
                    "asset_id": id,
                    "asset_type": asset_type.wire_name(),
                    "resolution": resolution,
                    "file_format": file_format,
                }),
            )
            .await
            .map_err(|e| match e {
                crate::errors::BridgeError::Remote(msg) => ToolError::ImportFailed(msg),
                other => other.into(),
            })?;

        Ok(AssetRef {
            name,
            source: "library",
            asset_type: asset_type.wire_name().to_string(),
        })
    }
}

/// The library indexes by subject, not by category words, so "wood
/// texture" should search as "wood".
fn strip_category_keywords(query: &str) -> String {
    const CATEGORY_WORDS: &[&str] = &[
        "texture", "textures", "material", "materials", "hdri", "hdris", "environment",
        "model", "models", "asset", "assets", "map", "background",
    ];
    let kept: Vec<&str> = query
        .split_whitespace()
        .filter(|w| {
            let lowered = w.to_lowercase();
            !CATEGORY_WORDS.contains(&lowered.as_str())
        })
        .collect();
    if kept.is_empty() {
        query.trim().to_string()
    } else {
        kept.join(" ")
    }
}

/// The library answers either a keyed map of assets or a plain array.
fn first_asset(found: &Value) -> Option<(String, String)> {
    if let Some(map) = found.get("assets").and_then(Value::as_object) {
        let (id, entry) = map.iter().next()?;
        let name = entry
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(id)
            .to_string();
        return Some((id.clone(), name));
    }
    if let Some(list) = found.get("assets").and_then(Value::as_array).or_else(|| found.as_array()) {
        let entry = list.first()?;
        let id = entry.get("id").and_then(Value::as_str)?;
        let name = entry
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(id)
            .to_string();
        return Some((id.to_string(), name));
    }
    None
}
