pub mod breaker;
pub mod generator;
pub mod library;
pub mod marketplace;

use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::{bridge::Bridge, errors::ToolError};
use breaker::CircuitBreaker;
use generator::GeneratorAdapter;
use library::{LibraryAdapter, LibraryAssetType};
use marketplace::MarketplaceAdapter;

/// Handle to an asset that has been imported into the scene.
#[derive(Debug, Clone, Serialize)]
pub struct AssetRef {
    pub name: String,
    #[serde(rename = "type")]
    pub source: &'static str,
    #[serde(rename = "assetType")]
    pub asset_type: String,
}

/// Which acquisition services the remote host currently has enabled.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct IntegrationStatus {
    pub generator: bool,
    pub marketplace: bool,
    pub library: bool,
}

impl IntegrationStatus {
    pub fn any_enabled(&self) -> bool {
        self.generator || self.marketplace || self.library
    }
}

/// Where a request for an asset should be routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetIntent {
    Generate,
    Marketplace,
    Library(LibraryAssetType),
    None,
}

/// The three acquisition adapters behind one facade, each guarded by its
/// own circuit breaker.
pub struct Integrations {
    bridge: Bridge,
    generator: GeneratorAdapter,
    marketplace: MarketplaceAdapter,
    library: LibraryAdapter,
    generator_breaker: CircuitBreaker,
    marketplace_breaker: CircuitBreaker,
    library_breaker: CircuitBreaker,
}

impl Integrations {
    pub fn new(bridge: Bridge, breaker_threshold: u32, breaker_cooldown: Duration) -> Self {
        Self {
            generator: GeneratorAdapter::new(bridge.clone()),
            marketplace: MarketplaceAdapter::new(bridge.clone()),
            library: LibraryAdapter::new(bridge.clone()),
            generator_breaker: CircuitBreaker::new("generator", breaker_threshold, breaker_cooldown),
            marketplace_breaker: CircuitBreaker::new(
                "marketplace",
                breaker_threshold,
                breaker_cooldown,
            ),
            library_breaker: CircuitBreaker::new("library", breaker_threshold, breaker_cooldown),
            bridge,
        }
    }

    /// Ask the host which services are configured. A probe that errors
    /// counts as disabled.
    pub async fn probe_status(&self) -> IntegrationStatus {
        let status = IntegrationStatus {
            generator: self.status_of("get_hyper3d_status").await,
            marketplace: self.status_of("get_sketchfab_status").await,
            library: self.status_of("get_polyhaven_status").await,
        };
        if status.any_enabled() {
            info!(?status, "integration status probed");
        } else {
            warn!("no asset integration is enabled on the host");
        }
        status
    }

    async fn status_of(&self, command: &str) -> bool {
        match self.bridge.send(command, json!({})).await {
            // A success response without an explicit flag means the
            // service answered, which is as enabled as it gets.
            Ok(v) => v.get("enabled").and_then(Value::as_bool).unwrap_or(true),
            Err(_) => false,
        }
    }

    /// Classify the prompt and dispatch to the matching adapter.
    pub async fn acquire(
        &self,
        prompt: &str,
        status: IntegrationStatus,
    ) -> Result<AssetRef, ToolError> {
        match classify_intent(prompt, status) {
            AssetIntent::Generate => {
                self.generator_breaker
                    .run(|| self.generator.generate(prompt))
                    .await
            }
            AssetIntent::Marketplace => {
                self.marketplace_breaker
                    .run(|| self.marketplace.search_and_import(prompt))
                    .await
            }
            AssetIntent::Library(asset_type) => {
                self.library_breaker
                    .run(|| self.library.search_and_import(prompt, asset_type))
                    .await
            }
            AssetIntent::None => Err(ToolError::NoAssetFound),
        }
    }
}

// ── Intent routing ────────────────────────────────────────────────────────────

const LIBRARY_WORDS: &[&str] = &[
    "texture", "material", "hdri", "environment", "skybox", "background", "furniture",
    "floor", "wall", "wood", "marble", "fabric", "metal plate", "brick",
];
const GENERATOR_WORDS: &[&str] = &[
    "unique", "realistic", "creature", "sculpture", "organic", "custom", "generate",
    "生成", "invent", "original",
];
const MARKETPLACE_WORDS: &[&str] = &[
    "sketchfab", "branded", "famous", "specific model", "replica", "low poly", "lowpoly",
    "rigged", "from the store",
];

/// Keyword routing: library categories are the most specific signal, a
/// wish for something unique routes to generation, and recognizable
/// catalog language routes to the marketplace. Anything else goes to
/// whichever general-purpose service is up.
pub fn classify_intent(prompt: &str, status: IntegrationStatus) -> AssetIntent {
    let lowered = prompt.to_lowercase();
    let contains = |words: &[&str]| words.iter().any(|w| lowered.contains(w));

    if status.library && contains(LIBRARY_WORDS) {
        return AssetIntent::Library(classify_library_type(&lowered));
    }
    if status.generator && contains(GENERATOR_WORDS) {
        return AssetIntent::Generate;
    }
    if status.marketplace && contains(MARKETPLACE_WORDS) {
        return AssetIntent::Marketplace;
    }

    // No keyword match: fall back to the broadest enabled service.
    if status.marketplace {
        AssetIntent::Marketplace
    } else if status.generator {
        AssetIntent::Generate
    } else if status.library {
        AssetIntent::Library(classify_library_type(&lowered))
    } else {
        AssetIntent::None
    }
}

fn classify_library_type(lowered: &str) -> LibraryAssetType {
    if ["hdri", "environment", "skybox", "sky", "background", "lighting"]
        .iter()
        .any(|w| lowered.contains(w))
    {
        LibraryAssetType::Hdris
    } else if ["texture", "material", "wood", "marble", "fabric", "brick", "surface"]
        .iter()
        .any(|w| lowered.contains(w))
    {
        LibraryAssetType::Textures
    } else {
        LibraryAssetType::Models
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: IntegrationStatus = IntegrationStatus {
        generator: true,
        marketplace: true,
        library: true,
    };

    #[test]
    fn library_keywords_win_and_subdivide_by_asset_type() {
        assert_eq!(
            classify_intent("add a wood texture to the floor", ALL),
            AssetIntent::Library(LibraryAssetType::Textures)
        );
        assert_eq!(
            classify_intent("use a sunset HDRI", ALL),
            AssetIntent::Library(LibraryAssetType::Hdris)
        );
        assert_eq!(
            classify_intent("some furniture for the room", ALL),
            AssetIntent::Library(LibraryAssetType::Models)
        );
    }

    #[test]
    fn generation_keywords_route_to_the_generator() {
        assert_eq!(classify_intent("a unique realistic creature", ALL), AssetIntent::Generate);
        assert_eq!(classify_intent("an organic sculpture of a bird", ALL), AssetIntent::Generate);
    }

    #[test]
    fn generic_requests_fall_back_to_the_marketplace() {
        assert_eq!(classify_intent("a dragon", ALL), AssetIntent::Marketplace);
    }

    #[test]
    fn disabled_services_are_never_selected() {
        let none = IntegrationStatus::default();
        assert_eq!(classify_intent("a dragon", none), AssetIntent::None);

        let only_generator = IntegrationStatus { generator: true, ..none };
        assert_eq!(classify_intent("a dragon", only_generator), AssetIntent::Generate);

        let only_library = IntegrationStatus { library: true, ..none };
        assert_eq!(
            classify_intent("a wood texture", only_library),
            AssetIntent::Library(LibraryAssetType::Textures)
        );
    }
}
