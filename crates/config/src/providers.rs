//! Provider catalog and credential loading
//!
//! The catalog is a JSON array of provider descriptors. Credentials live in
//! one file per provider, `<id>_keys.json`, holding `{"keys": [...]}`.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use common::error::{Error, Result};
use common::models::{
    HuggingfaceOptions, ProviderDescriptor, ProviderKind, ReplicateOptions, StabilityOptions,
};

/// On-disk credential file layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialFile {
    /// Credentials in rotation order
    #[serde(default)]
    pub keys: Vec<String>,

    /// Free-form note, ignored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// The three providers the dispatcher ships with
pub fn default_provider_catalog() -> Vec<ProviderDescriptor> {
    vec![
        ProviderDescriptor {
            id: "huggingface".to_string(),
            name: "Hugging Face".to_string(),
            base_url: "https://api-inference.huggingface.co/models".to_string(),
            kind: ProviderKind::Huggingface(HuggingfaceOptions::default()),
            daily_quota: 100,
            requires_auth: true,
            enabled: true,
            models: vec![
                "stabilityai/stable-diffusion-2".to_string(),
                "runwayml/stable-diffusion-v1-5".to_string(),
                "CompVis/stable-diffusion-v1-4".to_string(),
            ],
        },
        ProviderDescriptor {
            id: "replicate".to_string(),
            name: "Replicate".to_string(),
            base_url: "https://api.replicate.com/v1/predictions".to_string(),
            kind: ProviderKind::Replicate(ReplicateOptions::default()),
            daily_quota: 50,
            requires_auth: true,
            enabled: true,
            models: vec!["stability-ai/stable-diffusion".to_string()],
        },
        ProviderDescriptor {
            id: "stability".to_string(),
            name: "Stability AI".to_string(),
            base_url: "https://api.stability.ai/v1/generation".to_string(),
            kind: ProviderKind::StabilityAi(StabilityOptions::default()),
            daily_quota: 25,
            requires_auth: true,
            enabled: true,
            models: vec!["stable-diffusion-xl-1024-v1-0".to_string()],
        },
    ]
}

/// Loads a provider catalog from a JSON file
pub fn load_provider_catalog(path: impl AsRef<Path>) -> Result<Vec<ProviderDescriptor>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;

    let descriptors: Vec<ProviderDescriptor> = serde_json::from_str(&content)
        .map_err(|e| Error::Config(format!("Invalid provider catalog {}: {}", path.display(), e)))?;

    info!("Loaded {} providers from {}", descriptors.len(), path.display());

    Ok(descriptors)
}

/// Loads credential pools for the given providers from `dir`
///
/// A missing file yields an empty pool; blank entries are dropped.
pub fn load_credentials<'a, I>(dir: impl AsRef<Path>, provider_ids: I) -> Result<HashMap<String, Vec<String>>>
where
    I: IntoIterator<Item = &'a str>,
{
    let dir = dir.as_ref();
    let mut pools = HashMap::new();

    for id in provider_ids {
        let path = dir.join(format!("{}_keys.json", id));

        let keys = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let file: CredentialFile = serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("Invalid credential file {}: {}", path.display(), e)))?;

            file.keys
                .into_iter()
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty())
                .collect()
        } else {
            debug!("No credential file for {} at {}", id, path.display());
            Vec::new()
        };

        if keys.is_empty() {
            warn!("Provider {} has no credentials", id);
        }

        pools.insert(id.to_string(), keys);
    }

    Ok(pools)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog_shape() {
        let catalog = default_provider_catalog();
        let quotas: Vec<_> = catalog.iter().map(|p| (p.id.as_str(), p.daily_quota)).collect();

        assert_eq!(quotas, vec![("huggingface", 100), ("replicate", 50), ("stability", 25)]);
        assert!(catalog.iter().all(|p| !p.models.is_empty()));
    }

    #[test]
    fn test_catalog_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("providers.json");
        std::fs::write(&path, serde_json::to_string(&default_provider_catalog()).unwrap()).unwrap();

        assert_eq!(load_provider_catalog(&path).unwrap(), default_provider_catalog());
    }

    #[test]
    fn test_credentials_missing_and_blank() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("huggingface_keys.json"),
            r#"{"keys": ["hf_a", "  ", "hf_b"], "note": "rotated daily"}"#,
        )
        .unwrap();

        let pools = load_credentials(dir.path(), ["huggingface", "replicate"]).unwrap();

        assert_eq!(pools["huggingface"], vec!["hf_a".to_string(), "hf_b".to_string()]);
        assert!(pools["replicate"].is_empty());
    }

    #[test]
    fn test_malformed_credentials_are_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stability_keys.json"), "not json").unwrap();

        let err = load_credentials(dir.path(), ["stability"]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
