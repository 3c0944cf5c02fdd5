use super::model::{DecisionModel, ModelKey};
use super::DecisionError;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

const MODEL_EXTENSION: &str = "toml";

/// Registry of decision models, looked up by namespace and name
#[derive(Debug, Default)]
pub struct DecisionRuntime {
    models: HashMap<ModelKey, Arc<DecisionModel>>,
}

impl DecisionRuntime {
    /// Loads every `*.toml` model file in `dir`.
    ///
    /// A directory that does not exist yields an empty runtime; the caller
    /// decides whether a missing model is fatal.
    pub async fn load_dir(dir: &Path) -> Result<Self, DecisionError> {
        let mut runtime = Self::default();

        if !tokio::fs::try_exists(dir).await? {
            warn!("Decision model directory {} does not exist", dir.display());
            return Ok(runtime);
        }

        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(MODEL_EXTENSION) {
                paths.push(path);
            } else {
                debug!("Skipping non-model file {}", path.display());
            }
        }
        paths.sort();

        for path in paths {
            let content = tokio::fs::read_to_string(&path).await?;
            let model = DecisionModel::from_toml(&content).map_err(|e| match e {
                DecisionError::ModelParse(reason) => {
                    DecisionError::ModelParse(format!("{}: {}", path.display(), reason))
                }
                other => other,
            })?;
            info!("Loaded decision model {} from {}", model.key(), path.display());
            runtime.register(model)?;
        }

        Ok(runtime)
    }

    pub fn register(&mut self, model: DecisionModel) -> Result<(), DecisionError> {
        let key = model.key().clone();
        if self.models.contains_key(&key) {
            return Err(DecisionError::DuplicateModel(key.to_string()));
        }
        self.models.insert(key, Arc::new(model));
        Ok(())
    }

    pub fn get_model(&self, namespace: &str, name: &str) -> Option<Arc<DecisionModel>> {
        self.models.get(&ModelKey::new(namespace, name)).cloned()
    }

    pub fn model_keys(&self) -> Vec<&ModelKey> {
        let mut keys: Vec<&ModelKey> = self.models.keys().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
