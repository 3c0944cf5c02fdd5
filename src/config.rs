//! Relay configuration: one TOML file with broker, link, and decision sections.

use crate::mqtt::MqttConfig;
use crate::relay::RelaySettings;
use color_eyre::eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = "temp-alert-relay";
const CONFIG_FILE: &str = "relay.toml";
const BUNDLED_MODEL_FILE: &str = "tunnelofen.toml";
const BUNDLED_MODEL: &str = include_str!("../models/tunnelofen.toml");

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    pub broker: MqttConfig,
    pub ingest: LinkConfig,
    pub actuator: LinkConfig,
    pub decision: DecisionConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            broker: MqttConfig::default(),
            ingest: LinkConfig {
                client_id: "TempAlertIngest".to_string(),
                topic: "tunnelofen/data".to_string(),
            },
            actuator: LinkConfig {
                client_id: "TempAlertActuator".to_string(),
                topic: "m5stick/vibration".to_string(),
            },
            decision: DecisionConfig::default(),
        }
    }
}

/// One MQTT client session and the topic it serves
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct LinkConfig {
    pub client_id: String,
    pub topic: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct DecisionConfig {
    /// Relative paths are resolved against the config file's directory
    pub models_dir: PathBuf,
    pub namespace: String,
    pub model: String,
    pub input: String,
    pub output: String,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            namespace: "https://kie.apache.org/dmn/_96D74048-B4BC-455F-B1F5-42CD79464E0D"
                .to_string(),
            model: "tunnelofen".to_string(),
            input: "currentTemp".to_string(),
            output: "warningState".to_string(),
        }
    }
}

impl RelayConfig {
    /// `<config dir>/temp-alert-relay/relay.toml`
    pub fn default_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
            .ok_or_else(|| eyre!("Unable to determine a configuration directory"))?;
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        Ok(path)
    }

    /// Writes the default configuration if `path` does not exist yet, together
    /// with the bundled kiln model in the default models directory next to it.
    pub async fn ensure_default_config(path: &Path) -> Result<()> {
        if tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
        {
            return Ok(());
        }

        let defaults = RelayConfig::default();
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        tokio::fs::create_dir_all(base)
            .await
            .map_err(|e| eyre!("Failed to create config directory: {}", e))?;

        let content = toml::to_string_pretty(&defaults)
            .map_err(|e| eyre!("Failed to serialize default config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write default config file: {}", e))?;
        warn!("No configuration found, wrote defaults to {}", path.display());

        let models_dir = base.join(&defaults.decision.models_dir);
        let model_path = models_dir.join(BUNDLED_MODEL_FILE);
        if !tokio::fs::try_exists(&model_path)
            .await
            .map_err(|e| eyre!("Failed to check if model file exists: {}", e))?
        {
            tokio::fs::create_dir_all(&models_dir)
                .await
                .map_err(|e| eyre!("Failed to create models directory: {}", e))?;
            tokio::fs::write(&model_path, BUNDLED_MODEL)
                .await
                .map_err(|e| eyre!("Failed to write bundled model: {}", e))?;
            info!("Installed bundled decision model at {}", model_path.display());
        }
        Ok(())
    }

    /// Loads, resolves and validates the configuration at `path` (or the default location)
    pub async fn load(path: Option<PathBuf>) -> Result<Self> {
        let path = match path {
            Some(path) => path,
            None => Self::default_path()?,
        };
        Self::ensure_default_config(&path).await?;

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let mut config: RelayConfig = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

        if config.decision.models_dir.is_relative() {
            if let Some(base) = path.parent() {
                config.decision.models_dir = base.join(&config.decision.models_dir);
            }
        }
        debug!("Decision models directory: {}", config.decision.models_dir.display());

        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.broker
            .broker_address()
            .map_err(|e| eyre!("Invalid broker configuration: {}", e))?;
        self.broker
            .qos()
            .map_err(|e| eyre!("Invalid broker configuration: {}", e))?;

        for (role, link) in [("ingest", &self.ingest), ("actuator", &self.actuator)] {
            if link.client_id.trim().is_empty() {
                return Err(eyre!("The {} client id must not be empty", role));
            }
            if link.topic.trim().is_empty() {
                return Err(eyre!("The {} topic must not be empty", role));
            }
        }
        if self.ingest.client_id == self.actuator.client_id {
            return Err(eyre!(
                "Ingest and actuator need distinct client ids, both are '{}'",
                self.ingest.client_id
            ));
        }
        if self.actuator.topic.contains(['+', '#']) {
            return Err(eyre!(
                "Actuator topic '{}' must not contain wildcards",
                self.actuator.topic
            ));
        }

        let decision = &self.decision;
        if decision.namespace.trim().is_empty() || decision.model.trim().is_empty() {
            return Err(eyre!("Decision model namespace and name must not be empty"));
        }
        if decision.input.trim().is_empty() || decision.output.trim().is_empty() {
            return Err(eyre!("Decision input and output names must not be empty"));
        }
        Ok(())
    }

    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            input_name: self.decision.input.clone(),
            output_name: self.decision.output.clone(),
            actuator_topic: self.actuator.topic.clone(),
        }
    }
}
