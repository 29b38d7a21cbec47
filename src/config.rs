use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::model::check_artifact_path;

/// Service settings, layered from an optional TOML file and the environment.
///
/// Keys are flat so that `SUPABASE_URL`, `PORT`, `MODEL_PATH` and friends map
/// directly onto fields.
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    #[serde(default)]
    pub supabase_url: String,
    #[serde(default)]
    pub supabase_key: String,

    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_body_limit_mb")]
    pub body_limit_mb: usize,

    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    #[serde(default = "default_retrain_dir")]
    pub retrain_dir: PathBuf,

    #[serde(default = "default_model_path")]
    pub model_path: PathBuf,
    #[serde(default)]
    pub model_url: Option<String>,
    #[serde(default)]
    pub model_url_token: Option<String>,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
    #[serde(default = "default_remote_timeout_secs")]
    pub remote_timeout_secs: u64,

    #[serde(default = "default_retrain_epochs")]
    pub retrain_epochs: usize,
    #[serde(default = "default_retrain_batch_size")]
    pub retrain_batch_size: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_body_limit_mb() -> usize {
    25
}

fn default_bucket() -> String {
    "uploads".to_string()
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("temp_uploads")
}

fn default_retrain_dir() -> PathBuf {
    PathBuf::from("retraining_data")
}

fn default_model_path() -> PathBuf {
    PathBuf::from("models/shoe_cnn.mpk")
}

fn default_confidence_threshold() -> f64 {
    0.7
}

fn default_metrics_interval_secs() -> u64 {
    60
}

fn default_remote_timeout_secs() -> u64 {
    10
}

fn default_retrain_epochs() -> usize {
    3
}

fn default_retrain_batch_size() -> usize {
    16
}

fn default_learning_rate() -> f64 {
    1e-3
}

fn default_seed() -> u64 {
    42
}

impl ServiceConfig {
    fn read(path: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::default().try_parsing(true))
            .build()?
            .try_deserialize()
    }

    /// Loads `path` (if it exists) and then the process environment on top.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Like `load`, but without requiring backend credentials.
    pub fn load_for_training(path: &str) -> Result<Self, ConfigError> {
        let config = Self::read(path)?;
        config.validate_training()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.supabase_url.trim().is_empty() {
            return Err(ConfigError::Message("SUPABASE_URL is empty".into()));
        }
        if self.supabase_key.trim().is_empty() {
            return Err(ConfigError::Message("SUPABASE_KEY is empty".into()));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::Message(
                "confidence_threshold must be within [0, 1]".into(),
            ));
        }
        self.validate_training()
    }

    pub fn validate_training(&self) -> Result<(), ConfigError> {
        if self.retrain_batch_size == 0 {
            return Err(ConfigError::Message(
                "retrain_batch_size must be positive".into(),
            ));
        }
        check_artifact_path(&self.model_path).map_err(ConfigError::Message)?;
        Ok(())
    }

    pub fn body_limit_bytes(&self) -> usize {
        self.body_limit_mb * 1024 * 1024
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn from_toml(source: &str) -> Result<ServiceConfig, ConfigError> {
        let config: ServiceConfig = Config::builder()
            .add_source(File::from_str(source, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn defaults_fill_everything_but_the_backend() {
        let config = from_toml(
            r#"
            supabase_url = "https://example.supabase.co"
            supabase_key = "service-key"
            "#,
        )
        .unwrap();

        assert_eq!(config.port, 8000);
        assert_eq!(config.bucket, "uploads");
        assert_eq!(config.confidence_threshold, 0.7);
        assert_eq!(config.metrics_interval(), Duration::from_secs(60));
        assert_eq!(config.retrain_epochs, 3);
        assert_eq!(config.retrain_batch_size, 16);
        assert_eq!(config.body_limit_bytes(), 25 * 1024 * 1024);
        assert!(config.model_url.is_none());
    }

    #[test]
    fn missing_backend_key_is_rejected() {
        let result = from_toml(r#"supabase_url = "https://example.supabase.co""#);
        assert!(result.is_err());
    }

    #[test]
    fn blank_backend_url_is_rejected() {
        let result = from_toml(
            r#"
            supabase_url = "   "
            supabase_key = "service-key"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn training_does_not_need_backend_credentials() {
        let config: ServiceConfig = Config::builder()
            .add_source(File::from_str("retrain_epochs = 10", FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert!(config.validate_training().is_ok());
        assert!(config.validate().is_err());
        assert_eq!(config.retrain_epochs, 10);
    }

    #[test]
    fn threshold_outside_unit_interval_is_rejected() {
        let result = from_toml(
            r#"
            supabase_url = "https://example.supabase.co"
            supabase_key = "service-key"
            confidence_threshold = 1.5
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn model_path_must_carry_the_recorder_extension() {
        for model_path in ["models/shoe_cnn.h5", "models/shoe_cnn.bin", "models/shoe_cnn"] {
            let result = from_toml(&format!(
                r#"
                supabase_url = "https://example.supabase.co"
                supabase_key = "service-key"
                model_path = "{}"
                "#,
                model_path
            ));
            assert!(result.is_err(), "{}", model_path);
        }

        let config: ServiceConfig = Config::builder()
            .add_source(File::from_str(
                r#"model_path = "models/shoe_cnn.bin""#,
                FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert!(config.validate_training().is_err());
    }
}
