use std::env;
use std::path::{Path, PathBuf};

use crate::pipeline::classifier::{ClassifierConfig, ConvStage};
use crate::pipeline::overlay::OverlayConfig;

pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),
    #[error("Invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_address: String,
    pub classifier: ClassifierConfig,
    pub upload_dir: PathBuf,
    pub static_dir: PathBuf,
    pub max_upload_bytes: usize,
    pub jwt_secret: String,
    pub users_file: Option<PathBuf>,
    pub overlay: OverlayConfig,
}

impl OverlayConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(path)?;
        let config: OverlayConfig = serde_yaml::from_str(&config_str)?;
        Ok(config)
    }
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        Err(_) => Ok(default),
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        }),
    }
}

/// An empty feature method name disables the conv stage.
pub fn conv_stage(features: &str, head: &str) -> Option<ConvStage> {
    let features = features.trim();
    let head = head.trim();
    if features.is_empty() || head.is_empty() {
        return None;
    }
    Some(ConvStage {
        features: features.to_string(),
        head: head.to_string(),
    })
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = var_or("HOST", "0.0.0.0");
        let port: u16 = parse_var("PORT", 5000)?;

        let classifier = ClassifierConfig {
            model_path: PathBuf::from(var_or("MODEL_PATH", "models/best_chest_xray_model.pt")),
            conv_stage: conv_stage(
                &var_or("SALIENCY_FEATURES_METHOD", "features"),
                &var_or("SALIENCY_HEAD_METHOD", "head"),
            ),
            channels_first: parse_bool("MODEL_CHANNELS_FIRST", &var_or("MODEL_CHANNELS_FIRST", "true"))?,
        };

        let overlay = match env::var("OVERLAY_CONFIG") {
            Ok(path) => OverlayConfig::load(Path::new(&path))?,
            Err(_) => OverlayConfig::default(),
        };

        let jwt_secret = env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?;
        if jwt_secret.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "JWT_SECRET",
                value: jwt_secret,
            });
        }

        Ok(Self {
            bind_address: format!("{}:{}", host, port),
            classifier,
            upload_dir: PathBuf::from(var_or("UPLOAD_DIR", "uploads")),
            static_dir: PathBuf::from(var_or("STATIC_DIR", "static")),
            max_upload_bytes: parse_var("MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES)?,
            jwt_secret,
            users_file: env::var("USERS_FILE").ok().map(PathBuf::from),
            overlay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_overrides_only_named_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overlay.yaml");
        std::fs::write(&path, "attention_threshold: 0.75\nmax_regions: 5\n").unwrap();
        let config = OverlayConfig::load(&path).unwrap();
        assert_eq!(config.attention_threshold, 0.75);
        assert_eq!(config.max_regions, 5);
        assert_eq!(config.header_height, OverlayConfig::default().header_height);
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overlay.yaml");
        std::fs::write(&path, "max_regions: [not, a, number]\n").unwrap();
        assert!(matches!(OverlayConfig::load(&path), Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn blank_method_disables_conv_stage() {
        assert_eq!(conv_stage("", "head"), None);
        assert_eq!(
            conv_stage(" features ", "head"),
            Some(ConvStage {
                features: "features".to_string(),
                head: "head".to_string()
            })
        );
    }

    #[test]
    fn booleans_parse_leniently() {
        assert!(parse_bool("K", "Yes").unwrap());
        assert!(!parse_bool("K", "0").unwrap());
        assert!(parse_bool("K", "maybe").is_err());
    }
}
