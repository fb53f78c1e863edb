use serde::Deserialize;
use veilbox_shared::constants::{DEFAULT_SAS_SYMBOLS, MAX_MEDIA_PAYLOAD_BYTES};

use crate::error::CryptoError;
use crate::sas::MAX_SYMBOL_COUNT;

/// Configuration loaded from veilbox.toml with env var overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct VeilboxConfig {
    /// Path of the encrypted key database. Default: "veilbox-keys.db"
    #[serde(default = "default_key_db_path")]
    pub key_db_path: String,
    /// Base URL of the key directory. Unset means offline.
    #[serde(default)]
    pub directory_url: Option<String>,
    #[serde(default)]
    pub blob: BlobStoreConfig,
    #[serde(default)]
    pub media: MediaConfig,
    /// Emoji per SAS sequence. Default: 5
    #[serde(default = "default_sas_symbols")]
    pub sas_symbols: usize,
    /// Tracing log level. Default: "info"
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlobStoreConfig {
    /// "local" or "memory". Default: "local"
    #[serde(default = "default_blob_backend")]
    pub backend: String,
    /// Root directory for the local backend. Default: "./blobs"
    #[serde(default = "default_blob_path")]
    pub local_path: String,
    #[serde(default)]
    pub naming: BlobNaming,
}

/// How blob keys are chosen for uploaded ciphertext.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlobNaming {
    #[default]
    ContentAddressed,
    Random,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaConfig {
    /// Attempts at writing decrypted media before giving up. Default: 3
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
    /// Largest plaintext accepted for audio/video. Default: 100 MiB
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

fn default_key_db_path() -> String {
    "veilbox-keys.db".to_string()
}
fn default_blob_backend() -> String {
    "local".to_string()
}
fn default_blob_path() -> String {
    "./blobs".to_string()
}
fn default_sas_symbols() -> usize {
    DEFAULT_SAS_SYMBOLS
}
fn default_write_retries() -> u32 {
    3
}
fn default_max_payload_bytes() -> usize {
    MAX_MEDIA_PAYLOAD_BYTES
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        Self {
            backend: default_blob_backend(),
            local_path: default_blob_path(),
            naming: BlobNaming::default(),
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            write_retries: default_write_retries(),
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

impl Default for VeilboxConfig {
    fn default() -> Self {
        Self {
            key_db_path: default_key_db_path(),
            directory_url: None,
            blob: BlobStoreConfig::default(),
            media: MediaConfig::default(),
            sas_symbols: default_sas_symbols(),
            log_level: default_log_level(),
        }
    }
}

impl VeilboxConfig {
    /// Load configuration from TOML file with environment variable overrides.
    ///
    /// Reads `veilbox.toml` from CWD (or the path in `VEILBOX_CONFIG`). A
    /// missing default file is not an error; a missing explicit file is.
    pub fn load() -> Result<Self, CryptoError> {
        Self::load_from(std::env::var("VEILBOX_CONFIG").ok().as_deref())
    }

    /// Like [`VeilboxConfig::load`] with the file path given explicitly.
    pub fn load_from(path: Option<&str>) -> Result<Self, CryptoError> {
        let (path, explicit) = match path {
            Some(path) => (path, true),
            None => ("veilbox.toml", false),
        };
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(CryptoError::ConfigError(format!("{path}: {e}"))),
        };
        Self::from_toml_str(&contents)
    }

    /// Load configuration from a TOML string, then apply env var overrides.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, CryptoError> {
        let mut config: VeilboxConfig =
            toml::from_str(toml_str).map_err(|e| CryptoError::ConfigError(e.to_string()))?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to the config.
    ///
    /// Returns an error if a numeric env var is set but does not parse.
    pub fn apply_env_overrides(&mut self) -> Result<(), CryptoError> {
        if let Ok(val) = std::env::var("VEILBOX_KEY_DB_PATH") {
            self.key_db_path = val;
        }
        if let Ok(val) = std::env::var("VEILBOX_DIRECTORY_URL") {
            self.directory_url = Some(val).filter(|v| !v.is_empty());
        }
        if let Ok(val) = std::env::var("VEILBOX_BLOB_BACKEND") {
            self.blob.backend = val;
        }
        if let Ok(val) = std::env::var("VEILBOX_BLOB_PATH") {
            self.blob.local_path = val;
        }
        if let Ok(val) = std::env::var("VEILBOX_SAS_SYMBOLS") {
            self.sas_symbols = parse_env("VEILBOX_SAS_SYMBOLS", &val)?;
        }
        if let Ok(val) = std::env::var("VEILBOX_WRITE_RETRIES") {
            self.media.write_retries = parse_env("VEILBOX_WRITE_RETRIES", &val)?;
        }
        if let Ok(val) = std::env::var("VEILBOX_MAX_PAYLOAD_BYTES") {
            self.media.max_payload_bytes = parse_env("VEILBOX_MAX_PAYLOAD_BYTES", &val)?;
        }
        if let Ok(val) = std::env::var("LOG_LEVEL") {
            self.log_level = val;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), CryptoError> {
        if !(1..=MAX_SYMBOL_COUNT).contains(&self.sas_symbols) {
            return Err(CryptoError::ConfigError(format!(
                "sas_symbols must be between 1 and {MAX_SYMBOL_COUNT}, got {}",
                self.sas_symbols
            )));
        }
        if self.media.write_retries == 0 {
            return Err(CryptoError::ConfigError("write_retries must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, val: &str) -> Result<T, CryptoError> {
    val.parse()
        .map_err(|_| CryptoError::ConfigError(format!("invalid {name} value: {val}")))
}
