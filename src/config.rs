use crate::error::{ProtocolError, Result};
use crate::transaction::StoreSettings;
use crate::verification::ToleranceRules;
use crate::verification_service::VerificationSettings;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Upper bound for every configured ttl (ten years).
const MAX_TTL_SECONDS: u64 = 10 * 365 * 24 * 3600;

#[derive(Debug, Deserialize, Clone, Serialize, Default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub identity: IdentityConfig,
    pub signing: SigningConfig,
    pub store: StoreConfig,
    pub registry: RegistryConfig,
    pub verification: VerificationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Who this node is on the network.
#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct IdentityConfig {
    pub subscriber_id: String,
    pub subscriber_uri: String,
    pub unique_key_id: String,
    pub role: String,
    pub domain: String,
    /// Base64 Ed25519 seed. Usually injected through `BECKN_SIGNING_SEED`.
    pub signing_seed: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct SigningConfig {
    pub ttl_seconds: u64,
    pub clock_skew_seconds: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct StoreConfig {
    /// `memory` or a `sqlite://` url.
    pub url: String,
    pub transaction_ttl_seconds: u64,
    pub message_ttl_seconds: u64,
    pub verification_ttl_seconds: u64,
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct RegistryConfig {
    pub endpoint: String,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct VerificationConfig {
    pub max_deviation_percent: f64,
    pub min_quantity: Option<f64>,
    pub grace_seconds: i64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8010,
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            subscriber_id: "bap.example".to_string(),
            subscriber_uri: "http://localhost:8010".to_string(),
            unique_key_id: "key-1".to_string(),
            role: "bap".to_string(),
            domain: "energy:p2p-trading".to_string(),
            signing_seed: None,
        }
    }
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 30,
            clock_skew_seconds: 5,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "memory".to_string(),
            transaction_ttl_seconds: 24 * 3600,
            message_ttl_seconds: 7 * 24 * 3600,
            verification_ttl_seconds: 7 * 24 * 3600,
            timeout_ms: 2000,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8000".to_string(),
            timeout_seconds: Some(10),
        }
    }
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            max_deviation_percent: 10.0,
            min_quantity: None,
            grace_seconds: 24 * 3600,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: Some("json".to_string()),
        }
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| ProtocolError::Config(format!("Failed to read config file: {}", e)))?;

        let config: AppConfig = toml::from_str(&config_str)
            .map_err(|e| ProtocolError::Config(format!("Failed to parse config file: {}", e)))?;

        Ok(config)
    }

    /// Layers `BECKN__<SECTION>__<KEY>` environment variables over the file,
    /// then applies the few well-known secrets.
    pub fn load_with_env_overrides<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).format(config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix("BECKN")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ProtocolError::Config(format!("Failed to layer config: {}", e)))?;

        let mut config: AppConfig = settings
            .try_deserialize()
            .map_err(|e| ProtocolError::Config(format!("Failed to parse config: {}", e)))?;

        if let Ok(seed) = std::env::var("BECKN_SIGNING_SEED") {
            config.identity.signing_seed = Some(seed);
        }

        if let Ok(log_level) = std::env::var("RUST_LOG") {
            config.logging.level = log_level;
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(ProtocolError::Config("Server port cannot be 0".to_string()));
        }

        if self.identity.subscriber_id.is_empty() || self.identity.unique_key_id.is_empty() {
            return Err(ProtocolError::Config("Subscriber id and unique key id are required".to_string()));
        }

        if self.identity.subscriber_id.contains('|') || self.identity.unique_key_id.contains('|') {
            return Err(ProtocolError::Config("Identity fields cannot contain '|'".to_string()));
        }

        if !matches!(self.identity.role.as_str(), "bap" | "bpp") {
            return Err(ProtocolError::Config(format!("Unknown role: {}", self.identity.role)));
        }

        if self.signing.ttl_seconds == 0 {
            return Err(ProtocolError::Config("Signature ttl must be greater than 0".to_string()));
        }

        let ttls = [
            ("signing.ttl_seconds", self.signing.ttl_seconds),
            ("store.transaction_ttl_seconds", self.store.transaction_ttl_seconds),
            ("store.message_ttl_seconds", self.store.message_ttl_seconds),
            ("store.verification_ttl_seconds", self.store.verification_ttl_seconds),
        ];
        for (name, seconds) in ttls {
            if seconds > MAX_TTL_SECONDS {
                return Err(ProtocolError::Config(format!(
                    "{} cannot exceed {} seconds",
                    name, MAX_TTL_SECONDS
                )));
            }
        }

        if self.signing.clock_skew_seconds > MAX_TTL_SECONDS
            || self.verification.grace_seconds > MAX_TTL_SECONDS as i64
        {
            return Err(ProtocolError::Config("Clock skew and verification grace are out of range".to_string()));
        }

        // Replays must still be recognised after the transaction itself expired.
        if self.store.message_ttl_seconds <= self.store.transaction_ttl_seconds {
            return Err(ProtocolError::Config(
                "Message marker ttl must be longer than the transaction ttl".to_string(),
            ));
        }

        if self.store.timeout_ms == 0 {
            return Err(ProtocolError::Config("Store timeout cannot be 0".to_string()));
        }

        if self.store.url != "memory" && !self.store.url.starts_with("sqlite:") {
            return Err(ProtocolError::Config(format!("Unsupported store url: {}", self.store.url)));
        }

        if self.registry.endpoint.is_empty() {
            return Err(ProtocolError::Config("Registry endpoint cannot be empty".to_string()));
        }

        self.tolerance().validate()?;

        if self.verification.grace_seconds < 0 {
            return Err(ProtocolError::Config("Verification grace cannot be negative".to_string()));
        }

        Ok(())
    }

    pub fn get_server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn signature_ttl(&self) -> Duration {
        Duration::from_secs(self.signing.ttl_seconds)
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            transaction_ttl: Duration::from_secs(self.store.transaction_ttl_seconds),
            message_ttl: Duration::from_secs(self.store.message_ttl_seconds),
            timeout: Duration::from_millis(self.store.timeout_ms),
        }
    }

    pub fn tolerance(&self) -> ToleranceRules {
        ToleranceRules {
            max_deviation_percent: self.verification.max_deviation_percent,
            min_quantity: self.verification.min_quantity,
        }
    }

    pub fn verification_settings(&self) -> VerificationSettings {
        VerificationSettings {
            record_ttl: Duration::from_secs(self.store.verification_ttl_seconds),
            grace: chrono::Duration::seconds(self.verification.grace_seconds),
            default_tolerance: self.tolerance(),
            timeout: Duration::from_millis(self.store.timeout_ms),
        }
    }

    pub fn is_sqlite_store(&self) -> bool {
        self.store.url.starts_with("sqlite:")
    }
}

pub fn create_default_config_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let default_config = AppConfig::default();
    let toml_str = toml::to_string_pretty(&default_config)
        .map_err(|e| ProtocolError::Config(format!("Failed to serialize default config: {}", e)))?;

    std::fs::write(path, toml_str)
        .map_err(|e| ProtocolError::Config(format!("Failed to write default config file: {}", e)))?;

    Ok(())
}
