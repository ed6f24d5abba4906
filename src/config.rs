use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::ca::{LeafPolicy, RootSubject};
use crate::proxy::Timeouts;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Root certificate authority settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaConfig {
    /// PEM certificate path.
    pub cert_path: PathBuf,
    /// PEM PKCS#8 key path.
    pub key_path: PathBuf,
    /// Subject CN when a new root is generated.
    pub common_name: String,
    /// Subject O when a new root is generated. Leaves use it as their CN.
    pub organization: String,
    /// Lifetime of a newly generated root.
    pub validity_days: u32,
}

impl CaConfig {
    /// Points both files into `dir`.
    pub fn in_dir(&mut self, dir: impl AsRef<Path>) {
        let dir = dir.as_ref();
        self.cert_path = dir.join("root-ca.pem");
        self.key_path = dir.join("root-ca.key");
    }

    pub fn subject(&self) -> RootSubject {
        RootSubject {
            common_name: self.common_name.clone(),
            organization: self.organization.clone(),
            validity: time::Duration::days(i64::from(self.validity_days)),
        }
    }
}

impl Default for CaConfig {
    fn default() -> Self {
        let mut ca = Self {
            cert_path: PathBuf::new(),
            key_path: PathBuf::new(),
            common_name: "tls-inspector root CA".to_string(),
            organization: "tls-inspector".to_string(),
            validity_days: 3650,
        };
        ca.in_dir("ca");
        ca
    }
}

/// Leaf issuance and caching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeafConfig {
    /// How far `not_before` is backdated.
    pub skew_hours: u32,
    /// How far `not_after` lies ahead of issuance.
    pub lifetime_hours: u32,
    /// Maximum cached leaves. Zero disables caching.
    pub cache_capacity: usize,
    /// Reissue a cached leaf this close to its expiry.
    pub refresh_margin_secs: u64,
}

impl LeafConfig {
    pub fn policy(&self) -> LeafPolicy {
        LeafPolicy {
            skew: time::Duration::hours(i64::from(self.skew_hours)),
            lifetime: time::Duration::hours(i64::from(self.lifetime_hours)),
        }
    }

    pub fn refresh_margin(&self) -> time::Duration {
        time::Duration::seconds(i64::try_from(self.refresh_margin_secs).unwrap_or(i64::MAX))
    }
}

impl Default for LeafConfig {
    fn default() -> Self {
        Self {
            skew_hours: 24,
            lifetime_hours: 24,
            cache_capacity: 1024,
            refresh_margin_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// TLS handshake limit inside a tunnel.
    pub handshake_secs: u64,
    /// Limit for reading request headers.
    pub header_read_secs: u64,
}

impl TimeoutConfig {
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            handshake: Duration::from_secs(self.handshake_secs),
            header_read: Duration::from_secs(self.header_read_secs),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        let defaults = Timeouts::default();
        Self {
            handshake_secs: defaults.handshake.as_secs(),
            header_read_secs: defaults.header_read.as_secs(),
        }
    }
}

/// Upstream client trust.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// PEM files whose certificates are trusted in addition to the
    /// bundled webpki roots.
    pub extra_roots: Vec<PathBuf>,
}

/// Proxy configuration file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Config version for future compatibility.
    #[serde(default = "default_version")]
    pub version: u32,

    /// Address the proxy listens on.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    #[serde(default)]
    pub ca: CaConfig,

    #[serde(default)]
    pub leaf: LeafConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,
}

fn default_version() -> u32 {
    1
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

impl ProxyConfig {
    /// Loads config from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses config from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ca.cert_path.as_os_str().is_empty() || self.ca.key_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("CA paths must not be empty".to_string()));
        }
        if self.ca.cert_path == self.ca.key_path {
            return Err(ConfigError::Invalid(
                "CA certificate and key must be separate files".to_string(),
            ));
        }
        if self.ca.organization.trim().is_empty() {
            return Err(ConfigError::Invalid("CA organization must not be empty".to_string()));
        }
        if self.ca.validity_days == 0 {
            return Err(ConfigError::Invalid("CA validity must be positive".to_string()));
        }
        if self.leaf.lifetime_hours == 0 {
            return Err(ConfigError::Invalid("leaf lifetime must be positive".to_string()));
        }
        if self.timeouts.handshake_secs == 0 || self.timeouts.header_read_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be positive".to_string()));
        }
        Ok(())
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            listen: default_listen(),
            ca: CaConfig::default(),
            leaf: LeafConfig::default(),
            timeouts: TimeoutConfig::default(),
            upstream: UpstreamConfig::default(),
        }
    }
}
