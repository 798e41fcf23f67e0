use crate::auth::Credentials;
use cloudgate_core::CloudgateError;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub origin: OriginConfig,
    pub target: TargetConfig,
    #[serde(default)]
    pub handshake: HandshakeConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    pub listen_addr: String,
    pub max_connections: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OriginConfig {
    pub contact_point: String,
}

/// Target cluster endpoint. The credentials are what the proxy presents
/// when the target asks for authentication during the handshake.
#[derive(Debug, Deserialize, Clone)]
pub struct TargetConfig {
    pub contact_point: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl TargetConfig {
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(Credentials::new(username, password)),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HandshakeConfig {
    pub max_auth_rounds: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            max_auth_rounds: crate::startup::MAX_AUTH_ROUNDS,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    pub listen_addr: String,
    pub report_interval_ms: u64,
}

impl Config {
    pub fn from_path(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&contents)?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, CloudgateError> {
        let config: Config =
            toml::from_str(contents).map_err(|err| CloudgateError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), CloudgateError> {
        if self.proxy.max_connections == 0 {
            return Err(CloudgateError::Config(
                "proxy.max_connections must be at least 1".into(),
            ));
        }
        if self.origin.contact_point.is_empty() {
            return Err(CloudgateError::Config("origin.contact_point is empty".into()));
        }
        if self.target.contact_point.is_empty() {
            return Err(CloudgateError::Config("target.contact_point is empty".into()));
        }
        if self.target.username.is_some() != self.target.password.is_some() {
            return Err(CloudgateError::Config(
                "target credentials need both username and password".into(),
            ));
        }
        if self.handshake.max_auth_rounds == 0 {
            return Err(CloudgateError::Config(
                "handshake.max_auth_rounds must be at least 1".into(),
            ));
        }
        if self.metrics.report_interval_ms == 0 {
            return Err(CloudgateError::Config(
                "metrics.report_interval_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
