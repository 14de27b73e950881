use std::env;
use std::fs;
use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;
use transport_webrtc_http::IceConfiguration;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("jwt secret is empty")]
    EmptySecret,
    #[error("invalid ice configuration: {0}")]
    Ice(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_host: String,
    pub http_port: u16,
    pub api_port: u16,
    pub jwt_secret: Option<String>,
    pub jwt_secret_path: Option<PathBuf>,
    /// Key a server instance must present in its handshake.
    pub required_key: Option<String>,
    pub max_client_queue_size: usize,
    pub url_scheme: String,
    pub url_domain: String,
    /// Port of assigned URLs; the bound HTTP port when unset.
    pub url_port: Option<u16>,
    pub url_path: String,
    pub ice_config_path: Option<PathBuf>,
    pub error_page_title: String,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_host: env::var("HARBOR_BIND_HOST").unwrap_or(defaults.bind_host),
            http_port: env::var("HARBOR_HTTP_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.http_port),
            api_port: env::var("HARBOR_API_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.api_port),
            jwt_secret: env::var("HARBOR_JWT_SECRET").ok().filter(|s| !s.is_empty()),
            jwt_secret_path: env::var("HARBOR_JWT_SECRET_PATH").ok().map(PathBuf::from),
            required_key: env::var("HARBOR_REQUIRED_KEY").ok().filter(|s| !s.is_empty()),
            max_client_queue_size: env::var("HARBOR_MAX_CLIENT_QUEUE_SIZE")
                .ok()
                .and_then(|n| n.parse().ok())
                .unwrap_or(defaults.max_client_queue_size),
            url_scheme: env::var("HARBOR_URL_SCHEME").unwrap_or(defaults.url_scheme),
            url_domain: env::var("HARBOR_URL_DOMAIN").unwrap_or(defaults.url_domain),
            url_port: env::var("HARBOR_URL_PORT").ok().and_then(|p| p.parse().ok()),
            url_path: env::var("HARBOR_URL_PATH").unwrap_or(defaults.url_path),
            ice_config_path: env::var("HARBOR_ICE_CONFIG").ok().map(PathBuf::from),
            error_page_title: env::var("HARBOR_ERROR_PAGE_TITLE").unwrap_or(defaults.error_page_title),
        }
    }

    /// Command line flags win over the environment.
    pub fn with_overrides(mut self, cli: Cli) -> Self {
        if let Some(port) = cli.http_port {
            self.http_port = port;
        }
        if let Some(port) = cli.api_port {
            self.api_port = port;
        }
        if cli.jwt_secret.is_some() {
            self.jwt_secret = cli.jwt_secret;
        }
        if cli.jwt_secret_path.is_some() {
            self.jwt_secret_path = cli.jwt_secret_path;
        }
        if cli.required_key.is_some() {
            self.required_key = cli.required_key;
        }
        if let Some(size) = cli.max_client_queue_size {
            self.max_client_queue_size = size;
        }
        if let Some(scheme) = cli.url_scheme {
            self.url_scheme = scheme;
        }
        if let Some(domain) = cli.url_domain {
            self.url_domain = domain;
        }
        if cli.url_port.is_some() {
            self.url_port = cli.url_port;
        }
        if let Some(path) = cli.url_path {
            self.url_path = path;
        }
        if cli.ice_config.is_some() {
            self.ice_config_path = cli.ice_config;
        }
        if let Some(title) = cli.error_page_title {
            self.error_page_title = title;
        }
        self
    }

    /// Secret used to sign session tokens: inline value, then file, then a
    /// random per-process secret.
    pub fn resolve_jwt_secret(&self) -> Result<Vec<u8>, ConfigError> {
        if let Some(secret) = &self.jwt_secret {
            return Ok(secret.clone().into_bytes());
        }
        if let Some(path) = &self.jwt_secret_path {
            let secret = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            let secret = secret.trim();
            if secret.is_empty() {
                return Err(ConfigError::EmptySecret);
            }
            return Ok(secret.as_bytes().to_vec());
        }
        tracing::warn!(target = "harbor", "no jwt secret configured; session tokens will not survive a restart");
        Ok(format!("{}{}", uuid::Uuid::new_v4(), uuid::Uuid::new_v4()).into_bytes())
    }

    /// ICE servers handed to clients, read from a browser `RTCConfiguration` JSON file.
    pub fn load_ice(&self) -> Result<IceConfiguration, ConfigError> {
        let Some(path) = &self.ice_config_path else {
            return Ok(IceConfiguration::stun_default());
        };
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            http_port: 8080,
            api_port: 8081,
            jwt_secret: None,
            jwt_secret_path: None,
            required_key: None,
            max_client_queue_size: 10,
            url_scheme: "http".to_string(),
            url_domain: "localhost".to_string(),
            url_port: None,
            url_path: String::new(),
            ice_config_path: None,
            error_page_title: "beach-harbor".to_string(),
        }
    }
}

/// Discovery and signalling broker for peer-to-peer HTTP.
#[derive(Debug, Default, Parser)]
#[command(name = "beach-harbor", version)]
pub struct Cli {
    /// Port for the public HTTP listener
    #[arg(long)]
    pub http_port: Option<u16>,
    /// Port for the server-instance WebSocket API
    #[arg(long)]
    pub api_port: Option<u16>,
    #[arg(long)]
    pub jwt_secret: Option<String>,
    #[arg(long)]
    pub jwt_secret_path: Option<PathBuf>,
    /// Key server instances must present
    #[arg(long)]
    pub required_key: Option<String>,
    #[arg(long)]
    pub max_client_queue_size: Option<usize>,
    #[arg(long)]
    pub url_scheme: Option<String>,
    #[arg(long)]
    pub url_domain: Option<String>,
    #[arg(long)]
    pub url_port: Option<u16>,
    #[arg(long)]
    pub url_path: Option<String>,
    /// JSON file shaped like a browser RTCConfiguration
    #[arg(long)]
    pub ice_config: Option<PathBuf>,
    #[arg(long)]
    pub error_page_title: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "beach-harbor",
            "--http-port",
            "9000",
            "--url-domain",
            "example.com",
            "--max-client-queue-size",
            "3",
        ]);
        let config = Config::default().with_overrides(cli);
        assert_eq!(config.http_port, 9000);
        assert_eq!(config.api_port, 8081);
        assert_eq!(config.url_domain, "example.com");
        assert_eq!(config.max_client_queue_size, 3);
    }

    #[test_timeout::timeout]
    fn inline_secret_wins_and_random_secret_is_generated() {
        let config = Config {
            jwt_secret: Some("s3cret".into()),
            ..Config::default()
        };
        assert_eq!(config.resolve_jwt_secret().expect("secret"), b"s3cret");

        let a = Config::default().resolve_jwt_secret().expect("random");
        let b = Config::default().resolve_jwt_secret().expect("random");
        assert_ne!(a, b);
    }

    #[test_timeout::timeout]
    fn missing_secret_file_is_an_error() {
        let config = Config {
            jwt_secret_path: Some(PathBuf::from("/nonexistent/harbor/secret")),
            ..Config::default()
        };
        assert!(matches!(
            config.resolve_jwt_secret(),
            Err(ConfigError::Read { .. })
        ));
        assert_eq!(Config::default().load_ice().expect("ice"), IceConfiguration::stun_default());
    }
}
