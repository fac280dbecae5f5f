use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// Application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Environment (dev, staging, prod)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// CORS allowed origins
    pub cors_origins: Option<String>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Database URL for the durable document store
    pub db_url: Option<String>,

    /// Redis URL for the cross-instance fanout bus.
    /// When unset the bus degrades to local-only delivery.
    pub redis_url: Option<String>,

    /// Debounce window for coalescing document persists, in milliseconds
    #[serde(default = "default_persist_debounce_ms")]
    pub persist_debounce_ms: u64,

    /// Sandbox backend: "docker" or "process"
    #[serde(default = "default_sandbox_backend")]
    pub sandbox_backend: String,

    /// Wall-clock timeout for one execution job, in seconds
    #[serde(default = "default_exec_timeout_secs")]
    pub exec_timeout_secs: u64,

    /// Maximum number of concurrently running execution jobs
    #[serde(default = "default_exec_max_jobs")]
    pub exec_max_jobs: usize,

    /// Byte ceiling on captured job output
    #[serde(default = "default_exec_output_limit_bytes")]
    pub exec_output_limit_bytes: usize,
}

impl Config {
    /// Load configuration from environment variables or app.env file
    pub fn load() -> Result<Self, ConfigError> {
        // Try to load from app.env file first
        if std::path::Path::new("app.env").exists() {
            dotenvy::from_filename("app.env").ok();
        } else {
            // Fallback to .env file
            dotenvy::dotenv().ok();
        }

        // Load from environment variables using envy
        match envy::from_env::<Config>() {
            Ok(config) => {
                info!("Configuration loaded successfully");
                Ok(config)
            }
            Err(e) => {
                error!("Failed to load configuration: {}", e);
                Err(ConfigError::EnvError(e))
            }
        }
    }

    /// Get the full server address
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn persist_debounce(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.persist_debounce_ms)
    }

    pub fn exec_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.exec_timeout_secs)
    }

    /// Check if running in development mode
    pub fn is_development(&self) -> bool {
        self.environment.to_lowercase() == "dev" || self.environment.to_lowercase() == "development"
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            environment: default_environment(),
            log_level: default_log_level(),
            cors_origins: None,
            service_name: default_service_name(),
            db_url: None,
            redis_url: None,
            persist_debounce_ms: default_persist_debounce_ms(),
            sandbox_backend: default_sandbox_backend(),
            exec_timeout_secs: default_exec_timeout_secs(),
            exec_max_jobs: default_exec_max_jobs(),
            exec_output_limit_bytes: default_exec_output_limit_bytes(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    EnvError(envy::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::EnvError(e) => write!(f, "Environment variable error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "nexus-collab".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_persist_debounce_ms() -> u64 {
    2000
}

fn default_sandbox_backend() -> String {
    "docker".to_string()
}

fn default_exec_timeout_secs() -> u64 {
    10
}

fn default_exec_max_jobs() -> usize {
    4
}

fn default_exec_output_limit_bytes() -> usize {
    64 * 1024
}
