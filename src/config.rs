use std::path::Path;

use crate::error::ConfigError;

const DEFAULT_CONFIG_PATH: &str = "/etc/privcap.conf";
const DEFAULT_PRIVSEP_USER: &str = "nobody";
const DEFAULT_MAX_DRAIN: usize = 64;
const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Account workers switch to once their packet socket is open.
    pub privsep_user: String,
    /// Frames a worker forwards per wakeup before letting other events run.
    pub max_drain: usize,
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            privsep_user: DEFAULT_PRIVSEP_USER.to_string(),
            max_drain: DEFAULT_MAX_DRAIN,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("PRIVCAP_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        let mut config = if Path::new(&config_path).exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Self::parse(&content)?
        } else {
            Config::default()
        };

        // Allow environment variable overrides
        if let Ok(val) = std::env::var("PRIVCAP_USER") {
            config.privsep_user = val;
        }
        if let Ok(val) = std::env::var("PRIVCAP_MAX_DRAIN") {
            config.max_drain = parse_max_drain("PRIVCAP_MAX_DRAIN", &val)?;
        }
        if let Ok(val) = std::env::var("PRIVCAP_LOG") {
            config.log_filter = val;
        }

        Ok(config)
    }

    /// Parse `key = value` lines. Blank lines and `#` comments are skipped,
    /// unknown keys are ignored.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim();
                match key {
                    "privsep_user" => {
                        if value.is_empty() {
                            return Err(invalid(key, value));
                        }
                        config.privsep_user = value.to_string();
                    }
                    "max_drain" => config.max_drain = parse_max_drain(key, value)?,
                    "log_filter" => config.log_filter = value.to_string(),
                    _ => {}
                }
            }
        }

        Ok(config)
    }
}

fn parse_max_drain(key: &str, value: &str) -> Result<usize, ConfigError> {
    match value.parse::<usize>() {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(invalid(key, value)),
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
    }
}
