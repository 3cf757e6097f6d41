//! Configuration for the external metrics adapter service

use crate::client::DEFAULT_APP_NAME;
use clap::Parser;
use std::env;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://api.circonus.com/v2";

/// Configuration for the external metrics adapter
#[derive(Debug, Clone, Parser)]
#[command(name = "external-metrics-adapter")]
#[command(about = "Serves Circonus CAQL query results as Kubernetes external metrics")]
pub struct Config {
    /// Base URL of the Circonus API
    #[arg(long = "circonus-api-url", env = "CIRCONUS_API_URL", default_value = DEFAULT_API_URL)]
    pub api_url: String,

    /// Directory holding query configuration documents as <namespace>/<name>.yaml
    #[arg(long, env, default_value = "/etc/external-metrics-adapter")]
    pub config_dir: String,

    /// Seconds between configuration refreshes
    #[arg(long, env, default_value_t = 10)]
    pub refresh_interval_secs: u64,

    /// Seconds before a backend query is abandoned
    #[arg(long, env, default_value_t = 30)]
    pub query_timeout_secs: u64,

    /// Address the metrics API listens on
    #[arg(long, env, default_value = "0.0.0.0:6443")]
    pub listen_addr: String,

    /// Application name reported to the Circonus API
    #[arg(long, env, default_value = DEFAULT_APP_NAME)]
    pub app_name: String,

    /// Output logs in JSON format
    #[arg(long, env)]
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: env::var("CIRCONUS_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string()),
            config_dir: env::var("CONFIG_DIR")
                .unwrap_or_else(|_| "/etc/external-metrics-adapter".to_string()),
            refresh_interval_secs: env::var("REFRESH_INTERVAL_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .unwrap_or(10),
            query_timeout_secs: env::var("QUERY_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .unwrap_or(30),
            listen_addr: env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:6443".to_string()),
            app_name: env::var("APP_NAME").unwrap_or_else(|_| DEFAULT_APP_NAME.to_string()),
            log_json: env::var("LOG_JSON")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
        }
    }
}

impl Config {
    /// Parse configuration from command-line args and environment variables
    pub fn parse_config() -> Self {
        Config::parse()
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            api_url: DEFAULT_API_URL.to_string(),
            config_dir: "/tmp/adapter".to_string(),
            refresh_interval_secs: 10,
            query_timeout_secs: 30,
            listen_addr: "127.0.0.1:6443".to_string(),
            app_name: DEFAULT_APP_NAME.to_string(),
            log_json: false,
        }
    }

    #[test]
    fn test_durations_are_never_zero() {
        let mut config = test_config();
        assert_eq!(config.refresh_interval(), Duration::from_secs(10));

        config.refresh_interval_secs = 0;
        config.query_timeout_secs = 0;
        assert_eq!(config.refresh_interval(), Duration::from_secs(1));
        assert_eq!(config.query_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_default_matches_command_line_defaults() {
        let parsed = Config::try_parse_from(["external-metrics-adapter"]).unwrap();
        let default = Config::default();

        assert_eq!(parsed.api_url, default.api_url);
        assert_eq!(parsed.config_dir, default.config_dir);
        assert_eq!(parsed.listen_addr, default.listen_addr);
        assert_eq!(parsed.app_name, default.app_name);
        assert_eq!(parsed.refresh_interval(), default.refresh_interval());
    }

    #[test]
    fn test_command_line_overrides() {
        let config = Config::try_parse_from([
            "external-metrics-adapter",
            "--circonus-api-url",
            "https://circonus.internal/api",
            "--refresh-interval-secs",
            "5",
        ])
        .unwrap();

        assert_eq!(config.api_url, "https://circonus.internal/api");
        assert_eq!(config.refresh_interval(), Duration::from_secs(5));
    }
}
