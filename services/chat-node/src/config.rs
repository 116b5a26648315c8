//! Configuration for the chat node.

use std::fmt;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, bail, Result};
use chatfleet_id::NodeId;
use reqwest::Url;

use crate::scheduler::DEFAULT_PORT_RANGE;

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Production => write!(f, "production"),
        }
    }
}

impl FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => bail!("unknown environment {other:?}"),
        }
    }
}

/// Chat node configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identifier for this node in logs.
    pub node_id: NodeId,

    pub environment: Environment,

    /// Public listener port.
    pub port: u16,

    /// Admin listener port.
    pub admin_port: u16,

    /// Externally reachable base address advertised to load balancers.
    pub host: String,

    /// Key for the public API. Empty rejects every request.
    pub key: String,

    /// Key for the admin API. Empty rejects every request.
    pub admin_key: String,

    /// Shared key sent with registrations.
    pub loadbalancer_key: String,

    /// Load balancer base URLs.
    pub loadbalancers: Vec<Url>,

    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,

    /// Path to the `chat-room` worker binary.
    pub worker_bin: PathBuf,

    /// Ports scanned for new rooms.
    pub port_range: RangeInclusive<u16>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, reporting every invalid value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("CHATFLEET_{name}"));
        let mut problems = Vec::new();

        let node_id = var("NODE_ID")
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(NodeId::new);

        let environment = match var("ENV") {
            Some(s) => s.parse().unwrap_or_else(|e: anyhow::Error| {
                problems.push(format!("\"ENV\" {e}"));
                Environment::Development
            }),
            None => Environment::Development,
        };

        let port = parse_port(var("PORT"), "PORT", 80, 80, &mut problems);
        let admin_port = parse_port(var("ADMIN_PORT"), "ADMIN_PORT", 8090, 8000, &mut problems);

        let host = var("HOST").unwrap_or_else(|| "http://0.0.0.0".to_string());
        if Url::parse(&host).is_err() {
            problems.push("\"HOST\" must be a valid uri".to_string());
        }
        let host = host.trim_end_matches('/').to_string();

        let key = token(var("KEY"), "KEY", &mut problems).unwrap_or_default();
        let admin_key = token(var("ADMIN_KEY"), "ADMIN_KEY", &mut problems).unwrap_or_default();

        let loadbalancer_key = match token(var("LOADBALANCER_KEY"), "LOADBALANCER_KEY", &mut problems)
        {
            Some(key) if !key.is_empty() => key,
            Some(_) => {
                problems.push("\"LOADBALANCER_KEY\" is not allowed to be empty".to_string());
                String::new()
            }
            None => {
                problems.push("\"LOADBALANCER_KEY\" is required".to_string());
                String::new()
            }
        };

        let loadbalancers = match var("LOADBALANCERS") {
            Some(list) => parse_loadbalancers(&list, &mut problems),
            None => {
                problems.push("\"LOADBALANCERS\" is required".to_string());
                Vec::new()
            }
        };

        let heartbeat_interval_secs = match var("HEARTBEAT_INTERVAL") {
            Some(s) => match s.parse::<u64>() {
                Ok(secs) if secs > 0 => secs,
                _ => {
                    problems.push("\"HEARTBEAT_INTERVAL\" must be a positive integer".to_string());
                    10
                }
            },
            None => 10,
        };

        let worker_bin = match var("WORKER_BIN") {
            Some(path) => PathBuf::from(path),
            None => default_worker_bin(),
        };

        let port_range = match var("PORT_RANGE") {
            Some(s) => parse_port_range(&s).unwrap_or_else(|e| {
                problems.push(format!("\"PORT_RANGE\" {e}"));
                DEFAULT_PORT_RANGE
            }),
            None => DEFAULT_PORT_RANGE,
        };

        let log_level = var("LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        if !problems.is_empty() {
            bail!("Invalid configuration:\n{}", problems.join(".\n"));
        }

        Ok(Self {
            node_id,
            environment,
            port,
            admin_port,
            host,
            key,
            admin_key,
            loadbalancer_key,
            loadbalancers,
            heartbeat_interval_secs,
            worker_bin,
            port_range,
            log_level,
        })
    }

    /// Address advertised to load balancers: `{host}:{port}`.
    pub fn advertised_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_port(
    value: Option<String>,
    name: &str,
    default: u16,
    min: u16,
    problems: &mut Vec<String>,
) -> u16 {
    let Some(value) = value else {
        return default;
    };
    match value.parse::<u16>() {
        Ok(port) if port >= min => port,
        Ok(_) => {
            problems.push(format!("\"{name}\" must be greater than or equal to {min}"));
            default
        }
        Err(_) => {
            problems.push(format!("\"{name}\" must be a number between {min} and 65535"));
            default
        }
    }
}

/// Keys are word characters only.
fn token(value: Option<String>, name: &str, problems: &mut Vec<String>) -> Option<String> {
    let value = value?;
    if value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        Some(value)
    } else {
        problems.push(format!(
            "\"{name}\" must only contain alpha-numeric and underscore characters"
        ));
        Some(String::new())
    }
}

fn parse_loadbalancers(list: &str, problems: &mut Vec<String>) -> Vec<Url> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match Url::parse(entry) {
            Ok(url) => Some(url),
            Err(e) => {
                problems.push(format!("\"LOADBALANCERS\" entry {entry:?} is invalid: {e}"));
                None
            }
        })
        .collect()
}

/// Parse `min-max` into an inclusive range.
pub fn parse_port_range(s: &str) -> Result<RangeInclusive<u16>> {
    let (min, max) = s
        .split_once('-')
        .ok_or_else(|| anyhow!("must look like min-max"))?;
    let min: u16 = min.trim().parse().map_err(|_| anyhow!("has an invalid start"))?;
    let max: u16 = max.trim().parse().map_err(|_| anyhow!("has an invalid end"))?;
    if min == 0 || min > max {
        bail!("must satisfy 0 < min <= max");
    }
    Ok(min..=max)
}

/// `chat-room` next to the running executable.
fn default_worker_bin() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("chat-room")))
        .unwrap_or_else(|| PathBuf::from("chat-room"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (format!("CHATFLEET_{k}"), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    const REQUIRED: [(&str, &str); 2] = [
        ("LOADBALANCER_KEY", "lbkey"),
        ("LOADBALANCERS", "http://lb-a:9000,http://lb-b:9000"),
    ];

    #[test]
    fn test_defaults() {
        let config = load(&REQUIRED).unwrap();
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.port, 80);
        assert_eq!(config.admin_port, 8090);
        assert_eq!(config.host, "http://0.0.0.0");
        assert_eq!(config.key, "");
        assert_eq!(config.admin_key, "");
        assert_eq!(config.loadbalancer_key, "lbkey");
        assert_eq!(config.loadbalancers.len(), 2);
        assert_eq!(config.heartbeat_interval_secs, 10);
        assert_eq!(config.port_range, 34000..=34050);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.advertised_address(), "http://0.0.0.0:80");
    }

    #[test]
    fn test_missing_required() {
        let err = load(&[]).unwrap_err().to_string();
        assert!(err.starts_with("Invalid configuration:"));
        assert!(err.contains("\"LOADBALANCER_KEY\" is required"));
        assert!(err.contains("\"LOADBALANCERS\" is required"));
    }

    #[test]
    fn test_blank_loadbalancer_entries_skipped() {
        let config = load(&[
            ("LOADBALANCER_KEY", "k"),
            ("LOADBALANCERS", "http://lb-a:9000,, ,http://lb-b:9000,"),
        ])
        .unwrap();
        assert_eq!(config.loadbalancers.len(), 2);
    }

    #[rstest]
    #[case("PORT", "79")]
    #[case("PORT", "70000")]
    #[case("PORT", "abc")]
    #[case("ADMIN_PORT", "7999")]
    #[case("HOST", "not a url")]
    #[case("KEY", "has space")]
    #[case("ENV", "staging")]
    #[case("PORT_RANGE", "34050-34000")]
    #[case("HEARTBEAT_INTERVAL", "0")]
    #[case("LOADBALANCERS", "not a url")]
    fn test_invalid_values(#[case] name: &str, #[case] value: &str) {
        let mut vars = REQUIRED.to_vec();
        vars.retain(|(k, _)| *k != name);
        vars.push((name, value));
        let err = load(&vars).unwrap_err().to_string();
        assert!(err.contains(name), "{err}");
    }

    #[rstest]
    #[case("34000-34050", 34000..=34050)]
    #[case("8000 - 8000", 8000..=8000)]
    fn test_parse_port_range(#[case] input: &str, #[case] expected: RangeInclusive<u16>) {
        assert_eq!(parse_port_range(input).unwrap(), expected);
    }

    #[test]
    fn test_production_environment() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("ENV", "production"));
        vars.push(("HOST", "https://chat.example.com/"));
        let config = load(&vars).unwrap();
        assert!(config.environment.is_production());
        assert_eq!(config.host, "https://chat.example.com");
    }
}
