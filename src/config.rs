//! Daemon configuration: compiled-in defaults, overridden from the environment.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::store::{DEFAULT_QUERY_TIMEOUT, IN_MEMORY};

const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);
const SOCKET_NAME: &str = "dirindex.sock";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Database file, or [`IN_MEMORY`].
    pub db_path: String,
    pub root: PathBuf,
    /// Pause between rebuilds; zero rebuilds once.
    pub refresh_interval: Duration,
    /// Serve every query from the snapshot, never from the filesystem.
    pub cached_only: bool,
    pub query_timeout: Duration,
    pub socket_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let db_path = dirs::data_dir()
            .map(|dir| dir.join("dirindex").join("index.db").to_string_lossy().into_owned())
            .unwrap_or_else(|| IN_MEMORY.to_string());
        let socket_path = dirs::runtime_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(SOCKET_NAME);

        Self {
            db_path,
            root: PathBuf::from("."),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            cached_only: false,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            socket_path,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from defaults plus whatever `lookup` returns for the
    /// `DIRINDEX_*` keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(db) = lookup("DIRINDEX_DB") {
            config.db_path = db;
        }
        if let Some(root) = lookup("DIRINDEX_ROOT") {
            config.root = PathBuf::from(root);
        }
        if let Some(refresh) = lookup("DIRINDEX_REFRESH") {
            config.refresh_interval = parse_duration(&refresh)?;
        }
        if let Some(cached) = lookup("DIRINDEX_CACHED") {
            config.cached_only = parse_bool(&cached)?;
        }
        if let Some(timeout) = lookup("DIRINDEX_TIMEOUT") {
            config.query_timeout = parse_duration(&timeout)?;
        }
        if let Some(socket) = lookup("DIRINDEX_SOCKET") {
            config.socket_path = PathBuf::from(socket);
        }

        Ok(config)
    }
}

/// Parses `0` or a sequence of `<number><unit>` groups such as `1h30m` or `250ms`.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    if value == "0" {
        return Ok(Duration::ZERO);
    }
    if value.is_empty() {
        return Err(Error::Config("empty duration".to_string()));
    }

    let invalid = || Error::Config(format!("invalid duration {:?}", value));

    let mut total = Duration::ZERO;
    let mut rest = value;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(invalid());
        }
        let amount: u64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit = match &rest[..unit_len] {
            "ms" => Duration::from_millis(amount),
            "s" => Duration::from_secs(amount),
            "m" => Duration::from_secs(amount.saturating_mul(60)),
            "h" => Duration::from_secs(amount.saturating_mul(60 * 60)),
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];
        total = total.saturating_add(unit);
    }

    Ok(total)
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(Error::Config(format!("invalid boolean {:?}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1s").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration(" 2m5s ").unwrap(), Duration::from_secs(125));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        for bad in ["", "10", "s", "1d", "1.5s", "-1s", "1 s"] {
            assert!(
                matches!(parse_duration(bad), Err(Error::Config(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn test_overrides_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("DIRINDEX_DB", ":memory:"),
            ("DIRINDEX_ROOT", "/srv/files"),
            ("DIRINDEX_REFRESH", "0"),
            ("DIRINDEX_CACHED", "true"),
            ("DIRINDEX_TIMEOUT", "500ms"),
            ("DIRINDEX_SOCKET", "/tmp/test.sock"),
        ]
        .into_iter()
        .collect();

        let config = Config::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();

        assert_eq!(config.db_path, IN_MEMORY);
        assert_eq!(config.root, PathBuf::from("/srv/files"));
        assert_eq!(config.refresh_interval, Duration::ZERO);
        assert!(config.cached_only);
        assert_eq!(config.query_timeout, Duration::from_millis(500));
        assert_eq!(config.socket_path, PathBuf::from("/tmp/test.sock"));
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(|_| None).unwrap();

        assert_eq!(config, Config::default());
        assert_eq!(config.root, PathBuf::from("."));
        assert_eq!(config.refresh_interval, Duration::from_secs(3600));
        assert_eq!(config.query_timeout, Duration::from_secs(1));
        assert!(!config.cached_only);
        assert!(config.socket_path.ends_with(SOCKET_NAME));
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        let err = Config::from_lookup(|key| (key == "DIRINDEX_CACHED").then(|| "maybe".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = Config::from_lookup(|key| (key == "DIRINDEX_REFRESH").then(|| "soon".to_string()))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }
}
