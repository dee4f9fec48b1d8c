//! Server list configuration loading.

use crate::config::{validate_config, ServerList};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("failed to parse JSON: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Load the server list from a JSON file.
///
/// Reads the file, parses the JSON array, collapses duplicate `host:port`
/// keys (last one wins), and validates the result is non-empty.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<ServerList, ConfigError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)?;
    let servers: ServerList = serde_json::from_str(&contents)?;
    let servers = dedupe_last_wins(servers);
    validate_config(&servers).map_err(ConfigError::ValidationError)?;
    Ok(servers)
}

/// Collapse entries sharing a `host:port` key, keeping the last occurrence's
/// position and value.
fn dedupe_last_wins(servers: ServerList) -> ServerList {
    let mut order = Vec::new();
    let mut by_key = std::collections::HashMap::new();
    for entry in servers {
        let key = format!("{}:{}", entry.host, entry.port);
        if !by_key.contains_key(&key) {
            order.push(key.clone());
        }
        by_key.insert(key, entry);
    }
    order
        .into_iter()
        .map(|key| by_key.remove(&key).expect("key was just inserted"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerEntry;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn load_minimal_config() {
        let json = r#"[{"host": "127.0.0.1", "port": 9000}]"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let servers = load_config(file.path()).unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].host, "127.0.0.1");
    }

    #[test]
    fn load_missing_file() {
        let result = load_config("/nonexistent/path/servers.json");
        assert!(matches!(result.unwrap_err(), ConfigError::ReadError(_)));
    }

    #[test]
    fn load_invalid_json() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"not json at all").unwrap();
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn load_empty_array_is_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"[]").unwrap();
        let result = load_config(file.path());
        assert!(matches!(result.unwrap_err(), ConfigError::ValidationError(_)));
    }

    #[test]
    fn duplicate_host_port_collapses_last_wins() {
        let servers = dedupe_last_wins(vec![
            ServerEntry { host: "a".into(), port: 1 },
            ServerEntry { host: "b".into(), port: 2 },
            ServerEntry { host: "a".into(), port: 1 },
        ]);
        assert_eq!(servers.len(), 2);
    }
}
