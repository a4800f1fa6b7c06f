//! Relay configuration loading.
//!
//! The gateway reads one TOML file at startup. Every field has a default,
//! so an absent, unreadable, or malformed file degrades to the built-in
//! configuration with a warning rather than refusing to start.

use std::path::Path;

use chatwire_types::config::RelayConfig;
use tracing::{info, warn};

pub fn load_config(path: Option<&Path>) -> RelayConfig {
    let Some(path) = path else {
        return RelayConfig::default();
    };

    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "config file unreadable, using defaults");
            return RelayConfig::default();
        }
    };

    match toml::from_str(&raw) {
        Ok(config) => {
            info!(path = %path.display(), "configuration loaded");
            config
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "malformed config file, using defaults");
            RelayConfig::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn no_path_yields_defaults() {
        let config = load_config(None);
        assert_eq!(config.max_payload_bytes, RelayConfig::default().max_payload_bytes);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = load_config(Some(Path::new("/nonexistent/chatwire.toml")));
        assert_eq!(config.mailbox_capacity, RelayConfig::default().mailbox_capacity);
    }

    #[test]
    fn valid_file_overrides_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_payload_bytes = 512").unwrap();
        writeln!(file, "max_retries = 9").unwrap();

        let config = load_config(Some(file.path()));
        assert_eq!(config.max_payload_bytes, 512);
        assert_eq!(config.max_retries, 9);
        // Untouched fields keep their defaults.
        assert_eq!(config.mailbox_capacity, RelayConfig::default().mailbox_capacity);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_payload_bytes = \"not a number\"").unwrap();

        let config = load_config(Some(file.path()));
        assert_eq!(config.max_payload_bytes, RelayConfig::default().max_payload_bytes);
    }
}
