use crate::config::types::{JailError, Result, SessionConfig};
/// Configuration loading from JSON session files
use std::path::Path;

/// Load a base session configuration from a JSON file.
/// Fields missing from the file keep their `Default` values.
pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<SessionConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        JailError::Config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;

    let config: SessionConfig = serde_json::from_str(&content)
        .map_err(|e| JailError::Config(format!("Failed to parse config JSON: {}", e)))?;

    log::debug!("Loaded session config from {}", path.display());
    Ok(config)
}

/// Parse a `hh:mm:ss` wall-clock limit into seconds.
pub fn parse_timeout(value: &str) -> Result<u64> {
    let invalid = || JailError::Config(format!("Invalid timeout {:?}, expected hh:mm:ss", value));

    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() != 3 {
        return Err(invalid());
    }

    let mut fields = [0u64; 3];
    for (slot, part) in fields.iter_mut().zip(&parts) {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        *slot = part.parse().map_err(|_| invalid())?;
    }

    let [hours, minutes, seconds] = fields;
    if minutes > 59 || seconds > 59 {
        return Err(invalid());
    }

    let total = hours * 3600 + minutes * 60 + seconds;
    if total == 0 {
        return Err(JailError::Config("timeout must be greater than zero".to_string()));
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{CapabilityPolicy, ProgramSpec};
    use std::io::Write;

    #[test]
    fn parses_timeout_components() {
        assert_eq!(parse_timeout("00:00:05").unwrap(), 5);
        assert_eq!(parse_timeout("01:02:03").unwrap(), 3723);
        assert_eq!(parse_timeout("100:00:00").unwrap(), 360_000);
    }

    #[test]
    fn rejects_malformed_timeouts() {
        for bad in ["5", "00:05", "00:60:00", "00:00:60", "aa:bb:cc", "00:00:00", "-1:00:00"] {
            assert!(parse_timeout(bad).is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn loads_partial_config_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "program": {{"direct": {{"argv": ["xterm"]}}}},
                "capabilities": "drop_all",
                "timeout": 30,
                "noroot": true
            }}"#
        )
        .unwrap();

        let config = load_from_file(file.path()).unwrap();
        assert_eq!(
            config.program,
            ProgramSpec::Direct { argv: vec!["xterm".to_string()] }
        );
        assert_eq!(config.capabilities, CapabilityPolicy::DropAll);
        assert_eq!(config.timeout, Some(30));
        assert!(config.noroot);
        assert!(!config.no_new_privs);
    }

    #[test]
    fn reports_parse_failures_as_config_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(load_from_file(file.path()), Err(JailError::Config(_))));
    }
}
