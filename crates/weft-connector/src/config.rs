use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use weft_types::ObjectClass;

use crate::error::{ConnectorError, ConnectorResult};

/// Size of the fixed object-info broadcast header: two identifier halves
/// and three record lengths.
pub const OBJECT_INFO_HEADER_LEN: usize = 5 * 8;

/// Configuration for a connector instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Pool to connect to.
    pub pool: Uuid,
    /// Store server group name.
    pub group: String,
    /// Per-container placement-class default. `None` uses the kind default.
    pub default_object_class: Option<ObjectClass>,
    /// Key descriptors requested per listing page.
    pub key_prefetch_size: usize,
    /// Initial listing key buffer size in bytes.
    pub key_buffer_size: usize,
    /// Static buffer size of the first object-info broadcast.
    pub broadcast_static_size: usize,
    /// Engine progress slice used by the progress pump, in milliseconds.
    pub poll_interval_ms: u64,
    /// Timeout for blocking operations, in milliseconds. `None` waits forever.
    pub operation_timeout_ms: Option<u64>,
    /// Read object metadata on the coordinator only and broadcast it.
    pub collective_metadata: bool,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            pool: Uuid::nil(),
            group: "weft_server".to_string(),
            default_object_class: None,
            key_prefetch_size: 32,
            key_buffer_size: 1024,
            broadcast_static_size: 1024,
            poll_interval_ms: 1,
            operation_timeout_ms: None,
            collective_metadata: false,
        }
    }
}

impl ConnectorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_ms.map(Duration::from_millis)
    }

    /// Parse a TOML document. Missing fields keep their defaults.
    pub fn from_toml_str(s: &str) -> ConnectorResult<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> ConnectorResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `WEFT_POOL`, `WEFT_GROUP` and `WEFT_OBJECT_CLASS` from the
    /// process environment.
    pub fn apply_env(&mut self) -> ConnectorResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> ConnectorResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(pool) = lookup("WEFT_POOL") {
            self.pool = Uuid::parse_str(pool.trim())
                .map_err(|e| ConnectorError::Config(format!("WEFT_POOL: {e}")))?;
        }
        if let Some(group) = lookup("WEFT_GROUP") {
            self.group = group;
        }
        if let Some(class) = lookup("WEFT_OBJECT_CLASS") {
            self.default_object_class = Some(ObjectClass::from_name(class.trim())?);
        }
        Ok(())
    }

    /// Reject settings the connector cannot run with.
    pub fn validate(&self) -> ConnectorResult<()> {
        if self.key_prefetch_size == 0 {
            return Err(ConnectorError::Config(
                "key_prefetch_size must be at least 1".into(),
            ));
        }
        if self.key_buffer_size < 2 {
            return Err(ConnectorError::Config(
                "key_buffer_size must be at least 2 bytes".into(),
            ));
        }
        if self.broadcast_static_size < OBJECT_INFO_HEADER_LEN {
            return Err(ConnectorError::Config(format!(
                "broadcast_static_size must be at least {OBJECT_INFO_HEADER_LEN} bytes"
            )));
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> ConnectorResult<String> {
        toml::to_string_pretty(self).map_err(|e| ConnectorError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = ConnectorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.group, "weft_server");
        assert_eq!(config.key_prefetch_size, 32);
        assert_eq!(config.poll_interval(), Duration::from_millis(1));
        assert_eq!(config.operation_timeout(), None);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = ConnectorConfig::from_toml_str(
            r#"
            group = "lab"
            default_object_class = "S2"
            key_prefetch_size = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.group, "lab");
        assert_eq!(config.default_object_class, Some(ObjectClass::S2));
        assert_eq!(config.key_prefetch_size, 4);
        assert_eq!(config.key_buffer_size, 1024);
    }

    #[test]
    fn unknown_class_in_toml_is_an_error() {
        let err = ConnectorConfig::from_toml_str("default_object_class = \"Q9\"").unwrap_err();
        assert!(matches!(err, ConnectorError::Toml(_)));
    }

    #[test]
    fn overrides_replace_file_values() {
        let mut config = ConnectorConfig::default();
        let vars: HashMap<&str, &str> = [
            ("WEFT_POOL", "00000000-0000-0000-0000-00000000002a"),
            ("WEFT_GROUP", "override"),
            ("WEFT_OBJECT_CLASS", "sx"),
        ]
        .into_iter()
        .collect();
        config
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.pool, Uuid::from_u128(42));
        assert_eq!(config.group, "override");
        assert_eq!(config.default_object_class, Some(ObjectClass::SX));
    }

    #[test]
    fn bad_pool_override_is_rejected() {
        let mut config = ConnectorConfig::default();
        let err = config
            .apply_overrides(|k| (k == "WEFT_POOL").then(|| "not-a-uuid".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Config(_)));
    }

    #[test]
    fn validate_rejects_degenerate_sizes() {
        let mut config = ConnectorConfig {
            key_prefetch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        config.key_prefetch_size = 1;
        config.key_buffer_size = 1;
        assert!(config.validate().is_err());
        config.key_buffer_size = 2;
        config.broadcast_static_size = OBJECT_INFO_HEADER_LEN - 1;
        assert!(config.validate().is_err());
        config.broadcast_static_size = OBJECT_INFO_HEADER_LEN;
        config.validate().unwrap();
    }

    #[test]
    fn load_from_file_roundtrips() {
        let config = ConnectorConfig {
            pool: Uuid::from_u128(9),
            key_buffer_size: 64,
            operation_timeout_ms: Some(250),
            ..Default::default()
        };
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.to_toml_string().unwrap().as_bytes())
            .unwrap();
        let loaded = ConnectorConfig::load(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn json_form_names_the_class() {
        let config = ConnectorConfig {
            default_object_class: Some(ObjectClass::S2),
            ..Default::default()
        };
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["default_object_class"], "S2");
        assert_eq!(value["operation_timeout_ms"], serde_json::Value::Null);
        let back: ConnectorConfig = serde_json::from_value(value).unwrap();
        assert_eq!(back, config);
    }
}
