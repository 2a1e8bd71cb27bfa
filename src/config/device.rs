//! Device records and the validation rules applied when they are edited.

use crate::delivery::INGEST_PATH;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use thiserror::Error;

/// Allowed shape of an ingestion key.
pub const KEY_PATTERN: &str = r"^[A-Za-z0-9_-]{4,64}$";

static KEY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(KEY_PATTERN).expect("Valid regex"));

fn default_name() -> String {
    "Unknown".to_string()
}

fn default_true() -> bool {
    true
}

fn default_poll_seconds() -> u64 {
    30
}

/// One tracked device.
///
/// Immutable for the lifetime of the watcher built from it; edits go through
/// [`DeviceUpdate`] and a reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub server_url: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    /// 0 disables polling
    #[serde(default = "default_poll_seconds")]
    pub poll_seconds: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            entity_id: None,
            key: None,
            server_url: None,
            enabled: true,
            verify_ssl: true,
            poll_seconds: default_poll_seconds(),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

impl DeviceConfig {
    pub fn entity_id(&self) -> Option<&str> {
        non_empty(&self.entity_id)
    }

    pub fn key(&self) -> Option<&str> {
        non_empty(&self.key)
    }

    pub fn server_url(&self) -> Option<&str> {
        non_empty(&self.server_url)
    }

    /// Names of required fields that are absent or empty.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.entity_id().is_none() {
            missing.push("entity_id");
        }
        if self.key().is_none() {
            missing.push("key");
        }
        if self.server_url().is_none() {
            missing.push("server_url");
        }
        missing
    }

    /// Check the record the way the editing layer does before storing it.
    pub fn validate(&self) -> Result<(), Vec<DeviceValidationError>> {
        let mut errors = Vec::new();

        let server = self.server_url.as_deref().unwrap_or("").trim();
        if !(server.starts_with("http://") || server.starts_with("https://")) {
            errors.push(DeviceValidationError::MustStartHttp);
        }
        if server.contains(INGEST_PATH) {
            errors.push(DeviceValidationError::IncludesIngestPath);
        }

        let key = self.key.as_deref().unwrap_or("").trim();
        if !KEY_RE.is_match(key) {
            errors.push(DeviceValidationError::InvalidKey);
        }

        if self.entity_id.as_deref().unwrap_or("").trim().is_empty() {
            errors.push(DeviceValidationError::EntityIdRequired);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Field-level problems reported by [`DeviceConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceValidationError {
    #[error("server_url must start with http:// or https://")]
    MustStartHttp,

    #[error("server_url must not include /api/ingest.php")]
    IncludesIngestPath,

    #[error("key must be 4-64 characters of A-Z, a-z, 0-9, '_' or '-'")]
    InvalidKey,

    #[error("entity_id is required")]
    EntityIdRequired,
}

/// Partial edit of a stored device record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_ssl: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_seconds: Option<u64>,
}

impl DeviceUpdate {
    /// Return a copy of `device` with the provided fields replaced.
    /// String fields are trimmed.
    pub fn apply_to(&self, device: &DeviceConfig) -> DeviceConfig {
        let mut updated = device.clone();
        if let Some(name) = &self.name {
            updated.name = name.trim().to_string();
        }
        if let Some(entity_id) = &self.entity_id {
            updated.entity_id = Some(entity_id.trim().to_string());
        }
        if let Some(server_url) = &self.server_url {
            updated.server_url = Some(server_url.trim().to_string());
        }
        if let Some(key) = &self.key {
            updated.key = Some(key.trim().to_string());
        }
        if let Some(enabled) = self.enabled {
            updated.enabled = enabled;
        }
        if let Some(verify_ssl) = self.verify_ssl {
            updated.verify_ssl = verify_ssl;
        }
        if let Some(poll_seconds) = self.poll_seconds {
            updated.poll_seconds = poll_seconds;
        }
        updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_device() -> DeviceConfig {
        DeviceConfig {
            name: "Phone".to_string(),
            entity_id: Some("device_tracker.phone".to_string()),
            key: Some("BANANA-1234".to_string()),
            server_url: Some("https://example.org/geomap".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_for_absent_keys() {
        let device: DeviceConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(device.name, "Unknown");
        assert!(device.enabled);
        assert!(device.verify_ssl);
        assert_eq!(device.poll_seconds, 30);
        assert_eq!(device.missing_fields(), vec!["entity_id", "key", "server_url"]);
    }

    #[test]
    fn test_empty_strings_count_as_missing() {
        let device = DeviceConfig {
            key: Some(String::new()),
            ..valid_device()
        };
        assert_eq!(device.key(), None);
        assert_eq!(device.missing_fields(), vec!["key"]);
    }

    #[test]
    fn test_valid_device_passes() {
        assert_eq!(valid_device().validate(), Ok(()));
    }

    #[test]
    fn test_server_url_rules() {
        let device = DeviceConfig {
            server_url: Some("ftp://example.org".to_string()),
            ..valid_device()
        };
        assert_eq!(
            device.validate(),
            Err(vec![DeviceValidationError::MustStartHttp])
        );

        let device = DeviceConfig {
            server_url: Some("https://example.org/api/ingest.php".to_string()),
            ..valid_device()
        };
        assert_eq!(
            device.validate(),
            Err(vec![DeviceValidationError::IncludesIngestPath])
        );
    }

    #[test]
    fn test_key_rules() {
        let too_long = "x".repeat(65);
        for bad in ["abc", "has space", "ümlaut-key", too_long.as_str()] {
            let device = DeviceConfig {
                key: Some(bad.to_string()),
                ..valid_device()
            };
            assert_eq!(
                device.validate(),
                Err(vec![DeviceValidationError::InvalidKey]),
                "key {bad:?}"
            );
        }

        let device = DeviceConfig {
            key: Some("  abcd  ".to_string()),
            ..valid_device()
        };
        assert_eq!(device.validate(), Ok(()));
    }

    #[test]
    fn test_everything_missing_reports_all() {
        let errors = DeviceConfig::default().validate().unwrap_err();
        assert_eq!(
            errors,
            vec![
                DeviceValidationError::MustStartHttp,
                DeviceValidationError::InvalidKey,
                DeviceValidationError::EntityIdRequired,
            ]
        );
    }

    #[test]
    fn test_update_applies_only_given_fields() {
        let update = DeviceUpdate {
            name: Some("  Tablet ".to_string()),
            poll_seconds: Some(0),
            ..Default::default()
        };
        let updated = update.apply_to(&valid_device());
        assert_eq!(updated.name, "Tablet");
        assert_eq!(updated.poll_seconds, 0);
        assert_eq!(updated.entity_id, valid_device().entity_id);
    }
}
