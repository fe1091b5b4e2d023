//! Controller configuration.
//!
//! ```yaml
//! session_type: temporary
//! robustness_level: SW_SECURE_CRYPTO
//! negotiation_timeout: 10
//! license_timeout: ~
//! protection_data:
//!   com.widevine.alpha:
//!     server_url: https://license.example/wv
//!     http_request_headers:
//!       X-Custom: token
//! ```
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protection::ProtectionDataSet;
use crate::session::SessionType;

const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_LICENSE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Session type for new sessions unless protection data says otherwise.
    pub session_type: SessionType,
    /// Robustness requested for both audio and video; empty for none.
    pub robustness_level: String,
    /// Seconds to wait for key system access and selection. `null` waits
    /// forever.
    #[serde(with = "seconds")]
    pub negotiation_timeout: Option<Duration>,
    /// Seconds to wait for one license exchange. `null` waits forever.
    #[serde(with = "seconds")]
    pub license_timeout: Option<Duration>,
    pub protection_data: ProtectionDataSet,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            session_type: SessionType::Temporary,
            robustness_level: String::new(),
            negotiation_timeout: Some(DEFAULT_NEGOTIATION_TIMEOUT),
            license_timeout: Some(DEFAULT_LICENSE_TIMEOUT),
            protection_data: ProtectionDataSet::new(),
        }
    }
}

impl ControllerConfig {
    /// Load a configuration file. `.json` files are read as JSON, anything
    /// else as YAML.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_yaml_str(&content)
        }
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()
    }

    fn validate(self) -> Result<Self> {
        for (name, timeout) in [
            ("negotiation_timeout", self.negotiation_timeout),
            ("license_timeout", self.license_timeout),
        ] {
            if timeout.is_some_and(|t| t.is_zero()) {
                return Err(Error::InvalidConfig(format!(
                    "{} must be positive or null",
                    name
                )));
            }
        }
        Ok(self)
    }
}

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        match Option::<f64>::deserialize(deserializer)? {
            Some(secs) => Duration::try_from_secs_f64(secs)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
