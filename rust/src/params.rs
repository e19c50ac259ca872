//! Parameter descriptors and the built-in device parameter table.

use std::collections::HashSet;

use thiserror::Error;

use crate::storage::{check_key, StorageError};

pub const CONFIG_NAMESPACE: &str = "config";
pub const SECRETS_NAMESPACE: &str = "secrets";

#[derive(Debug, Error)]
pub enum ParamError {
    #[error("invalid key in namespace {namespace:?}: {source}")]
    InvalidKey {
        namespace: &'static str,
        #[source]
        source: StorageError,
    },
    #[error("duplicate key {key:?} in namespace {namespace:?}")]
    DuplicateKey {
        namespace: &'static str,
        key: &'static str,
    },
}

/// Build-time description of one stored parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigParam {
    /// Storage key, unique within its namespace.
    pub key: &'static str,
    /// Loading blocks until a non-empty value exists.
    pub mandatory: bool,
    /// Canonical stored form is encrypted.
    pub secret: bool,
    /// Subject to operator-requested reconfiguration.
    pub configurable: bool,
    pub prompt: &'static str,
}

/// Parameters sharing one storage namespace.
#[derive(Debug, Clone, Copy)]
pub struct ParamGroup {
    pub namespace: &'static str,
    pub params: &'static [ConfigParam],
}

pub const DEVICE_ID: ConfigParam = ConfigParam {
    key: "dvc_id",
    mandatory: true,
    secret: false,
    configurable: true,
    prompt: "Enter a unique network device ID that is used when connecting to the WiFi and Home Assistant: ",
};

pub const MANUFACTURER: ConfigParam = ConfigParam {
    key: "dvc_manuf",
    mandatory: false,
    secret: false,
    configurable: false,
    prompt: "Device Manufacturer: this should not need to be configured: ",
};

pub const MODEL: ConfigParam = ConfigParam {
    key: "dvc_model",
    mandatory: false,
    secret: false,
    configurable: false,
    prompt: "Device Model: this should not need to be configured: ",
};

pub const TIMEZONE: ConfigParam = ConfigParam {
    key: "tz",
    mandatory: true,
    secret: false,
    configurable: true,
    prompt: "Enter a standard TimeZone for your device to configure local time. A full list is available here https://en.wikipedia.org/wiki/List_of_tz_database_time_zones : ",
};

pub const MQTT_BROKER: ConfigParam = ConfigParam {
    key: "mqtt_broker_ip",
    mandatory: true,
    secret: false,
    configurable: true,
    prompt: "Please enter a valid IP address for the MQTT broker: ",
};

pub const WIFI_SSID: ConfigParam = ConfigParam {
    key: "s_wifi_ssid",
    mandatory: true,
    secret: true,
    configurable: true,
    prompt: "Enter your WiFi network SSID: ",
};

pub const WIFI_PASSWORD: ConfigParam = ConfigParam {
    key: "s_wifi_pwd",
    mandatory: true,
    secret: true,
    configurable: true,
    prompt: "Enter your WiFi password: ",
};

pub const MQTT_USER: ConfigParam = ConfigParam {
    key: "s_mqtt_user",
    mandatory: true,
    secret: true,
    configurable: true,
    prompt: "Enter your MQTT broker user name: ",
};

pub const MQTT_PASSWORD: ConfigParam = ConfigParam {
    key: "s_mqtt_pwd",
    mandatory: true,
    secret: true,
    configurable: true,
    prompt: "Enter your MQTT broker password: ",
};

pub const MQTT_CA: ConfigParam = ConfigParam {
    key: "s_mqtt_ca",
    mandatory: false,
    secret: true,
    configurable: true,
    prompt: "Enter your MQTT Broker Root CA (PEM format, or leave empty for plain MQTT): ",
};

pub const GENERAL: ParamGroup = ParamGroup {
    namespace: CONFIG_NAMESPACE,
    params: &[DEVICE_ID, MANUFACTURER, MODEL, TIMEZONE, MQTT_BROKER],
};

pub const SECRETS: ParamGroup = ParamGroup {
    namespace: SECRETS_NAMESPACE,
    params: &[WIFI_SSID, WIFI_PASSWORD, MQTT_USER, MQTT_PASSWORD, MQTT_CA],
};

pub const DEVICE_TABLE: &[ParamGroup] = &[GENERAL, SECRETS];

/// Checks every key against the backend's length limit and for duplicates
/// within its namespace. Run once at startup, before any load.
pub fn validate_table(groups: &[ParamGroup], max_key_len: usize) -> Result<(), ParamError> {
    for group in groups {
        let mut seen = HashSet::new();
        for param in group.params {
            check_key(param.key, max_key_len).map_err(|source| ParamError::InvalidKey {
                namespace: group.namespace,
                source,
            })?;
            if !seen.insert(param.key) {
                return Err(ParamError::DuplicateKey {
                    namespace: group.namespace,
                    key: param.key,
                });
            }
        }
    }
    Ok(())
}
