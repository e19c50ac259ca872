//! Device configuration resolved at boot, and the runtime settings that say
//! where the store and identity sources live.
//!
//! `setup_config` walks the built-in parameter table: general settings from
//! the `config` namespace first, then credentials from `secrets` once the
//! device key is available. The result is handed to the network and MQTT
//! layers as plain values.

use std::env;
use std::fmt;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::crypto::key::{AbsentIdentity, IdentitySource, KeyDeriver, PlatformMac, SecureElementSerial};
use crate::params::{
    ConfigParam, DEVICE_ID, DEVICE_TABLE, GENERAL, MANUFACTURER, MODEL, MQTT_BROKER, MQTT_CA, MQTT_PASSWORD,
    MQTT_USER, SECRETS, TIMEZONE, WIFI_PASSWORD, WIFI_SSID,
};
use crate::prompt::Prompter;
use crate::storage::{Backend, JsonFileBackend, StorageError};
use crate::store::{ParamStore, StoreError};

const DEFAULT_STORE_PATH: &str = "haiot-store.json";
const DEFAULT_PLATFORM_ID_PATH: &str = "/sys/class/net/eth0/address";
const RECONFIGURE_PROMPT: &str = "Do you want to configure the device?";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("settings file unreadable: {0}")]
    Io(String),
    #[error("settings parse failed: {0}")]
    Parse(String),
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Where this process finds its store and identity sources.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// JSON store file.
    pub store_path: PathBuf,
    /// Never offer the "configure the device?" question.
    pub no_reconfigure: bool,
    /// Hex serial of the secure element, when one is fitted.
    pub secure_element_path: Option<PathBuf>,
    /// MAC address file used when no secure element is available.
    pub platform_id_path: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from(DEFAULT_STORE_PATH),
            no_reconfigure: false,
            secure_element_path: None,
            platform_id_path: PathBuf::from(DEFAULT_PLATFORM_ID_PATH),
        }
    }
}

impl Settings {
    /// Reads `HAIOT_SETTINGS` (if set) and applies environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut settings = match env::var("HAIOT_SETTINGS") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        settings.apply_overrides(|var| env::var(var).ok())?;
        Ok(settings)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(&path).map_err(|e| ConfigError::Io(format!("{e}")))?;
        serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(format!("{e}")))
    }

    /// Applies `HAIOT_*` overrides from `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(path) = lookup("HAIOT_STORE_PATH") {
            self.store_path = PathBuf::from(path);
        }
        if let Some(flag) = lookup("HAIOT_NO_RECONFIGURE") {
            self.no_reconfigure = parse_flag("HAIOT_NO_RECONFIGURE", &flag)?;
        }
        if let Some(path) = lookup("HAIOT_SE_SERIAL_PATH") {
            self.secure_element_path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("HAIOT_PLATFORM_ID_PATH") {
            self.platform_id_path = PathBuf::from(path);
        }
        Ok(())
    }

    pub fn platform_source(&self) -> PlatformMac {
        PlatformMac::new(&self.platform_id_path)
    }

    pub fn key_deriver(&self) -> KeyDeriver {
        let hardware: Box<dyn IdentitySource> = match &self.secure_element_path {
            Some(path) => Box::new(SecureElementSerial::new(path)),
            None => Box::new(AbsentIdentity("secure-element")),
        };
        KeyDeriver::new(hardware, Box::new(self.platform_source()))
    }

    pub fn open_backend(&self) -> Result<JsonFileBackend, StorageError> {
        JsonFileBackend::load(&self.store_path)
    }
}

fn parse_flag(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var,
            value: value.to_string(),
        }),
    }
}

/// Resolved device configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub device_id: String,
    pub software_version: String,
    pub manufacturer: String,
    pub model: String,
    pub time_zone: String,
    pub mqtt_broker: Ipv4Addr,
    pub wifi_ssid: String,
    pub wifi_password: String,
    pub mqtt_user: String,
    pub mqtt_password: String,
    /// PEM root CA; empty selects plain MQTT.
    pub mqtt_ca: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
            manufacturer: "Arduino".to_string(),
            model: "Nano ESP32 S3".to_string(),
            time_zone: "Europe/London".to_string(),
            mqtt_broker: Ipv4Addr::UNSPECIFIED,
            wifi_ssid: String::new(),
            wifi_password: String::new(),
            mqtt_user: String::new(),
            mqtt_password: String::new(),
            mqtt_ca: String::new(),
        }
    }
}

impl fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("device_id", &self.device_id)
            .field("software_version", &self.software_version)
            .field("manufacturer", &self.manufacturer)
            .field("model", &self.model)
            .field("time_zone", &self.time_zone)
            .field("mqtt_broker", &self.mqtt_broker)
            .field("wifi_ssid", &"<redacted>")
            .field("wifi_password", &"<redacted>")
            .field("mqtt_user", &"<redacted>")
            .field("mqtt_password", &"<redacted>")
            .field("mqtt_tls", &!self.mqtt_ca.is_empty())
            .finish()
    }
}

impl DeviceConfig {
    /// Printable view with every credential withheld.
    pub fn redacted_summary(&self) -> serde_json::Value {
        let mark = |value: &str| if value.is_empty() { "<unset>" } else { "<redacted>" };
        json!({
            "deviceId": self.device_id,
            "softwareVersion": self.software_version,
            "manufacturer": self.manufacturer,
            "model": self.model,
            "timeZone": self.time_zone,
            "mqttBroker": self.mqtt_broker.to_string(),
            "wifiSsid": mark(&self.wifi_ssid),
            "wifiPassword": mark(&self.wifi_password),
            "mqttUser": mark(&self.mqtt_user),
            "mqttPassword": mark(&self.mqtt_password),
            "mqttTls": !self.mqtt_ca.is_empty(),
        })
    }
}

/// Boot-time configuration: loads every parameter, prompting where needed.
///
/// With `interactive` set (an operator console is attached) and
/// `no_reconfigure` clear, the operator is first asked whether to reconfigure
/// the device.
pub fn setup_config<B: Backend, P: Prompter>(
    store: &mut ParamStore<B, P>,
    interactive: bool,
    no_reconfigure: bool,
) -> Result<DeviceConfig, StoreError> {
    store.validate(DEVICE_TABLE)?;

    let reconfigure = interactive && !no_reconfigure && ask_reconfigure(store.prompter_mut());
    tracing::info!(op = "config.setup", reconfigure, "Loading device configuration");

    let mut config = DeviceConfig::default();

    store.with_namespace(GENERAL.namespace, |s| {
        config.device_id = s.load(&DEVICE_ID, &config.device_id, reconfigure)?;
        config.manufacturer = s.load(&MANUFACTURER, &config.manufacturer, reconfigure)?;
        config.model = s.load(&MODEL, &config.model, reconfigure)?;
        config.time_zone = s.load(&TIMEZONE, &config.time_zone, reconfigure)?;
        config.mqtt_broker = load_broker(s, config.mqtt_broker, reconfigure)?;
        Ok(())
    })?;

    store.keys().derive()?;

    store.with_namespace(SECRETS.namespace, |s| {
        config.wifi_ssid = s.load(&WIFI_SSID, &config.wifi_ssid, reconfigure)?;
        config.wifi_password = s.load(&WIFI_PASSWORD, &config.wifi_password, reconfigure)?;
        config.mqtt_user = s.load(&MQTT_USER, &config.mqtt_user, reconfigure)?;
        config.mqtt_password = s.load(&MQTT_PASSWORD, &config.mqtt_password, reconfigure)?;
        config.mqtt_ca = s.load(&MQTT_CA, &config.mqtt_ca, reconfigure)?;
        Ok(())
    })?;

    tracing::info!(
        op = "config.setup",
        device_id = %config.device_id,
        mqtt_broker = %config.mqtt_broker,
        "Device configuration ready"
    );
    Ok(config)
}

/// Reads the stored configuration without prompting or migrating.
/// Missing or unreadable entries fall back to the built-in defaults.
pub fn read_config<B: Backend, P: Prompter>(
    store: &mut ParamStore<B, P>,
) -> Result<DeviceConfig, StoreError> {
    let mut config = DeviceConfig::default();

    store.with_namespace(GENERAL.namespace, |s| {
        peek_into(s, &DEVICE_ID, &mut config.device_id)?;
        peek_into(s, &MANUFACTURER, &mut config.manufacturer)?;
        peek_into(s, &MODEL, &mut config.model)?;
        peek_into(s, &TIMEZONE, &mut config.time_zone)?;
        let mut broker = String::new();
        peek_into(s, &MQTT_BROKER, &mut broker)?;
        if let Ok(addr) = broker.trim().parse() {
            config.mqtt_broker = addr;
        }
        Ok(())
    })?;

    store.with_namespace(SECRETS.namespace, |s| {
        peek_into(s, &WIFI_SSID, &mut config.wifi_ssid)?;
        peek_into(s, &WIFI_PASSWORD, &mut config.wifi_password)?;
        peek_into(s, &MQTT_USER, &mut config.mqtt_user)?;
        peek_into(s, &MQTT_PASSWORD, &mut config.mqtt_password)?;
        peek_into(s, &MQTT_CA, &mut config.mqtt_ca)?;
        Ok(())
    })?;

    Ok(config)
}

fn peek_into<B: Backend, P: Prompter>(
    store: &ParamStore<B, P>,
    param: &ConfigParam,
    slot: &mut String,
) -> Result<(), StoreError> {
    let decoded = store.peek(param)?;
    if !decoded.value.is_empty() {
        *slot = decoded.value;
    }
    Ok(())
}

fn ask_reconfigure<P: Prompter>(prompter: &mut P) -> bool {
    match prompter.prompt_yes_no(RECONFIGURE_PROMPT, false) {
        Ok(answer) => answer,
        Err(err) => {
            tracing::debug!(op = "config.setup", error = %err, "Reconfigure question skipped");
            false
        }
    }
}

/// Loads the broker address until it parses as a usable IPv4 address,
/// re-prompting on anything else (including `0.0.0.0`).
fn load_broker<B: Backend, P: Prompter>(
    store: &mut ParamStore<B, P>,
    current: Ipv4Addr,
    reconfigure: bool,
) -> Result<Ipv4Addr, StoreError> {
    let mut force = reconfigure;
    loop {
        let text = store.load(&MQTT_BROKER, &current.to_string(), force)?;
        match text.trim().parse::<Ipv4Addr>() {
            Ok(addr) if !addr.is_unspecified() => return Ok(addr),
            _ => {
                tracing::warn!(
                    op = "config.broker",
                    value = %text,
                    "Could not parse IP address, or address is unconfigured 0.0.0.0"
                );
                force = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::key::FixedIdentity;
    use crate::format::{PLAIN_TAG, SECRET_TAG};
    use crate::prompt::ScriptedPrompter;
    use crate::storage::MemoryBackend;
    use std::collections::HashMap;

    fn keys() -> KeyDeriver {
        KeyDeriver::new(
            Box::new(FixedIdentity::new("se", [3u8; 9])),
            Box::new(AbsentIdentity("mac")),
        )
    }

    fn first_boot_answers() -> Vec<&'static str> {
        vec![
            "",             // configure the device? -> default no
            "cbiot_01",     // device id
            "not-an-ip",    // broker, first attempt
            "192.168.1.10", // broker, second attempt
            "HomeNet",
            "wifi-pass",
            "mqtt",
            "hunter2",
            "", // no CA
        ]
    }

    fn provisioned() -> MemoryBackend {
        let mut store = ParamStore::new(
            MemoryBackend::new(),
            ScriptedPrompter::new(first_boot_answers()),
            keys(),
        );
        setup_config(&mut store, true, false).expect("first boot");
        store.into_parts().0
    }

    #[test]
    fn first_boot_prompts_and_persists() {
        let mut store = ParamStore::new(
            MemoryBackend::new(),
            ScriptedPrompter::new(first_boot_answers()),
            keys(),
        );
        let config = setup_config(&mut store, true, false).expect("setup");

        assert_eq!(config.device_id, "cbiot_01");
        assert_eq!(config.manufacturer, "Arduino");
        assert_eq!(config.time_zone, "Europe/London");
        assert_eq!(config.mqtt_broker, Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(config.wifi_ssid, "HomeNet");
        assert_eq!(config.mqtt_password, "hunter2");
        assert_eq!(config.mqtt_ca, "");
        assert_eq!(store.prompter().remaining(), 0);

        let backend = store.backend();
        assert_eq!(backend.raw("config", "dvc_id"), Some("p1:cbiot_01"));
        assert_eq!(backend.raw("config", "mqtt_broker_ip"), Some("p1:192.168.1.10"));
        for key in ["s_wifi_ssid", "s_wifi_pwd", "s_mqtt_user", "s_mqtt_pwd"] {
            let raw = backend.raw("secrets", key).expect("secret stored");
            assert!(raw.starts_with(SECRET_TAG), "{key} should be encrypted");
        }
        assert_eq!(backend.raw("secrets", "s_mqtt_ca"), Some(PLAIN_TAG));
    }

    #[test]
    fn unattended_boot_reads_without_writes() {
        let backend = provisioned();
        let writes = backend.write_count();
        let mut store = ParamStore::new(backend, ScriptedPrompter::default(), keys());

        let config = setup_config(&mut store, false, false).expect("second boot");
        assert_eq!(config.device_id, "cbiot_01");
        assert_eq!(config.wifi_password, "wifi-pass");
        assert_eq!(store.backend().write_count(), writes);
        // Only the optional, deliberately empty CA is offered again.
        assert_eq!(store.prompter().asked(), [MQTT_CA.prompt.to_string()]);
    }

    #[test]
    fn reconfigure_reprompts_configurable_parameters() {
        let backend = provisioned();
        let answers = ["y", "", "", "", "NewNet", "", "", "", ""];
        let mut store = ParamStore::new(backend, ScriptedPrompter::new(answers), keys());

        let config = setup_config(&mut store, true, false).expect("reconfigure");
        assert_eq!(config.wifi_ssid, "NewNet");
        assert_eq!(config.wifi_password, "wifi-pass");
        assert_eq!(config.device_id, "cbiot_01");
        assert_eq!(store.prompter().asked().len(), answers.len());
        assert!(!store
            .prompter()
            .asked()
            .iter()
            .any(|p| p == MANUFACTURER.prompt || p == MODEL.prompt));
    }

    #[test]
    fn no_reconfigure_skips_question() {
        let backend = provisioned();
        let mut store = ParamStore::new(backend, ScriptedPrompter::default(), keys());
        setup_config(&mut store, true, true).expect("boot");
        assert!(!store
            .prompter()
            .asked()
            .iter()
            .any(|p| p.starts_with(RECONFIGURE_PROMPT)));
    }

    #[test]
    fn read_config_does_not_prompt_or_write() {
        let backend = provisioned();
        let writes = backend.write_count();
        let mut store = ParamStore::new(backend, ScriptedPrompter::default(), keys());
        let config = read_config(&mut store).expect("read");
        assert_eq!(config.mqtt_user, "mqtt");
        assert_eq!(config.mqtt_broker, Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(store.backend().write_count(), writes);
    }

    #[test]
    fn summary_hides_credentials() {
        let config = DeviceConfig {
            wifi_password: "wifi-pass".to_string(),
            ..DeviceConfig::default()
        };
        let text = serde_json::to_string(&config.redacted_summary()).expect("json");
        assert!(!text.contains("wifi-pass"));
        assert!(text.contains("<redacted>"));
        assert!(!format!("{config:?}").contains("wifi-pass"));
    }

    #[test]
    fn settings_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("HAIOT_STORE_PATH", "/data/store.json"),
            ("HAIOT_NO_RECONFIGURE", "true"),
            ("HAIOT_SE_SERIAL_PATH", "/run/se/serial"),
        ]
        .into_iter()
        .collect();
        let mut settings = Settings::default();
        settings
            .apply_overrides(|var| vars.get(var).map(|v| v.to_string()))
            .expect("overrides");
        assert_eq!(settings.store_path, PathBuf::from("/data/store.json"));
        assert!(settings.no_reconfigure);
        assert_eq!(settings.secure_element_path, Some(PathBuf::from("/run/se/serial")));
        assert_eq!(settings.platform_id_path, PathBuf::from(DEFAULT_PLATFORM_ID_PATH));
    }

    #[test]
    fn settings_reject_bad_flag() {
        let mut settings = Settings::default();
        let err = settings
            .apply_overrides(|var| (var == "HAIOT_NO_RECONFIGURE").then(|| "maybe".to_string()))
            .unwrap_err();
        assert!(format!("{err}").contains("HAIOT_NO_RECONFIGURE"));
    }

    #[test]
    fn settings_load_from_file() {
        let file = tempfile::NamedTempFile::new().expect("temp file");
        fs::write(
            file.path(),
            r#"{ "store_path": "/var/lib/haiot.json", "no_reconfigure": true }"#,
        )
        .expect("write settings");
        let settings = Settings::from_file(file.path()).expect("settings should load");
        assert_eq!(settings.store_path, PathBuf::from("/var/lib/haiot.json"));
        assert!(settings.no_reconfigure);
        assert_eq!(settings.secure_element_path, None);
    }

    #[test]
    fn settings_build_file_backed_store() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mac = dir.path().join("address");
        fs::write(&mac, "a4:cf:12:34:56:78").expect("write mac");
        let settings = Settings {
            store_path: dir.path().join("store.json"),
            platform_id_path: mac,
            ..Settings::default()
        };

        let backend = settings.open_backend().expect("backend");
        let mut store = ParamStore::new(
            backend,
            ScriptedPrompter::new(first_boot_answers()),
            settings.key_deriver(),
        );
        setup_config(&mut store, true, false).expect("setup");

        let reopened = settings.open_backend().expect("reopen");
        let mut store = ParamStore::new(reopened, ScriptedPrompter::default(), settings.key_deriver());
        let config = read_config(&mut store).expect("read back");
        assert_eq!(config.mqtt_password, "hunter2");
    }
}
