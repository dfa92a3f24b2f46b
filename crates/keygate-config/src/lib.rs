use std::collections::BTreeMap;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

const CONFIG_SCHEMA: &str = include_str!("../../../config/config.schema.json");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
    #[error("write config failed: {0}")]
    Write(String),
}

/// The persisted configuration document.
///
/// `keys` and `used_keys` are the only fields the runtime mutates; everything
/// else is read once at startup. Unknown top-level fields are kept in `extra`
/// so a save never drops operator data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub bot_token: String,
    #[serde(rename = "webhookURL", default)]
    pub webhook_url: String,
    pub allowed_role_id: String,
    pub key_role_id: String,
    pub role_to_assign: String,
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(
        default,
        alias = "UsedKeys",
        deserialize_with = "null_as_empty"
    )]
    pub used_keys: BTreeMap<String, bool>,
    #[serde(default)]
    pub methods: BTreeMap<String, Method>,
    pub api: BTreeMap<String, ApiEndpoint>,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_user_id: Option<String>,
    #[serde(default = "default_discord_api_base")]
    pub discord_api_base: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub strict_redemption: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Method {
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiEndpoint {
    pub url: String,
    /// Reserved; carried through saves but not interpreted.
    #[serde(rename = "requestFormat", default, skip_serializing_if = "Option::is_none")]
    pub request_format: Option<Value>,
}

impl Config {
    /// Looks up an endpoint template by name, ignoring ASCII case.
    pub fn endpoint(&self, name: &str) -> Option<&ApiEndpoint> {
        self.api
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_discord_api_base() -> String {
    "https://discord.com/api/v10".to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<BTreeMap<String, bool>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<BTreeMap<String, bool>>::deserialize(deserializer)?.unwrap_or_default())
}

pub fn load_and_validate(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read(e.to_string()))?;
    parse_and_validate(&config_text)
}

pub fn parse_and_validate(config_text: &str) -> Result<Config, ConfigError> {
    let instance: Value =
        serde_json::from_str(config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

/// Writes the document next to `path` and renames it into place, so a crash
/// mid-write never leaves a truncated config behind.
pub fn save(path: impl AsRef<Path>, cfg: &Config) -> Result<(), ConfigError> {
    let path = path.as_ref();
    let text = serde_json::to_string_pretty(cfg).map_err(|e| ConfigError::Write(e.to_string()))?;
    let tmp = temp_path_for(path);

    let mut file = std::fs::File::create(&tmp).map_err(|e| ConfigError::Write(e.to_string()))?;
    file.write_all(text.as_bytes())
        .and_then(|_| file.write_all(b"\n"))
        .and_then(|_| file.sync_all())
        .map_err(|e| ConfigError::Write(e.to_string()))?;
    drop(file);

    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        ConfigError::Write(e.to_string())
    })
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "config.json".into());
    name.push(".tmp");
    path.with_file_name(name)
}

fn validate_against_schema(instance: &Value) -> Result<(), ConfigError> {
    let schema: Value =
        serde_json::from_str(CONFIG_SCHEMA).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    for (field, value) in [
        ("allowedRoleId", &cfg.allowed_role_id),
        ("keyRoleId", &cfg.key_role_id),
        ("roleToAssign", &cfg.role_to_assign),
    ] {
        if value.trim().is_empty() {
            return Err(ConfigError::UnsupportedConfig(format!(
                "{field} must not be empty"
            )));
        }
    }
    if cfg.api.is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "api must declare at least one endpoint".to_string(),
        ));
    }
    if let Some((name, _)) = cfg.api.iter().find(|(_, ep)| ep.url.trim().is_empty()) {
        return Err(ConfigError::UnsupportedConfig(format!(
            "api.{name}.url must not be empty"
        )));
    }
    if cfg.listen_addr.parse::<SocketAddr>().is_err() {
        return Err(ConfigError::UnsupportedConfig(format!(
            "listenAddr={} is not a socket address",
            cfg.listen_addr
        )));
    }
    if cfg.request_timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "requestTimeoutMs must be >= 1".to_string(),
        ));
    }
    if cfg.bot_token.trim().is_empty() && cfg.bot_user_id.is_none() {
        return Err(ConfigError::UnsupportedConfig(
            "botUserId is required when botToken is empty".to_string(),
        ));
    }
    Ok(())
}
