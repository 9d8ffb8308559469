// Config loading: base YAML plus an optional override file, with ${ENV} expansion.
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "config/pagebot.yaml";
pub const DEFAULT_OVERRIDE_PATH: &str = "data/config/pagebot.override.yaml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub messenger: MessengerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    #[serde(deserialize_with = "deserialize_u16_from_any")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: String,
    #[serde(default)]
    pub db_path: String,
    #[serde(default)]
    pub postgres: PostgresConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PostgresConfig {
    #[serde(default)]
    pub dsn: String,
    #[serde(default)]
    pub connect_timeout_s: u64,
    #[serde(default)]
    pub pool_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BufferConfig {
    #[serde(default)]
    pub backend: String,
    #[serde(default)]
    pub redis_url: String,
    #[serde(default)]
    pub ttl_s: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AssistantConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub timeout_s: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessengerConfig {
    #[serde(default)]
    pub graph_api_base: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub verify_token: Option<String>,
    #[serde(default)]
    pub app_secret: Option<String>,
    #[serde(default = "default_true")]
    pub send_sender_actions: bool,
    #[serde(default)]
    pub max_text_chars: usize,
    #[serde(default)]
    pub replies: ReplyTexts,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            graph_api_base: None,
            api_version: None,
            verify_token: None,
            app_secret: None,
            send_sender_actions: true,
            max_text_chars: 0,
            replies: ReplyTexts::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyTexts {
    #[serde(default = "default_unsupported_attachment_reply")]
    pub unsupported_attachment: String,
    #[serde(default = "default_system_error_reply")]
    pub system_error: String,
}

impl Default for ReplyTexts {
    fn default() -> Self {
        Self {
            unsupported_attachment: default_unsupported_attachment_reply(),
            system_error: default_system_error_reply(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkerConfig {
    #[serde(default)]
    pub max_concurrency: usize,
    #[serde(default)]
    pub queue_capacity: usize,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub retry_base_s: f64,
    #[serde(default)]
    pub retry_max_s: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub max_parts_per_message: usize,
    #[serde(default)]
    pub migration_history_limit: usize,
    #[serde(default = "default_max_migration_depth")]
    pub max_migration_depth: u32,
    #[serde(default = "default_true")]
    pub serialize_conversations: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_parts_per_message: 0,
            migration_history_limit: 0,
            max_migration_depth: default_max_migration_depth(),
            serialize_conversations: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_migration_depth() -> u32 {
    1
}

fn default_unsupported_attachment_reply() -> String {
    "Sorry, we can't accept this kind of attachment. Please send text or images.".to_string()
}

fn default_system_error_reply() -> String {
    "System error, please try again.".to_string()
}

impl AssistantConfig {
    // Empty or unresolved placeholders fall back to OPENAI_API_KEY.
    pub fn api_key(&self) -> Option<String> {
        let inline = self
            .api_key
            .as_ref()
            .map(|value| value.trim())
            .filter(|value| !value.is_empty() && !value.starts_with("${"));
        if let Some(value) = inline {
            return Some(value.to_string());
        }
        env::var("OPENAI_API_KEY")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

fn deserialize_u16_from_any<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    struct U16Visitor;

    impl<'de> Visitor<'de> for U16Visitor {
        type Value = u16;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("u16 or numeric string")
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            u16::try_from(value).map_err(|_| E::custom("u16 out of range"))
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if value < 0 {
                return Err(E::custom("u16 must be non-negative"));
            }
            self.visit_u64(value as u64)
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Err(E::custom("u16 string is empty"));
            }
            trimmed
                .parse::<u16>()
                .map_err(|_| E::custom("invalid u16 string"))
        }

        fn visit_string<E>(self, value: String) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            self.visit_str(&value)
        }
    }

    deserializer.deserialize_any(U16Visitor)
}

pub fn load_config() -> Config {
    let base_path =
        env::var("PAGEBOT_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let override_path = env::var("PAGEBOT_CONFIG_OVERRIDE_PATH")
        .unwrap_or_else(|_| DEFAULT_OVERRIDE_PATH.to_string());
    load_config_from(&base_path, &override_path)
}

pub fn load_config_from(base_path: &str, override_path: &str) -> Config {
    let mut merged = read_yaml(base_path);
    if Path::new(override_path).exists() {
        let override_value = read_yaml(override_path);
        // Only non-null override values replace base values.
        merge_yaml(&mut merged, override_value);
    }

    expand_yaml_env(&mut merged);

    if merged.is_null() {
        return Config::default();
    }
    serde_yaml::from_value::<Config>(merged).unwrap_or_else(|err| {
        warn!("config parse failed, using defaults: {err}");
        Config::default()
    })
}

fn read_yaml(path: &str) -> Value {
    let content = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            warn!("read config failed: {path}, {err}");
            return Value::Null;
        }
    };
    serde_yaml::from_str(&content).unwrap_or_else(|err| {
        warn!("parse yaml failed: {path}, {err}");
        Value::Null
    })
}

fn merge_yaml(base: &mut Value, override_value: Value) {
    match (base, override_value) {
        (Value::Mapping(base_map), Value::Mapping(override_map)) => {
            for (key, value) in override_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, override_value) => {
            if !override_value.is_null() {
                *base_slot = override_value;
            }
        }
    }
}

fn expand_yaml_env(value: &mut Value) {
    match value {
        Value::String(text) => {
            *text = expand_env_placeholders(text);
        }
        Value::Sequence(items) => {
            for item in items {
                expand_yaml_env(item);
            }
        }
        Value::Mapping(map) => {
            for (_, value) in map.iter_mut() {
                expand_yaml_env(value);
            }
        }
        _ => {}
    }
}

fn expand_env_placeholders(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        rest = &rest[start + 2..];
        let Some(end) = rest.find('}') else {
            output.push_str("${");
            output.push_str(rest);
            return output;
        };
        let inner = &rest[..end];
        rest = &rest[end + 1..];
        let (name, default_value) = match inner.split_once(":-") {
            Some((name, default_value)) => (name.trim(), Some(default_value)),
            None => (inner.trim(), None),
        };
        if name.is_empty() {
            output.push_str("${");
            output.push_str(inner);
            output.push('}');
            continue;
        }
        let resolved = env::var(name).ok().filter(|value| !value.is_empty());
        match (resolved, default_value) {
            (Some(value), _) => output.push_str(&value),
            (None, Some(default_value)) => output.push_str(default_value),
            (None, None) => {}
        }
    }
    output.push_str(rest);
    output
}
