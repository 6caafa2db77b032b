use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "CONCIERGE_";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub session: SessionConfig,
    pub bridge: BridgeConfig,
    pub server: ServerConfig,
    pub panel: PanelConfig,
    pub llm: LlmConfig,
    pub responder: ResponderConfig,
    pub reconnect: ReconnectConfig,
    pub prompt: PromptConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    pub dir: String,
    pub browser: Vec<String>,
    pub connect_timeout_ms: u64,
    pub keep_alive_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dir: "./session".to_string(),
            browser: vec![
                "ConciergePanel".to_string(),
                "Chrome".to_string(),
                "1.0.0".to_string(),
            ],
            connect_timeout_ms: 60_000,
            keep_alive_interval_ms: 20_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub url: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8787/bridge".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct PanelConfig {
    pub user: Option<String>,
    pub pass: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub api_key_env: String,
    pub timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.2,
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_ms: 45_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResponderConfig {
    pub debounce_ms: u64,
    pub min_reply_delay_ms: u64,
    pub max_reply_delay_ms: u64,
    pub greeting: String,
    pub fallback_reply: String,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 9_000,
            min_reply_delay_ms: 9_000,
            max_reply_delay_ms: 15_000,
            greeting: "Hi 👋 Thanks for writing in. I'm ready to help you.".to_string(),
            fallback_reply: "Sure, I'll help you right away 😊".to_string(),
        }
    }
}

impl ResponderConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    pub max_exponent: u32,
    pub blocked_floor_ms: u64,
    pub rate_limited_floor_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_ms: 3_000,
            max_ms: 120_000,
            max_exponent: 6,
            blocked_floor_ms: 60_000,
            rate_limited_floor_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PromptConfig {
    pub settings_path: String,
    pub fallback_file: String,
    pub default_prompt: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            settings_path: "storage/config.json".to_string(),
            fallback_file: "prompt.txt".to_string(),
            default_prompt: "You are a helpful and clear assistant.".to_string(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = Self::default();
        let config_path = active_config_path();

        if let Ok(raw) = fs::read_to_string(&config_path) {
            match toml::from_str::<Config>(&raw) {
                Ok(file_config) => config = file_config,
                Err(err) => {
                    tracing::warn!(path = %config_path.display(), error = %err, "ignoring unreadable config file");
                }
            }
        }

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var(format!("{}SESSION_DIR", ENV_PREFIX)) {
            self.session.dir = val;
        }

        if let Ok(val) = env::var(format!("{}BRIDGE_URL", ENV_PREFIX)) {
            self.bridge.url = val;
        }

        if let Ok(val) = env::var(format!("{}SERVER_PORT", ENV_PREFIX)) {
            if let Ok(port) = val.parse() {
                self.server.port = port;
            }
        }
        if let Ok(val) = env::var(format!("{}SERVER_TOKEN", ENV_PREFIX)) {
            self.server.token = Some(val);
        }

        if let Ok(val) = env::var(format!("{}PANEL_USER", ENV_PREFIX)) {
            self.panel.user = Some(val);
        }
        if let Ok(val) = env::var(format!("{}PANEL_PASS", ENV_PREFIX)) {
            self.panel.pass = Some(val);
        }

        if let Ok(val) = env::var(format!("{}LLM_BASE_URL", ENV_PREFIX)) {
            self.llm.base_url = val;
        }
        if let Ok(val) = env::var(format!("{}MODEL", ENV_PREFIX)) {
            self.llm.model = val;
        }
        if let Ok(val) = env::var(format!("{}LLM_TIMEOUT_MS", ENV_PREFIX)) {
            if let Ok(timeout) = val.parse() {
                self.llm.timeout_ms = timeout;
            }
        }

        if let Ok(val) = env::var(format!("{}DEBOUNCE_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.responder.debounce_ms = ms;
            }
        }

        if let Ok(val) = env::var(format!("{}PROMPT_SETTINGS_PATH", ENV_PREFIX)) {
            self.prompt.settings_path = val;
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.server.port == 0 {
            return Err("server.port must be non-zero".into());
        }
        if self.session.dir.trim().is_empty() {
            return Err("session.dir must be set".into());
        }
        if self.bridge.url.trim().is_empty() {
            return Err("bridge.url must be set".into());
        }
        if self.llm.model.trim().is_empty() {
            return Err("llm.model must be set".into());
        }
        if self.llm.timeout_ms == 0 {
            return Err("llm.timeout_ms must be non-zero".into());
        }
        if self.responder.debounce_ms == 0 {
            return Err("responder.debounce_ms must be non-zero".into());
        }
        if self.responder.min_reply_delay_ms > self.responder.max_reply_delay_ms {
            return Err("responder.min_reply_delay_ms must not exceed max_reply_delay_ms".into());
        }
        if self.responder.fallback_reply.trim().is_empty() {
            return Err("responder.fallback_reply must be set".into());
        }
        if self.reconnect.base_ms == 0 || self.reconnect.max_ms < self.reconnect.base_ms {
            return Err("reconnect.base_ms must be non-zero and not exceed reconnect.max_ms".into());
        }
        Ok(())
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err("config.toml already exists".into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    let base = env::var("XDG_CONFIG_HOME")
        .or_else(|_| env::var("APPDATA"))
        .unwrap_or_else(|_| ".".to_string());
    Path::new(&base).join("wa-concierge").join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}
