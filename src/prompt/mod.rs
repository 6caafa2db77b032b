use crate::config::PromptConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("bot settings io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bot settings json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Operator-editable bot settings, saved by the panel as JSON.
///
/// Keys other than `systemPrompt` are kept as-is so the panel can store its
/// own fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl BotSettings {
    pub fn load(path: &Path) -> Result<Self, PromptError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), PromptError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn ensure_exists(path: &Path, default_prompt: &str) -> Result<(), PromptError> {
        if path.exists() {
            return Ok(());
        }
        Self {
            system_prompt: Some(default_prompt.to_string()),
            extra: Default::default(),
        }
        .save(path)
    }

    fn prompt(&self) -> Option<String> {
        self.system_prompt
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
    }
}

pub trait PromptSource: Send + Sync {
    fn load(&self) -> String;
}

/// Saved settings first, then the prompt file, then the built-in default.
#[derive(Debug, Clone)]
pub struct FilePromptSource {
    settings_path: PathBuf,
    fallback_file: PathBuf,
    default_prompt: String,
}

impl FilePromptSource {
    pub fn from_config(config: &PromptConfig) -> Self {
        Self {
            settings_path: PathBuf::from(&config.settings_path),
            fallback_file: PathBuf::from(&config.fallback_file),
            default_prompt: config.default_prompt.clone(),
        }
    }

    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }

    fn saved_prompt(&self) -> Option<String> {
        if !self.settings_path.exists() {
            return None;
        }
        match BotSettings::load(&self.settings_path) {
            Ok(settings) => settings.prompt(),
            Err(err) => {
                tracing::warn!(path = %self.settings_path.display(), error = %err, "bot settings unreadable");
                None
            }
        }
    }

    fn file_prompt(&self) -> Option<String> {
        if !self.fallback_file.exists() {
            return None;
        }
        match fs::read_to_string(&self.fallback_file) {
            Ok(raw) => Some(raw.trim().to_string()).filter(|p| !p.is_empty()),
            Err(err) => {
                tracing::warn!(path = %self.fallback_file.display(), error = %err, "prompt file unreadable");
                None
            }
        }
    }
}

impl PromptSource for FilePromptSource {
    fn load(&self) -> String {
        self.saved_prompt()
            .or_else(|| self.file_prompt())
            .unwrap_or_else(|| self.default_prompt.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(dir: &Path) -> FilePromptSource {
        FilePromptSource {
            settings_path: dir.join("storage").join("config.json"),
            fallback_file: dir.join("prompt.txt"),
            default_prompt: "default prompt".to_string(),
        }
    }

    #[test]
    fn saved_settings_win_over_file_and_default() {
        let dir = tempfile::tempdir().unwrap();
        let source = source(dir.path());
        fs::write(dir.path().join("prompt.txt"), "file prompt").unwrap();
        BotSettings {
            system_prompt: Some("  saved prompt \n".to_string()),
            extra: Default::default(),
        }
        .save(source.settings_path())
        .unwrap();

        assert_eq!(source.load(), "saved prompt");
    }

    #[test]
    fn blank_saved_prompt_falls_back_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = source(dir.path());
        fs::write(dir.path().join("prompt.txt"), "file prompt\n").unwrap();
        BotSettings {
            system_prompt: Some("   ".to_string()),
            extra: Default::default(),
        }
        .save(source.settings_path())
        .unwrap();

        assert_eq!(source.load(), "file prompt");
    }

    #[test]
    fn corrupt_settings_and_missing_file_use_default() {
        let dir = tempfile::tempdir().unwrap();
        let source = source(dir.path());
        fs::create_dir_all(source.settings_path().parent().unwrap()).unwrap();
        fs::write(source.settings_path(), "{ not json").unwrap();

        assert_eq!(source.load(), "default prompt");
    }

    #[test]
    fn settings_keep_unknown_panel_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "systemPrompt": "p", "botName": "Oliver" }"#).unwrap();

        let settings = BotSettings::load(&path).unwrap();
        assert_eq!(settings.system_prompt.as_deref(), Some("p"));
        assert_eq!(settings.extra["botName"], "Oliver");

        settings.save(&path).unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"botName\""));
        assert!(raw.contains("\"systemPrompt\""));
    }

    #[test]
    fn ensure_exists_seeds_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage").join("config.json");
        BotSettings::ensure_exists(&path, "seeded").unwrap();
        assert_eq!(BotSettings::load(&path).unwrap().system_prompt.as_deref(), Some("seeded"));

        BotSettings {
            system_prompt: Some("edited".to_string()),
            extra: Default::default(),
        }
        .save(&path)
        .unwrap();
        BotSettings::ensure_exists(&path, "seeded").unwrap();
        assert_eq!(BotSettings::load(&path).unwrap().system_prompt.as_deref(), Some("edited"));
    }
}
