use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

const CREDS_FILE: &str = "creds.json";

/// Opaque credential material. Only the transport understands its contents.
pub type CredentialState = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credential store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("credential store json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("credential entry {key} is not valid base64: {source}")]
    Decode {
        key: String,
        source: base64::DecodeError,
    },
}

pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Result<CredentialState, CredentialError>;
    fn persist(&self, state: &CredentialState) -> Result<(), CredentialError>;
    /// Removes all stored material and leaves an empty session directory.
    fn wipe(&self) -> Result<(), CredentialError>;
}

#[derive(Debug)]
pub struct FileCredentialStore {
    session_dir: PathBuf,
    write_lock: Mutex<()>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredsFile {
    entries: HashMap<String, String>,
}

impl FileCredentialStore {
    pub fn new(session_dir: impl Into<PathBuf>) -> Self {
        Self {
            session_dir: session_dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    fn creds_path(&self) -> PathBuf {
        self.session_dir.join(CREDS_FILE)
    }

    fn ensure_dir(&self) -> Result<(), CredentialError> {
        fs::create_dir_all(&self.session_dir)?;
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<CredentialState, CredentialError> {
        self.ensure_dir()?;
        let path = self.creds_path();
        if !path.exists() {
            return Ok(CredentialState::new());
        }

        let raw = fs::read_to_string(&path)?;
        let file: CredsFile = serde_json::from_str(&raw)?;
        let mut state = CredentialState::new();
        for (key, encoded) in file.entries {
            let decoded = general_purpose::STANDARD
                .decode(&encoded)
                .map_err(|source| CredentialError::Decode {
                    key: key.clone(),
                    source,
                })?;
            let value = serde_json::from_slice(&decoded)?;
            state.insert(key, value);
        }
        Ok(state)
    }

    fn persist(&self, state: &CredentialState) -> Result<(), CredentialError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.ensure_dir()?;

        let mut file = CredsFile::default();
        for (key, value) in state {
            let raw = serde_json::to_vec(value)?;
            file.entries
                .insert(key.clone(), general_purpose::STANDARD.encode(raw));
        }
        let data = serde_json::to_string_pretty(&file)?;
        fs::write(self.creds_path(), data)?;
        Ok(())
    }

    fn wipe(&self) -> Result<(), CredentialError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.session_dir.exists() {
            fs::remove_dir_all(&self.session_dir)?;
        }
        self.ensure_dir()
    }
}
