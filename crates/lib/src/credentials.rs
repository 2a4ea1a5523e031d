//! Persisted session credentials.
//!
//! One bundle per session, stored as `creds.json` in the session directory. Loaded once at startup
//! and rewritten (temp file + rename) on every credential update from the transport.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

const CREDS_FILE: &str = "creds.json";

/// Session credential bundle. Opaque to everything except the session manager and the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    /// True once the device has been linked (QR scanned or pairing code entered).
    #[serde(default)]
    pub registered: bool,
    /// The session's own identity (WhatsApp JID), once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Per-instance token issued by the transport server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Partial credential change; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialsPatch {
    pub registered: Option<bool>,
    pub device_id: Option<String>,
    pub instance_token: Option<String>,
}

impl Credentials {
    /// Apply `patch`; returns whether anything changed (and stamps `updated_at` if so).
    pub fn apply(&mut self, patch: &CredentialsPatch) -> bool {
        let mut changed = false;
        if let Some(registered) = patch.registered {
            changed |= self.registered != registered;
            self.registered = registered;
        }
        if let Some(ref device_id) = patch.device_id {
            changed |= self.device_id.as_deref() != Some(device_id.as_str());
            self.device_id = Some(device_id.clone());
        }
        if let Some(ref token) = patch.instance_token {
            changed |= self.instance_token.as_deref() != Some(token.as_str());
            self.instance_token = Some(token.clone());
        }
        if changed {
            self.updated_at = Some(Utc::now());
        }
        changed
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialsError {
    #[error("credential store io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("credential store at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// File store for one session's credentials.
#[derive(Debug, Clone)]
pub struct CredentialsStore {
    path: PathBuf,
}

impl CredentialsStore {
    pub fn new(session_dir: impl AsRef<Path>) -> Self {
        Self {
            path: session_dir.as_ref().join(CREDS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the bundle. A missing file means a fresh, unregistered session; a corrupt one is an error
    /// so it is never silently overwritten.
    pub fn load(&self) -> Result<Credentials, CredentialsError> {
        let s = match std::fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Credentials::default())
            }
            Err(source) => {
                return Err(CredentialsError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        serde_json::from_str(&s).map_err(|source| CredentialsError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    /// Persist the bundle durably (fsync before rename). Creates the session directory if needed.
    pub fn save(&self, credentials: &Credentials) -> Result<(), CredentialsError> {
        let io_err = |source| CredentialsError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_vec_pretty(credentials).map_err(|source| {
            CredentialsError::Corrupt {
                path: self.path.clone(),
                source,
            }
        })?;
        let tmp = self.path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4()));
        let written = std::fs::File::create(&tmp).and_then(|mut f| {
            f.write_all(&json)?;
            f.sync_all()
        });
        if let Err(e) = written.and_then(|_| std::fs::rename(&tmp, &self.path)) {
            let _ = std::fs::remove_file(&tmp);
            return Err(io_err(e));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> CredentialsStore {
        let dir = std::env::temp_dir().join(format!("wabridge-creds-test-{}", uuid::Uuid::new_v4()));
        CredentialsStore::new(dir)
    }

    #[test]
    fn missing_file_is_unregistered_session() {
        let store = temp_store();
        assert_eq!(store.load().unwrap(), Credentials::default());
    }

    #[test]
    fn save_then_load_keeps_bundle() {
        let store = temp_store();
        let mut creds = Credentials::default();
        creds.apply(&CredentialsPatch {
            registered: Some(true),
            device_id: Some("49151@s.whatsapp.net".to_string()),
            instance_token: None,
        });
        store.save(&creds).unwrap();
        assert_eq!(store.load().unwrap(), creds);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let store = temp_store();
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), "{ nope").unwrap();
        assert!(matches!(store.load(), Err(CredentialsError::Corrupt { .. })));
    }

    #[test]
    fn apply_reports_changes_only() {
        let mut creds = Credentials::default();
        let patch = CredentialsPatch {
            registered: Some(true),
            ..Default::default()
        };
        assert!(creds.apply(&patch));
        assert!(creds.updated_at.is_some());
        assert!(!creds.apply(&patch));
        assert!(!creds.apply(&CredentialsPatch::default()));
    }
}
