use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write as _};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::domain::{ContractForm, DealKey, Recipient, SessionKey, SigningRound, SigningStage};

/// Resumable record of one signing round for one deal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningSession {
    pub key: SessionKey,
    pub deal: DealKey,
    pub round: SigningRound,
    pub stage: SigningStage,
    pub recipient: Recipient,
    pub envelope_id: Option<String>,
    pub account_id: Option<String>,
    pub signing_url: Option<String>,
    pub contract_snapshot: ContractForm,
    /// Set once the buyer came back from the provider and the provider confirmed it.
    #[serde(default)]
    pub signature_confirmed: bool,
    pub completed: bool,
    pub updated_at: DateTime<Utc>,
}

impl SigningSession {
    pub fn draft(
        deal: &DealKey,
        round: SigningRound,
        recipient: Recipient,
        contract_snapshot: ContractForm,
    ) -> Self {
        Self {
            key: SessionKey::for_round(deal, round),
            deal: deal.clone(),
            round,
            stage: SigningStage::Draft,
            recipient,
            envelope_id: None,
            account_id: None,
            signing_url: None,
            contract_snapshot,
            signature_confirmed: false,
            completed: false,
            updated_at: Utc::now(),
        }
    }

    /// A signing URL is only worth handing out while the envelope exists and the
    /// round has not finished.
    pub fn live_signing_url(&self) -> Option<&str> {
        if self.completed || self.envelope_id.is_none() {
            return None;
        }
        self.signing_url.as_deref()
    }

    /// True when the envelope can be reused instead of creating a duplicate.
    pub fn has_live_envelope(&self) -> bool {
        self.envelope_id.is_some()
            && !self.completed
            && matches!(
                self.stage,
                SigningStage::EnvelopeCreated
                    | SigningStage::AwaitingBuyerSignature
                    | SigningStage::AwaitingSellerSignature
            )
    }

    pub(crate) fn mark_completed(&mut self) {
        self.completed = true;
        self.signing_url = None;
    }

    /// Drops everything the provider issued so the round starts over from `Draft`.
    pub(crate) fn reset_to_draft(&mut self) {
        self.stage = SigningStage::Draft;
        self.envelope_id = None;
        self.account_id = None;
        self.signing_url = None;
        self.signature_confirmed = false;
        self.completed = false;
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Keyed durable storage for signing sessions. Writes replace the whole record.
pub trait SessionStore: Send + Sync {
    fn get(&self, key: &SessionKey) -> Result<Option<SigningSession>, SessionStoreError>;
    fn set(&self, session: &SigningSession) -> Result<(), SessionStoreError>;
    fn remove(&self, key: &SessionKey) -> Result<(), SessionStoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SessionStoreError {
    #[error("session store io failure for {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("session record for {key} is corrupt: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("session store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Default, Clone)]
pub struct MemorySessionStore {
    sessions: Arc<Mutex<HashMap<SessionKey, SigningSession>>>,
}

impl MemorySessionStore {
    pub fn len(&self) -> usize {
        self.sessions.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, key: &SessionKey) -> Result<Option<SigningSession>, SessionStoreError> {
        let guard = self
            .sessions
            .lock()
            .map_err(|_| SessionStoreError::Unavailable("session mutex poisoned".to_string()))?;
        Ok(guard.get(key).cloned())
    }

    fn set(&self, session: &SigningSession) -> Result<(), SessionStoreError> {
        let mut guard = self
            .sessions
            .lock()
            .map_err(|_| SessionStoreError::Unavailable("session mutex poisoned".to_string()))?;
        guard.insert(session.key.clone(), session.clone());
        Ok(())
    }

    fn remove(&self, key: &SessionKey) -> Result<(), SessionStoreError> {
        let mut guard = self
            .sessions
            .lock()
            .map_err(|_| SessionStoreError::Unavailable("session mutex poisoned".to_string()))?;
        guard.remove(key);
        Ok(())
    }
}

/// One JSON document per session key. Survives process restarts, which is what lets a
/// reloaded browser resume an in-flight envelope.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    directory: PathBuf,
}

impl FileSessionStore {
    pub fn open(directory: impl Into<PathBuf>) -> Result<Self, SessionStoreError> {
        let directory = directory.into();
        fs::create_dir_all(&directory).map_err(|source| SessionStoreError::Io {
            key: directory.display().to_string(),
            source,
        })?;
        Ok(Self { directory })
    }

    // Keys are validated to [A-Za-z0-9_-] by DealKey, so they are safe file names.
    fn path_for(&self, key: &SessionKey) -> PathBuf {
        self.directory.join(format!("{}.json", key.as_str()))
    }

    fn io_error(key: &SessionKey, source: std::io::Error) -> SessionStoreError {
        SessionStoreError::Io {
            key: key.to_string(),
            source,
        }
    }
}

impl SessionStore for FileSessionStore {
    fn get(&self, key: &SessionKey) -> Result<Option<SigningSession>, SessionStoreError> {
        let raw = match fs::read(self.path_for(key)) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Self::io_error(key, err)),
        };

        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|source| SessionStoreError::Corrupt {
                key: key.to_string(),
                source,
            })
    }

    fn set(&self, session: &SigningSession) -> Result<(), SessionStoreError> {
        let key = &session.key;
        let body = serde_json::to_vec_pretty(session).map_err(|source| {
            SessionStoreError::Corrupt {
                key: key.to_string(),
                source,
            }
        })?;

        let target = self.path_for(key);
        let staging = target.with_extension("json.tmp");
        let mut file = fs::File::create(&staging).map_err(|err| Self::io_error(key, err))?;
        file.write_all(&body)
            .and_then(|_| file.sync_all())
            .map_err(|err| Self::io_error(key, err))?;
        fs::rename(&staging, &target).map_err(|err| Self::io_error(key, err))
    }

    fn remove(&self, key: &SessionKey) -> Result<(), SessionStoreError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Self::io_error(key, err)),
        }
    }
}
