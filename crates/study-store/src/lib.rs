use chrono::Utc;
use serde_json::json;
use std::sync::{Mutex, PoisonError};
use study_core::{ParticipantInfo, ResultSet, TrialResult};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store transport failed: {0}")]
    Transport(String),
    #[error("store rejected request: status {status}")]
    Rejected { status: u16 },
    #[error("record serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Persistence seam between the result sink and the remote data store.
///
/// Implementations may block: `save_all` runs on the event thread after the
/// run is over, and `save_one` is only ever called from a detached thread.
pub trait ResultStore: Send + Sync {
    fn save_one(&self, record: &TrialResult) -> Result<(), StoreError>;
    fn save_all(&self, records: &ResultSet) -> Result<(), StoreError>;
}

/// Remote store client posting JSON over HTTP.
pub struct HttpStore {
    base_url: String,
    participant: ParticipantInfo,
    auth_token: Option<String>,
    client: reqwest::blocking::Client,
}

impl HttpStore {
    pub fn new(base_url: &str, participant: ParticipantInfo) -> Result<Self, StoreError> {
        // Saves carry no deadline; the participant-facing flow never waits
        // on them.
        let client = reqwest::blocking::Client::builder()
            .timeout(None)
            .build()
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            participant,
            auth_token: None,
            client,
        })
    }

    /// Attaches a bearer token read from the named environment variable, if
    /// set and non-empty.
    pub fn with_token_env(mut self, var: &str) -> Self {
        self.auth_token = std::env::var(var).ok().filter(|v| !v.trim().is_empty());
        self
    }

    fn post(&self, path: &str, body: &serde_json::Value) -> Result<(), StoreError> {
        let url = format!("{}/{}", self.base_url, path);
        let mut request = self.client.post(&url).json(body);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(StoreError::Rejected {
                status: status.as_u16(),
            })
        }
    }
}

impl ResultStore for HttpStore {
    fn save_one(&self, record: &TrialResult) -> Result<(), StoreError> {
        let body = json!({
            "participant": self.participant,
            "recorded_at": Utc::now().to_rfc3339(),
            "record": record,
        });
        self.post("trials", &body)
    }

    fn save_all(&self, records: &ResultSet) -> Result<(), StoreError> {
        let body = json!({
            "participant": self.participant,
            "completed_at": Utc::now().to_rfc3339(),
            "record_count": records.len(),
            "records": records,
        });
        self.post("sessions", &body)
    }
}

/// In-process store used in mock mode and by tests. Records every save and
/// always succeeds.
#[derive(Debug, Default)]
pub struct MemoryStore {
    partial: Mutex<Vec<TrialResult>>,
    batches: Mutex<Vec<ResultSet>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partial_records(&self) -> Vec<TrialResult> {
        self.partial
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn batch_saves(&self) -> Vec<ResultSet> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn save_one_calls(&self) -> usize {
        self.partial
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn save_all_calls(&self) -> usize {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl ResultStore for MemoryStore {
    fn save_one(&self, record: &TrialResult) -> Result<(), StoreError> {
        self.partial
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }

    fn save_all(&self, records: &ResultSet) -> Result<(), StoreError> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(records.clone());
        Ok(())
    }
}
