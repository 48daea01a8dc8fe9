use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Field the experiment definition sets on a trial to request immediate
/// persistence of that trial's record.
pub const SAVE_INCREMENTALLY_FIELD: &str = "save_incrementally";

const DEFAULT_REDIRECT_DELAY_MS: u64 = 3000;

/// Identity the delivery platform assigns to a participant session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub participant_id: String,
    pub study_id: String,
    pub session_id: String,
}

impl ParticipantInfo {
    pub fn new(participant_id: &str, study_id: &str, session_id: &str) -> Self {
        Self {
            participant_id: participant_id.to_string(),
            study_id: study_id.to_string(),
            session_id: session_id.to_string(),
        }
    }

    /// Reads `STUDY_PARTICIPANT_ID` / `STUDY_STUDY_ID` / `STUDY_SESSION_ID`.
    /// Missing values fall back to `"unknown"` so debug sessions without a
    /// platform assignment still produce attributable records.
    pub fn from_env() -> Self {
        Self {
            participant_id: env_string("STUDY_PARTICIPANT_ID", "unknown"),
            study_id: env_string("STUDY_STUDY_ID", "unknown"),
            session_id: env_string("STUDY_SESSION_ID", "unknown"),
        }
    }
}

/// Process-wide session switches, injected into the sink at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub debug: bool,
    pub mock_store: bool,
    pub completion_code: String,
    pub completion_url: String,
    /// Delay between showing the exit notice and leaving the experiment.
    /// Production construction keeps the 3000 ms default; tests shorten it.
    pub redirect_delay: Duration,
}

impl SessionConfig {
    pub fn new(completion_code: &str, completion_url: &str) -> Self {
        Self {
            debug: false,
            mock_store: false,
            completion_code: completion_code.to_string(),
            completion_url: completion_url.to_string(),
            redirect_delay: Duration::from_millis(DEFAULT_REDIRECT_DELAY_MS),
        }
    }

    /// Reads `STUDY_DEBUG`, `STUDY_MOCK_STORE`, `STUDY_COMPLETION_CODE` and
    /// `STUDY_COMPLETION_URL`.
    pub fn from_env() -> Self {
        Self {
            debug: env_flag("STUDY_DEBUG"),
            mock_store: env_flag("STUDY_MOCK_STORE"),
            completion_code: env_string("STUDY_COMPLETION_CODE", ""),
            completion_url: env_string("STUDY_COMPLETION_URL", ""),
            redirect_delay: Duration::from_millis(DEFAULT_REDIRECT_DELAY_MS),
        }
    }
}

fn env_string(name: &str, fallback: &str) -> String {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => v,
        _ => fallback.to_string(),
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).ok().as_deref(),
        Some("1") | Some("true") | Some("yes")
    )
}

/// One completed trial's record: field name to value, in field order.
///
/// Runner-assigned fields (task, trial index, response, elapsed time) plus
/// whatever the experiment definition attached at trial definition time.
/// The sink treats records as read-only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrialResult {
    fields: BTreeMap<String, Value>,
}

impl TrialResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fields(fields: BTreeMap<String, Value>) -> Self {
        Self { fields }
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.fields.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn task(&self) -> Option<&str> {
        self.fields.get("task").and_then(|v| v.as_str())
    }

    pub fn trial_index(&self) -> Option<u64> {
        self.fields.get("trial_index").and_then(|v| v.as_u64())
    }

    /// Whether this record requested persistence at trial completion.
    /// Absent or non-boolean values count as false.
    pub fn saves_incrementally(&self) -> bool {
        self.fields
            .get(SAVE_INCREMENTALLY_FIELD)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }
}

/// Ordered snapshot of every record accumulated over a run, handed to the
/// sink once when the runner signals completion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultSet {
    records: Vec<TrialResult>,
}

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: TrialResult) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn values(&self) -> &[TrialResult] {
        &self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrialResult> {
        self.records.iter()
    }
}

impl From<Vec<TrialResult>> for ResultSet {
    fn from(records: Vec<TrialResult>) -> Self {
        Self { records }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn save_flag_defaults_to_false() {
        let record = TrialResult::new();
        assert!(!record.saves_incrementally());

        let mut record = TrialResult::new();
        record.set(SAVE_INCREMENTALLY_FIELD, json!(false));
        assert!(!record.saves_incrementally());
    }

    #[test]
    fn save_flag_requires_boolean_true() {
        let mut record = TrialResult::new();
        record.set(SAVE_INCREMENTALLY_FIELD, json!(true));
        assert!(record.saves_incrementally());

        let mut record = TrialResult::new();
        record.set(SAVE_INCREMENTALLY_FIELD, json!("true"));
        assert!(!record.saves_incrementally(), "non-boolean flag must not count");
    }

    #[test]
    fn result_set_preserves_completion_order() {
        let mut set = ResultSet::new();
        for idx in 0..4 {
            let mut record = TrialResult::new();
            record.set("trial_index", json!(idx));
            set.push(record);
        }
        assert_eq!(set.len(), 4);
        let indexes: Vec<u64> = set.iter().filter_map(|r| r.trial_index()).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3]);
    }

    #[test]
    fn trial_result_serializes_as_plain_map() {
        let mut record = TrialResult::new();
        record.set("task", json!("comprehension_slider"));
        record.set("response", json!(62));
        let value = serde_json::to_value(&record).expect("serialize");
        assert_eq!(
            value,
            json!({"task": "comprehension_slider", "response": 62})
        );
    }

    #[test]
    fn env_flag_accepts_common_truthy_spellings() {
        std::env::set_var("STUDY_CORE_TEST_FLAG_A", "1");
        assert!(env_flag("STUDY_CORE_TEST_FLAG_A"));
        std::env::set_var("STUDY_CORE_TEST_FLAG_B", "true");
        assert!(env_flag("STUDY_CORE_TEST_FLAG_B"));
        std::env::set_var("STUDY_CORE_TEST_FLAG_C", "0");
        assert!(!env_flag("STUDY_CORE_TEST_FLAG_C"));
        assert!(!env_flag("STUDY_CORE_TEST_FLAG_UNSET"));
    }

    #[test]
    fn session_config_carries_fixed_redirect_delay() {
        let config = SessionConfig::new("C1A2B3", "https://example.org/done");
        assert_eq!(config.redirect_delay, Duration::from_millis(3000));
        assert!(!config.debug);
        assert!(!config.mock_store);
    }
}
