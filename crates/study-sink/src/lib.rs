use anyhow::Result;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use study_core::{ResultSet, SessionConfig, TrialResult, SAVE_INCREMENTALLY_FIELD};
use study_store::ResultStore;
use study_timeline::{Timeline, TrialSpec, Widget};

/// Lifecycle callbacks the external trial runner invokes. `on_trial_complete`
/// runs synchronously between trials and must not panic: a hook failure would
/// abort the run mid-session.
pub trait RunHooks {
    fn on_trial_complete(&self, record: &TrialResult);
    fn on_run_complete(&self, results: ResultSet);
}

/// Run lifecycle as observed by the sink. `Running` admits any number of
/// independent incremental saves; `Saving` is entered exactly once and only
/// ever leads to a terminal UI state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Running,
    Saving,
    Inspecting,
    Redirecting,
}

/// Participant-facing UI boundary: swap the page content, or leave the
/// experiment entirely.
pub trait ParticipantView: Send + Sync {
    fn show(&self, fragment: &str);
    fn navigate(&self, url: &str);
    /// Refresh the mock-store inspection panel. No-op outside debug tooling.
    fn refresh_debug_panel(&self) {}
}

pub fn saving_notice() -> String {
    "<p>Please wait, your data are being saved.</p>".to_string()
}

pub fn exit_notice(config: &SessionConfig) -> String {
    let debug_line = if config.debug {
        format!("<br /><br />redirect link: {}", config.completion_url)
    } else {
        "<br />".to_string()
    };
    format!(
        "<p class=\"text-center align-middle\">\n\
         Please wait. You will be redirected back in a few moments.\n\
         <br /><br />\n\
         If not, please use the following completion code to ensure compensation for this study: {}\n\
         {}\n\
         </p>",
        config.completion_code, debug_line
    )
}

pub fn data_dump(results: &ResultSet) -> String {
    let rendered = serde_json::to_string_pretty(results).unwrap_or_else(|_| "[]".to_string());
    format!("<pre>{}</pre>", rendered)
}

/// Forwards completed-trial records to the remote store and drives the
/// end-of-run UI transitions. Configuration is injected at construction.
pub struct ResultSink {
    config: SessionConfig,
    store: Arc<dyn ResultStore>,
    view: Arc<dyn ParticipantView>,
    phase: Mutex<RunPhase>,
}

impl ResultSink {
    pub fn new(
        config: SessionConfig,
        store: Arc<dyn ResultStore>,
        view: Arc<dyn ParticipantView>,
    ) -> Self {
        Self {
            config,
            store,
            view,
            phase: Mutex::new(RunPhase::Running),
        }
    }

    pub fn phase(&self) -> RunPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, next: RunPhase) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Exit notice, fixed delay, then hand the participant back to the
    /// completion URL. Used on batch-save success in normal mode and on
    /// batch-save failure in every mode.
    fn exit_experiment(&self) {
        self.view.show(&exit_notice(&self.config));
        thread::sleep(self.config.redirect_delay);
        self.view.navigate(&self.config.completion_url);
        self.set_phase(RunPhase::Redirecting);
    }
}

impl RunHooks for ResultSink {
    fn on_trial_complete(&self, record: &TrialResult) {
        if !record.saves_incrementally() {
            return;
        }
        let store = Arc::clone(&self.store);
        let view = Arc::clone(&self.view);
        let debug = self.config.debug;
        let mock_store = self.config.mock_store;
        let record = record.clone();
        // Detached: trial progression never waits on store latency.
        thread::spawn(move || match store.save_one(&record) {
            Ok(()) => {
                if debug {
                    tracing::debug!(
                        task = record.task().unwrap_or("unknown"),
                        "incremental save ok"
                    );
                    if mock_store {
                        view.refresh_debug_panel();
                    }
                }
            }
            Err(error) => {
                tracing::error!(
                    %error,
                    task = record.task().unwrap_or("unknown"),
                    "incremental save failed; record remains in the final batch"
                );
            }
        });
    }

    fn on_run_complete(&self, results: ResultSet) {
        {
            let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
            if *phase != RunPhase::Running {
                tracing::warn!(phase = ?*phase, "run completion signaled again; ignoring");
                return;
            }
            *phase = RunPhase::Saving;
        }
        self.view.show(&saving_notice());
        match self.store.save_all(&results) {
            Ok(()) => {
                if self.config.debug {
                    tracing::debug!(records = results.len(), "batch save ok");
                    self.view.show(&exit_notice(&self.config));
                    thread::sleep(self.config.redirect_delay);
                    self.view.show(&data_dump(&results));
                    self.set_phase(RunPhase::Inspecting);
                } else {
                    self.exit_experiment();
                }
            }
            Err(error) => {
                tracing::error!(%error, records = results.len(), "batch save failed");
                self.exit_experiment();
            }
        }
    }
}

/// Scripted responses for a headless session, one value per trial in
/// presentation order. Trials beyond the script fall back to a per-widget
/// default.
#[derive(Debug, Clone, Default)]
pub struct ResponseScript {
    responses: Vec<Value>,
}

impl ResponseScript {
    pub fn new(responses: Vec<Value>) -> Self {
        Self { responses }
    }

    /// One JSON response value per non-empty line.
    pub fn from_jsonl(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let mut responses = Vec::new();
        for line in data.lines() {
            if line.trim().is_empty() {
                continue;
            }
            responses.push(serde_json::from_str(line)?);
        }
        Ok(Self { responses })
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }

    fn response_for(&self, index: usize, widget: &Widget) -> Value {
        self.responses
            .get(index)
            .cloned()
            .unwrap_or_else(|| default_response(widget))
    }
}

fn default_response(widget: &Widget) -> Value {
    match widget {
        Widget::HtmlKeyboardResponse { .. } => json!("f"),
        Widget::HtmlButtonResponse { .. } => json!(0),
        Widget::HtmlSliderResponse { .. } => json!(50),
        Widget::SurveyLikert { questions, .. } => json!(vec![0; questions.len()]),
    }
}

fn synthesize_record(index: usize, trial: &TrialSpec, script: &ResponseScript) -> TrialResult {
    let mut record = TrialResult::new();
    record.set(
        "task",
        json!(trial
            .tag
            .clone()
            .unwrap_or_else(|| trial.widget.name().to_string())),
    );
    record.set("trial_index", json!(index));
    record.set("widget", json!(trial.widget.name()));
    record.set("response", script.response_for(index, &trial.widget));
    record.set("rt_ms", json!(500 + 25 * index as u64));
    if trial.save_incrementally {
        record.set(SAVE_INCREMENTALLY_FIELD, json!(true));
    }
    record
}

/// Drives a timeline the way the external runner would, headlessly: declared
/// order, one synthesized record per completed trial, hooks invoked as each
/// trial finishes and once more at the end with the ordered snapshot.
/// `randomize_order` is a presentation hint and is not applied here, so
/// scripted sessions are reproducible.
pub fn run_scripted_session(
    timeline: &Timeline,
    script: &ResponseScript,
    hooks: &dyn RunHooks,
) -> ResultSet {
    let mut results = ResultSet::new();
    for (index, trial) in timeline.flattened().into_iter().enumerate() {
        let record = synthesize_record(index, trial, script);
        hooks.on_trial_complete(&record);
        results.push(record);
    }
    hooks.on_run_complete(results.clone());
    results
}
