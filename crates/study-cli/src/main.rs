use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use study_core::{ParticipantInfo, SessionConfig};
use study_sink::{run_scripted_session, ParticipantView, ResponseScript, ResultSink, RunPhase};
use study_store::{HttpStore, MemoryStore, ResultStore};
use study_timeline::StudySummary;

#[derive(Parser)]
#[command(name = "study", version, about = "Participant study delivery CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize a study definition.
    Describe {
        study: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Check a study definition for missing required fields.
    Validate {
        study: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Run a headless scripted session through the sink and store.
    Simulate {
        study: PathBuf,
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long)]
        mock: bool,
        #[arg(long)]
        token_env: Option<String>,
        #[arg(long)]
        responses: Option<PathBuf>,
        #[arg(long)]
        debug: bool,
        #[arg(long)]
        completion_code: Option<String>,
        #[arg(long)]
        completion_url: Option<String>,
        #[arg(long, default_value_t = 3000)]
        redirect_delay_ms: u64,
        #[arg(long)]
        json: bool,
    },
    /// Write a study definition template.
    Init {
        #[arg(long, default_value = "study.yaml")]
        out: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

const STUDY_TEMPLATE: &str = "\
study:
  id: ''                              # REQUIRED
  title: ''                           # REQUIRED
welcome: ''                           # REQUIRED: html shown before the run
instructions: ''                      # REQUIRED: html; a 2000 ms gap follows
slider:
  labels: []                          # REQUIRED: at least 2 anchor labels
  width: 500
stimuli: []                           # REQUIRED: at least 1 item, e.g.
#  - passage: '<p>...</p>'
#    amended: '<p>... She tells you: ...</p>'
#    prompt: '<p>...</p>'
#    scale: ['', '']
randomize_order: true
debrief: ''                           # REQUIRED: html shown after the run
";

/// Participant view for headless sessions: fragments go to stderr so JSON
/// output on stdout stays parseable.
struct ConsoleView;

impl ParticipantView for ConsoleView {
    fn show(&self, fragment: &str) {
        eprintln!("view :: {}", fragment);
    }

    fn navigate(&self, url: &str) {
        eprintln!("navigate :: {}", url);
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Describe { study, json } => {
            let summary = study_timeline::describe_study(&study)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": summary_to_json(&summary)
                })));
            }
            print_summary(&summary);
        }
        Commands::Validate { study, json } => {
            study_timeline::load_study(&study)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "validate",
                    "valid": true,
                    "study": study.display().to_string()
                })));
            }
            println!("ok");
        }
        Commands::Simulate {
            study,
            endpoint,
            mock,
            token_env,
            responses,
            debug,
            completion_code,
            completion_url,
            redirect_delay_ms,
            json,
        } => {
            let summary = study_timeline::describe_study(&study)?;
            let definition = study_timeline::load_study(&study)?;
            let timeline = study_timeline::build_timeline(&definition);

            let participant = ParticipantInfo::from_env();
            let mut config = SessionConfig::from_env();
            if debug {
                config.debug = true;
            }
            if mock {
                config.mock_store = true;
            }
            if let Some(code) = completion_code {
                config.completion_code = code;
            }
            if let Some(url) = completion_url {
                config.completion_url = url;
            }
            config.redirect_delay = Duration::from_millis(redirect_delay_ms);

            let script = match responses {
                Some(path) => ResponseScript::from_jsonl(&path)?,
                None => ResponseScript::default(),
            };

            let mut mock_handle: Option<Arc<MemoryStore>> = None;
            let store: Arc<dyn ResultStore> = if config.mock_store {
                let memory = Arc::new(MemoryStore::new());
                mock_handle = Some(memory.clone());
                memory
            } else if let Some(endpoint) = endpoint.as_deref() {
                let mut http = HttpStore::new(endpoint, participant.clone())?;
                if let Some(var) = token_env.as_deref() {
                    http = http.with_token_env(var);
                }
                Arc::new(http)
            } else {
                return Err(anyhow!("missing_store_endpoint: pass --endpoint or --mock"));
            };

            if config.debug {
                tracing::debug!(
                    participant_id = %participant.participant_id,
                    study_id = %definition.study.id,
                    "starting scripted session"
                );
            }

            let sink = ResultSink::new(config, store, Arc::new(ConsoleView));
            let results = run_scripted_session(&timeline, &script, &sink);
            let phase = phase_name(sink.phase());

            // Give detached incremental saves a moment to land before
            // reporting observed counts.
            std::thread::sleep(Duration::from_millis(50));
            let store_report = match &mock_handle {
                Some(memory) => json!({
                    "mode": "mock",
                    "partial_saves": memory.save_one_calls(),
                    "batch_saves": memory.save_all_calls(),
                }),
                None => json!({
                    "mode": "http",
                    "endpoint": endpoint,
                }),
            };

            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "simulate",
                    "summary": summary_to_json(&summary),
                    "session": {
                        "records": results.len(),
                        "phase": phase,
                    },
                    "store": store_report,
                })));
            }
            print_summary(&summary);
            println!("records: {}", results.len());
            println!("phase: {}", phase);
            if let Some(memory) = &mock_handle {
                println!("partial_saves: {}", memory.save_one_calls());
                println!("batch_saves: {}", memory.save_all_calls());
            }
        }
        Commands::Init { out, force } => {
            if !force && out.exists() {
                return Err(anyhow!(
                    "init file already exists (use --force): {}",
                    out.display()
                ));
            }
            if let Some(parent) = out.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            std::fs::write(&out, STUDY_TEMPLATE)?;
            println!("wrote: {}", out.display());
            println!("next: edit {} and fill in all fields marked REQUIRED", out.display());
            println!("next: study validate {}", out.display());
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Describe { json, .. }
        | Commands::Validate { json, .. }
        | Commands::Simulate { json, .. } => *json,
        _ => false,
    }
}

fn phase_name(phase: RunPhase) -> &'static str {
    match phase {
        RunPhase::Running => "running",
        RunPhase::Saving => "saving",
        RunPhase::Inspecting => "inspecting",
        RunPhase::Redirecting => "redirecting",
    }
}

fn summary_to_json(summary: &StudySummary) -> Value {
    json!({
        "study": summary.study_id,
        "title": summary.title,
        "stimuli": summary.stimulus_count,
        "trials": summary.trial_count,
        "incremental_trials": summary.incremental_trial_count,
        "randomize_order": summary.randomize_order,
        "widgets": summary.widget_counts,
    })
}

fn print_summary(summary: &StudySummary) {
    println!("study: {}", summary.study_id);
    println!("title: {}", summary.title);
    println!("stimuli: {}", summary.stimulus_count);
    println!("trials: {}", summary.trial_count);
    println!("incremental_trials: {}", summary.incremental_trial_count);
    println!("randomize_order: {}", summary.randomize_order);
    for (widget, count) in &summary.widget_counts {
        println!("widget.{}: {}", widget, count);
    }
}
