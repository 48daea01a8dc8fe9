use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

fn default_slider_width() -> u32 {
    500
}

fn default_true() -> bool {
    true
}

fn default_repetitions() -> u32 {
    1
}

/// Response widget the external runner renders for one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "widget", rename_all = "snake_case")]
pub enum Widget {
    HtmlKeyboardResponse {
        stimulus: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        choices: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        post_trial_gap_ms: Option<u64>,
    },
    HtmlButtonResponse {
        stimulus: String,
        choices: Vec<String>,
    },
    HtmlSliderResponse {
        stimulus: String,
        prompt: String,
        labels: Vec<String>,
        #[serde(default = "default_slider_width")]
        slider_width: u32,
    },
    SurveyLikert {
        preamble: String,
        questions: Vec<LikertQuestion>,
    },
}

impl Widget {
    pub fn name(&self) -> &'static str {
        match self {
            Widget::HtmlKeyboardResponse { .. } => "html_keyboard_response",
            Widget::HtmlButtonResponse { .. } => "html_button_response",
            Widget::HtmlSliderResponse { .. } => "html_slider_response",
            Widget::SurveyLikert { .. } => "survey_likert",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LikertQuestion {
    pub prompt: String,
    pub labels: Vec<String>,
}

/// One trial as handed to the runner: the widget plus the fields this
/// repository attaches at definition time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialSpec {
    #[serde(flatten)]
    pub widget: Widget,
    #[serde(default)]
    pub save_incrementally: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl TrialSpec {
    pub fn new(widget: Widget, tag: &str) -> Self {
        Self {
            widget,
            save_incrementally: false,
            tag: Some(tag.to_string()),
        }
    }

    pub fn saved_incrementally(mut self) -> Self {
        self.save_incrementally = true;
        self
    }
}

/// A procedure block: each group holds the trials generated from one
/// stimulus item and is presented consecutively. `randomize_order` asks the
/// runner to permute groups, never trials within a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub groups: Vec<Vec<TrialSpec>>,
    #[serde(default = "default_true")]
    pub randomize_order: bool,
    #[serde(default = "default_repetitions")]
    pub repetitions: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum TimelineEntry {
    Trial(TrialSpec),
    Block(Block),
}

/// Ordered trial plan for one run. Presentation (timing, input capture,
/// randomization) belongs to the external runner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timeline {
    pub entries: Vec<TimelineEntry>,
}

impl Timeline {
    /// Trials in declared order, with block repetitions expanded.
    pub fn flattened(&self) -> Vec<&TrialSpec> {
        let mut out = Vec::new();
        for entry in &self.entries {
            match entry {
                TimelineEntry::Trial(trial) => out.push(trial),
                TimelineEntry::Block(block) => {
                    for _ in 0..block.repetitions {
                        for group in &block.groups {
                            out.extend(group.iter());
                        }
                    }
                }
            }
        }
        out
    }

    pub fn trial_count(&self) -> usize {
        self.flattened().len()
    }

    pub fn incremental_trial_count(&self) -> usize {
        self.flattened()
            .iter()
            .filter(|t| t.save_incrementally)
            .count()
    }

    pub fn widget_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for trial in self.flattened() {
            *counts.entry(trial.widget.name().to_string()).or_default() += 1;
        }
        counts
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StudyMeta {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SliderScale {
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default = "default_slider_width")]
    pub width: u32,
}

/// One reading-comprehension item: the plain passage, the passage amended
/// with the claim under test, the judgment prompt, and the judgment scale.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StimulusItem {
    #[serde(default)]
    pub passage: String,
    #[serde(default)]
    pub amended: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub scale: Vec<String>,
}

/// Everything that varies between near-duplicate study variants: wording,
/// stimulus text, and response-scale configuration. Loaded from YAML.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StudyDefinition {
    pub study: StudyMeta,
    #[serde(default)]
    pub welcome: String,
    #[serde(default)]
    pub instructions: String,
    pub slider: SliderScale,
    #[serde(default)]
    pub stimuli: Vec<StimulusItem>,
    #[serde(default = "default_true")]
    pub randomize_order: bool,
    #[serde(default)]
    pub debrief: String,
}

pub fn load_study(path: &Path) -> Result<StudyDefinition> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("study definition not readable: {}: {}", path.display(), e))?;
    let definition: StudyDefinition = serde_yaml::from_str(&raw)?;
    validate(&definition)?;
    Ok(definition)
}

/// Reports every missing or malformed required field at once.
pub fn validate(definition: &StudyDefinition) -> Result<()> {
    let mut missing = Vec::new();
    if definition.study.id.trim().is_empty() {
        missing.push("study.id".to_string());
    }
    if definition.study.title.trim().is_empty() {
        missing.push("study.title".to_string());
    }
    if definition.welcome.trim().is_empty() {
        missing.push("welcome".to_string());
    }
    if definition.instructions.trim().is_empty() {
        missing.push("instructions".to_string());
    }
    if definition.slider.labels.len() < 2 {
        missing.push("slider.labels (need at least 2)".to_string());
    }
    if definition.debrief.trim().is_empty() {
        missing.push("debrief".to_string());
    }
    if definition.stimuli.is_empty() {
        missing.push("stimuli (need at least 1)".to_string());
    }
    for (idx, item) in definition.stimuli.iter().enumerate() {
        if item.passage.trim().is_empty() {
            missing.push(format!("stimuli[{}].passage", idx));
        }
        if item.amended.trim().is_empty() {
            missing.push(format!("stimuli[{}].amended", idx));
        }
        if item.prompt.trim().is_empty() {
            missing.push(format!("stimuli[{}].prompt", idx));
        }
        if item.scale.len() < 2 {
            missing.push(format!("stimuli[{}].scale (need at least 2)", idx));
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(anyhow!(
            "study definition missing required fields:\n{}",
            missing
                .iter()
                .map(|f| format!("  - {}", f))
                .collect::<Vec<_>>()
                .join("\n")
        ))
    }
}

/// Assembles the run plan: welcome, instructions, one group per stimulus
/// (a slider estimate on the plain passage, then a Likert judgment on the
/// amended passage, both persisted incrementally), then the debrief.
pub fn build_timeline(definition: &StudyDefinition) -> Timeline {
    let mut entries = Vec::new();

    entries.push(TimelineEntry::Trial(TrialSpec::new(
        Widget::HtmlKeyboardResponse {
            stimulus: definition.welcome.clone(),
            choices: None,
            post_trial_gap_ms: None,
        },
        "welcome",
    )));

    entries.push(TimelineEntry::Trial(TrialSpec::new(
        Widget::HtmlKeyboardResponse {
            stimulus: definition.instructions.clone(),
            choices: None,
            post_trial_gap_ms: Some(2000),
        },
        "instructions",
    )));

    let groups = definition
        .stimuli
        .iter()
        .map(|item| {
            vec![
                TrialSpec::new(
                    Widget::HtmlSliderResponse {
                        stimulus: item.passage.clone(),
                        prompt: item.prompt.clone(),
                        labels: definition.slider.labels.clone(),
                        slider_width: definition.slider.width,
                    },
                    "passage_estimate",
                )
                .saved_incrementally(),
                TrialSpec::new(
                    Widget::SurveyLikert {
                        preamble: item.amended.clone(),
                        questions: vec![LikertQuestion {
                            prompt: item.prompt.clone(),
                            labels: item.scale.clone(),
                        }],
                    },
                    "claim_judgment",
                )
                .saved_incrementally(),
            ]
        })
        .collect();
    entries.push(TimelineEntry::Block(Block {
        groups,
        randomize_order: definition.randomize_order,
        repetitions: 1,
    }));

    entries.push(TimelineEntry::Trial(TrialSpec::new(
        Widget::HtmlKeyboardResponse {
            stimulus: definition.debrief.clone(),
            choices: None,
            post_trial_gap_ms: None,
        },
        "debrief",
    )));

    Timeline { entries }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StudySummary {
    pub study_id: String,
    pub title: String,
    pub stimulus_count: usize,
    pub trial_count: usize,
    pub incremental_trial_count: usize,
    pub randomize_order: bool,
    pub widget_counts: BTreeMap<String, usize>,
}

pub fn describe_study(path: &Path) -> Result<StudySummary> {
    let definition = load_study(path)?;
    let timeline = build_timeline(&definition);
    Ok(StudySummary {
        study_id: definition.study.id.clone(),
        title: definition.study.title.clone(),
        stimulus_count: definition.stimuli.len(),
        trial_count: timeline.trial_count(),
        incremental_trial_count: timeline.incremental_trial_count(),
        randomize_order: definition.randomize_order,
        widget_counts: timeline.widget_counts(),
    })
}
