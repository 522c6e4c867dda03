use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ModelBase {
    /// Human readable name used in logs
    pub name: String,

    /// The identifier reported in every response of the model
    pub id: String,

    /// Local model directory, or a HuggingFace repository id when hub fallback is enabled
    pub source: String,

    /// The task the model was fine-tuned for
    pub task: TextTask,
}

#[derive(Deserialize, Serialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TextTask {
    MoodScore,
    DepressCheck,
}

impl TextTask {
    /// The response identifier of the model serving this task.
    pub fn model_id(&self) -> &'static str {
        match self {
            TextTask::MoodScore => "bert_4_moods",
            TextTask::DepressCheck => "bert_depress_check",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            TextTask::MoodScore => "mood score model",
            TextTask::DepressCheck => "depression check model",
        }
    }
}

impl ModelBase {
    pub fn for_task(task: TextTask, source: impl Into<String>) -> Self {
        Self {
            name: task.display_name().into(),
            id: task.model_id().into(),
            source: source.into(),
            task,
        }
    }
}
