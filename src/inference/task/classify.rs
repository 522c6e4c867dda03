use std::fmt::Display;

use anyhow::Error;
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Debug, Clone)]
pub struct ClassifyRequest {
    pub text: String,
}

/// A category as found in the model's `id2label` table, numeric codes stay numeric.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Label {
    Id(i64),
    Text(String),
}

impl Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Label::Id(id) => write!(f, "{id}"),
            Label::Text(text) => write!(f, "{text}"),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ClassifyResponse {
    pub label: Label,
    pub score: f64,
    pub model: String,
}

pub trait ClassifyHandler: Send + Sync {
    fn run_classify(&self, request: ClassifyRequest) -> Result<ClassifyResponse, Error>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn numeric_labels_serialize_as_integers() {
        let response = ClassifyResponse {
            label: Label::Id(3),
            score: 0.75,
            model: "bert_4_moods".into(),
        };
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"label": 3, "score": 0.75, "model": "bert_4_moods"})
        );
    }

    #[test]
    fn request_ignores_extra_fields() {
        let request: ClassifyRequest =
            serde_json::from_value(json!({"text": "today was fine", "score_type": "mood"}))
                .unwrap();
        assert_eq!(request.text, "today was fine");
    }

    #[test]
    fn label_accepts_both_shapes() {
        assert_eq!(serde_json::from_str::<Label>("1").unwrap(), Label::Id(1));
        assert_eq!(
            serde_json::from_str::<Label>("\"LABEL_1\"").unwrap(),
            Label::Text("LABEL_1".into())
        );
        assert_eq!(Label::Text("sad".into()).to_string(), "sad");
    }
}
