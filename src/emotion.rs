use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

/// Canonical emotion vocabulary shared by the filter, detector, scheduler
/// and wire layer. Label text that is not in this set is a protocol error,
/// never a silent default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmotionLabel {
    Happy,
    Sad,
    Angry,
    Fearful,
    Disgusted,
    Surprised,
    Neutral,
    Confused,
}

impl EmotionLabel {
    pub const ALL: [EmotionLabel; 8] = [
        EmotionLabel::Happy,
        EmotionLabel::Sad,
        EmotionLabel::Angry,
        EmotionLabel::Fearful,
        EmotionLabel::Disgusted,
        EmotionLabel::Surprised,
        EmotionLabel::Neutral,
        EmotionLabel::Confused,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmotionLabel::Happy => "happy",
            EmotionLabel::Sad => "sad",
            EmotionLabel::Angry => "angry",
            EmotionLabel::Fearful => "fearful",
            EmotionLabel::Disgusted => "disgusted",
            EmotionLabel::Surprised => "surprised",
            EmotionLabel::Neutral => "neutral",
            EmotionLabel::Confused => "confused",
        }
    }
}

impl fmt::Display for EmotionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmotionLabel {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "happy" => Ok(EmotionLabel::Happy),
            "sad" => Ok(EmotionLabel::Sad),
            "angry" => Ok(EmotionLabel::Angry),
            "fearful" => Ok(EmotionLabel::Fearful),
            "disgusted" => Ok(EmotionLabel::Disgusted),
            "surprised" => Ok(EmotionLabel::Surprised),
            "neutral" => Ok(EmotionLabel::Neutral),
            "confused" => Ok(EmotionLabel::Confused),
            other => Err(EngineError::Protocol(format!(
                "unknown emotion label: {other}"
            ))),
        }
    }
}

/// One classifier invocation. Scores keep the classifier's reported order
/// so dominant-label ties resolve to whatever the classifier listed first.
/// An empty score list means no face was found in the frame.
#[derive(Debug, Clone)]
pub struct ClassifierFrame {
    pub scores: Vec<(EmotionLabel, f32)>,
    pub captured_at: DateTime<Utc>,
}

impl ClassifierFrame {
    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn score_for(&self, label: EmotionLabel) -> f32 {
        self.scores
            .iter()
            .find(|(l, _)| *l == label)
            .map(|(_, s)| *s)
            .unwrap_or(0.0)
    }
}

/// Candidate emitted by the sample filter. Ephemeral, never persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmotionSample {
    pub label: EmotionLabel,
    pub confidence: f32,
    pub captured_at: DateTime<Utc>,
}

/// Discrete event the stability detector promotes a candidate run into.
/// Events for a learner are strictly ordered by `occurred_at` and spaced
/// by at least the detection cooldown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StableEmotionEvent {
    pub learner_id: Uuid,
    pub label: EmotionLabel,
    pub confidence: f32,
    pub occurred_at: DateTime<Utc>,
}
