use crate::emotion::{ClassifierFrame, EmotionLabel, EmotionSample};

// Confusion is not a first-class classifier output; it is blended here from
// co-occurring surprise and neutrality. Both ingredients must actually be
// present and the blend must beat every non-ingredient score.
const CONFUSED_SURPRISED_WEIGHT: f32 = 0.7;
const CONFUSED_NEUTRAL_WEIGHT: f32 = 0.3;
const CONFUSED_FLOOR: f32 = 0.4;
const INGREDIENT_FLOOR: f32 = 0.3;

/// Rejects low-confidence frames and emits a candidate label per frame.
/// Rejections are silent; the counters exist for diagnostics only.
#[derive(Debug)]
pub struct SampleFilter {
    threshold: f32,
    empty_frames: u64,
    low_confidence_frames: u64,
}

impl SampleFilter {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            empty_frames: 0,
            low_confidence_frames: 0,
        }
    }

    /// One candidate or nothing; dropped frames are not queued.
    pub fn candidate(&mut self, frame: &ClassifierFrame) -> Option<EmotionSample> {
        if frame.is_empty() {
            self.empty_frames += 1;
            return None;
        }

        // First strictly-greater score wins, so ties fall to whatever the
        // classifier listed as dominant.
        let (mut label, mut score) = frame.scores[0];
        for (candidate, candidate_score) in frame.scores.iter().skip(1) {
            if *candidate_score > score {
                label = *candidate;
                score = *candidate_score;
            }
        }

        if let Some(confused_score) = self.derived_confusion(frame) {
            label = EmotionLabel::Confused;
            score = confused_score;
        }

        if score < self.threshold {
            self.low_confidence_frames += 1;
            return None;
        }

        Some(EmotionSample {
            label,
            confidence: score,
            captured_at: frame.captured_at,
        })
    }

    fn derived_confusion(&self, frame: &ClassifierFrame) -> Option<f32> {
        let surprised = frame.score_for(EmotionLabel::Surprised);
        let neutral = frame.score_for(EmotionLabel::Neutral);
        if surprised < INGREDIENT_FLOOR || neutral < INGREDIENT_FLOOR {
            return None;
        }

        let blend =
            surprised * CONFUSED_SURPRISED_WEIGHT + neutral * CONFUSED_NEUTRAL_WEIGHT;
        if blend <= CONFUSED_FLOOR {
            return None;
        }

        let other_max = frame
            .scores
            .iter()
            .filter(|(l, _)| {
                !matches!(l, EmotionLabel::Surprised | EmotionLabel::Neutral)
            })
            .map(|(_, s)| *s)
            .fold(0.0_f32, f32::max);
        if blend > other_max {
            Some(blend)
        } else {
            None
        }
    }

    pub fn empty_frames(&self) -> u64 {
        self.empty_frames
    }

    pub fn low_confidence_frames(&self) -> u64 {
        self.low_confidence_frames
    }
}
