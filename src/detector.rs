use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::emotion::{EmotionLabel, EmotionSample, StableEmotionEvent};

/// Stability detector states. `Cooldown` holds the instant at which the
/// machine may accumulate again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectorState {
    Idle,
    Accumulating { label: EmotionLabel, count: u32 },
    Cooldown { until: DateTime<Utc> },
}

/// Per-learner run-length machine over the candidate stream. Time is read
/// from sample timestamps, so a given input sequence always folds to the
/// same events.
#[derive(Debug)]
pub struct StabilityDetector {
    learner_id: Uuid,
    stability_frames: u32,
    cooldown: Duration,
    state: DetectorState,
    last_event_at: Option<DateTime<Utc>>,
}

impl StabilityDetector {
    pub fn new(learner_id: Uuid, stability_frames: u32, cooldown: Duration) -> Self {
        Self {
            learner_id,
            stability_frames,
            cooldown,
            state: DetectorState::Idle,
            last_event_at: None,
        }
    }

    /// Folds one candidate into the machine. Emits at most one event: the
    /// run-length threshold was just reached and the cooldown window from
    /// the previous event (if any) has fully elapsed.
    pub fn observe(&mut self, sample: &EmotionSample) -> Option<StableEmotionEvent> {
        let now = sample.captured_at;

        if let DetectorState::Cooldown { until } = self.state {
            if now < until {
                // Observed, not accumulated.
                return None;
            }
            self.state = DetectorState::Idle;
        }

        let count = match &self.state {
            DetectorState::Accumulating { label, count } if *label == sample.label => count + 1,
            _ => 1,
        };

        if count >= self.stability_frames {
            let event = StableEmotionEvent {
                learner_id: self.learner_id,
                label: sample.label,
                confidence: sample.confidence,
                occurred_at: now,
            };
            self.last_event_at = Some(now);
            self.state = DetectorState::Cooldown {
                until: now + self.cooldown,
            };
            return Some(event);
        }

        self.state = DetectorState::Accumulating {
            label: sample.label,
            count,
        };
        None
    }

    /// Explicit stop: back to `Idle`, run and cooldown discarded.
    pub fn reset(&mut self) {
        self.state = DetectorState::Idle;
    }

    pub fn state(&self) -> &DetectorState {
        &self.state
    }

    pub fn last_event_at(&self) -> Option<DateTime<Utc>> {
        self.last_event_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn detector() -> StabilityDetector {
        StabilityDetector::new(Uuid::new_v4(), 3, Duration::seconds(5))
    }

    fn sample(label: EmotionLabel, offset_ms: i64) -> EmotionSample {
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        EmotionSample {
            label,
            confidence: 0.7,
            captured_at: start + Duration::milliseconds(offset_ms),
        }
    }

    #[test]
    fn five_confused_frames_emit_exactly_one_event_on_the_third() {
        let mut det = detector();
        let mut events = Vec::new();
        for i in 0..5 {
            if let Some(event) = det.observe(&sample(EmotionLabel::Confused, i * 300)) {
                events.push((i, event));
            }
        }
        assert_eq!(events.len(), 1);
        let (frame_index, event) = &events[0];
        assert_eq!(*frame_index, 2);
        assert_eq!(event.label, EmotionLabel::Confused);
    }

    #[test]
    fn differing_candidate_restarts_the_run() {
        let mut det = detector();
        assert!(det.observe(&sample(EmotionLabel::Happy, 0)).is_none());
        assert!(det.observe(&sample(EmotionLabel::Happy, 300)).is_none());
        assert!(det.observe(&sample(EmotionLabel::Sad, 600)).is_none());
        assert!(det.observe(&sample(EmotionLabel::Happy, 900)).is_none());
        assert!(det.observe(&sample(EmotionLabel::Happy, 1200)).is_none());
        assert!(det.observe(&sample(EmotionLabel::Happy, 1500)).is_some());
    }

    #[test]
    fn no_two_events_within_the_cooldown_regardless_of_label() {
        let mut det = detector();
        for i in 0..3 {
            det.observe(&sample(EmotionLabel::Happy, i * 300));
        }
        // A full new run of a different label inside the 5s window.
        for i in 3..10 {
            assert!(det.observe(&sample(EmotionLabel::Sad, i * 300)).is_none());
        }
        // Past the window (event at 600ms + 5000ms = 5600ms), a fresh run
        // may emit again.
        assert!(det.observe(&sample(EmotionLabel::Sad, 5_700)).is_none());
        assert!(det.observe(&sample(EmotionLabel::Sad, 6_000)).is_none());
        let second = det.observe(&sample(EmotionLabel::Sad, 6_300)).unwrap();
        let first_at = sample(EmotionLabel::Happy, 600).captured_at;
        assert!(second.occurred_at - first_at >= Duration::seconds(5));
    }

    #[test]
    fn events_are_strictly_ordered_per_learner() {
        let mut det = detector();
        let mut occurred = Vec::new();
        for i in 0..60 {
            if let Some(event) = det.observe(&sample(EmotionLabel::Neutral, i * 300)) {
                occurred.push(event.occurred_at);
            }
        }
        assert!(occurred.len() > 1);
        for pair in occurred.windows(2) {
            assert!(pair[1] > pair[0]);
            assert!(pair[1] - pair[0] >= Duration::seconds(5));
        }
    }

    #[test]
    fn cooldown_candidates_do_not_shorten_the_window() {
        let mut det = detector();
        for i in 0..3 {
            det.observe(&sample(EmotionLabel::Happy, i * 300));
        }
        assert!(matches!(det.state(), DetectorState::Cooldown { .. }));
        // Candidates during cooldown leave the state untouched.
        det.observe(&sample(EmotionLabel::Happy, 1_000));
        assert!(matches!(det.state(), DetectorState::Cooldown { .. }));
    }

    #[test]
    fn reset_returns_to_idle() {
        let mut det = detector();
        det.observe(&sample(EmotionLabel::Happy, 0));
        det.observe(&sample(EmotionLabel::Happy, 300));
        det.reset();
        assert_eq!(*det.state(), DetectorState::Idle);
        // The run starts over after a reset.
        assert!(det.observe(&sample(EmotionLabel::Happy, 600)).is_none());
        assert!(det.observe(&sample(EmotionLabel::Happy, 900)).is_none());
        assert!(det.observe(&sample(EmotionLabel::Happy, 1200)).is_some());
    }
}
