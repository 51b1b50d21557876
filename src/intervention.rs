use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::emotion::{EmotionLabel, StableEmotionEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterventionKind {
    Informational,
    Quiz,
    Motivational,
    Clarification,
}

/// Fixed label-to-kind mapping. Total over the canonical enum so a new
/// label cannot silently fall through.
pub fn kind_for(label: EmotionLabel) -> InterventionKind {
    match label {
        EmotionLabel::Happy | EmotionLabel::Surprised | EmotionLabel::Fearful => {
            InterventionKind::Informational
        }
        EmotionLabel::Neutral => InterventionKind::Quiz,
        EmotionLabel::Sad | EmotionLabel::Angry | EmotionLabel::Disgusted => {
            InterventionKind::Motivational
        }
        EmotionLabel::Confused => InterventionKind::Clarification,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterventionTrigger {
    pub learner_id: Uuid,
    pub kind: InterventionKind,
    pub label: EmotionLabel,
    pub subject_hint: Option<String>,
    pub triggered_at: DateTime<Utc>,
}

/// Decides whether a stable emotion becomes an intervention. Keeps the
/// session suppression set (labels whose UI is still open) and the global
/// per-learner trigger cooldown. `Confused` bypasses the suppression set
/// because confusion can recur legitimately, but still honors the cooldown.
#[derive(Debug)]
pub struct InterventionScheduler {
    cooldown: Duration,
    shown: HashSet<EmotionLabel>,
    last_trigger_at: Option<DateTime<Utc>>,
}

impl InterventionScheduler {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            shown: HashSet::new(),
            last_trigger_at: None,
        }
    }

    pub fn on_stable_emotion(
        &mut self,
        event: &StableEmotionEvent,
        subject_hint: Option<&str>,
    ) -> Option<InterventionTrigger> {
        if let Some(last) = self.last_trigger_at {
            if event.occurred_at - last < self.cooldown {
                return None;
            }
        }

        if event.label != EmotionLabel::Confused && self.shown.contains(&event.label) {
            return None;
        }

        if event.label != EmotionLabel::Confused {
            self.shown.insert(event.label);
        }
        self.last_trigger_at = Some(event.occurred_at);

        Some(InterventionTrigger {
            learner_id: event.learner_id,
            kind: kind_for(event.label),
            label: event.label,
            subject_hint: subject_hint.map(str::to_owned),
            triggered_at: event.occurred_at,
        })
    }

    /// The viewer dismissed the intervention UI for this label; the label
    /// may fire again later in the session.
    pub fn dismiss(&mut self, label: EmotionLabel) {
        self.shown.remove(&label);
    }

    pub fn reset(&mut self) {
        self.shown.clear();
        self.last_trigger_at = None;
    }

    pub fn suppressed(&self, label: EmotionLabel) -> bool {
        self.shown.contains(&label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(label: EmotionLabel, offset_secs: i64) -> StableEmotionEvent {
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();
        StableEmotionEvent {
            learner_id: Uuid::new_v4(),
            label,
            confidence: 0.75,
            occurred_at: start + Duration::seconds(offset_secs),
        }
    }

    fn scheduler() -> InterventionScheduler {
        InterventionScheduler::new(Duration::seconds(30))
    }

    #[test]
    fn mapping_covers_every_label() {
        assert_eq!(kind_for(EmotionLabel::Happy), InterventionKind::Informational);
        assert_eq!(kind_for(EmotionLabel::Surprised), InterventionKind::Informational);
        assert_eq!(kind_for(EmotionLabel::Fearful), InterventionKind::Informational);
        assert_eq!(kind_for(EmotionLabel::Neutral), InterventionKind::Quiz);
        assert_eq!(kind_for(EmotionLabel::Sad), InterventionKind::Motivational);
        assert_eq!(kind_for(EmotionLabel::Angry), InterventionKind::Motivational);
        assert_eq!(kind_for(EmotionLabel::Disgusted), InterventionKind::Motivational);
        assert_eq!(kind_for(EmotionLabel::Confused), InterventionKind::Clarification);
    }

    #[test]
    fn sad_fires_once_then_again_after_dismissal() {
        let mut sched = scheduler();
        assert!(sched.on_stable_emotion(&event(EmotionLabel::Sad, 0), None).is_some());
        // Second sad event before the modal is dismissed: suppressed even
        // though the cooldown has elapsed.
        assert!(sched.on_stable_emotion(&event(EmotionLabel::Sad, 40), None).is_none());
        sched.dismiss(EmotionLabel::Sad);
        let third = sched.on_stable_emotion(&event(EmotionLabel::Sad, 80), None);
        assert!(third.is_some());
        assert_eq!(third.unwrap().kind, InterventionKind::Motivational);
    }

    #[test]
    fn global_cooldown_applies_across_labels() {
        let mut sched = scheduler();
        assert!(sched.on_stable_emotion(&event(EmotionLabel::Sad, 0), None).is_some());
        assert!(sched.on_stable_emotion(&event(EmotionLabel::Angry, 10), None).is_none());
        assert!(sched.on_stable_emotion(&event(EmotionLabel::Angry, 31), None).is_some());
    }

    #[test]
    fn confused_bypasses_the_suppression_set() {
        let mut sched = scheduler();
        assert!(sched
            .on_stable_emotion(&event(EmotionLabel::Confused, 0), Some("mathematics"))
            .is_some());
        assert!(!sched.suppressed(EmotionLabel::Confused));
        // Recurs without any dismissal, once the cooldown allows.
        assert!(sched
            .on_stable_emotion(&event(EmotionLabel::Confused, 35), None)
            .is_some());
    }

    #[test]
    fn confused_still_honors_the_cooldown() {
        let mut sched = scheduler();
        assert!(sched.on_stable_emotion(&event(EmotionLabel::Confused, 0), None).is_some());
        assert!(sched.on_stable_emotion(&event(EmotionLabel::Confused, 5), None).is_none());
    }

    #[test]
    fn suppressed_label_does_not_consume_the_cooldown() {
        let mut sched = scheduler();
        assert!(sched.on_stable_emotion(&event(EmotionLabel::Sad, 0), None).is_some());
        // Suppressed at 40s; the cooldown clock still dates from 0s, so a
        // different label at 45s fires.
        assert!(sched.on_stable_emotion(&event(EmotionLabel::Sad, 40), None).is_none());
        assert!(sched.on_stable_emotion(&event(EmotionLabel::Neutral, 45), None).is_some());
    }

    #[test]
    fn subject_hint_is_carried_through() {
        let mut sched = scheduler();
        let trigger = sched
            .on_stable_emotion(&event(EmotionLabel::Neutral, 0), Some("science"))
            .unwrap();
        assert_eq!(trigger.subject_hint.as_deref(), Some("science"));
    }

    #[test]
    fn reset_clears_history_and_cooldown() {
        let mut sched = scheduler();
        assert!(sched.on_stable_emotion(&event(EmotionLabel::Sad, 0), None).is_some());
        sched.reset();
        assert!(sched.on_stable_emotion(&event(EmotionLabel::Sad, 1), None).is_some());
    }
}
