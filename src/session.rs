use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::detector::StabilityDetector;
use crate::emotion::{ClassifierFrame, EmotionLabel, EmotionSample, StableEmotionEvent};
use crate::filter::SampleFilter;
use crate::intervention::{InterventionScheduler, InterventionTrigger};

/// Everything one frame can produce.
#[derive(Debug, Default)]
pub struct FrameOutcome {
    pub candidate: Option<EmotionSample>,
    pub stable: Option<StableEmotionEvent>,
    pub trigger: Option<InterventionTrigger>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionDiagnostics {
    pub frames_seen: u64,
    pub empty_frames: u64,
    pub low_confidence_frames: u64,
    pub dropped_in_flight: u64,
}

/// Per-learner detection arena: filter, detector, scheduler and counters
/// live and die together. Dropping the session is the teardown; there are
/// no timers to leak because cooldowns are carried as timestamps.
pub struct LearnerSession {
    learner_id: Uuid,
    filter: SampleFilter,
    detector: StabilityDetector,
    scheduler: InterventionScheduler,
    frames_seen: u64,
}

impl LearnerSession {
    pub fn new(learner_id: Uuid, config: &EngineConfig) -> Self {
        Self {
            learner_id,
            filter: SampleFilter::new(config.confidence_threshold),
            detector: StabilityDetector::new(
                learner_id,
                config.stability_frames,
                config.detection_cooldown(),
            ),
            scheduler: InterventionScheduler::new(config.intervention_cooldown()),
            frames_seen: 0,
        }
    }

    /// One strictly sequential fold step over the classifier stream.
    pub fn process_frame(
        &mut self,
        frame: &ClassifierFrame,
        subject_hint: Option<&str>,
    ) -> FrameOutcome {
        self.frames_seen += 1;
        let mut outcome = FrameOutcome::default();

        let Some(candidate) = self.filter.candidate(frame) else {
            return outcome;
        };
        outcome.candidate = Some(candidate);

        let Some(stable) = self.detector.observe(&candidate) else {
            return outcome;
        };
        debug!(
            learner = %self.learner_id,
            label = %stable.label,
            confidence = stable.confidence,
            "stable emotion"
        );
        outcome.trigger = self.scheduler.on_stable_emotion(&stable, subject_hint);
        outcome.stable = Some(stable);
        outcome
    }

    pub fn dismiss_intervention(&mut self, label: EmotionLabel) {
        self.scheduler.dismiss(label);
    }

    pub fn learner_id(&self) -> Uuid {
        self.learner_id
    }

    pub fn diagnostics(&self) -> SessionDiagnostics {
        SessionDiagnostics {
            frames_seen: self.frames_seen,
            empty_frames: self.filter.empty_frames(),
            low_confidence_frames: self.filter.low_confidence_frames(),
            dropped_in_flight: 0,
        }
    }
}

struct SessionSlot {
    inner: Arc<Mutex<LearnerSession>>,
    dropped_in_flight: AtomicU64,
}

/// Registry of active detection sessions. Frame processing is guarded by
/// `try_lock`: a frame arriving while a prior pass for the same learner is
/// still in flight is dropped and counted, never queued.
pub struct SessionManager {
    config: EngineConfig,
    sessions: RwLock<HashMap<Uuid, Arc<SessionSlot>>>,
}

impl SessionManager {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Idempotent; returns whether a new session was created.
    pub async fn start(&self, learner_id: Uuid) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&learner_id) {
            return false;
        }
        sessions.insert(
            learner_id,
            Arc::new(SessionSlot {
                inner: Arc::new(Mutex::new(LearnerSession::new(learner_id, &self.config))),
                dropped_in_flight: AtomicU64::new(0),
            }),
        );
        info!(learner = %learner_id, "detection session started");
        true
    }

    /// Tears the whole arena down. Pending cooldowns die with it.
    pub async fn stop(&self, learner_id: Uuid) -> bool {
        let removed = self.sessions.write().await.remove(&learner_id).is_some();
        if removed {
            info!(learner = %learner_id, "detection session stopped");
        }
        removed
    }

    /// Processes one frame for the learner. `Ok(None)` means the frame was
    /// dropped because a pass was already in flight; `Err` means no active
    /// session.
    pub async fn process_frame(
        &self,
        learner_id: Uuid,
        frame: &ClassifierFrame,
        subject_hint: Option<&str>,
    ) -> Result<Option<FrameOutcome>, NoActiveSession> {
        let slot = {
            let sessions = self.sessions.read().await;
            sessions.get(&learner_id).cloned().ok_or(NoActiveSession)?
        };

        let outcome = match slot.inner.try_lock() {
            Ok(mut session) => Ok(Some(session.process_frame(frame, subject_hint))),
            Err(_) => {
                slot.dropped_in_flight.fetch_add(1, Ordering::Relaxed);
                debug!(learner = %learner_id, "frame dropped: pass in flight");
                Ok(None)
            }
        };
        outcome
    }

    pub async fn dismiss(
        &self,
        learner_id: Uuid,
        label: EmotionLabel,
    ) -> Result<(), NoActiveSession> {
        let slot = {
            let sessions = self.sessions.read().await;
            sessions.get(&learner_id).cloned().ok_or(NoActiveSession)?
        };
        slot.inner.lock().await.dismiss_intervention(label);
        Ok(())
    }

    pub async fn diagnostics(
        &self,
        learner_id: Uuid,
    ) -> Result<SessionDiagnostics, NoActiveSession> {
        let slot = {
            let sessions = self.sessions.read().await;
            sessions.get(&learner_id).cloned().ok_or(NoActiveSession)?
        };
        let mut diagnostics = slot.inner.lock().await.diagnostics();
        diagnostics.dropped_in_flight = slot.dropped_in_flight.load(Ordering::Relaxed);
        Ok(diagnostics)
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct NoActiveSession;
