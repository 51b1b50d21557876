use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::emotion::EmotionLabel;
use crate::error::EngineError;
use crate::storage::SnapshotStore;

const RECENT_ACTIVITY_CAP: usize = 10;
const EMOTION_HISTORY_CAP: usize = 100;
const DEFAULT_TOTAL_MODULES: u32 = 3;
const DEFAULT_WEEKLY_GOAL: u32 = 300;
const ACHIEVEMENT_POINTS: u32 = 50;
const WEEKLY_RESET_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    Quiz,
    Content,
    Module,
    Assignment,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Quiz => "quiz",
            ActivityKind::Content => "content",
            ActivityKind::Module => "module",
            ActivityKind::Assignment => "assignment",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub subject: String,
    pub kind: ActivityKind,
    pub score: Option<u32>,
    pub duration_secs: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmotionEntry {
    pub label: EmotionLabel,
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectProgress {
    pub progress: u32,
    pub modules_completed: u32,
    pub total_modules: u32,
    pub time_spent_secs: u64,
    pub average_score: u32,
    pub last_accessed: DateTime<Utc>,
}

impl SubjectProgress {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            progress: 0,
            modules_completed: 0,
            total_modules: DEFAULT_TOTAL_MODULES,
            time_spent_secs: 0,
            average_score: 0,
            last_accessed: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Achievement {
    pub id: u32,
    pub title: String,
    pub description: String,
    pub earned: bool,
    pub earned_at: Option<DateTime<Utc>>,
}

fn default_achievements() -> Vec<Achievement> {
    let catalogue = [
        (1, "First Steps", "Complete your first module"),
        (2, "Streak Builder", "Maintain a 3-day study streak"),
        (3, "Quiz Master", "Score 90% or higher on a quiz"),
        (4, "Time Manager", "Study for 60 minutes in one session"),
        (5, "Subject Specialist", "Complete all modules in one subject"),
        (6, "Emotion Explorer", "Show every emotion the detector knows"),
    ];
    catalogue
        .into_iter()
        .map(|(id, title, description)| Achievement {
            id,
            title: title.to_owned(),
            description: description.to_owned(),
            earned: false,
            earned_at: None,
        })
        .collect()
}

/// Canonical per-learner progress document. The aggregator is its single
/// writer; everything else sees it through broadcast copies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub learner_id: Uuid,
    pub overall_progress: u32,
    pub subjects: HashMap<String, SubjectProgress>,
    pub current_streak: u32,
    pub longest_streak: u32,
    pub total_points: u32,
    pub weekly_goal: u32,
    pub weekly_progress: u32,
    pub active_minutes: u32,
    pub current_emotion: Option<EmotionEntry>,
    pub recent_activity: Vec<ActivityEntry>,
    pub emotion_history: Vec<EmotionEntry>,
    pub achievements: Vec<Achievement>,
    pub last_study_date: Option<NaiveDate>,
    pub last_reset: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    /// Reconciliation flag: the snapshot was broadcast but the last write
    /// to the store failed twice.
    #[serde(default)]
    pub unpersisted: bool,
}

impl ProgressSnapshot {
    pub fn new(learner_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            learner_id,
            overall_progress: 0,
            subjects: HashMap::new(),
            current_streak: 0,
            longest_streak: 0,
            total_points: 0,
            weekly_goal: DEFAULT_WEEKLY_GOAL,
            weekly_progress: 0,
            active_minutes: 0,
            current_emotion: None,
            recent_activity: Vec::new(),
            emotion_history: Vec::new(),
            achievements: default_achievements(),
            last_study_date: None,
            last_reset: now,
            last_active: now,
            unpersisted: false,
        }
    }

    /// Unweighted mean over subjects with recorded progress; 0 when none.
    pub fn recompute_overall(&mut self) {
        if self.subjects.is_empty() {
            self.overall_progress = 0;
            return;
        }
        let total: u64 = self.subjects.values().map(|s| s.progress as u64).sum();
        self.overall_progress =
            ((total as f64 / self.subjects.len() as f64).round()) as u32;
    }

    /// Zeroes the weekly counter once 7 or more days have elapsed since
    /// the last reset. Returns whether anything changed.
    pub fn check_weekly_reset(&mut self, now: DateTime<Utc>) -> bool {
        if now - self.last_reset >= Duration::days(WEEKLY_RESET_DAYS) {
            self.weekly_progress = 0;
            self.last_reset = now;
            return true;
        }
        false
    }

    pub fn push_activity(&mut self, entry: ActivityEntry) {
        self.recent_activity.insert(0, entry);
        self.recent_activity.truncate(RECENT_ACTIVITY_CAP);
    }

    pub fn push_emotion(&mut self, entry: EmotionEntry) {
        self.current_emotion = Some(entry.clone());
        self.emotion_history.insert(0, entry);
        self.emotion_history.truncate(EMOTION_HISTORY_CAP);
    }

    pub fn update_streak(&mut self, today: NaiveDate) {
        self.current_streak = match self.last_study_date {
            Some(last) if last == today => self.current_streak,
            Some(last) if today - last == Duration::days(1) => self.current_streak + 1,
            _ => 1,
        };
        self.longest_streak = self.longest_streak.max(self.current_streak);
        self.last_study_date = Some(today);
    }

    fn award(&mut self, id: u32, now: DateTime<Utc>) {
        if let Some(achievement) = self
            .achievements
            .iter_mut()
            .find(|a| a.id == id && !a.earned)
        {
            achievement.earned = true;
            achievement.earned_at = Some(now);
            self.total_points += ACHIEVEMENT_POINTS;
            self.weekly_progress += ACHIEVEMENT_POINTS;
        }
    }

    fn observed_every_label(&self) -> bool {
        EmotionLabel::ALL
            .iter()
            .all(|label| self.emotion_history.iter().any(|e| e.label == *label))
    }
}

#[derive(Debug, Clone)]
pub struct ActivityInput {
    pub subject: String,
    pub kind: ActivityKind,
    pub score: Option<u32>,
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmotionShare {
    pub label: EmotionLabel,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardStats {
    pub total_students: usize,
    pub avg_progress: f64,
    pub emotion_distribution: Vec<EmotionShare>,
}

/// Fleet summary for the admin initial payload.
pub fn dashboard_stats(snapshots: &[ProgressSnapshot]) -> DashboardStats {
    let mut counts: HashMap<EmotionLabel, usize> = HashMap::new();
    for snapshot in snapshots {
        for entry in snapshot.emotion_history.iter() {
            *counts.entry(entry.label).or_insert(0) += 1;
        }
    }

    let mut emotion_distribution: Vec<EmotionShare> = counts
        .into_iter()
        .map(|(label, count)| EmotionShare { label, count })
        .collect();
    emotion_distribution.sort_by(|a, b| b.count.cmp(&a.count));

    let avg_progress = if snapshots.is_empty() {
        0.0
    } else {
        snapshots.iter().map(|s| s.overall_progress as f64).sum::<f64>()
            / snapshots.len() as f64
    };

    DashboardStats {
        total_students: snapshots.len(),
        avg_progress,
        emotion_distribution,
    }
}

/// Single writer of the canonical snapshot. Persistence failures are
/// retried once; after that the in-memory snapshot is still returned for
/// broadcast, flagged for background reconciliation.
pub struct ProgressAggregator {
    store: Arc<dyn SnapshotStore>,
}

impl ProgressAggregator {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self { store }
    }

    pub async fn record_activity(
        &self,
        learner_id: Uuid,
        input: ActivityInput,
    ) -> Result<ProgressSnapshot, EngineError> {
        let now = Utc::now();
        let mut snapshot = self.load_or_create(learner_id, now).await?;

        let subject = snapshot
            .subjects
            .entry(input.subject.clone())
            .or_insert_with(|| SubjectProgress::new(now));

        match input.kind {
            ActivityKind::Module => {
                subject.modules_completed =
                    (subject.modules_completed + 1).min(subject.total_modules);
                subject.progress = ((subject.modules_completed as f64
                    / subject.total_modules as f64)
                    * 100.0)
                    .round() as u32;
            }
            ActivityKind::Content | ActivityKind::Assignment => {
                subject.time_spent_secs += input.duration_secs;
                let minutes = subject.time_spent_secs / 60;
                let time_based = (minutes * 2).min(100) as u32;
                subject.progress = subject.progress.max(time_based);
            }
            ActivityKind::Quiz => {
                if let Some(score) = input.score {
                    let score = score.min(100);
                    subject.progress = subject.progress.max(score);
                    subject.average_score = if subject.average_score == 0 {
                        score
                    } else {
                        ((subject.average_score + score) as f64 / 2.0).round() as u32
                    };
                }
            }
        }
        subject.last_accessed = now;

        let minutes = (input.duration_secs as f64 / 60.0).round() as u32;
        snapshot.active_minutes += minutes;
        snapshot.weekly_progress += minutes;

        snapshot.push_activity(ActivityEntry {
            subject: input.subject.clone(),
            kind: input.kind,
            score: input.score,
            duration_secs: input.duration_secs,
            timestamp: now,
        });

        snapshot.recompute_overall();
        snapshot.update_streak(now.date_naive());
        snapshot.check_weekly_reset(now);
        snapshot.last_active = now;

        self.check_achievements(&mut snapshot, &input, now);

        if let Err(err) = self
            .store
            .append_activity(learner_id, &snapshot.recent_activity[0])
            .await
        {
            warn!(learner = %learner_id, error = %err, "activity log append failed");
        }
        self.persist(&mut snapshot).await;
        Ok(snapshot)
    }

    pub async fn record_emotion(
        &self,
        learner_id: Uuid,
        label: EmotionLabel,
        confidence: f32,
    ) -> Result<ProgressSnapshot, EngineError> {
        let now = Utc::now();
        let mut snapshot = self.load_or_create(learner_id, now).await?;

        snapshot.push_emotion(EmotionEntry {
            label,
            confidence,
            timestamp: now,
        });
        snapshot.last_active = now;
        if snapshot.observed_every_label() {
            snapshot.award(6, now);
        }

        self.persist(&mut snapshot).await;
        Ok(snapshot)
    }

    pub async fn apply_weekly_reset(
        &self,
        learner_id: Uuid,
    ) -> Result<ProgressSnapshot, EngineError> {
        let now = Utc::now();
        let mut snapshot = self.load_or_create(learner_id, now).await?;
        if snapshot.check_weekly_reset(now) {
            self.persist(&mut snapshot).await;
        }
        Ok(snapshot)
    }

    pub async fn snapshot(
        &self,
        learner_id: Uuid,
    ) -> Result<Option<ProgressSnapshot>, EngineError> {
        self.store.get_snapshot(learner_id).await
    }

    pub async fn all_snapshots(&self) -> Result<Vec<ProgressSnapshot>, EngineError> {
        self.store.list_snapshots().await
    }

    async fn load_or_create(
        &self,
        learner_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ProgressSnapshot, EngineError> {
        Ok(self
            .store
            .get_snapshot(learner_id)
            .await?
            .unwrap_or_else(|| ProgressSnapshot::new(learner_id, now)))
    }

    fn check_achievements(
        &self,
        snapshot: &mut ProgressSnapshot,
        input: &ActivityInput,
        now: DateTime<Utc>,
    ) {
        if input.kind == ActivityKind::Module {
            snapshot.award(1, now);
            let completed_subject = snapshot
                .subjects
                .get(&input.subject)
                .map(|s| s.modules_completed >= s.total_modules)
                .unwrap_or(false);
            if completed_subject {
                snapshot.award(5, now);
            }
        }
        if snapshot.current_streak >= 3 {
            snapshot.award(2, now);
        }
        if input.score.is_some_and(|s| s >= 90) {
            snapshot.award(3, now);
        }
        if input.duration_secs >= 3_600 {
            snapshot.award(4, now);
        }
    }

    async fn persist(&self, snapshot: &mut ProgressSnapshot) {
        snapshot.unpersisted = false;
        if let Err(first) = self.store.put_snapshot(snapshot).await {
            warn!(
                learner = %snapshot.learner_id,
                error = %first,
                "snapshot write failed, retrying once"
            );
            if let Err(second) = self.store.put_snapshot(snapshot).await {
                warn!(
                    learner = %snapshot.learner_id,
                    error = %second,
                    "snapshot write failed twice, flagging for reconciliation"
                );
                snapshot.unpersisted = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn at(y: i32, mo: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn overall_progress_is_the_mean_of_recorded_subjects() {
        let now = at(2026, 3, 2);
        let mut snapshot = ProgressSnapshot::new(Uuid::new_v4(), now);
        snapshot.subjects.insert(
            "mathematics".into(),
            SubjectProgress {
                progress: 40,
                ..SubjectProgress::new(now)
            },
        );
        snapshot.subjects.insert(
            "science".into(),
            SubjectProgress {
                progress: 60,
                ..SubjectProgress::new(now)
            },
        );
        snapshot.recompute_overall();
        assert_eq!(snapshot.overall_progress, 50);

        // Idempotent: no intervening activity, same value.
        snapshot.recompute_overall();
        assert_eq!(snapshot.overall_progress, 50);
    }

    #[test]
    fn overall_progress_is_zero_without_subjects() {
        let mut snapshot = ProgressSnapshot::new(Uuid::new_v4(), at(2026, 3, 2));
        snapshot.recompute_overall();
        assert_eq!(snapshot.overall_progress, 0);
    }

    #[test]
    fn weekly_reset_after_eight_days_but_not_six() {
        let mut snapshot = ProgressSnapshot::new(Uuid::new_v4(), at(2026, 3, 2));
        snapshot.weekly_progress = 120;

        let mut six_days = snapshot.clone();
        assert!(!six_days.check_weekly_reset(at(2026, 3, 8)));
        assert_eq!(six_days.weekly_progress, 120);

        assert!(snapshot.check_weekly_reset(at(2026, 3, 10)));
        assert_eq!(snapshot.weekly_progress, 0);
        assert_eq!(snapshot.last_reset, at(2026, 3, 10));
    }

    #[test]
    fn streak_increments_day_over_day_and_resets_on_gaps() {
        let mut snapshot = ProgressSnapshot::new(Uuid::new_v4(), at(2026, 3, 2));
        let day = |d: u32| at(2026, 3, d).date_naive();

        snapshot.update_streak(day(2));
        assert_eq!(snapshot.current_streak, 1);
        snapshot.update_streak(day(2));
        assert_eq!(snapshot.current_streak, 1);
        snapshot.update_streak(day(3));
        assert_eq!(snapshot.current_streak, 2);
        snapshot.update_streak(day(4));
        assert_eq!(snapshot.current_streak, 3);
        snapshot.update_streak(day(8));
        assert_eq!(snapshot.current_streak, 1);
        assert_eq!(snapshot.longest_streak, 3);
    }

    #[test]
    fn recent_activity_keeps_the_latest_ten() {
        let now = at(2026, 3, 2);
        let mut snapshot = ProgressSnapshot::new(Uuid::new_v4(), now);
        for i in 0..12 {
            snapshot.push_activity(ActivityEntry {
                subject: format!("subject-{i}"),
                kind: ActivityKind::Content,
                score: None,
                duration_secs: 60,
                timestamp: now,
            });
        }
        assert_eq!(snapshot.recent_activity.len(), 10);
        assert_eq!(snapshot.recent_activity[0].subject, "subject-11");
    }

    #[test]
    fn emotion_history_is_bounded_to_one_hundred() {
        let now = at(2026, 3, 2);
        let mut snapshot = ProgressSnapshot::new(Uuid::new_v4(), now);
        for _ in 0..120 {
            snapshot.push_emotion(EmotionEntry {
                label: EmotionLabel::Neutral,
                confidence: 0.7,
                timestamp: now,
            });
        }
        assert_eq!(snapshot.emotion_history.len(), 100);
    }

    #[tokio::test]
    async fn module_completion_moves_subject_and_overall_progress() {
        let aggregator = ProgressAggregator::new(Arc::new(MemoryStore::new()));
        let learner = Uuid::new_v4();
        let snapshot = aggregator
            .record_activity(
                learner,
                ActivityInput {
                    subject: "mathematics".into(),
                    kind: ActivityKind::Module,
                    score: None,
                    duration_secs: 900,
                },
            )
            .await
            .unwrap();

        let math = &snapshot.subjects["mathematics"];
        assert_eq!(math.modules_completed, 1);
        assert_eq!(math.progress, 33);
        assert_eq!(snapshot.overall_progress, 33);
        // First Steps earned.
        assert!(snapshot.achievements.iter().any(|a| a.id == 1 && a.earned));
        assert_eq!(snapshot.total_points, 50);
    }

    #[tokio::test]
    async fn quiz_score_raises_progress_and_average() {
        let aggregator = ProgressAggregator::new(Arc::new(MemoryStore::new()));
        let learner = Uuid::new_v4();
        aggregator
            .record_activity(
                learner,
                ActivityInput {
                    subject: "science".into(),
                    kind: ActivityKind::Quiz,
                    score: Some(80),
                    duration_secs: 300,
                },
            )
            .await
            .unwrap();
        let snapshot = aggregator
            .record_activity(
                learner,
                ActivityInput {
                    subject: "science".into(),
                    kind: ActivityKind::Quiz,
                    score: Some(90),
                    duration_secs: 300,
                },
            )
            .await
            .unwrap();

        let science = &snapshot.subjects["science"];
        assert_eq!(science.progress, 90);
        assert_eq!(science.average_score, 85);
        // Quiz Master at 90.
        assert!(snapshot.achievements.iter().any(|a| a.id == 3 && a.earned));
    }

    #[tokio::test]
    async fn emotion_recording_leaves_overall_progress_alone() {
        let aggregator = ProgressAggregator::new(Arc::new(MemoryStore::new()));
        let learner = Uuid::new_v4();
        aggregator
            .record_activity(
                learner,
                ActivityInput {
                    subject: "mathematics".into(),
                    kind: ActivityKind::Module,
                    score: None,
                    duration_secs: 60,
                },
            )
            .await
            .unwrap();
        let before = aggregator.snapshot(learner).await.unwrap().unwrap();
        let after = aggregator
            .record_emotion(learner, EmotionLabel::Sad, 0.8)
            .await
            .unwrap();
        assert_eq!(after.overall_progress, before.overall_progress);
        assert_eq!(after.emotion_history.len(), 1);
        assert_eq!(after.current_emotion.as_ref().unwrap().label, EmotionLabel::Sad);
    }

    #[tokio::test]
    async fn emotion_explorer_awarded_after_every_label() {
        let aggregator = ProgressAggregator::new(Arc::new(MemoryStore::new()));
        let learner = Uuid::new_v4();
        let mut last = None;
        for label in EmotionLabel::ALL {
            last = Some(
                aggregator
                    .record_emotion(learner, label, 0.7)
                    .await
                    .unwrap(),
            );
        }
        let snapshot = last.unwrap();
        assert!(snapshot.achievements.iter().any(|a| a.id == 6 && a.earned));
    }

    struct FlakyStore {
        inner: MemoryStore,
        failures_left: AtomicU32,
    }

    #[async_trait::async_trait]
    impl SnapshotStore for FlakyStore {
        async fn get_snapshot(
            &self,
            learner_id: Uuid,
        ) -> Result<Option<ProgressSnapshot>, EngineError> {
            self.inner.get_snapshot(learner_id).await
        }

        async fn put_snapshot(
            &self,
            snapshot: &ProgressSnapshot,
        ) -> Result<(), EngineError> {
            if self.failures_left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_sub(1)
            }).is_ok()
            {
                return Err(EngineError::Persistence("injected failure".into()));
            }
            self.inner.put_snapshot(snapshot).await
        }

        async fn append_activity(
            &self,
            learner_id: Uuid,
            entry: &ActivityEntry,
        ) -> Result<(), EngineError> {
            self.inner.append_activity(learner_id, entry).await
        }

        async fn list_snapshots(&self) -> Result<Vec<ProgressSnapshot>, EngineError> {
            self.inner.list_snapshots().await
        }
    }

    #[tokio::test]
    async fn single_write_failure_is_retried_and_cleared() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failures_left: AtomicU32::new(1),
        });
        let aggregator = ProgressAggregator::new(store);
        let snapshot = aggregator
            .record_emotion(Uuid::new_v4(), EmotionLabel::Happy, 0.9)
            .await
            .unwrap();
        assert!(!snapshot.unpersisted);
    }

    #[tokio::test]
    async fn repeated_write_failure_still_returns_a_flagged_snapshot() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failures_left: AtomicU32::new(2),
        });
        let aggregator = ProgressAggregator::new(store);
        let snapshot = aggregator
            .record_emotion(Uuid::new_v4(), EmotionLabel::Happy, 0.9)
            .await
            .unwrap();
        assert!(snapshot.unpersisted);
        assert_eq!(snapshot.emotion_history.len(), 1);
    }

    #[test]
    fn dashboard_stats_summarize_the_fleet() {
        let now = at(2026, 3, 2);
        let mut a = ProgressSnapshot::new(Uuid::new_v4(), now);
        a.overall_progress = 40;
        a.push_emotion(EmotionEntry {
            label: EmotionLabel::Happy,
            confidence: 0.8,
            timestamp: now,
        });
        a.push_emotion(EmotionEntry {
            label: EmotionLabel::Happy,
            confidence: 0.9,
            timestamp: now,
        });
        let mut b = ProgressSnapshot::new(Uuid::new_v4(), now);
        b.overall_progress = 60;
        b.push_emotion(EmotionEntry {
            label: EmotionLabel::Sad,
            confidence: 0.7,
            timestamp: now,
        });

        let stats = dashboard_stats(&[a, b]);
        assert_eq!(stats.total_students, 2);
        assert!((stats.avg_progress - 50.0).abs() < f64::EPSILON);
        assert_eq!(stats.emotion_distribution[0].label, EmotionLabel::Happy);
        assert_eq!(stats.emotion_distribution[0].count, 2);
    }
}
