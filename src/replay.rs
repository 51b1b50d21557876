use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::emotion::{ClassifierFrame, EmotionLabel, EmotionSample, StableEmotionEvent};
use crate::intervention::InterventionTrigger;
use crate::progress::{ProgressAggregator, ProgressSnapshot};
use crate::session::{LearnerSession, SessionDiagnostics};
use crate::storage::MemoryStore;

#[derive(Debug)]
pub struct ReplayResult {
    pub frames: usize,
    pub candidates: Vec<EmotionSample>,
    pub events: Vec<StableEmotionEvent>,
    pub triggers: Vec<InterventionTrigger>,
    pub diagnostics: SessionDiagnostics,
    pub snapshot: Option<ProgressSnapshot>,
}

#[derive(Debug, Clone)]
pub struct CandidateSummary {
    pub label: EmotionLabel,
    pub count: usize,
    pub avg_confidence: f64,
}

/// Replays a CSV of recorded classifier frames through the full
/// filter → detector → scheduler → aggregator pipeline against an
/// in-memory store.
pub async fn replay_csv(
    csv_path: &Path,
    learner_id: Uuid,
    config: &EngineConfig,
) -> anyhow::Result<ReplayResult> {
    let reader = csv::Reader::from_path(csv_path)?;
    replay_frames(reader, learner_id, config).await
}

pub async fn replay_frames<R: std::io::Read>(
    mut reader: csv::Reader<R>,
    learner_id: Uuid,
    config: &EngineConfig,
) -> anyhow::Result<ReplayResult> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        captured_at: DateTime<Utc>,
        #[serde(default)]
        happy: f32,
        #[serde(default)]
        sad: f32,
        #[serde(default)]
        angry: f32,
        #[serde(default)]
        fearful: f32,
        #[serde(default)]
        disgusted: f32,
        #[serde(default)]
        surprised: f32,
        #[serde(default)]
        neutral: f32,
        #[serde(default)]
        confused: f32,
        subject: Option<String>,
    }

    let mut session = LearnerSession::new(learner_id, config);
    let aggregator = ProgressAggregator::new(Arc::new(MemoryStore::new()));

    let mut result = ReplayResult {
        frames: 0,
        candidates: Vec::new(),
        events: Vec::new(),
        triggers: Vec::new(),
        diagnostics: SessionDiagnostics::default(),
        snapshot: None,
    };

    for row in reader.deserialize::<CsvRow>() {
        let row = row?;
        let scores: Vec<(EmotionLabel, f32)> = [
            (EmotionLabel::Happy, row.happy),
            (EmotionLabel::Sad, row.sad),
            (EmotionLabel::Angry, row.angry),
            (EmotionLabel::Fearful, row.fearful),
            (EmotionLabel::Disgusted, row.disgusted),
            (EmotionLabel::Surprised, row.surprised),
            (EmotionLabel::Neutral, row.neutral),
            (EmotionLabel::Confused, row.confused),
        ]
        .into_iter()
        .filter(|(_, score)| *score > 0.0)
        .collect();

        let frame = ClassifierFrame {
            scores,
            captured_at: row.captured_at,
        };
        result.frames += 1;

        let outcome = session.process_frame(&frame, row.subject.as_deref());
        if let Some(candidate) = outcome.candidate {
            result.candidates.push(candidate);
        }
        if let Some(stable) = outcome.stable {
            aggregator
                .record_emotion(learner_id, stable.label, stable.confidence)
                .await?;
            result.events.push(stable);
        }
        if let Some(trigger) = outcome.trigger {
            result.triggers.push(trigger);
        }
    }

    result.diagnostics = session.diagnostics();
    result.snapshot = aggregator.snapshot(learner_id).await?;
    Ok(result)
}

pub fn summarize_candidates(candidates: &[EmotionSample]) -> Vec<CandidateSummary> {
    let mut map: HashMap<EmotionLabel, (usize, f64)> = HashMap::new();
    for candidate in candidates {
        let entry = map.entry(candidate.label).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += candidate.confidence as f64;
    }

    let mut summaries: Vec<CandidateSummary> = map
        .into_iter()
        .map(|(label, (count, total))| CandidateSummary {
            label,
            count,
            avg_confidence: if count == 0 { 0.0 } else { total / count as f64 },
        })
        .collect();

    summaries.sort_by(|a, b| b.count.cmp(&a.count));
    summaries
}

pub fn build_report(learner_id: Uuid, result: &ReplayResult) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Engagement Replay Report");
    let _ = writeln!(
        output,
        "Learner {} ({} frames replayed)",
        learner_id, result.frames
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Candidate Mix");

    let summaries = summarize_candidates(&result.candidates);
    if summaries.is_empty() {
        let _ = writeln!(output, "No candidates cleared the confidence threshold.");
    } else {
        for summary in summaries.iter() {
            let _ = writeln!(
                output,
                "- {}: {} candidates (avg confidence {:.2})",
                summary.label, summary.count, summary.avg_confidence
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Stable Emotions");

    if result.events.is_empty() {
        let _ = writeln!(output, "No stable emotions detected.");
    } else {
        for event in result.events.iter() {
            let _ = writeln!(
                output,
                "- {} {} ({:.2})",
                event.occurred_at.format("%H:%M:%S%.3f"),
                event.label,
                event.confidence
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Interventions");

    if result.triggers.is_empty() {
        let _ = writeln!(output, "No interventions scheduled.");
    } else {
        for trigger in result.triggers.iter() {
            let subject = trigger.subject_hint.as_deref().unwrap_or("general");
            let _ = writeln!(
                output,
                "- {} {:?} for {} (subject {})",
                trigger.triggered_at.format("%H:%M:%S%.3f"),
                trigger.kind,
                trigger.label,
                subject
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Diagnostics");
    let _ = writeln!(output, "- frames seen: {}", result.diagnostics.frames_seen);
    let _ = writeln!(output, "- empty frames: {}", result.diagnostics.empty_frames);
    let _ = writeln!(
        output,
        "- low-confidence frames: {}",
        result.diagnostics.low_confidence_frames
    );

    output
}
