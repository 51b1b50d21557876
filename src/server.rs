use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::emotion::{ClassifierFrame, EmotionLabel};
use crate::hub::{BroadcastHub, LearnerScope, Subscription, ViewerRole};
use crate::progress::{dashboard_stats, ActivityInput, ActivityKind, ProgressAggregator, ProgressSnapshot};
use crate::protocol::{BroadcastMessage, MessageType};
use crate::session::{NoActiveSession, SessionManager};

const POLICY_VIOLATION: u16 = 1008;

/// Identity a capability token resolves to. Issuance is someone else's
/// problem; the engine only consumes the result.
#[derive(Debug, Clone)]
pub struct Viewer {
    pub role: ViewerRole,
    pub learner_id: Option<Uuid>,
}

pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Option<Viewer>;
}

/// Token table handed in at startup (env or config).
pub struct StaticTokenVerifier {
    tokens: HashMap<String, Viewer>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self {
            tokens: HashMap::new(),
        }
    }

    pub fn with_admin(mut self, token: impl Into<String>) -> Self {
        self.tokens.insert(
            token.into(),
            Viewer {
                role: ViewerRole::Admin,
                learner_id: None,
            },
        );
        self
    }

    pub fn with_student(mut self, token: impl Into<String>, learner_id: Uuid) -> Self {
        self.tokens.insert(
            token.into(),
            Viewer {
                role: ViewerRole::Student,
                learner_id: Some(learner_id),
            },
        );
        self
    }

    /// Parses `token=learner-uuid` pairs separated by commas, the format
    /// of the `ENGAGE_STUDENT_TOKENS` environment variable.
    pub fn with_student_pairs(mut self, pairs: &str) -> anyhow::Result<Self> {
        for pair in pairs.split(',').filter(|p| !p.trim().is_empty()) {
            let (token, learner) = pair
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("expected token=learner-id, got {pair}"))?;
            let learner_id = Uuid::parse_str(learner.trim())?;
            self = self.with_student(token.trim().to_owned(), learner_id);
        }
        Ok(self)
    }
}

impl Default for StaticTokenVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Option<Viewer> {
        self.tokens.get(token).cloned()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<BroadcastHub>,
    pub aggregator: Arc<ProgressAggregator>,
    pub sessions: Arc<SessionManager>,
    pub verifier: Arc<dyn TokenVerifier>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws/admin", get(ws_admin))
        .route("/ws/student", get(ws_student))
        .route(
            "/api/learners/:id/session",
            post(start_session).delete(stop_session),
        )
        .route("/api/learners/:id/frames", post(ingest_frame))
        .route("/api/learners/:id/activity", post(record_activity))
        .route(
            "/api/learners/:id/interventions/:label/dismiss",
            post(dismiss_intervention),
        )
        .with_state(state)
}

pub async fn serve(bind: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(%bind, "engagement engine listening");
    tokio::spawn(weekly_reset_sweep(state.clone()));
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Hourly sweep applying the weekly reset independently of other
/// mutations, broadcasting any snapshot it actually changed.
async fn weekly_reset_sweep(state: AppState) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(3_600));
    loop {
        ticker.tick().await;
        let snapshots = match state.aggregator.all_snapshots().await {
            Ok(snapshots) => snapshots,
            Err(err) => {
                warn!(error = %err, "weekly reset sweep could not list snapshots");
                continue;
            }
        };
        for snapshot in snapshots {
            if Utc::now() - snapshot.last_reset < chrono::Duration::days(7) {
                continue;
            }
            match state.aggregator.apply_weekly_reset(snapshot.learner_id).await {
                Ok(fresh) => {
                    if let Ok(data) = serde_json::to_value(&fresh) {
                        state.hub.publish_progress(fresh.learner_id, data).await;
                    }
                }
                Err(err) => {
                    warn!(learner = %snapshot.learner_id, error = %err, "weekly reset failed");
                }
            }
        }
    }
}

/// The opaque bearer token arrives via the WebSocket subprotocol header,
/// the same out-of-band slot browsers can actually set.
fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_owned())
}

async fn ws_admin(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let token = bearer_token(&headers);
    let viewer = token.as_deref().and_then(|t| state.verifier.verify(t));
    match viewer {
        Some(Viewer {
            role: ViewerRole::Admin,
            ..
        }) => {
            // Echo the subprotocol so browser clients complete the handshake.
            let ws = ws.protocols([token.unwrap_or_default()]);
            ws.on_upgrade(move |socket| async move {
                let initial = match admin_initial(&state).await {
                    Ok(initial) => initial,
                    Err(err) => {
                        warn!(error = %err, "failed to build admin initial payload");
                        return;
                    }
                };
                let subscription = state
                    .hub
                    .subscribe(ViewerRole::Admin, LearnerScope::All, initial)
                    .await;
                forward(socket, subscription, state.hub.clone()).await;
            })
        }
        _ => reject_upgrade(ws),
    }
}

async fn ws_student(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let token = bearer_token(&headers);
    let viewer = token.as_deref().and_then(|t| state.verifier.verify(t));
    match viewer {
        Some(Viewer {
            learner_id: Some(learner_id),
            ..
        }) => ws.protocols([token.unwrap_or_default()]).on_upgrade(move |socket| async move {
            let initial = match student_initial(&state, learner_id).await {
                Ok(initial) => initial,
                Err(err) => {
                    warn!(error = %err, learner = %learner_id, "failed to build student initial payload");
                    return;
                }
            };
            let subscription = state
                .hub
                .subscribe(
                    ViewerRole::Student,
                    LearnerScope::Single(learner_id),
                    initial,
                )
                .await;
            forward(socket, subscription, state.hub.clone()).await;
        }),
        _ => reject_upgrade(ws),
    }
}

/// Bad tokens still get an upgrade, then an immediate 1008 close;
/// browsers surface a close code better than a failed handshake.
fn reject_upgrade(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|mut socket| async move {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: POLICY_VIOLATION,
                reason: "unauthorized".into(),
            })))
            .await;
    })
}

async fn admin_initial(state: &AppState) -> Result<BroadcastMessage, crate::error::EngineError> {
    let snapshots = state.aggregator.all_snapshots().await?;
    let stats = dashboard_stats(&snapshots);
    Ok(BroadcastMessage::new(
        MessageType::InitialSnapshot,
        None,
        serde_json::json!({ "students": snapshots, "stats": stats }),
    ))
}

async fn student_initial(
    state: &AppState,
    learner_id: Uuid,
) -> Result<BroadcastMessage, crate::error::EngineError> {
    let snapshot = state
        .aggregator
        .snapshot(learner_id)
        .await?
        .unwrap_or_else(|| ProgressSnapshot::new(learner_id, Utc::now()));
    Ok(BroadcastMessage::new(
        MessageType::InitialStudentData,
        Some(learner_id),
        serde_json::to_value(&snapshot)?,
    ))
}

/// Pumps hub messages to the socket. Viewer connections are receive-only:
/// inbound frames are drained and ignored so pings and stray text cannot
/// back-pressure the hub.
async fn forward(socket: WebSocket, mut subscription: Subscription, hub: Arc<BroadcastHub>) {
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            outbound = subscription.receiver.recv() => {
                let Some(message) = outbound else { break };
                let encoded = match message.encode() {
                    Ok(encoded) => encoded,
                    Err(err) => {
                        warn!(error = %err, "dropping unencodable broadcast message");
                        continue;
                    }
                };
                if sink.send(Message::Text(encoded)).await.is_err() {
                    break;
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(_)) => {}
                    _ => break,
                }
            }
        }
    }
    hub.unsubscribe(subscription.id).await;
}

#[derive(Debug, Deserialize)]
struct FramePayload {
    scores: HashMap<String, f32>,
    captured_at: Option<DateTime<Utc>>,
    subject: Option<String>,
}

#[derive(Debug, Serialize)]
struct FrameResponse {
    accepted: bool,
    stable: Option<crate::emotion::StableEmotionEvent>,
    trigger: Option<crate::intervention::InterventionTrigger>,
}

async fn ingest_frame(
    Path(learner_id): Path<Uuid>,
    State(state): State<AppState>,
    Json(payload): Json<FramePayload>,
) -> Response {
    let mut scores = Vec::with_capacity(payload.scores.len());
    for (label, score) in payload.scores {
        match EmotionLabel::from_str(&label) {
            Ok(label) => scores.push((label, score)),
            Err(err) => {
                // Protocol error: log and discard the message, keep going.
                warn!(error = %err, learner = %learner_id, "rejecting frame");
                return StatusCode::BAD_REQUEST.into_response();
            }
        }
    }
    let frame = ClassifierFrame {
        scores,
        captured_at: payload.captured_at.unwrap_or_else(Utc::now),
    };

    let outcome = match state
        .sessions
        .process_frame(learner_id, &frame, payload.subject.as_deref())
        .await
    {
        Ok(Some(outcome)) => outcome,
        Ok(None) => {
            return Json(FrameResponse {
                accepted: false,
                stable: None,
                trigger: None,
            })
            .into_response()
        }
        Err(NoActiveSession) => return StatusCode::NOT_FOUND.into_response(),
    };

    if let Some(stable) = &outcome.stable {
        match state
            .aggregator
            .record_emotion(learner_id, stable.label, stable.confidence)
            .await
        {
            Ok(_snapshot) => {
                let data = serde_json::to_value(stable).unwrap_or_default();
                state.hub.publish_emotion(learner_id, data).await;
            }
            Err(err) => {
                warn!(error = %err, learner = %learner_id, "failed to record stable emotion");
            }
        }
    }

    Json(FrameResponse {
        accepted: true,
        stable: outcome.stable,
        trigger: outcome.trigger,
    })
    .into_response()
}

#[derive(Debug, Deserialize)]
struct ActivityPayload {
    subject: String,
    kind: ActivityKind,
    score: Option<u32>,
    #[serde(default)]
    duration_secs: u64,
}

async fn record_activity(
    Path(learner_id): Path<Uuid>,
    State(state): State<AppState>,
    Json(payload): Json<ActivityPayload>,
) -> Response {
    let input = ActivityInput {
        subject: payload.subject,
        kind: payload.kind,
        score: payload.score,
        duration_secs: payload.duration_secs,
    };
    match state.aggregator.record_activity(learner_id, input).await {
        Ok(snapshot) => {
            match serde_json::to_value(&snapshot) {
                Ok(data) => state.hub.publish_progress(learner_id, data).await,
                Err(err) => warn!(error = %err, "snapshot did not serialize for broadcast"),
            }
            Json(snapshot).into_response()
        }
        Err(err) => {
            warn!(error = %err, learner = %learner_id, "record_activity failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn start_session(
    Path(learner_id): Path<Uuid>,
    State(state): State<AppState>,
) -> StatusCode {
    if state.sessions.start(learner_id).await {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    }
}

async fn stop_session(
    Path(learner_id): Path<Uuid>,
    State(state): State<AppState>,
) -> StatusCode {
    if state.sessions.stop(learner_id).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn dismiss_intervention(
    Path((learner_id, label)): Path<(Uuid, String)>,
    State(state): State<AppState>,
) -> StatusCode {
    let label = match EmotionLabel::from_str(&label) {
        Ok(label) => label,
        Err(err) => {
            warn!(error = %err, "dismiss with unknown label");
            return StatusCode::BAD_REQUEST;
        }
    };
    match state.sessions.dismiss(learner_id, label).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(NoActiveSession) => StatusCode::NOT_FOUND,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::storage::MemoryStore;

    fn header_map(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("sec-websocket-protocol", token.parse().unwrap());
        headers
    }

    fn test_state() -> AppState {
        let store = Arc::new(MemoryStore::new());
        AppState {
            hub: Arc::new(BroadcastHub::new(16)),
            aggregator: Arc::new(ProgressAggregator::new(store)),
            sessions: Arc::new(SessionManager::new(EngineConfig::default())),
            verifier: Arc::new(StaticTokenVerifier::new().with_admin("admin-secret")),
        }
    }

    #[test]
    fn token_rides_the_subprotocol_header() {
        let headers = header_map("tok-123, other");
        assert_eq!(bearer_token(&headers).as_deref(), Some("tok-123"));
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn static_verifier_resolves_roles() {
        let learner = Uuid::new_v4();
        let verifier = StaticTokenVerifier::new()
            .with_admin("admin-secret")
            .with_student("student-secret", learner);

        let admin = verifier.verify("admin-secret").unwrap();
        assert_eq!(admin.role, ViewerRole::Admin);
        let student = verifier.verify("student-secret").unwrap();
        assert_eq!(student.learner_id, Some(learner));
        assert!(verifier.verify("nope").is_none());
    }

    #[test]
    fn student_pairs_parse_from_env_format() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let verifier = StaticTokenVerifier::new()
            .with_student_pairs(&format!("tok-a={a}, tok-b={b}"))
            .unwrap();
        assert_eq!(verifier.verify("tok-a").unwrap().learner_id, Some(a));
        assert_eq!(verifier.verify("tok-b").unwrap().learner_id, Some(b));
        assert!(StaticTokenVerifier::new().with_student_pairs("garbage").is_err());
    }

    #[tokio::test]
    async fn admin_initial_carries_students_and_stats() {
        let state = test_state();
        state
            .aggregator
            .record_emotion(Uuid::new_v4(), EmotionLabel::Happy, 0.9)
            .await
            .unwrap();

        let initial = admin_initial(&state).await.unwrap();
        assert_eq!(initial.kind, MessageType::InitialSnapshot);
        assert_eq!(initial.data["stats"]["total_students"], 1);
        assert_eq!(initial.data["students"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn student_initial_defaults_to_an_empty_snapshot() {
        let state = test_state();
        let learner = Uuid::new_v4();
        let initial = student_initial(&state, learner).await.unwrap();
        assert_eq!(initial.kind, MessageType::InitialStudentData);
        assert_eq!(initial.learner_id, Some(learner));
        assert_eq!(initial.data["overall_progress"], 0);
    }
}
