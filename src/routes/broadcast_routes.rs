// src/routes/broadcast_routes.rs
//
// Start/observe/cancel the WhatsApp batch dispatcher. A run is resolved to
// concrete recipients up front, then handed to a background task; the
// handler answers immediately and progress is read from /broadcast/status.

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::{
    broadcast::{self, BroadcastSnapshot, Pacing},
    error::ApiError,
    gateway::EvolutionGateway,
    middleware::auth_context::AuthContext,
    models::{AppState, Patient, PatientRow, TreatmentStatus},
    notify::TracingNotifier,
    settings::SettingsStore,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/broadcast", post(start_broadcast))
        .route("/broadcast/status", get(broadcast_status))
        .route("/broadcast/cancel", post(cancel_broadcast))
}

#[derive(Debug, Deserialize)]
pub struct StartBroadcastRequest {
    pub message: String,
    /// Funnel segment: "all" (or absent) or a treatment status value.
    pub status: Option<String>,
    /// City segment: "all" (or absent) or a city name.
    pub city: Option<String>,
    #[serde(default)]
    pub pacing: Pacing,
}

#[derive(Debug, Serialize)]
pub struct StartBroadcastResponse {
    pub data: StartBroadcastData,
}

#[derive(Debug, Serialize)]
pub struct StartBroadcastData {
    pub started: bool,
    pub recipients: usize,
}

fn parse_segment(raw: Option<&str>) -> Result<Option<TreatmentStatus>, ApiError> {
    match raw.map(str::trim) {
        None | Some("") | Some("all") => Ok(None),
        Some(value) => TreatmentStatus::parse(value).map(Some).ok_or_else(|| {
            ApiError::BadRequest(
                "VALIDATION_ERROR",
                format!("unknown treatment status '{value}'"),
            )
        }),
    }
}

pub async fn start_broadcast(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<StartBroadcastRequest>,
) -> Result<Json<StartBroadcastResponse>, ApiError> {
    // Configuration errors are reported synchronously; the loop never starts.
    let settings = SettingsStore::new(state.db.clone())
        .evolution(&auth.operator_id)
        .await
        .map_err(ApiError::db)?
        .filter(|s| s.is_complete())
        .ok_or_else(|| {
            ApiError::BadRequest(
                "GATEWAY_NOT_CONFIGURED",
                "save the Evolution API base URL, key and instance first".into(),
            )
        })?;

    let message = req.message.trim().to_string();
    if message.is_empty() {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "message is required".into(),
        ));
    }

    let status = parse_segment(req.status.as_deref())?;
    let city = req
        .city
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty() && *c != "all");

    let rows: Vec<PatientRow> = sqlx::query_as::<_, PatientRow>(
        r#"
        SELECT patient_id, name, phone, email, birth_date, lead_source,
               scheduled_appointment, non_conversion_reason, main_complaint,
               diagnosis, treatment_objective, suggested_sessions,
               completed_sessions, treatment_status, payment_modality,
               session_value, financial_status, anamnesis_link, quick_context,
               created_at, updated_at
        FROM patient
        ORDER BY updated_at DESC
        "#,
    )
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    let patients: Vec<Patient> = rows
        .into_iter()
        .map(|row| Patient::from_rows(row, vec![]))
        .collect();

    let recipients = broadcast::select_recipients(&patients, status, city);
    if recipients.is_empty() {
        return Err(ApiError::BadRequest(
            "NO_RECIPIENTS",
            "no patients with a dialable phone match this segment".into(),
        ));
    }

    if !state.broadcast.try_begin(recipients.len()) {
        return Err(ApiError::Conflict(
            "BROADCAST_RUNNING",
            "a broadcast is already in progress".into(),
        ));
    }

    let total = recipients.len();
    let run_state = state.broadcast.clone();
    tokio::spawn(async move {
        let gateway = EvolutionGateway::new(&settings);
        let summary = broadcast::run(
            &gateway,
            &recipients,
            &message,
            req.pacing,
            &run_state,
            &TracingNotifier,
        )
        .await;
        tracing::info!(
            sent = summary.sent,
            errored = summary.errored,
            cancelled = summary.cancelled,
            "broadcast run done"
        );
    });

    Ok(Json(StartBroadcastResponse {
        data: StartBroadcastData {
            started: true,
            recipients: total,
        },
    }))
}

#[derive(Debug, Serialize)]
pub struct BroadcastStatusResponse {
    pub data: BroadcastSnapshot,
}

pub async fn broadcast_status(
    State(state): State<AppState>,
    _auth: AuthContext,
) -> Result<Json<BroadcastStatusResponse>, ApiError> {
    Ok(Json(BroadcastStatusResponse {
        data: state.broadcast.snapshot(),
    }))
}

pub async fn cancel_broadcast(
    State(state): State<AppState>,
    _auth: AuthContext,
) -> Result<Json<BroadcastStatusResponse>, ApiError> {
    if !state.broadcast.is_running() {
        return Err(ApiError::BadRequest(
            "NOT_RUNNING",
            "no broadcast is in progress".into(),
        ));
    }
    // Takes effect between sends, at the next loop iteration.
    state.broadcast.request_cancel();

    Ok(Json(BroadcastStatusResponse {
        data: state.broadcast.snapshot(),
    }))
}
