// src/routes/patient_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::Deserialize;
use sqlx::QueryBuilder;
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{
        AppState, FinancialStatus, OkData, OkResponse, Patient, PatientRow, SessionRow,
        TreatmentStatus,
    },
    quick_context,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/patients", post(create_patient).get(list_patients))
        .route(
            "/patients/{patient_id}",
            get(get_patient).patch(update_patient).delete(delete_patient),
        )
}

use serde::de::Deserializer;

fn deserialize_double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: serde::Deserialize<'de>,
{
    // Called only when the field is present (even as `null`):
    // null => Some(None) (explicit clear), value => Some(Some(value)).
    let inner = Option::<T>::deserialize(deserializer)?;
    Ok(Some(inner))
}

const PATIENT_COLUMNS: &str = r#"
    patient_id, name, phone, email, birth_date, lead_source,
    scheduled_appointment, non_conversion_reason, main_complaint, diagnosis,
    treatment_objective, suggested_sessions, completed_sessions,
    treatment_status, payment_modality, session_value, financial_status,
    anamnesis_link, quick_context, created_at, updated_at
"#;

#[derive(Debug, Deserialize)]
pub struct SessionInput {
    pub date: NaiveDate,
    pub notes: Option<String>,
    pub evolution: Option<String>,
    pub paid: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct CreatePatientRequest {
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub city: Option<String>,
    pub lead_source: Option<String>,
    pub scheduled_appointment: Option<bool>,
    pub non_conversion_reason: Option<String>,
    pub main_complaint: Option<String>,
    pub diagnosis: Option<String>,
    pub treatment_objective: Option<String>,
    pub suggested_sessions: Option<i32>,
    pub completed_sessions: Option<i32>,
    pub treatment_status: Option<TreatmentStatus>,
    pub payment_modality: Option<String>,
    pub session_value: Option<f64>,
    pub financial_status: Option<FinancialStatus>,
    pub anamnesis_link: Option<String>,
    pub quick_context: Option<String>,
    pub sessions: Option<Vec<SessionInput>>,
}

async fn insert_sessions(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    patient_id: Uuid,
    sessions: &[SessionInput],
) -> Result<Vec<SessionRow>, ApiError> {
    let mut rows = Vec::with_capacity(sessions.len());
    for s in sessions {
        let row: SessionRow = sqlx::query_as::<_, SessionRow>(
            r#"
            INSERT INTO session (patient_id, date, notes, evolution, paid)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING session_id, patient_id, date, notes, evolution, paid
            "#,
        )
        .bind(patient_id)
        .bind(s.date)
        .bind(s.notes.as_deref())
        .bind(s.evolution.as_deref())
        .bind(s.paid.unwrap_or(false))
        .fetch_one(&mut **tx)
        .await
        .map_err(ApiError::db)?;
        rows.push(row);
    }
    Ok(rows)
}

pub async fn create_patient(
    State(state): State<AppState>,
    _auth: AuthContext,
    Json(req): Json<CreatePatientRequest>,
) -> Result<Json<Patient>, ApiError> {
    let name = req.name.trim();
    let phone = req.phone.trim();

    if name.is_empty() || phone.is_empty() {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "name and phone are required".to_string(),
        ));
    }
    if req.session_value.is_some_and(|v| v < 0.0) {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "session_value must be non-negative".to_string(),
        ));
    }

    // City and quick-context token are reconciled to a single source of truth.
    let quick_context =
        quick_context::reconcile(req.quick_context.as_deref(), req.city.as_deref());

    let sessions = req.sessions.unwrap_or_default();
    let completed_sessions = if sessions.is_empty() {
        req.completed_sessions.unwrap_or(0).max(0)
    } else {
        sessions.len() as i32
    };

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    let row: PatientRow = sqlx::query_as::<_, PatientRow>(&format!(
        r#"
        INSERT INTO patient (
            name, phone, email, birth_date, lead_source, scheduled_appointment,
            non_conversion_reason, main_complaint, diagnosis, treatment_objective,
            suggested_sessions, completed_sessions, treatment_status,
            payment_modality, session_value, financial_status, anamnesis_link,
            quick_context, created_at, updated_at
        )
        VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18, now(), now())
        RETURNING {PATIENT_COLUMNS}
        "#
    ))
    .bind(name)
    .bind(phone)
    .bind(req.email.as_deref().map(str::trim).filter(|s| !s.is_empty()))
    .bind(req.birth_date)
    .bind(req.lead_source.as_deref().unwrap_or("Outros"))
    .bind(req.scheduled_appointment.unwrap_or(false))
    .bind(req.non_conversion_reason.as_deref())
    .bind(req.main_complaint.as_deref())
    .bind(req.diagnosis.as_deref())
    .bind(req.treatment_objective.as_deref())
    .bind(req.suggested_sessions)
    .bind(completed_sessions)
    .bind(req.treatment_status.unwrap_or(TreatmentStatus::New).as_str())
    .bind(req.payment_modality.as_deref().unwrap_or("Particular"))
    .bind(req.session_value)
    .bind(req.financial_status.unwrap_or(FinancialStatus::Pending).as_str())
    .bind(req.anamnesis_link.as_deref())
    .bind(quick_context.as_deref())
    .fetch_one(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    let session_rows = insert_sessions(&mut tx, row.patient_id, &sessions).await?;

    tx.commit().await.map_err(ApiError::db)?;

    Ok(Json(Patient::from_rows(row, session_rows)))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub query: Option<String>,
    pub status: Option<TreatmentStatus>,
}

pub async fn list_patients(
    State(state): State<AppState>,
    _auth: AuthContext,
    Query(q): Query<ListQuery>,
) -> Result<Json<Vec<Patient>>, ApiError> {
    // Dynamic filters via QueryBuilder, most recently touched first.
    let mut qb: QueryBuilder<sqlx::Postgres> =
        QueryBuilder::new(format!("SELECT {PATIENT_COLUMNS} FROM patient WHERE 1=1 "));

    if let Some(keyword) = q.query.as_ref().map(|s| s.trim()).filter(|s| !s.is_empty()) {
        let like = format!("%{}%", keyword);
        qb.push(" AND (name ILIKE ");
        qb.push_bind(like.clone());
        qb.push(" OR phone ILIKE ");
        qb.push_bind(like.clone());
        qb.push(" OR email ILIKE ");
        qb.push_bind(like);
        qb.push(") ");
    }
    if let Some(status) = q.status {
        qb.push(" AND treatment_status = ");
        qb.push_bind(status.as_str());
    }
    qb.push(" ORDER BY updated_at DESC ");

    let rows: Vec<PatientRow> = qb
        .build_query_as::<PatientRow>()
        .fetch_all(&state.db)
        .await
        .map_err(ApiError::db)?;

    let patients = attach_sessions(&state, rows).await?;
    Ok(Json(patients))
}

/// Fetch the sessions for a page of patients in one query and group them.
async fn attach_sessions(
    state: &AppState,
    rows: Vec<PatientRow>,
) -> Result<Vec<Patient>, ApiError> {
    if rows.is_empty() {
        return Ok(vec![]);
    }

    let ids: Vec<Uuid> = rows.iter().map(|r| r.patient_id).collect();
    let session_rows: Vec<SessionRow> = sqlx::query_as::<_, SessionRow>(
        r#"
        SELECT session_id, patient_id, date, notes, evolution, paid
        FROM session
        WHERE patient_id = ANY($1)
        ORDER BY date DESC
        "#,
    )
    .bind(&ids)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    let mut by_patient: std::collections::HashMap<Uuid, Vec<SessionRow>> =
        std::collections::HashMap::new();
    for s in session_rows {
        by_patient.entry(s.patient_id).or_default().push(s);
    }

    Ok(rows
        .into_iter()
        .map(|row| {
            let sessions = by_patient.remove(&row.patient_id).unwrap_or_default();
            Patient::from_rows(row, sessions)
        })
        .collect())
}

async fn load_patient(state: &AppState, patient_id: Uuid) -> Result<Patient, ApiError> {
    let row: PatientRow = sqlx::query_as::<_, PatientRow>(&format!(
        "SELECT {PATIENT_COLUMNS} FROM patient WHERE patient_id = $1"
    ))
    .bind(patient_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(ApiError::patient_not_found)?;

    let sessions: Vec<SessionRow> = sqlx::query_as::<_, SessionRow>(
        r#"
        SELECT session_id, patient_id, date, notes, evolution, paid
        FROM session
        WHERE patient_id = $1
        ORDER BY date DESC
        "#,
    )
    .bind(patient_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Patient::from_rows(row, sessions))
}

pub async fn get_patient(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(patient_id): Path<Uuid>,
) -> Result<Json<Patient>, ApiError> {
    Ok(Json(load_patient(&state, patient_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct UpdatePatientRequest {
    pub name: Option<String>,
    pub phone: Option<String>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub email: Option<Option<String>>,
    pub birth_date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub city: Option<Option<String>>,
    pub lead_source: Option<String>,
    pub scheduled_appointment: Option<bool>,
    pub non_conversion_reason: Option<String>,
    pub main_complaint: Option<String>,
    pub diagnosis: Option<String>,
    pub treatment_objective: Option<String>,
    pub suggested_sessions: Option<i32>,
    pub completed_sessions: Option<i32>,
    pub treatment_status: Option<TreatmentStatus>,
    pub payment_modality: Option<String>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub session_value: Option<Option<f64>>,
    pub financial_status: Option<FinancialStatus>,
    pub anamnesis_link: Option<String>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub quick_context: Option<Option<String>>,
    /// When present, replaces the full session set (no partial diffing).
    pub sessions: Option<Vec<SessionInput>>,
}

pub async fn update_patient(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(patient_id): Path<Uuid>,
    Json(req): Json<UpdatePatientRequest>,
) -> Result<Json<Patient>, ApiError> {
    let existing: PatientRow = sqlx::query_as::<_, PatientRow>(&format!(
        "SELECT {PATIENT_COLUMNS} FROM patient WHERE patient_id = $1"
    ))
    .bind(patient_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(ApiError::patient_not_found)?;

    let name = match req.name.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => existing.name.clone(),
    };
    let phone = match req.phone.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => existing.phone.clone(),
    };

    let email: Option<String> = match req.email {
        None => existing.email.clone(),
        Some(None) => None,
        Some(Some(e)) => {
            let t = e.trim();
            if t.is_empty() { None } else { Some(t.to_string()) }
        }
    };

    // The city token inside quick_context is regenerated on every write so
    // the two never diverge.
    let quick_context_input: Option<String> = match req.quick_context {
        None => existing.quick_context.clone(),
        Some(None) => None,
        Some(Some(q)) => Some(q),
    };
    let city: Option<String> = match req.city {
        None => quick_context_input
            .as_deref()
            .and_then(quick_context::extract_city),
        Some(None) => None,
        Some(Some(c)) => {
            let t = c.trim();
            if t.is_empty() { None } else { Some(t.to_string()) }
        }
    };
    let quick_context =
        quick_context::sync_city(quick_context_input.as_deref(), city.as_deref());

    let session_value: Option<f64> = match req.session_value {
        None => existing.session_value,
        Some(None) => None,
        Some(Some(v)) => {
            if v < 0.0 {
                return Err(ApiError::BadRequest(
                    "VALIDATION_ERROR",
                    "session_value must be non-negative".into(),
                ));
            }
            Some(v)
        }
    };

    let birth_date = req.birth_date.or(existing.birth_date);
    let lead_source = req.lead_source.unwrap_or(existing.lead_source);
    let scheduled_appointment = req
        .scheduled_appointment
        .unwrap_or(existing.scheduled_appointment);
    let non_conversion_reason = req.non_conversion_reason.or(existing.non_conversion_reason);
    let main_complaint = req.main_complaint.or(existing.main_complaint);
    let diagnosis = req.diagnosis.or(existing.diagnosis);
    let treatment_objective = req.treatment_objective.or(existing.treatment_objective);
    let suggested_sessions = req.suggested_sessions.or(existing.suggested_sessions);
    let treatment_status = req
        .treatment_status
        .map(|s| s.as_str().to_string())
        .unwrap_or(existing.treatment_status);
    let payment_modality = req.payment_modality.unwrap_or(existing.payment_modality);
    let financial_status = req
        .financial_status
        .map(|s| s.as_str().to_string())
        .unwrap_or(existing.financial_status);
    let anamnesis_link = req.anamnesis_link.or(existing.anamnesis_link);

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    // Sessions are a full replacement set when provided; the counter then
    // always equals the new set's length.
    let session_rows: Vec<SessionRow>;
    let completed_sessions: i32;
    match &req.sessions {
        Some(sessions) => {
            sqlx::query("DELETE FROM session WHERE patient_id = $1")
                .bind(patient_id)
                .execute(&mut *tx)
                .await
                .map_err(ApiError::db)?;
            session_rows = insert_sessions(&mut tx, patient_id, sessions).await?;
            completed_sessions = session_rows.len() as i32;
        }
        None => {
            session_rows = sqlx::query_as::<_, SessionRow>(
                r#"
                SELECT session_id, patient_id, date, notes, evolution, paid
                FROM session
                WHERE patient_id = $1
                ORDER BY date DESC
                "#,
            )
            .bind(patient_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(ApiError::db)?;
            completed_sessions = if session_rows.is_empty() {
                req.completed_sessions
                    .unwrap_or(existing.completed_sessions)
                    .max(0)
            } else {
                session_rows.len() as i32
            };
        }
    }

    let updated: PatientRow = sqlx::query_as::<_, PatientRow>(&format!(
        r#"
        UPDATE patient
        SET name = $1,
            phone = $2,
            email = $3,
            birth_date = $4,
            lead_source = $5,
            scheduled_appointment = $6,
            non_conversion_reason = $7,
            main_complaint = $8,
            diagnosis = $9,
            treatment_objective = $10,
            suggested_sessions = $11,
            completed_sessions = $12,
            treatment_status = $13,
            payment_modality = $14,
            session_value = $15,
            financial_status = $16,
            anamnesis_link = $17,
            quick_context = $18,
            updated_at = now()
        WHERE patient_id = $19
        RETURNING {PATIENT_COLUMNS}
        "#
    ))
    .bind(&name)
    .bind(&phone)
    .bind(email.as_deref())
    .bind(birth_date)
    .bind(&lead_source)
    .bind(scheduled_appointment)
    .bind(non_conversion_reason.as_deref())
    .bind(main_complaint.as_deref())
    .bind(diagnosis.as_deref())
    .bind(treatment_objective.as_deref())
    .bind(suggested_sessions)
    .bind(completed_sessions)
    .bind(&treatment_status)
    .bind(&payment_modality)
    .bind(session_value)
    .bind(&financial_status)
    .bind(anamnesis_link.as_deref())
    .bind(quick_context.as_deref())
    .bind(patient_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    tx.commit().await.map_err(ApiError::db)?;

    Ok(Json(Patient::from_rows(updated, session_rows)))
}

pub async fn delete_patient(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(patient_id): Path<Uuid>,
) -> Result<Json<OkResponse>, ApiError> {
    // Sessions go with the patient (FK cascade).
    let res = sqlx::query("DELETE FROM patient WHERE patient_id = $1")
        .bind(patient_id)
        .execute(&state.db)
        .await
        .map_err(ApiError::db)?;

    if res.rows_affected() == 0 {
        return Err(ApiError::patient_not_found());
    }

    Ok(Json(OkResponse {
        data: OkData { ok: true },
    }))
}
