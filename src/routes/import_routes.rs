// src/routes/import_routes.rs
//
// CSV import/export endpoints. Import parses the uploaded file with the
// shared csv_io pipeline and upserts row by row, awaiting each write —
// memory stays bounded, but there is deliberately no batch atomicity:
// rows already persisted stay persisted if a later row fails.

use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    csv_io::{self, PatientDraft},
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{AppState, FinancialStatus, Patient, PatientRow, TreatmentStatus},
    notify::{Notify, Severity, TracingNotifier},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/patients/import", post(import_patients))
        .route("/patients/export", get(export_patients))
}

#[derive(Debug, Serialize)]
pub struct ImportResponse {
    pub data: ImportData,
}

#[derive(Debug, Default, Serialize)]
pub struct ImportData {
    pub imported: usize,
    pub updated: usize,
    /// Rows dropped by the parser for lacking a name or phone.
    pub skipped: usize,
    /// Rows that parsed but failed to persist.
    pub failed: usize,
}

async fn upsert_draft(state: &AppState, draft: &PatientDraft) -> Result<bool, sqlx::Error> {
    // Upsert keyed on the stored phone string: re-importing the same file
    // updates instead of duplicating.
    let existing: Option<Uuid> =
        sqlx::query_scalar("SELECT patient_id FROM patient WHERE phone = $1 LIMIT 1")
            .bind(&draft.phone)
            .fetch_optional(&state.db)
            .await?;

    match existing {
        Some(patient_id) => {
            sqlx::query(
                r#"
                UPDATE patient
                SET name = $1,
                    email = COALESCE($2, email),
                    birth_date = COALESCE($3, birth_date),
                    lead_source = COALESCE($4, lead_source),
                    scheduled_appointment = $5,
                    main_complaint = COALESCE($6, main_complaint),
                    suggested_sessions = COALESCE($7, suggested_sessions),
                    treatment_status = COALESCE($8, treatment_status),
                    payment_modality = COALESCE($9, payment_modality),
                    session_value = COALESCE($10, session_value),
                    financial_status = COALESCE($11, financial_status),
                    quick_context = COALESCE($12, quick_context),
                    updated_at = now()
                WHERE patient_id = $13
                "#,
            )
            .bind(&draft.name)
            .bind(draft.email.as_deref())
            .bind(draft.birth_date)
            .bind(draft.lead_source.as_deref())
            .bind(draft.scheduled_appointment)
            .bind(draft.main_complaint.as_deref())
            .bind(draft.suggested_sessions)
            .bind(draft.treatment_status.map(|s| s.as_str()))
            .bind(draft.payment_modality.as_deref())
            .bind(draft.session_value)
            .bind(draft.financial_status.map(|s| s.as_str()))
            .bind(draft.quick_context.as_deref())
            .bind(patient_id)
            .execute(&state.db)
            .await?;
            Ok(false)
        }
        None => {
            sqlx::query(
                r#"
                INSERT INTO patient (
                    name, phone, email, birth_date, lead_source,
                    scheduled_appointment, main_complaint, suggested_sessions,
                    treatment_status, payment_modality, session_value,
                    financial_status, quick_context, created_at, updated_at
                )
                VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13, now(), now())
                "#,
            )
            .bind(&draft.name)
            .bind(&draft.phone)
            .bind(draft.email.as_deref())
            .bind(draft.birth_date)
            .bind(draft.lead_source.as_deref().unwrap_or("Outros"))
            .bind(draft.scheduled_appointment)
            .bind(draft.main_complaint.as_deref())
            .bind(draft.suggested_sessions)
            .bind(
                draft
                    .treatment_status
                    .unwrap_or(TreatmentStatus::New)
                    .as_str(),
            )
            .bind(draft.payment_modality.as_deref().unwrap_or("Particular"))
            .bind(draft.session_value)
            .bind(
                draft
                    .financial_status
                    .unwrap_or(FinancialStatus::Pending)
                    .as_str(),
            )
            .bind(draft.quick_context.as_deref())
            .execute(&state.db)
            .await?;
            Ok(true)
        }
    }
}

pub async fn import_patients(
    State(state): State<AppState>,
    _auth: AuthContext,
    body: String,
) -> Result<Json<ImportResponse>, ApiError> {
    let parsed = csv_io::parse_patients(&body);

    if parsed.drafts.is_empty() && parsed.skipped == 0 {
        return Err(ApiError::BadRequest(
            "EMPTY_IMPORT",
            "file has no data rows (header row plus at least one patient expected)".into(),
        ));
    }

    let mut data = ImportData {
        skipped: parsed.skipped,
        ..Default::default()
    };

    for draft in &parsed.drafts {
        match upsert_draft(&state, draft).await {
            Ok(true) => data.imported += 1,
            Ok(false) => data.updated += 1,
            Err(e) => {
                tracing::warn!(name = %draft.name, "import row failed: {e}");
                data.failed += 1;
            }
        }
    }

    let notifier = TracingNotifier;
    notifier.notify(
        "Import finished",
        &format!(
            "{} imported, {} updated, {} skipped, {} failed",
            data.imported, data.updated, data.skipped, data.failed
        ),
        if data.failed > 0 {
            Severity::Error
        } else {
            Severity::Info
        },
    );

    Ok(Json(ImportResponse { data }))
}

pub async fn export_patients(
    State(state): State<AppState>,
    _auth: AuthContext,
) -> Result<impl IntoResponse, ApiError> {
    // Export only reads the narrow column set; sessions are not needed.
    let rows: Vec<PatientRow> = sqlx::query_as::<_, PatientRow>(
        r#"
        SELECT patient_id, name, phone, email, birth_date, lead_source,
               scheduled_appointment, non_conversion_reason, main_complaint,
               diagnosis, treatment_objective, suggested_sessions,
               completed_sessions, treatment_status, payment_modality,
               session_value, financial_status, anamnesis_link, quick_context,
               created_at, updated_at
        FROM patient
        ORDER BY name ASC
        "#,
    )
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    let patients: Vec<Patient> = rows
        .into_iter()
        .map(|row| Patient::from_rows(row, vec![]))
        .collect();

    let csv = csv_io::export_patients(&patients);

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"pacientes.csv\"",
            ),
        ],
        csv,
    ))
}
