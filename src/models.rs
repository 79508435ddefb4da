use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::broadcast::BroadcastState;
use crate::quick_context;

#[derive(Clone)]
pub struct AppState {
    pub db: sqlx::PgPool,
    pub api_key_hash: String,
    pub operator_id: String,
    pub broadcast: Arc<BroadcastState>,
}

/* -------------------------
   Domain enums
--------------------------*/

/// Kanban funnel stage. Wire values match the legacy Portuguese data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreatmentStatus {
    #[serde(rename = "novo")]
    New,
    #[serde(rename = "em_tratamento")]
    InTreatment,
    #[serde(rename = "aguardando_retorno")]
    AwaitingReturn,
    #[serde(rename = "alta_sucesso")]
    DischargedSuccess,
    #[serde(rename = "abandono")]
    Abandoned,
}

impl TreatmentStatus {
    pub const ALL: [TreatmentStatus; 5] = [
        TreatmentStatus::New,
        TreatmentStatus::InTreatment,
        TreatmentStatus::AwaitingReturn,
        TreatmentStatus::DischargedSuccess,
        TreatmentStatus::Abandoned,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TreatmentStatus::New => "novo",
            TreatmentStatus::InTreatment => "em_tratamento",
            TreatmentStatus::AwaitingReturn => "aguardando_retorno",
            TreatmentStatus::DischargedSuccess => "alta_sucesso",
            TreatmentStatus::Abandoned => "abandono",
        }
    }

    /// Human label as it appears on spreadsheet exports.
    pub fn label(self) -> &'static str {
        match self {
            TreatmentStatus::New => "Novo Paciente",
            TreatmentStatus::InTreatment => "Em Tratamento",
            TreatmentStatus::AwaitingReturn => "Aguardando Retorno",
            TreatmentStatus::DischargedSuccess => "Alta (Sucesso)",
            TreatmentStatus::Abandoned => "Abandono",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.as_str() == s)
    }

    /// Tolerant parse for CSV cells: wire value or human label, any case.
    pub fn parse_loose(s: &str) -> Option<Self> {
        let key = crate::csv_io::normalize_key(s);
        if key.is_empty() {
            return None;
        }
        Self::ALL.into_iter().find(|v| {
            crate::csv_io::normalize_key(v.as_str()) == key
                || crate::csv_io::normalize_key(v.label()) == key
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinancialStatus {
    #[serde(rename = "pago")]
    Paid,
    #[serde(rename = "pendente")]
    Pending,
    #[serde(rename = "reembolso")]
    RefundPending,
}

impl FinancialStatus {
    pub const ALL: [FinancialStatus; 3] = [
        FinancialStatus::Paid,
        FinancialStatus::Pending,
        FinancialStatus::RefundPending,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FinancialStatus::Paid => "pago",
            FinancialStatus::Pending => "pendente",
            FinancialStatus::RefundPending => "reembolso",
        }
    }

    /// Human label as it appears on spreadsheet exports.
    pub fn label(self) -> &'static str {
        match self {
            FinancialStatus::Paid => "Pago",
            FinancialStatus::Pending => "Pendente",
            FinancialStatus::RefundPending => "Reembolso a processar",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.as_str() == s)
    }

    pub fn parse_loose(s: &str) -> Option<Self> {
        let key = crate::csv_io::normalize_key(s);
        if key.is_empty() {
            return None;
        }
        Self::ALL.into_iter().find(|v| {
            crate::csv_io::normalize_key(v.as_str()) == key
                || crate::csv_io::normalize_key(v.label()) == key
        })
    }
}

/* -------------------------
   API DTOs
--------------------------*/

#[derive(Debug, Clone, Serialize)]
pub struct Patient {
    pub id: Uuid,
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
    pub birth_date: Option<NaiveDate>,
    /// Derived from the quick_context city token; not a stored column.
    pub city: Option<String>,
    pub lead_source: String,
    pub scheduled_appointment: bool,
    pub non_conversion_reason: Option<String>,
    pub main_complaint: Option<String>,
    pub diagnosis: Option<String>,
    pub treatment_objective: Option<String>,
    pub suggested_sessions: Option<i32>,
    pub completed_sessions: i32,
    pub treatment_status: TreatmentStatus,
    pub payment_modality: String,
    pub session_value: Option<f64>,
    pub financial_status: FinancialStatus,
    pub anamnesis_link: Option<String>,
    pub quick_context: Option<String>,
    pub sessions: Vec<SessionEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    pub id: Uuid,
    pub date: NaiveDate,
    pub notes: Option<String>,
    pub evolution: Option<String>,
    pub paid: bool,
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub data: OkData,
}

#[derive(Debug, Serialize)]
pub struct OkData {
    pub ok: bool,
}

/* -------------------------
   DB Row Models
--------------------------*/

#[derive(Debug, Clone, FromRow)]
pub struct PatientRow {
    pub patient_id: Uuid,
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub lead_source: String,
    pub scheduled_appointment: bool,
    pub non_conversion_reason: Option<String>,
    pub main_complaint: Option<String>,
    pub diagnosis: Option<String>,
    pub treatment_objective: Option<String>,
    pub suggested_sessions: Option<i32>,
    pub completed_sessions: i32,
    pub treatment_status: String,
    pub payment_modality: String,
    pub session_value: Option<f64>,
    pub financial_status: String,
    pub anamnesis_link: Option<String>,
    pub quick_context: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct SessionRow {
    pub session_id: Uuid,
    pub patient_id: Uuid,
    pub date: NaiveDate,
    pub notes: Option<String>,
    pub evolution: Option<String>,
    pub paid: bool,
}

impl Patient {
    /// Assemble the API shape from its two tables. The session count wins
    /// over the stored counter whenever sessions exist.
    pub fn from_rows(row: PatientRow, session_rows: Vec<SessionRow>) -> Self {
        let sessions: Vec<SessionEntry> = session_rows
            .into_iter()
            .map(|s| SessionEntry {
                id: s.session_id,
                date: s.date,
                notes: s.notes,
                evolution: s.evolution,
                paid: s.paid,
            })
            .collect();

        let completed_sessions = if sessions.is_empty() {
            row.completed_sessions.max(0)
        } else {
            sessions.len() as i32
        };

        let city = row
            .quick_context
            .as_deref()
            .and_then(quick_context::extract_city);

        Patient {
            id: row.patient_id,
            name: row.name,
            phone: row.phone,
            email: row.email,
            birth_date: row.birth_date,
            city,
            lead_source: row.lead_source,
            scheduled_appointment: row.scheduled_appointment,
            non_conversion_reason: row.non_conversion_reason,
            main_complaint: row.main_complaint,
            diagnosis: row.diagnosis,
            treatment_objective: row.treatment_objective,
            suggested_sessions: row.suggested_sessions,
            completed_sessions,
            treatment_status: TreatmentStatus::parse(&row.treatment_status)
                .unwrap_or(TreatmentStatus::New),
            payment_modality: row.payment_modality,
            session_value: row.session_value,
            financial_status: FinancialStatus::parse(&row.financial_status)
                .unwrap_or(FinancialStatus::Pending),
            anamnesis_link: row.anamnesis_link,
            quick_context: row.quick_context,
            sessions,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}
