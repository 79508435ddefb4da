//! Throttled batch dispatch of personalized WhatsApp messages.
//!
//! Recipients are processed strictly in selection order, one request at a
//! time. Sequential sends are a deliberate throughput limiter: parallel
//! fan-out is exactly what gets a sending account flagged for abuse. For
//! the same reason the pacing knobs have hard floors that misconfigured
//! values are clamped to before the first send.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::csv_io::normalize_key;
use crate::gateway::MessageGateway;
use crate::models::{Patient, TreatmentStatus};
use crate::notify::{Notify, Severity};
use crate::phone;

pub const MIN_MESSAGE_DELAY_MS: u64 = 1_000;
pub const MIN_BATCH_SIZE: usize = 5;
pub const MIN_BATCH_PAUSE_MS: u64 = 10_000;

/// Pacing knobs for a dispatch run. Values below the documented floors are
/// clamped, even when the user asks for less.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct Pacing {
    pub message_delay_ms: u64,
    pub batch_size: usize,
    pub batch_pause_ms: u64,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            message_delay_ms: 3_000,
            batch_size: 20,
            batch_pause_ms: 60_000,
        }
    }
}

impl Pacing {
    pub fn clamped(self) -> Self {
        Self {
            message_delay_ms: self.message_delay_ms.max(MIN_MESSAGE_DELAY_MS),
            batch_size: self.batch_size.max(MIN_BATCH_SIZE),
            batch_pause_ms: self.batch_pause_ms.max(MIN_BATCH_PAUSE_MS),
        }
    }
}

/* -------------------------
   Recipient selection
--------------------------*/

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub name: String,
    pub number: String,
}

/// Filter by funnel segment (status × city) and keep only patients whose
/// phone normalizes to a dialable number. Running this twice over the same
/// patients yields the same recipients in the same order.
pub fn select_recipients(
    patients: &[Patient],
    status: Option<TreatmentStatus>,
    city: Option<&str>,
) -> Vec<Recipient> {
    let city_key = city.map(normalize_key).filter(|k| !k.is_empty());

    patients
        .iter()
        .filter(|p| status.is_none_or(|s| p.treatment_status == s))
        .filter(|p| match &city_key {
            None => true,
            Some(key) => p
                .city
                .as_deref()
                .is_some_and(|c| normalize_key(c) == *key),
        })
        .filter_map(|p| {
            let number = phone::normalize(&p.phone)?;
            Some(Recipient {
                name: p.name.clone(),
                number,
            })
        })
        .collect()
}

/* -------------------------
   Templating
--------------------------*/

fn name_placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\{\{\s*(?:nome|name)\s*\}\}").unwrap())
}

/// Replace every name placeholder with the recipient's name. No other
/// placeholders are supported.
pub fn render_message(template: &str, name: &str) -> String {
    name_placeholder()
        .replace_all(template, regex::NoExpand(name))
        .into_owned()
}

/* -------------------------
   Run state
--------------------------*/

#[derive(Debug, Clone, Serialize)]
pub struct LastError {
    pub number: String,
    pub detail: String,
}

/// Shared between the running dispatch task and the status endpoint.
/// Counters are updated after every processed recipient so observers see
/// live progress.
#[derive(Default)]
pub struct BroadcastState {
    running: AtomicBool,
    cancel: AtomicBool,
    total: AtomicUsize,
    sent: AtomicUsize,
    errored: AtomicUsize,
    last_error: Mutex<Option<LastError>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BroadcastSnapshot {
    pub running: bool,
    pub cancel_requested: bool,
    pub total: usize,
    pub sent: usize,
    pub errored: usize,
    pub last_error: Option<LastError>,
}

impl BroadcastState {
    /// Claim the dispatcher for a run. Fails when a run is already active.
    pub fn try_begin(&self, total: usize) -> bool {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.cancel.store(false, Ordering::SeqCst);
        self.total.store(total, Ordering::SeqCst);
        self.sent.store(0, Ordering::SeqCst);
        self.errored.store(0, Ordering::SeqCst);
        *self.last_error.lock().unwrap() = None;
        true
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn record_success(&self) {
        self.sent.fetch_add(1, Ordering::SeqCst);
    }

    fn record_failure(&self, number: &str, detail: String) {
        self.errored.fetch_add(1, Ordering::SeqCst);
        *self.last_error.lock().unwrap() = Some(LastError {
            number: number.to_string(),
            detail,
        });
    }

    fn finish(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> BroadcastSnapshot {
        BroadcastSnapshot {
            running: self.running.load(Ordering::SeqCst),
            cancel_requested: self.cancel.load(Ordering::SeqCst),
            total: self.total.load(Ordering::SeqCst),
            sent: self.sent.load(Ordering::SeqCst),
            errored: self.errored.load(Ordering::SeqCst),
            last_error: self.last_error.lock().unwrap().clone(),
        }
    }
}

/* -------------------------
   Dispatch loop
--------------------------*/

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub sent: usize,
    pub errored: usize,
    pub cancelled: bool,
}

/// Run one broadcast to completion. Expects `state.try_begin` to have
/// claimed the run already. Failures are counted and logged, never fatal;
/// there is no retry within a run. Cancellation is checked once per
/// iteration, between sends.
pub async fn run<G: MessageGateway + ?Sized>(
    gateway: &G,
    recipients: &[Recipient],
    template: &str,
    pacing: Pacing,
    state: &BroadcastState,
    notifier: &dyn Notify,
) -> RunSummary {
    let pacing = pacing.clamped();
    let total = recipients.len();
    let mut cancelled = false;

    for (index, recipient) in recipients.iter().enumerate() {
        if state.cancel_requested() {
            cancelled = true;
            break;
        }

        let text = render_message(template, &recipient.name);
        match gateway.send_text(&recipient.number, &text).await {
            Ok(()) => state.record_success(),
            Err(e) => {
                tracing::warn!(number = %recipient.number, "send failed: {e}");
                state.record_failure(&recipient.number, e.to_string());
            }
        }

        let processed = index + 1;
        if processed < total {
            let wait = if processed % pacing.batch_size == 0 {
                pacing.batch_pause_ms
            } else {
                pacing.message_delay_ms
            };
            tokio::time::sleep(Duration::from_millis(wait)).await;
        }
    }

    let snapshot = state.snapshot();
    let summary = RunSummary {
        sent: snapshot.sent,
        errored: snapshot.errored,
        cancelled,
    };
    state.finish();

    let description = if cancelled {
        format!(
            "cancelled after {} of {} recipients ({} sent, {} errors)",
            summary.sent + summary.errored,
            total,
            summary.sent,
            summary.errored
        )
    } else {
        format!("{} sent, {} errors", summary.sent, summary.errored)
    };
    let severity = if summary.errored > 0 {
        Severity::Error
    } else {
        Severity::Info
    };
    notifier.notify("Broadcast finished", &description, severity);

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayError;
    use crate::models::FinancialStatus;
    use crate::notify::test_support::CapturingNotifier;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use uuid::Uuid;

    fn patient(name: &str, phone: &str, status: TreatmentStatus, city: Option<&str>) -> Patient {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        Patient {
            id: Uuid::new_v4(),
            name: name.to_string(),
            phone: phone.to_string(),
            email: None,
            birth_date: None,
            city: city.map(str::to_string),
            lead_source: "Outros".to_string(),
            scheduled_appointment: false,
            non_conversion_reason: None,
            main_complaint: None,
            diagnosis: None,
            treatment_objective: None,
            suggested_sessions: None,
            completed_sessions: 0,
            treatment_status: status,
            payment_modality: "Particular".to_string(),
            session_value: None,
            financial_status: FinancialStatus::Pending,
            anamnesis_link: None,
            quick_context: None,
            sessions: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    /// Scripted gateway: one planned result per call, recording each call.
    struct ScriptedGateway {
        // true = success, false = rejected
        script: Vec<bool>,
        calls: Mutex<Vec<(String, String)>>,
        state: Option<Arc<BroadcastState>>,
        cancel_after: Option<usize>,
    }

    impl ScriptedGateway {
        fn new(script: Vec<bool>) -> Self {
            Self {
                script,
                calls: Mutex::new(Vec::new()),
                state: None,
                cancel_after: None,
            }
        }
    }

    #[async_trait]
    impl MessageGateway for ScriptedGateway {
        async fn send_text(&self, number: &str, text: &str) -> Result<(), GatewayError> {
            let call_index = {
                let mut calls = self.calls.lock().unwrap();
                calls.push((number.to_string(), text.to_string()));
                calls.len() - 1
            };

            if let Some(state) = &self.state {
                // Counters must already reflect every prior iteration.
                let snap = state.snapshot();
                assert_eq!(snap.sent + snap.errored, call_index);
                if self.cancel_after == Some(call_index) {
                    state.request_cancel();
                }
            }

            if self.script.get(call_index).copied().unwrap_or(true) {
                Ok(())
            } else {
                Err(GatewayError::Rejected {
                    status: 500,
                    body: "instance unavailable".to_string(),
                })
            }
        }
    }

    fn recipients(n: usize) -> Vec<Recipient> {
        (0..n)
            .map(|i| Recipient {
                name: format!("Paciente {i}"),
                number: format!("55119876543{i:02}"),
            })
            .collect()
    }

    #[test]
    fn pacing_floors_clamp_zero_config() {
        let pacing = Pacing {
            message_delay_ms: 0,
            batch_size: 0,
            batch_pause_ms: 0,
        }
        .clamped();
        assert_eq!(pacing.message_delay_ms, MIN_MESSAGE_DELAY_MS);
        assert_eq!(pacing.batch_size, MIN_BATCH_SIZE);
        assert_eq!(pacing.batch_pause_ms, MIN_BATCH_PAUSE_MS);

        // Values above the floors pass through untouched.
        let pacing = Pacing::default().clamped();
        assert_eq!(pacing.message_delay_ms, 3_000);
        assert_eq!(pacing.batch_size, 20);
        assert_eq!(pacing.batch_pause_ms, 60_000);
    }

    #[test]
    fn placeholder_is_case_insensitive_with_optional_whitespace() {
        assert_eq!(
            render_message("Olá {{nome}}, tudo bem?", "Ana"),
            "Olá Ana, tudo bem?"
        );
        assert_eq!(
            render_message("{{ NOME }} e {{Name}} e {{nome}}", "Ana"),
            "Ana e Ana e Ana"
        );
        assert_eq!(render_message("sem placeholder", "Ana"), "sem placeholder");
    }

    #[test]
    fn selection_filters_segment_and_normalizes_phones() {
        let patients = vec![
            patient("Ana", "11987654321", TreatmentStatus::InTreatment, Some("Santos")),
            patient("Bia", "21912345678", TreatmentStatus::New, Some("Santos")),
            patient("Caio", "11911112222", TreatmentStatus::InTreatment, Some("São Paulo")),
            // Undialable phone: excluded regardless of segment.
            patient("Duda", "1234", TreatmentStatus::InTreatment, Some("Santos")),
        ];

        let all = select_recipients(&patients, None, None);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].number, "5511987654321");

        let in_treatment = select_recipients(&patients, Some(TreatmentStatus::InTreatment), None);
        assert_eq!(in_treatment.len(), 2);

        let santos =
            select_recipients(&patients, Some(TreatmentStatus::InTreatment), Some("santos"));
        assert_eq!(santos.len(), 1);
        assert_eq!(santos[0].name, "Ana");

        // City match tolerates accents.
        let sp = select_recipients(&patients, None, Some("sao paulo"));
        assert_eq!(sp.len(), 1);
        assert_eq!(sp[0].name, "Caio");
    }

    #[tokio::test(start_paused = true)]
    async fn counts_failures_without_halting() {
        let state = Arc::new(BroadcastState::default());
        let mut gateway = ScriptedGateway::new(vec![true, false, true, false, true]);
        gateway.state = Some(state.clone());
        let notifier = CapturingNotifier::default();

        assert!(state.try_begin(5));
        let summary = run(
            &gateway,
            &recipients(5),
            "Olá {{nome}}",
            Pacing::default(),
            &state,
            &notifier,
        )
        .await;

        assert_eq!(summary, RunSummary { sent: 3, errored: 2, cancelled: false });
        assert!(!state.is_running());

        let snap = state.snapshot();
        assert_eq!(snap.sent, 3);
        assert_eq!(snap.errored, 2);
        let last = snap.last_error.unwrap();
        assert_eq!(last.number, "5511987654303");
        assert!(last.detail.contains("instance unavailable"));

        // Personalization happened per recipient.
        let calls = gateway.calls.lock().unwrap();
        assert_eq!(calls.len(), 5);
        assert_eq!(calls[0].1, "Olá Paciente 0");
        assert_eq!(calls[4].1, "Olá Paciente 4");

        let messages = notifier.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].1, "3 sent, 2 errors");
        assert_eq!(messages[0].2, Severity::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_pause_replaces_delay_at_batch_boundaries() {
        let state = BroadcastState::default();
        let gateway = ScriptedGateway::new(vec![true; 7]);
        let notifier = CapturingNotifier::default();
        let pacing = Pacing {
            message_delay_ms: 1_000,
            batch_size: 5,
            batch_pause_ms: 10_000,
        };

        assert!(state.try_begin(7));
        let started = tokio::time::Instant::now();
        run(&gateway, &recipients(7), "oi", pacing, &state, &notifier).await;

        // Waits after recipients 1-4 (short), 5 (batch pause), 6 (short);
        // none after the last.
        assert_eq!(
            started.elapsed(),
            Duration::from_millis(4 * 1_000 + 10_000 + 1_000)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn no_pause_after_final_recipient() {
        let state = BroadcastState::default();
        let gateway = ScriptedGateway::new(vec![true]);
        let notifier = CapturingNotifier::default();

        assert!(state.try_begin(1));
        let started = tokio::time::Instant::now();
        run(
            &gateway,
            &recipients(1),
            "oi",
            Pacing::default(),
            &state,
            &notifier,
        )
        .await;
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_between_sends() {
        let state = Arc::new(BroadcastState::default());
        let mut gateway = ScriptedGateway::new(vec![true; 4]);
        gateway.state = Some(state.clone());
        gateway.cancel_after = Some(0);
        let notifier = CapturingNotifier::default();

        assert!(state.try_begin(4));
        let summary = run(
            &gateway,
            &recipients(4),
            "oi",
            Pacing::default(),
            &state,
            &notifier,
        )
        .await;

        assert_eq!(summary, RunSummary { sent: 1, errored: 0, cancelled: true });
        assert_eq!(gateway.calls.lock().unwrap().len(), 1);

        let messages = notifier.messages.lock().unwrap();
        assert!(messages[0].1.contains("cancelled after 1 of 4"));
    }

    #[tokio::test(start_paused = true)]
    async fn second_run_cannot_start_while_active() {
        let state = BroadcastState::default();
        assert!(state.try_begin(3));
        assert!(!state.try_begin(3));

        let gateway = ScriptedGateway::new(vec![true; 3]);
        let notifier = CapturingNotifier::default();
        run(
            &gateway,
            &recipients(3),
            "oi",
            Pacing::default(),
            &state,
            &notifier,
        )
        .await;

        // Once finished the dispatcher can be claimed again.
        assert!(state.try_begin(1));
    }
}
