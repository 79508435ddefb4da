//! Outbound WhatsApp messaging through an Evolution API instance.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("gateway returned {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Seam between the dispatch loop and the wire, so tests can script
/// successes and failures without a network.
#[async_trait]
pub trait MessageGateway: Send + Sync {
    async fn send_text(&self, number: &str, text: &str) -> Result<(), GatewayError>;
}

/// Evolution API connection data, kept in the per-operator settings store —
/// never baked into the binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionSettings {
    pub base_url: String,
    pub api_key: String,
    pub instance: String,
}

impl EvolutionSettings {
    pub fn is_complete(&self) -> bool {
        !self.base_url.trim().is_empty()
            && !self.api_key.trim().is_empty()
            && !self.instance.trim().is_empty()
    }
}

#[derive(Serialize)]
struct SendTextBody<'a> {
    number: &'a str,
    text: &'a str,
}

pub struct EvolutionGateway {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl EvolutionGateway {
    pub fn new(settings: &EvolutionSettings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        let endpoint = format!(
            "{}/message/sendText/{}",
            settings.base_url.trim().trim_end_matches('/'),
            settings.instance.trim()
        );

        Self {
            client,
            endpoint,
            api_key: settings.api_key.trim().to_string(),
        }
    }
}

#[async_trait]
impl MessageGateway for EvolutionGateway {
    async fn send_text(&self, number: &str, text: &str) -> Result<(), GatewayError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("apikey", &self.api_key)
            .json(&SendTextBody { number, text })
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        // Keep the failure body for diagnostics; the loop logs it.
        let body = response.text().await.unwrap_or_default();
        Err(GatewayError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_tolerates_trailing_slash_and_padding() {
        let gw = EvolutionGateway::new(&EvolutionSettings {
            base_url: "https://evo.example.com/".to_string(),
            api_key: " key ".to_string(),
            instance: "clinica".to_string(),
        });
        assert_eq!(gw.endpoint, "https://evo.example.com/message/sendText/clinica");
        assert_eq!(gw.api_key, "key");
    }

    #[test]
    fn settings_completeness() {
        let mut s = EvolutionSettings {
            base_url: "https://evo.example.com".to_string(),
            api_key: "key".to_string(),
            instance: "clinica".to_string(),
        };
        assert!(s.is_complete());
        s.instance = "  ".to_string();
        assert!(!s.is_complete());
    }
}
