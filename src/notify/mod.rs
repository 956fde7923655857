//! Notification hand-off.
//!
//! After a successful sync the core emits an event (watch id, match
//! summary, score) to an external notification collaborator over a
//! webhook. Delivery and formatting beyond this payload are out of
//! scope; failures are logged and never propagate into the pipeline.

use anyhow::Result;
use serde::Serialize;
use tracing::warn;

/// Webhook notification client.
pub struct NotifyClient {
    webhook_url: Option<String>,
    http: reqwest::Client,
    enabled: bool,
}

#[derive(Debug, Serialize)]
struct NotifyEvent<'a> {
    event_id: String,
    event: &'a str,
    watch_id: i64,
    listing: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    score: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    external_ref: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    strategy: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

impl NotifyClient {
    pub fn new(webhook_url: Option<String>, enabled: bool) -> Self {
        Self {
            enabled: enabled && webhook_url.is_some(),
            webhook_url,
            http: reqwest::Client::new(),
        }
    }

    async fn send(&self, event: &NotifyEvent<'_>) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let Some(ref url) = self.webhook_url else {
            return Ok(());
        };

        match self.http.post(url).json(event).send().await {
            Ok(response) => {
                if !response.status().is_success() {
                    warn!(
                        status = %response.status(),
                        event = event.event,
                        "Notification webhook returned non-success status"
                    );
                }
            }
            Err(e) => {
                warn!(error = %e, event = event.event, "Failed to deliver notification");
            }
        }

        Ok(())
    }

    /// Event: a new match was synced into the CRM pipeline.
    pub async fn match_synced(
        &self,
        watch_id: i64,
        listing_summary: &str,
        score: u8,
        external_ref: &str,
        strategy: Option<&str>,
    ) -> Result<()> {
        self.send(&NotifyEvent {
            event_id: uuid::Uuid::new_v4().to_string(),
            event: "match_synced",
            watch_id,
            listing: listing_summary,
            score: Some(score),
            external_ref: Some(external_ref),
            strategy,
            error: None,
        })
        .await
    }

    /// Event: a match exhausted its sync retries and needs attention.
    pub async fn sync_failed(
        &self,
        watch_id: i64,
        listing_summary: &str,
        error: &str,
    ) -> Result<()> {
        self.send(&NotifyEvent {
            event_id: uuid::Uuid::new_v4().to_string(),
            event: "sync_failed",
            watch_id,
            listing: listing_summary,
            score: None,
            external_ref: None,
            strategy: None,
            error: Some(error),
        })
        .await
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}
