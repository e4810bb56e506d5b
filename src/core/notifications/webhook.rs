use super::{JobEvent, NotificationChannel};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;

/// POSTs each event as JSON to a fixed URL.
pub struct WebhookNotifier {
    webhook_url: String,
    cluster_name: Option<String>,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(webhook_url: String, cluster_name: Option<String>) -> Self {
        Self {
            webhook_url,
            cluster_name,
            client: reqwest::Client::new(),
        }
    }

    fn payload(&self, event: &JobEvent) -> serde_json::Value {
        json!({
            "cluster": self.cluster_name,
            "job": event,
        })
    }
}

#[async_trait]
impl NotificationChannel for WebhookNotifier {
    async fn notify(&self, event: JobEvent) -> Result<()> {
        self.client
            .post(&self.webhook_url)
            .json(&self.payload(&event))
            .send()
            .await
            .context("Failed to send webhook notification")?
            .error_for_status()
            .context("Webhook rejected notification")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::Target;

    #[test]
    fn payload_wraps_event_with_cluster() {
        let notifier = WebhookNotifier::new("http://localhost/hook".into(), Some("prod".into()));
        let event = JobEvent::Completed {
            job_id: "0190".into(),
            target: Target::new("iotdb", "datanode-0", "iotdb-datanode"),
            archive_name: "a.tar.gz".into(),
            location: Some("https://bucket.example.com/a.tar.gz".into()),
            duration_secs: 2.0,
        };
        let payload = notifier.payload(&event);
        assert_eq!(payload["cluster"], "prod");
        assert_eq!(payload["job"]["event"], "completed");
        assert_eq!(payload["job"]["target"]["pod"], "datanode-0");
    }
}
