mod webhook;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

use crate::config::NotificationConfig;
use crate::core::models::{JobReport, JobState, Target};

pub use webhook::WebhookNotifier;

/// Terminal job outcomes handed to notification channels.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Completed {
        job_id: String,
        target: Target,
        archive_name: String,
        location: Option<String>,
        duration_secs: f64,
    },
    Failed {
        job_id: String,
        target: Target,
        archive_name: String,
        step: String,
        error: String,
    },
}

impl JobEvent {
    /// `None` while the report is not terminal.
    pub fn from_report(report: &JobReport) -> Option<Self> {
        match &report.state {
            JobState::Succeeded => Some(Self::Completed {
                job_id: report.job_id.clone(),
                target: report.target.clone(),
                archive_name: report.archive_name.clone(),
                location: report.location.clone(),
                duration_secs: report.duration.as_secs_f64(),
            }),
            JobState::Failed { step, error } => Some(Self::Failed {
                job_id: report.job_id.clone(),
                target: report.target.clone(),
                archive_name: report.archive_name.clone(),
                step: step.clone(),
                error: error.to_string(),
            }),
            JobState::Pending | JobState::Running { .. } => None,
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            Self::Completed { job_id, .. } | Self::Failed { job_id, .. } => job_id,
        }
    }
}

/// Trait for notification channel implementations
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn notify(&self, event: JobEvent) -> Result<()>;
}

/// Factory function to create a notifier based on config
pub fn create_notifier(
    config: &NotificationConfig,
    cluster_name: Option<&str>,
) -> Option<Arc<dyn NotificationChannel>> {
    let webhook = config.webhook_url.as_ref()?;
    if webhook.is_empty() {
        return None;
    }
    Some(Arc::new(WebhookNotifier::new(
        webhook.clone(),
        cluster_name.map(str::to_string),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::StepError;
    use chrono::Utc;
    use std::time::Duration;

    fn report(state: JobState) -> JobReport {
        JobReport {
            job_id: "0190".into(),
            target: Target::new("iotdb", "datanode-0", "iotdb-datanode"),
            archive_name: "datanode-0_20240101000000.tar.gz".into(),
            state,
            steps: Vec::new(),
            started_at: Utc::now(),
            duration: Duration::from_millis(1500),
            location: Some("s3://bucket/datanode-0_20240101000000.tar.gz".into()),
            last_transfer: None,
        }
    }

    #[test]
    fn events_only_for_terminal_reports() {
        assert!(JobEvent::from_report(&report(JobState::Pending)).is_none());

        let done = JobEvent::from_report(&report(JobState::Succeeded)).unwrap();
        assert!(matches!(done, JobEvent::Completed { duration_secs, .. } if duration_secs == 1.5));

        let failed = JobEvent::from_report(&report(JobState::Failed {
            step: "compress".into(),
            error: StepError {
                kind: "command".into(),
                message: "tar exited 2".into(),
            },
        }))
        .unwrap();
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["event"], "failed");
        assert_eq!(json["step"], "compress");
    }

    #[test]
    fn no_webhook_no_notifier() {
        assert!(create_notifier(&NotificationConfig::default(), None).is_none());
        let empty = NotificationConfig {
            webhook_url: Some(String::new()),
        };
        assert!(create_notifier(&empty, None).is_none());
    }
}
