//! Importance alerts and periodic digests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::warehouse::{run_blocking, Warehouse};

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook returned {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationEvent {
    ImportantEmail {
        user_id: String,
        email_id: Uuid,
        from_address: String,
        subject: String,
        reason: String,
    },
    Digest {
        user_id: String,
        new_emails: i64,
        since: DateTime<Utc>,
    },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), NotifyError>;
}

/// Emits notifications as structured log events.
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        match event {
            NotificationEvent::ImportantEmail {
                user_id,
                email_id,
                from_address,
                subject,
                reason,
            } => info!(
                user_id = %user_id,
                email_id = %email_id,
                from = %from_address,
                "important email: {} ({})",
                subject,
                reason
            ),
            NotificationEvent::Digest {
                user_id,
                new_emails,
                since,
            } => info!(
                user_id = %user_id,
                "{} new email(s) since {}",
                new_emails,
                since.to_rfc3339()
            ),
        }
        Ok(())
    }
}

/// POSTs each event as JSON to a fixed URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        let response = self.client.post(&self.url).json(event).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Emits one digest per user that received mail since the previous tick.
pub struct DigestTimer {
    warehouse: Arc<dyn Warehouse>,
    notifier: Arc<dyn Notifier>,
    last_check: Mutex<DateTime<Utc>>,
}

impl DigestTimer {
    pub fn new(warehouse: Arc<dyn Warehouse>, notifier: Arc<dyn Notifier>) -> Self {
        Self::starting_at(warehouse, notifier, Utc::now())
    }

    pub fn starting_at(
        warehouse: Arc<dyn Warehouse>,
        notifier: Arc<dyn Notifier>,
        last_check: DateTime<Utc>,
    ) -> Self {
        Self {
            warehouse,
            notifier,
            last_check: Mutex::new(last_check),
        }
    }

    /// Returns the number of digest events sent. Each tick counts emails
    /// stored in `(last_check, now]`, so a row is reported at most once.
    pub async fn tick(&self) -> usize {
        let now = Utc::now();
        let since = match self.last_check.lock() {
            Ok(last_check) => *last_check,
            Err(_) => return 0,
        };

        let counts = match run_blocking(&self.warehouse, move |w| {
            w.new_email_counts_between(since, now)
        })
        .await
        {
            Ok(counts) => counts,
            Err(err) => {
                warn!("digest query failed: {}", err);
                return 0;
            }
        };
        if let Ok(mut last_check) = self.last_check.lock() {
            *last_check = now;
        }

        let mut sent = 0;
        for (user_id, new_emails) in counts.into_iter().filter(|(_, count)| *count > 0) {
            let event = NotificationEvent::Digest {
                user_id,
                new_emails,
                since,
            };
            match self.notifier.notify(&event).await {
                Ok(()) => sent += 1,
                Err(err) => warn!("failed to send digest: {}", err),
            }
        }
        sent
    }

    /// Ticks every `interval` for the life of the process.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::EmailRecord;
    use crate::warehouse::MemoryWarehouse;
    use mockito::{Matcher, Server};

    #[derive(Default)]
    struct RecordingNotifier {
        events: Mutex<Vec<NotificationEvent>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
            self.events.lock().expect("lock").push(event.clone());
            Ok(())
        }
    }

    fn email(user_id: &str) -> EmailRecord {
        EmailRecord {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            from_address: "a@example.com".to_string(),
            subject: "s".to_string(),
            body_text: "b".to_string(),
            timestamp: Utc::now(),
            provider_message_id: None,
            thread_id: None,
            references: Vec::new(),
            body_blob_uri: "memory://body/x".to_string(),
            attachment_blob_uris: Vec::new(),
        }
    }

    #[tokio::test]
    async fn digest_reports_new_mail_once() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let timer = DigestTimer::starting_at(
            warehouse.clone(),
            notifier.clone(),
            Utc::now() - chrono::Duration::minutes(1),
        );
        for user in ["u1", "u1", "u2"] {
            warehouse.insert_email(&email(user)).expect("insert");
        }

        assert_eq!(timer.tick().await, 2);
        assert_eq!(timer.tick().await, 0);

        let events = notifier.events.lock().expect("lock").clone();
        assert!(matches!(
            &events[0],
            NotificationEvent::Digest { user_id, new_emails: 2, .. } if user_id == "u1"
        ));
    }

    #[tokio::test]
    async fn digest_leaves_mail_stored_after_the_cutoff_for_the_next_tick() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let start = Utc::now() - chrono::Duration::minutes(1);
        let timer = DigestTimer::starting_at(warehouse.clone(), notifier.clone(), start);
        warehouse.insert_email(&email("u1")).expect("insert");
        warehouse
            .insert_email_created_at(&email("u2"), Utc::now() + chrono::Duration::hours(1))
            .expect("insert late row");

        assert_eq!(timer.tick().await, 1);
        let events = notifier.events.lock().expect("lock").clone();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            NotificationEvent::Digest { user_id, new_emails: 1, .. } if user_id == "u1"
        ));

        let cutoff = *timer.last_check.lock().expect("lock");
        let counts = warehouse
            .new_email_counts_between(cutoff, Utc::now() + chrono::Duration::hours(2))
            .expect("counts");
        assert_eq!(counts, vec![("u2".to_string(), 1)]);
    }

    #[tokio::test]
    async fn webhook_posts_event_json() -> Result<(), Box<dyn std::error::Error>> {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "kind": "important_email",
                "user_id": "u1",
                "reason": "urgent keyword \"asap\""
            })))
            .with_status(204)
            .create_async()
            .await;

        let notifier = WebhookNotifier::new(&format!("{}/hook", server.url()))?;
        notifier
            .notify(&NotificationEvent::ImportantEmail {
                user_id: "u1".to_string(),
                email_id: Uuid::new_v4(),
                from_address: "boss@example.com".to_string(),
                subject: "Need this asap".to_string(),
                reason: "urgent keyword \"asap\"".to_string(),
            })
            .await?;

        mock.assert_async().await;
        Ok(())
    }

    #[tokio::test]
    async fn webhook_error_status_is_reported() -> Result<(), Box<dyn std::error::Error>> {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/hook")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let notifier = WebhookNotifier::new(&format!("{}/hook", server.url()))?;
        let result = notifier
            .notify(&NotificationEvent::Digest {
                user_id: "u1".to_string(),
                new_emails: 1,
                since: Utc::now(),
            })
            .await;
        assert!(matches!(result, Err(NotifyError::Status { status: 500, .. })));
        Ok(())
    }
}
