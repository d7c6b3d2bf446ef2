//! Delivery layer: text first, then attachments one at a time.
//!
//! Each payload is retried with linearly increasing backoff. A failed
//! attachment is reported and recorded but never aborts the rest of the
//! response. Every outcome becomes an outbound message record.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::channels::{Attachment, ChannelGateway, SendReceipt};
use crate::config::DeliveryConfig;
use crate::error::ChannelError;
use crate::identity::StaffRole;
use crate::store::{Direction, MessageStatus, NewMessage, SenderKind, Storage};

/// Who the outbound records are attributed to.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub tenant_id: String,
    pub conversation_id: String,
    /// The tenant's own channel account.
    pub from: String,
    pub destination: String,
    pub sender_kind: SenderKind,
    pub intent: Option<String>,
    /// Set when replying inside a staff conversation.
    pub recipient_level: Option<StaffRole>,
}

/// Outcome of one attachment.
#[derive(Debug, Clone, Serialize)]
pub struct AttachmentResult {
    /// Position in the original attachment list.
    pub index: usize,
    pub success: bool,
    pub message_id: Option<String>,
    pub error: Option<String>,
    pub attempts: u32,
}

/// Outcome of a whole response.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeliveryReport {
    pub text_sent: bool,
    pub text_message_id: Option<String>,
    pub text_error: Option<String>,
    pub attachments: Vec<AttachmentResult>,
}

impl DeliveryReport {
    pub fn delivered_attachments(&self) -> usize {
        self.attachments.iter().filter(|a| a.success).count()
    }

    pub fn failed_attachments(&self) -> usize {
        self.attachments.len() - self.delivered_attachments()
    }

    pub fn is_complete(&self) -> bool {
        self.text_error.is_none() && self.failed_attachments() == 0
    }
}

pub struct DeliveryLayer {
    gateway: Arc<dyn ChannelGateway>,
    store: Arc<dyn Storage>,
    config: DeliveryConfig,
}

impl DeliveryLayer {
    pub fn new(
        gateway: Arc<dyn ChannelGateway>,
        store: Arc<dyn Storage>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            gateway,
            store,
            config,
        }
    }

    /// Send `text` (when non-empty) and then each attachment in order.
    pub async fn send(
        &self,
        envelope: &Envelope,
        text: &str,
        attachments: &[Attachment],
    ) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        if !text.trim().is_empty() {
            let (result, attempts) = self
                .with_retry(|| self.gateway.send_text(&envelope.destination, text))
                .await;
            match result {
                Ok(receipt) => {
                    report.text_sent = true;
                    report.text_message_id = receipt.message_id.clone();
                    self.persist(envelope, text, None, Ok(&receipt)).await;
                }
                Err(e) => {
                    warn!(
                        destination = %envelope.destination,
                        attempts,
                        error = %e,
                        "Text delivery failed"
                    );
                    report.text_error = Some(e.to_string());
                    self.persist(envelope, text, None, Err(&e)).await;
                }
            }
        }

        let last = attachments.len().saturating_sub(1);
        for (index, attachment) in attachments.iter().enumerate() {
            let (result, attempts) = self
                .with_retry(|| {
                    self.gateway
                        .send_attachment(&envelope.destination, attachment)
                })
                .await;
            let caption = attachment.caption().unwrap_or_default();
            let reference = Some(attachment.reference());

            match result {
                Ok(receipt) => {
                    debug!(index, attempts, "Attachment delivered");
                    self.persist(envelope, caption, reference, Ok(&receipt)).await;
                    report.attachments.push(AttachmentResult {
                        index,
                        success: true,
                        message_id: receipt.message_id,
                        error: None,
                        attempts,
                    });
                    if index < last && !self.config.inter_attachment_delay.is_zero() {
                        tokio::time::sleep(self.config.inter_attachment_delay).await;
                    }
                }
                Err(e) => {
                    warn!(
                        destination = %envelope.destination,
                        index,
                        attempts,
                        error = %e,
                        "Attachment delivery failed"
                    );
                    self.persist(envelope, caption, reference, Err(&e)).await;
                    report.attachments.push(AttachmentResult {
                        index,
                        success: false,
                        message_id: None,
                        error: Some(e.to_string()),
                        attempts,
                    });
                }
            }
        }

        if !attachments.is_empty() {
            info!(
                destination = %envelope.destination,
                delivered = report.delivered_attachments(),
                failed = report.failed_attachments(),
                "Attachments delivered"
            );
        }
        report
    }

    /// Run `op` up to `max_attempts` times, sleeping `backoff_step * n`
    /// after the n-th failure. Returns the last result and attempt count.
    async fn with_retry<F, Fut>(&self, mut op: F) -> (Result<SendReceipt, ChannelError>, u32)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<SendReceipt, ChannelError>>,
    {
        let max = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(receipt) => return (Ok(receipt), attempt),
                Err(e) if attempt >= max || !e.is_retryable() => return (Err(e), attempt),
                Err(e) => {
                    let delay = backoff_delay(self.config.backoff_step, attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying send");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn persist(
        &self,
        envelope: &Envelope,
        content: &str,
        attachment: Option<&str>,
        outcome: Result<&SendReceipt, &ChannelError>,
    ) {
        let (status, gateway_message_id, error) = match outcome {
            Ok(receipt) => (MessageStatus::Sent, receipt.message_id.clone(), None),
            Err(e) => (MessageStatus::Failed, None, Some(e.to_string())),
        };
        let record = NewMessage {
            tenant_id: envelope.tenant_id.clone(),
            conversation_id: envelope.conversation_id.clone(),
            direction: Direction::Outbound,
            sender: envelope.from.clone(),
            content: content.to_string(),
            attachment: attachment.map(String::from),
            intent: envelope.intent.clone(),
            confidence: None,
            sender_kind: envelope.sender_kind,
            sender_level: envelope.recipient_level,
            status,
            gateway_message_id,
            error,
        };
        if let Err(e) = self.store.append_message(record).await {
            warn!(
                conversation = %envelope.conversation_id,
                error = %e,
                "Failed to persist outbound message record"
            );
        }
    }
}

/// Linear backoff: `step * attempt`.
pub fn backoff_delay(step: Duration, attempt: u32) -> Duration {
    step.saturating_mul(attempt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::store::MemoryStore;

    /// Fails image sends whose url contains a marker, a fixed number of times.
    /// Urls containing `rejected` always fail as undeliverable.
    struct FlakyGateway {
        sent: Mutex<Vec<String>>,
        failures_left: Mutex<u32>,
        fail_marker: &'static str,
    }

    impl FlakyGateway {
        fn new(fail_marker: &'static str, failures: u32) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                failures_left: Mutex::new(failures),
                fail_marker,
            }
        }
    }

    #[async_trait]
    impl ChannelGateway for FlakyGateway {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn send_text(&self, _dest: &str, text: &str) -> Result<SendReceipt, ChannelError> {
            self.sent.lock().unwrap().push(format!("text:{text}"));
            Ok(SendReceipt {
                message_id: Some("m-text".into()),
            })
        }

        async fn send_image(
            &self,
            _dest: &str,
            url: &str,
            _caption: Option<&str>,
        ) -> Result<SendReceipt, ChannelError> {
            if url.contains("rejected") {
                return Err(ChannelError::InvalidDestination(url.to_string()));
            }
            if url.contains(self.fail_marker) {
                let mut left = self.failures_left.lock().unwrap();
                if *left > 0 {
                    *left -= 1;
                    return Err(ChannelError::SendFailed {
                        name: "flaky".into(),
                        reason: "timeout".into(),
                    });
                }
            }
            self.sent.lock().unwrap().push(format!("image:{url}"));
            Ok(SendReceipt {
                message_id: Some(format!("m-{url}")),
            })
        }

        async fn send_document(
            &self,
            _dest: &str,
            _b64: &str,
            filename: &str,
            _caption: Option<&str>,
        ) -> Result<SendReceipt, ChannelError> {
            self.sent.lock().unwrap().push(format!("doc:{filename}"));
            Ok(SendReceipt::default())
        }
    }

    fn config() -> DeliveryConfig {
        DeliveryConfig {
            max_attempts: 3,
            backoff_step: Duration::from_millis(1),
            inter_attachment_delay: Duration::from_millis(1),
        }
    }

    fn envelope() -> Envelope {
        Envelope {
            tenant_id: "t1".into(),
            conversation_id: "c1".into(),
            from: "620000".into(),
            destination: "6281".into(),
            sender_kind: SenderKind::Ai,
            intent: None,
            recipient_level: None,
        }
    }

    fn images() -> Vec<Attachment> {
        vec![
            Attachment::image("a.jpg", None),
            Attachment::image("b-bad.jpg", Some("samping".into())),
            Attachment::image("c.jpg", None),
        ]
    }

    #[test]
    fn backoff_is_linear() {
        let step = Duration::from_millis(100);
        assert_eq!(backoff_delay(step, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(step, 3), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn failed_attachment_does_not_abort_the_rest() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(FlakyGateway::new("bad", u32::MAX));
        let layer = DeliveryLayer::new(gateway.clone(), store.clone(), config());

        let report = layer.send(&envelope(), "Ini fotonya", &images()).await;

        assert!(report.text_sent);
        assert_eq!(report.delivered_attachments(), 2);
        assert_eq!(report.failed_attachments(), 1);
        assert!(!report.is_complete());
        assert_eq!(report.attachments[1].attempts, 3);
        assert!(!report.attachments[1].success);

        let sent = gateway.sent.lock().unwrap().clone();
        assert_eq!(sent, vec!["text:Ini fotonya", "image:a.jpg", "image:c.jpg"]);

        let records = store.messages_for("c1").await;
        assert_eq!(records.len(), 4);
        let failed: Vec<_> = records
            .iter()
            .filter(|m| m.status == MessageStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attachment.as_deref(), Some("b-bad.jpg"));
        assert!(failed[0].error.is_some());
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(FlakyGateway::new("bad", 2));
        let layer = DeliveryLayer::new(gateway.clone(), store.clone(), config());

        let report = layer.send(&envelope(), "", &images()).await;

        assert!(!report.text_sent);
        assert!(report.is_complete());
        assert_eq!(report.attachments[1].attempts, 3);
        let sent = gateway.sent.lock().unwrap().clone();
        assert_eq!(sent, vec!["image:a.jpg", "image:b-bad.jpg", "image:c.jpg"]);
        // No text record for an empty body.
        assert_eq!(store.messages_for("c1").await.len(), 3);
    }

    #[tokio::test]
    async fn invalid_destination_is_not_retried() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(FlakyGateway::new("never", 0));
        let layer = DeliveryLayer::new(gateway, store, config());

        let report = layer
            .send(&envelope(), "", &[Attachment::image("rejected.jpg", None)])
            .await;

        assert_eq!(report.failed_attachments(), 1);
        assert_eq!(report.attachments[0].attempts, 1);
    }

    #[tokio::test]
    async fn records_carry_gateway_ids() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(FlakyGateway::new("never", 0));
        let layer = DeliveryLayer::new(gateway, store.clone(), config());

        layer.send(&envelope(), "halo", &[]).await;

        let records = store.messages_for("c1").await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].direction, Direction::Outbound);
        assert_eq!(records[0].status, MessageStatus::Sent);
        assert_eq!(records[0].gateway_message_id.as_deref(), Some("m-text"));
    }
}
