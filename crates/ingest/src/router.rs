//! Size-class routing of upload notifications to work queues.

use crate::error::{IngestError, Result};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use bytes::Bytes;
use romvault_core::config::RoutingConfig;
use romvault_core::{SizeClass, display_size};
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::instrument;

/// Notification that an object landed in the upload store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadEvent {
    pub bucket: String,
    pub name: String,
    /// Object size in bytes. Notifications carry it as a decimal string.
    #[serde(deserialize_with = "size_from_number_or_string")]
    pub size: u64,
}

impl UploadEvent {
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| IngestError::InvalidEvent(e.to_string()))
    }

    /// Only zip archives are routed.
    pub fn is_archive(&self) -> bool {
        self.name.to_ascii_lowercase().ends_with(".zip")
    }
}

fn size_from_number_or_string<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Number(u64),
        Text(String),
    }

    match Size::deserialize(deserializer)? {
        Size::Number(n) => Ok(n),
        Size::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid size {s:?}"))),
    }
}

/// A message queue the router can publish to.
#[async_trait]
pub trait QueuePublisher: Send + Sync {
    /// Publish `payload` to `queue`, returning the broker's message id.
    async fn publish(&self, queue: &str, payload: Bytes) -> Result<String>;
}

/// A message accepted by [`MemoryPublisher`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishedMessage {
    pub id: String,
    pub queue: String,
    pub payload: Bytes,
}

#[derive(Debug, Default)]
struct PublisherState {
    messages: Vec<PublishedMessage>,
    failures_left: usize,
}

/// In-process publisher that records messages.
#[derive(Clone, Debug, Default)]
pub struct MemoryPublisher {
    state: Arc<Mutex<PublisherState>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn messages(&self) -> Vec<PublishedMessage> {
        self.state.lock().await.messages.clone()
    }

    /// Make the next `n` publishes fail with a retryable error.
    pub async fn fail_next(&self, n: usize) {
        self.state.lock().await.failures_left = n;
    }
}

#[async_trait]
impl QueuePublisher for MemoryPublisher {
    async fn publish(&self, queue: &str, payload: Bytes) -> Result<String> {
        let mut state = self.state.lock().await;
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(IngestError::PublishFailed {
                queue: queue.to_string(),
                reason: "broker unavailable".to_string(),
            });
        }

        let id = uuid::Uuid::new_v4().to_string();
        state.messages.push(PublishedMessage {
            id: id.clone(),
            queue: queue.to_string(),
            payload,
        });
        Ok(id)
    }
}

/// Where an event was sent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RouteDecision {
    pub class: SizeClass,
    pub queue: String,
    pub message_id: String,
}

/// Publishes upload events to the queue matching their size class.
pub struct SizeRouter {
    routing: RoutingConfig,
    publisher: Arc<dyn QueuePublisher>,
    publish_timeout: Duration,
    retry: RetryPolicy,
}

impl SizeRouter {
    pub fn new(
        routing: RoutingConfig,
        publisher: Arc<dyn QueuePublisher>,
        publish_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            routing,
            publisher,
            publish_timeout,
            retry,
        }
    }

    pub fn classify(&self, size: u64) -> SizeClass {
        self.routing.classify(size)
    }

    /// Publish the event's object name to its size-class queue.
    ///
    /// Returns `None` for objects that are not zip archives.
    #[instrument(skip(self), fields(name = %event.name, size = event.size))]
    pub async fn route(&self, event: &UploadEvent) -> Result<Option<RouteDecision>> {
        if !event.is_archive() {
            tracing::debug!(name = %event.name, "Ignoring non-archive upload");
            return Ok(None);
        }

        let started = Instant::now();
        let class = self.classify(event.size);
        let queue = self.routing.queue(class).to_string();
        let payload = Bytes::from(event.name.clone());

        let message_id = self
            .retry
            .run("publish", || async {
                match tokio::time::timeout(
                    self.publish_timeout,
                    self.publisher.publish(&queue, payload.clone()),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(IngestError::PublishFailed {
                        queue: queue.clone(),
                        reason: format!(
                            "publish exceeded {}ms",
                            self.publish_timeout.as_millis()
                        ),
                    }),
                }
            })
            .await?;

        tracing::info!(
            bucket = %event.bucket,
            name = %event.name,
            size = %display_size(event.size),
            class = %class,
            queue = %queue,
            message_id = %message_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Routed upload"
        );

        Ok(Some(RouteDecision {
            class,
            queue,
            message_id,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use romvault_core::MIB;

    fn router(publisher: &MemoryPublisher, retries: u32) -> SizeRouter {
        SizeRouter::new(
            RoutingConfig::default(),
            Arc::new(publisher.clone()),
            Duration::from_secs(1),
            RetryPolicy::new(retries, Duration::from_millis(1), Duration::from_millis(2)),
        )
    }

    fn event(name: &str, size: u64) -> UploadEvent {
        UploadEvent {
            bucket: "uploads".to_string(),
            name: name.to_string(),
            size,
        }
    }

    #[test]
    fn test_event_size_as_string_or_number() {
        let e = UploadEvent::from_json(br#"{"bucket":"b","name":"a.zip","size":"5242880"}"#)
            .unwrap();
        assert_eq!(e.size, 5 * MIB);
        let e = UploadEvent::from_json(br#"{"bucket":"b","name":"a.zip","size":12}"#).unwrap();
        assert_eq!(e.size, 12);

        let err = UploadEvent::from_json(br#"{"bucket":"b","name":"a.zip","size":"big"}"#)
            .unwrap_err();
        assert!(matches!(err, IngestError::InvalidEvent(_)));
        assert!(UploadEvent::from_json(b"{}").is_err());
    }

    #[tokio::test]
    async fn test_route_boundaries() {
        let publisher = MemoryPublisher::new();
        let router = router(&publisher, 0);

        let cases = [
            (5 * MIB - 1, "rom-upload-small"),
            (5 * MIB, "rom-upload-medium"),
            (50 * MIB, "rom-upload-large"),
            (100 * MIB, "rom-upload-xlarge"),
        ];
        for (size, queue) in cases {
            let decision = router.route(&event("set.zip", size)).await.unwrap().unwrap();
            assert_eq!(decision.queue, queue, "size {size}");
        }

        let messages = publisher.messages().await;
        assert_eq!(messages.len(), 4);
        assert!(messages.iter().all(|m| m.payload == Bytes::from_static(b"set.zip")));
    }

    #[tokio::test]
    async fn test_non_archives_ignored() {
        let publisher = MemoryPublisher::new();
        let router = router(&publisher, 0);

        assert!(router.route(&event("notes.txt", 10)).await.unwrap().is_none());
        assert!(router.route(&event("SET.ZIP", 10)).await.unwrap().is_some());
        assert_eq!(publisher.messages().await.len(), 1);
    }

    #[tokio::test]
    async fn test_publish_retried_then_fails() {
        let publisher = MemoryPublisher::new();
        let router = router(&publisher, 2);

        publisher.fail_next(2).await;
        let decision = router.route(&event("a.zip", 1)).await.unwrap().unwrap();
        assert_eq!(publisher.messages().await[0].id, decision.message_id);

        publisher.fail_next(3).await;
        let err = router.route(&event("b.zip", 1)).await.unwrap_err();
        assert!(matches!(err, IngestError::PublishFailed { .. }));
        assert_eq!(publisher.messages().await.len(), 1);
    }
}
