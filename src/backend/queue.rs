use crate::data_model::ProcessMessage;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions, BasicPublishOptions},
    protocol::basic::AMQPProperties,
    Channel, Connection, Consumer,
};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Queue tier for a process message. Priority work gets its own queue so it is
/// never head-of-line-blocked behind standard work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueTier {
    Standard,
    Priority,
}

impl QueueTier {
    pub fn for_priority(priority: bool) -> Self {
        if priority {
            QueueTier::Priority
        } else {
            QueueTier::Standard
        }
    }
}

/// A dequeued message plus whatever the backend needs to acknowledge it.
pub struct QueueDelivery {
    pub message: ProcessMessage,
    inner: DeliveryInner,
}

enum DeliveryInner {
    Memory,
    Amqp(Delivery),
}

/// Message transport between the router and the stage workers.
///
/// `dequeue` must poll the priority tier preferentially. `delay` is advisory:
/// backends without native delayed delivery may publish immediately.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(
        &self,
        tier: QueueTier,
        message: &ProcessMessage,
        delay: Option<Duration>,
    ) -> Result<()>;

    /// Blocks until a message is available.
    async fn dequeue(&self) -> Result<QueueDelivery>;

    async fn ack(&self, delivery: QueueDelivery) -> Result<()>;

    /// Returns an unprocessable delivery to the queue for redelivery.
    async fn nack(&self, delivery: QueueDelivery) -> Result<()>;
}

struct Delayed {
    ready_at: Instant,
    message: ProcessMessage,
}

/// In-process queue for tests and single-node runs. Honors enqueue delays.
#[derive(Default)]
pub struct MemoryQueue {
    standard: Mutex<VecDeque<Delayed>>,
    priority: Mutex<VecDeque<Delayed>>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages currently queued (ready or delayed), both tiers.
    pub async fn len(&self) -> usize {
        self.standard.lock().await.len() + self.priority.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn pop_ready(&self, now: Instant) -> (Option<ProcessMessage>, Option<Instant>) {
        let mut earliest: Option<Instant> = None;
        for tier in [&self.priority, &self.standard] {
            let mut queue = tier.lock().await;
            if let Some(pos) = queue.iter().position(|d| d.ready_at <= now) {
                if let Some(delayed) = queue.remove(pos) {
                    return (Some(delayed.message), None);
                }
            }
            if let Some(min) = queue.iter().map(|d| d.ready_at).min() {
                earliest = Some(earliest.map_or(min, |e: Instant| e.min(min)));
            }
        }
        (None, earliest)
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(
        &self,
        tier: QueueTier,
        message: &ProcessMessage,
        delay: Option<Duration>,
    ) -> Result<()> {
        let ready_at = Instant::now() + delay.unwrap_or(Duration::ZERO);
        let delayed = Delayed {
            ready_at,
            message: message.clone(),
        };
        match tier {
            QueueTier::Standard => self.standard.lock().await.push_back(delayed),
            QueueTier::Priority => self.priority.lock().await.push_back(delayed),
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dequeue(&self) -> Result<QueueDelivery> {
        loop {
            // Register for wakeup before the emptiness check so an enqueue
            // racing with us cannot be missed.
            let notified = self.notify.notified();
            let now = Instant::now();
            let (message, earliest) = self.pop_ready(now).await;
            if let Some(message) = message {
                return Ok(QueueDelivery {
                    message,
                    inner: DeliveryInner::Memory,
                });
            }
            match earliest {
                Some(ready_at) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(ready_at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn ack(&self, _delivery: QueueDelivery) -> Result<()> {
        Ok(())
    }

    async fn nack(&self, delivery: QueueDelivery) -> Result<()> {
        // Redeliver after a short pause so a persistently failing message
        // cannot hot-loop the consumer.
        let tier = QueueTier::for_priority(delivery.message.priority);
        self.enqueue(tier, &delivery.message, Some(Duration::from_secs(1)))
            .await
    }
}

/// AMQP-backed queue: two durable queues per logical queue name, consumed with
/// a biased select so the priority queue drains first.
pub struct AmqpQueue {
    publish_channel: Channel,
    standard_queue: String,
    priority_queue: String,
    consumers: Option<(Mutex<Consumer>, Mutex<Consumer>)>,
}

impl AmqpQueue {
    /// Declares both tiers and opens a publish channel, without consuming.
    /// For processes that only enqueue; `dequeue` on this instance errors.
    pub async fn publisher(conn: &Connection, queue_name: &str) -> Result<Self> {
        let standard_queue = queue_name.to_string();
        let priority_queue = format!("{}_priority", queue_name);

        let publish_channel = conn
            .create_channel()
            .await
            .map_err(|e| PipelineError::QueueError(format!("failed to create channel: {}", e)))?;
        for queue in [&standard_queue, &priority_queue] {
            publish_channel
                .queue_declare(
                    queue,
                    lapin::options::QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    lapin::types::FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    PipelineError::QueueError(format!("failed to declare queue '{}': {}", queue, e))
                })?;
        }

        Ok(AmqpQueue {
            publish_channel,
            standard_queue,
            priority_queue,
            consumers: None,
        })
    }

    pub async fn setup(
        conn: &Connection,
        queue_name: &str,
        prefetch_count: u16,
        consumer_label: &str,
    ) -> Result<Self> {
        let standard_queue = queue_name.to_string();
        let priority_queue = format!("{}_priority", queue_name);

        let (publish_channel, standard_consumer) = crate::utils::amqp::setup_channel_and_queue(
            conn,
            &standard_queue,
            prefetch_count,
            consumer_label,
        )
        .await?;
        let (_, priority_consumer) = crate::utils::amqp::setup_channel_and_queue(
            conn,
            &priority_queue,
            prefetch_count,
            &format!("{}-priority", consumer_label),
        )
        .await?;

        Ok(AmqpQueue {
            publish_channel,
            standard_queue,
            priority_queue,
            consumers: Some((Mutex::new(standard_consumer), Mutex::new(priority_consumer))),
        })
    }

    fn queue_for(&self, tier: QueueTier) -> &str {
        match tier {
            QueueTier::Standard => &self.standard_queue,
            QueueTier::Priority => &self.priority_queue,
        }
    }

    fn parse_delivery(delivery: Delivery) -> Result<QueueDelivery> {
        match serde_json::from_slice::<ProcessMessage>(&delivery.data) {
            Ok(message) => Ok(QueueDelivery {
                message,
                inner: DeliveryInner::Amqp(delivery),
            }),
            Err(e) => {
                warn!(error = %e, payload = %String::from_utf8_lossy(&delivery.data),
                    "Discarding undecodable task message");
                // Ack asynchronously so the broker does not redeliver garbage.
                tokio::spawn(async move {
                    if let Err(ack_err) = delivery.ack(BasicAckOptions::default()).await {
                        warn!(error = %ack_err, "Failed to ack undecodable message");
                    }
                });
                Err(PipelineError::SerializationError { source: e })
            }
        }
    }
}

#[async_trait]
impl TaskQueue for AmqpQueue {
    async fn enqueue(
        &self,
        tier: QueueTier,
        message: &ProcessMessage,
        delay: Option<Duration>,
    ) -> Result<()> {
        if let Some(delay) = delay {
            // AMQP has no native per-message delay; the backoff is advisory.
            debug!(delay_secs = delay.as_secs(), "Publishing without delay (unsupported by AMQP backend)");
        }
        let payload = serde_json::to_vec(message)?;
        self.publish_channel
            .basic_publish(
                "",
                self.queue_for(tier),
                BasicPublishOptions::default(),
                &payload,
                AMQPProperties::default().with_delivery_mode(2),
            )
            .await?
            .await?;
        Ok(())
    }

    async fn dequeue(&self) -> Result<QueueDelivery> {
        let (standard, priority) = self.consumers.as_ref().ok_or_else(|| {
            PipelineError::QueueError("dequeue on a publisher-only queue".to_string())
        })?;
        let mut priority = priority.lock().await;
        let mut standard = standard.lock().await;
        loop {
            let delivery_result = tokio::select! {
                biased;
                Some(d) = priority.next() => d,
                Some(d) = standard.next() => d,
                else => {
                    return Err(PipelineError::QueueError(
                        "consumer streams closed".to_string(),
                    ))
                }
            };
            match delivery_result {
                Ok(delivery) => match Self::parse_delivery(delivery) {
                    Ok(parsed) => return Ok(parsed),
                    Err(_) => continue,
                },
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn ack(&self, delivery: QueueDelivery) -> Result<()> {
        match delivery.inner {
            DeliveryInner::Memory => Ok(()),
            DeliveryInner::Amqp(d) => {
                d.ack(BasicAckOptions::default()).await?;
                Ok(())
            }
        }
    }

    async fn nack(&self, delivery: QueueDelivery) -> Result<()> {
        match delivery.inner {
            DeliveryInner::Memory => Ok(()),
            DeliveryInner::Amqp(d) => {
                d.nack(BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                })
                .await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_model::PipelineStep;

    fn msg(job_id: &str, priority: bool) -> ProcessMessage {
        ProcessMessage {
            job_id: job_id.to_string(),
            doc_id: "d1".to_string(),
            step: PipelineStep::Ocr,
            priority,
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn priority_tier_drains_before_standard() {
        let queue = MemoryQueue::new();
        queue
            .enqueue(QueueTier::Standard, &msg("std", false), None)
            .await
            .unwrap();
        queue
            .enqueue(QueueTier::Priority, &msg("prio", true), None)
            .await
            .unwrap();

        let first = queue.dequeue().await.unwrap();
        assert_eq!(first.message.job_id, "prio");
        let second = queue.dequeue().await.unwrap();
        assert_eq!(second.message.job_id, "std");
    }

    #[tokio::test]
    async fn delayed_message_is_not_visible_early() {
        let queue = MemoryQueue::new();
        queue
            .enqueue(
                QueueTier::Standard,
                &msg("later", false),
                Some(Duration::from_millis(80)),
            )
            .await
            .unwrap();

        let started = Instant::now();
        let delivery = queue.dequeue().await.unwrap();
        assert_eq!(delivery.message.job_id, "later");
        assert!(started.elapsed() >= Duration::from_millis(70));
    }

    #[tokio::test(start_paused = true)]
    async fn nacked_message_is_redelivered_on_its_tier() {
        let queue = MemoryQueue::new();
        queue
            .enqueue(QueueTier::Priority, &msg("j1", true), None)
            .await
            .unwrap();

        let delivery = queue.dequeue().await.unwrap();
        queue.nack(delivery).await.unwrap();
        assert_eq!(queue.len().await, 1);

        // redelivery is delayed, not immediate
        let redelivered = queue.dequeue().await.unwrap();
        assert_eq!(redelivered.message.job_id, "j1");
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn dequeue_blocks_until_enqueue() {
        let queue = std::sync::Arc::new(MemoryQueue::new());
        let q2 = queue.clone();
        let handle = tokio::spawn(async move { q2.dequeue().await.unwrap().message.job_id });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue
            .enqueue(QueueTier::Standard, &msg("j1", false), None)
            .await
            .unwrap();
        assert_eq!(handle.await.unwrap(), "j1");
    }
}
