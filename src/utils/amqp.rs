// src/utils/amqp.rs

use lapin::{
    options::{BasicConsumeOptions, BasicQosOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel, Connection, ConnectionProperties, Consumer, Result as LapinResult,
};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info};

use crate::error::{PipelineError, Result};

/// Connects to RabbitMQ with a bounded retry loop.
pub async fn connect_rabbitmq(addr: &str) -> LapinResult<Connection> {
    let options = ConnectionProperties::default()
        .with_executor(tokio_executor_trait::Tokio::current())
        .with_reactor(tokio_reactor_trait::Tokio);

    let mut attempts = 0;
    loop {
        match Connection::connect(addr, options.clone()).await {
            Ok(conn) => {
                info!("Successfully connected to RabbitMQ at {}", addr);
                return Ok(conn);
            }
            Err(e) => {
                attempts += 1;
                error!(
                    attempt = attempts,
                    error = %e,
                    "Failed to connect to RabbitMQ. Retrying in 5 seconds..."
                );
                if attempts >= 5 {
                    return Err(e);
                }
                sleep(Duration::from_secs(5)).await;
            }
        }
    }
}

/// Declares one durable queue and returns a publish channel plus a consumer on
/// it, with prefetch applied to the consume channel.
pub async fn setup_channel_and_queue(
    conn: &Connection,
    queue_name: &str,
    prefetch_count: u16,
    consumer_label: &str,
) -> Result<(Channel, Consumer)> {
    let consume_channel = conn.create_channel().await.map_err(|e| {
        PipelineError::QueueError(format!(
            "{} failed to create consume channel: {}",
            consumer_label, e
        ))
    })?;
    let publish_channel = conn.create_channel().await.map_err(|e| {
        PipelineError::QueueError(format!(
            "{} failed to create publish channel: {}",
            consumer_label, e
        ))
    })?;

    consume_channel
        .queue_declare(
            queue_name,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| {
            PipelineError::QueueError(format!(
                "{} failed to declare queue '{}': {}",
                consumer_label, queue_name, e
            ))
        })?;

    consume_channel
        .basic_qos(prefetch_count, BasicQosOptions::default())
        .await
        .map_err(|e| PipelineError::QueueError(format!("Failed to set QoS: {}", e)))?;

    let consumer_tag = format!(
        "{}-{}-{}",
        consumer_label,
        std::process::id(),
        chrono::Utc::now().timestamp()
    );
    let consumer = consume_channel
        .basic_consume(
            queue_name,
            &consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;

    Ok((publish_channel, consumer))
}
