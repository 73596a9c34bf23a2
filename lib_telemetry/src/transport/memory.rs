use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{TopicConsumer, TopicMessage, TopicProducer};
use crate::error::{PublishError, TransportError};

/// # Memory Topic
///
/// A named, unbounded, in-process topic. Messages are delivered in publish
/// order to the single consumer.
///
/// ```
/// use lib_telemetry::transport::memory::MemoryTopic;
///
/// let (producer, consumer) = MemoryTopic::open("telemetry.raw");
/// # drop((producer, consumer));
/// ```
pub struct MemoryTopic;

impl MemoryTopic {
    /// Opens a topic and returns its two ends.
    pub fn open(name: impl Into<String>) -> (MemoryProducer, MemoryConsumer) {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        (
            MemoryProducer { tx },
            MemoryConsumer {
                name,
                rx: Some(rx),
                subscribed: false,
            },
        )
    }
}

/// Cloneable write end of a [`MemoryTopic`].
#[derive(Clone)]
pub struct MemoryProducer {
    tx: mpsc::UnboundedSender<TopicMessage>,
}

#[async_trait]
impl TopicProducer for MemoryProducer {
    async fn publish(&self, key: &str, payload: &[u8]) -> Result<(), PublishError> {
        self.tx
            .send(TopicMessage {
                key: key.to_string(),
                payload: payload.to_vec(),
            })
            .map_err(|_| PublishError::Rejected {
                key: key.to_string(),
                reason: "consumer closed".into(),
            })
    }
}

/// Read end of a [`MemoryTopic`].
pub struct MemoryConsumer {
    name: String,
    rx: Option<mpsc::UnboundedReceiver<TopicMessage>>,
    subscribed: bool,
}

#[async_trait]
impl TopicConsumer for MemoryConsumer {
    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        if topic != self.name {
            return Err(TransportError::Subscribe {
                topic: topic.to_string(),
                reason: format!("this consumer reads {}", self.name),
            });
        }
        if self.rx.is_none() {
            return Err(TransportError::Closed);
        }
        self.subscribed = true;
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<TopicMessage>, TransportError> {
        if !self.subscribed {
            return Err(TransportError::Poll("poll before subscribe".into()));
        }
        let rx = self.rx.as_mut().ok_or(TransportError::Closed)?;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(msg)) => Ok(Some(msg)),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Ok(None),
        }
    }

    async fn close(&mut self) {
        self.subscribed = false;
        if let Some(mut rx) = self.rx.take() {
            rx.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let (producer, mut consumer) = MemoryTopic::open("t");
        consumer.subscribe("t").await.unwrap();

        for key in ["a", "b", "c"] {
            producer.publish(key, key.as_bytes()).await.unwrap();
        }

        let mut keys = Vec::new();
        while let Some(msg) = consumer.poll(Duration::from_millis(10)).await.unwrap() {
            keys.push(msg.key);
        }
        assert_eq!(keys, ["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_poll_times_out_with_none() {
        let (_producer, mut consumer) = MemoryTopic::open("t");
        consumer.subscribe("t").await.unwrap();
        assert_eq!(consumer.poll(Duration::from_secs(5)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn wrong_topic_name_is_rejected() {
        let (_producer, mut consumer) = MemoryTopic::open("t");
        let err = consumer.subscribe("other").await.unwrap_err();
        assert!(matches!(err, TransportError::Subscribe { .. }));
    }

    #[tokio::test]
    async fn dropped_producers_close_the_topic() {
        let (producer, mut consumer) = MemoryTopic::open("t");
        consumer.subscribe("t").await.unwrap();
        drop(producer);
        let err = consumer.poll(Duration::from_millis(10)).await.unwrap_err();
        assert_eq!(err, TransportError::Closed);
    }

    #[tokio::test]
    async fn publish_after_close_is_rejected() {
        let (producer, mut consumer) = MemoryTopic::open("t");
        consumer.subscribe("t").await.unwrap();
        consumer.close().await;
        let err = producer.publish("k", b"x").await.unwrap_err();
        assert!(matches!(err, PublishError::Rejected { .. }));
    }
}
