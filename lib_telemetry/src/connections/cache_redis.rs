//! # Redis Streams Topic
//!
//! A durable [`TopicProducer`]/[`TopicConsumer`] pair on top of one Redis stream
//! per topic.
//!
//! - The producer appends with `XADD <topic> MAXLEN ~ <n> * key <icao24> value <json>`
//!   through a reconnecting `ConnectionManager`.
//! - The consumer joins a consumer group (created with `MKSTREAM` on first use)
//!   and reads with `XREADGROUP`. Entries handed out by one `poll` are `XACK`ed at
//!   the start of the next `poll` or on `close`, once the caller has taken them.
//! - Every `subscribe` first replays this consumer's own pending entries (read
//!   from ID `0`) and only then switches to new entries (`>`). Anything read but
//!   never acknowledged before a shutdown or crash is therefore delivered again,
//!   which gives at-least-once delivery.
//!
//! Blocking reads are issued in short slices so a single command never outlives
//! the client's response timeout; `poll` keeps slicing until its own timeout.

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamId, StreamReadReply};
use redis::Client;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{PublishError, TransportError};
use crate::transport::{TopicConsumer, TopicMessage, TopicProducer};

const FIELD_KEY: &str = "key";
const FIELD_VALUE: &str = "value";
const BLOCK_SLICE: Duration = Duration::from_millis(250);
const NEW_ENTRIES: &str = ">";
const BACKLOG_START: &str = "0";

/// # Redis Topic Settings
#[derive(Debug, Clone)]
pub struct RedisTopicSettings {
    /// Connection URL, e.g. `redis://127.0.0.1:6379/`.
    pub url: String,
    /// Consumer group shared by every processor instance.
    pub group: String,
    /// This instance's name inside the group.
    pub consumer: String,
    /// Approximate cap on stream length applied on every append.
    pub max_len: usize,
    /// Entries fetched per `XREADGROUP`.
    pub read_count: usize,
}

impl Default for RedisTopicSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/".into(),
            group: "skystream".into(),
            consumer: "processor-1".into(),
            max_len: 100_000,
            read_count: 100,
        }
    }
}

/// Write end of a Redis stream topic.
#[derive(Clone)]
pub struct RedisProducer {
    conn: ConnectionManager,
    stream: String,
    max_len: usize,
}

impl RedisProducer {
    /// Connects to Redis and binds to `topic`.
    pub async fn connect(settings: &RedisTopicSettings, topic: &str) -> Result<Self, TransportError> {
        let client = Client::open(settings.url.as_str()).map_err(|e| TransportError::Subscribe {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        log::info!("Redis producer connected; appending to stream '{}'", topic);
        Ok(Self {
            conn,
            stream: topic.to_string(),
            max_len: settings.max_len,
        })
    }
}

#[async_trait]
impl TopicProducer for RedisProducer {
    async fn publish(&self, key: &str, payload: &[u8]) -> Result<(), PublishError> {
        let mut conn = self.conn.clone();
        let _id: String = redis::cmd("XADD")
            .arg(&self.stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_len)
            .arg("*")
            .arg(FIELD_KEY)
            .arg(key)
            .arg(FIELD_VALUE)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| PublishError::Rejected {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

/// Read position and delivery bookkeeping of one consumer, kept apart from
/// the connection.
#[derive(Debug, Default)]
struct ReadCursor {
    /// Last pending id replayed so far; `None` once the backlog is drained.
    backlog_after: Option<String>,
    buffered: VecDeque<(String, TopicMessage)>,
    unacked: Vec<String>,
}

impl ReadCursor {
    /// Starts over at the head of this consumer's pending entries.
    fn replay_backlog(&mut self) {
        self.backlog_after = Some(BACKLOG_START.to_string());
        self.buffered.clear();
        self.unacked.clear();
    }

    fn replaying(&self) -> bool {
        self.backlog_after.is_some()
    }

    /// ID argument for the next `XREADGROUP`.
    fn read_id(&self) -> &str {
        self.backlog_after.as_deref().unwrap_or(NEW_ENTRIES)
    }

    /// Takes one read reply. An empty backlog page ends the replay. Entries
    /// with no payload (trimmed, or written without a `value` field) are queued
    /// for acknowledgement without being handed out.
    fn absorb(&mut self, reply: StreamReadReply) {
        let entries: Vec<StreamId> = reply.keys.into_iter().flat_map(|stream| stream.ids).collect();

        if self.replaying() {
            match entries.last() {
                Some(last) => self.backlog_after = Some(last.id.clone()),
                None => {
                    log::info!("Pending backlog replayed; reading new entries");
                    self.backlog_after = None;
                }
            }
        }

        for entry in entries {
            match message_from_entry(&entry) {
                Some(message) => self.buffered.push_back((entry.id, message)),
                None => {
                    log::warn!("Stream entry {} has no '{}' field; skipping", entry.id, FIELD_VALUE);
                    self.unacked.push(entry.id);
                }
            }
        }
    }

    fn hand_out(&mut self) -> Option<TopicMessage> {
        self.buffered.pop_front().map(|(id, message)| {
            self.unacked.push(id);
            message
        })
    }

    fn pending_acks(&self) -> &[String] {
        &self.unacked
    }

    fn acked(&mut self) {
        self.unacked.clear();
    }

    /// Drops read-ahead entries. They stay in the group's pending list and come
    /// back through the next backlog replay.
    fn release(&mut self) {
        self.buffered.clear();
        self.backlog_after = None;
    }
}

/// Read end of a Redis stream topic.
pub struct RedisConsumer {
    settings: RedisTopicSettings,
    conn: Option<MultiplexedConnection>,
    stream: Option<String>,
    cursor: ReadCursor,
}

impl RedisConsumer {
    /// Creates an unconnected consumer; the connection is opened in `subscribe`.
    pub fn new(settings: RedisTopicSettings) -> Self {
        Self {
            settings,
            conn: None,
            stream: None,
            cursor: ReadCursor::default(),
        }
    }

    async fn ack_handed_out(&mut self) -> Result<(), TransportError> {
        if self.cursor.pending_acks().is_empty() {
            return Ok(());
        }
        let (Some(conn), Some(stream)) = (self.conn.as_mut(), self.stream.as_ref()) else {
            return Ok(());
        };
        let _acked: i64 = redis::cmd("XACK")
            .arg(stream)
            .arg(&self.settings.group)
            .arg(self.cursor.pending_acks())
            .query_async(conn)
            .await
            .map_err(|e| TransportError::Poll(format!("XACK failed: {}", e)))?;
        self.cursor.acked();
        Ok(())
    }

    async fn read_slice(&mut self, block: Duration) -> Result<(), TransportError> {
        let (Some(conn), Some(stream)) = (self.conn.as_mut(), self.stream.as_ref()) else {
            return Err(TransportError::Poll("poll before subscribe".into()));
        };

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.settings.group)
            .arg(&self.settings.consumer)
            .arg("COUNT")
            .arg(self.settings.read_count.max(1));
        // Backlog reads answer immediately; only new-entry reads block.
        if !self.cursor.replaying() {
            cmd.arg("BLOCK")
                .arg(u64::try_from(block.as_millis()).unwrap_or(u64::MAX).max(1));
        }
        cmd.arg("STREAMS").arg(stream).arg(self.cursor.read_id());

        let reply: Option<StreamReadReply> = cmd
            .query_async(conn)
            .await
            .map_err(|e| TransportError::Poll(e.to_string()))?;

        match reply {
            Some(reply) => self.cursor.absorb(reply),
            None if self.cursor.replaying() => self.cursor.absorb(StreamReadReply::default()),
            None => {}
        }
        Ok(())
    }
}

#[async_trait]
impl TopicConsumer for RedisConsumer {
    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let failed = |reason: String| TransportError::Subscribe {
            topic: topic.to_string(),
            reason,
        };

        let client = Client::open(self.settings.url.as_str()).map_err(|e| failed(e.to_string()))?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| failed(e.to_string()))?;

        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(topic)
            .arg(&self.settings.group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(()) => log::info!("Created consumer group '{}' on '{}'", self.settings.group, topic),
            Err(e) if group_already_exists(&e) => {}
            Err(e) => return Err(failed(e.to_string())),
        }

        log::info!(
            "Redis consumer '{}' joined group '{}' on stream '{}'",
            self.settings.consumer,
            self.settings.group,
            topic
        );
        self.conn = Some(conn);
        self.stream = Some(topic.to_string());
        self.cursor.replay_backlog();
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<TopicMessage>, TransportError> {
        self.ack_handed_out().await?;

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(message) = self.cursor.hand_out() {
                return Ok(Some(message));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() && !self.cursor.replaying() {
                return Ok(None);
            }
            self.read_slice(remaining.min(BLOCK_SLICE)).await?;
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.ack_handed_out().await {
            log::warn!("Final acknowledgement failed: {}", e);
        }
        self.cursor.release();
        self.conn = None;
        self.stream = None;
    }
}

fn group_already_exists(e: &redis::RedisError) -> bool {
    e.code() == Some("BUSYGROUP")
}

fn message_from_entry(entry: &StreamId) -> Option<TopicMessage> {
    let payload: Vec<u8> = entry.get(FIELD_VALUE)?;
    let key: String = entry.get(FIELD_KEY).unwrap_or_default();
    Some(TopicMessage { key, payload })
}
