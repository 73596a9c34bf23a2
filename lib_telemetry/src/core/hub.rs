//! # Broadcast Hub
//!
//! Fans every flushed batch out to all live stream subscribers.
//!
//! ## Core Design Principles:
//!
//! 1.  **Single Owner**: the subscriber set lives inside one control task and is
//!     only touched there. Register, unregister and publish all arrive as typed
//!     commands on one unbounded queue, so there is no lock and no registration
//!     race: a subscriber that joined before a `broadcast` call sees that batch.
//!
//! 2.  **Zero-Copy Fan-out**: a batch is wrapped in an `Arc` once; each subscriber
//!     receives a new pointer to the same allocation.
//!
//! 3.  **Non-blocking Delivery**: each subscriber has a bounded buffer and sends use
//!     `try_send`. A full buffer means that subscriber misses the batch; the hub
//!     never waits on a slow client and never pushes back on the pipeline.
//!
//! 4.  **Deterministic Teardown**: on cancellation every subscriber channel is
//!     dropped, so each consumer observes end-of-stream, and the control task
//!     returns a [`HubStats`] snapshot.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::models::Batch;

/// Identifier handed out by [`HubHandle::join`].
pub type SubscriberId = u64;

/// # Hub Settings
#[derive(Debug, Clone)]
pub struct HubSettings {
    /// Batches buffered per subscriber before new ones are dropped for it.
    pub subscriber_buffer: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            subscriber_buffer: 64,
        }
    }
}

/// Counters kept by the control loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Subscribers currently registered.
    pub subscribers: usize,
    /// Batches received through `broadcast`.
    pub batches_published: u64,
    /// Successful per-subscriber deliveries.
    pub deliveries: u64,
    /// Per-subscriber deliveries skipped because the buffer was full.
    pub deliveries_dropped: u64,
}

enum Command {
    Register {
        id: SubscriberId,
        sender: mpsc::Sender<Arc<Batch>>,
    },
    Unregister(SubscriberId),
    Publish(Arc<Batch>),
    Stats(oneshot::Sender<HubStats>),
}

/// Entry point for starting the hub.
pub struct BroadcastHub;

impl BroadcastHub {
    /// Spawns the control task.
    ///
    /// The returned handle is cheap to clone. The join handle resolves to the
    /// final [`HubStats`] once `cancel` fires.
    pub fn spawn(settings: HubSettings, cancel: CancellationToken) -> (HubHandle, JoinHandle<HubStats>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let handle = HubHandle {
            commands,
            next_id: Arc::new(AtomicU64::new(1)),
            buffer: settings.subscriber_buffer.max(1),
        };
        let task = tokio::spawn(control_loop(rx, cancel));
        (handle, task)
    }
}

/// # Hub Handle
///
/// Cloneable front door to the control task.
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
    buffer: usize,
}

impl HubHandle {
    /// Registers a new subscriber and returns its handle immediately.
    ///
    /// If the hub has already stopped, the subscription is born closed.
    pub fn join(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.buffer);
        if self.commands.send(Command::Register { id, sender }).is_err() {
            log::debug!("Hub stopped; subscriber {} starts closed", id);
        }
        Subscription {
            id,
            receiver,
            commands: self.commands.clone(),
        }
    }

    /// Removes a subscriber and closes its channel. Unknown ids are ignored.
    pub fn leave(&self, id: SubscriberId) {
        let _ = self.commands.send(Command::Unregister(id));
    }

    /// Queues a batch for delivery to everyone currently registered.
    pub fn broadcast(&self, batch: impl Into<Arc<Batch>>) {
        if self.commands.send(Command::Publish(batch.into())).is_err() {
            log::debug!("Hub stopped; batch discarded");
        }
    }

    /// Current counters, or `None` once the hub has stopped.
    pub async fn stats(&self) -> Option<HubStats> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::Stats(tx)).ok()?;
        rx.await.ok()
    }
}

/// # Subscription
///
/// One live delivery channel. Dropping it unregisters the subscriber.
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<Arc<Batch>>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Subscription {
    /// Hub-assigned identifier.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next batch, or `None` after `leave` or hub shutdown.
    pub async fn recv(&mut self) -> Option<Arc<Batch>> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Unregister(self.id));
    }
}

async fn control_loop(
    mut commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
) -> HubStats {
    let mut subscribers: BTreeMap<SubscriberId, mpsc::Sender<Arc<Batch>>> = BTreeMap::new();
    let mut stats = HubStats::default();
    log::info!("Broadcast hub started.");

    loop {
        let command = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        match command {
            Command::Register { id, sender } => {
                subscribers.insert(id, sender);
                log::info!("Subscriber {} joined ({} active)", id, subscribers.len());
            }
            Command::Unregister(id) => {
                if subscribers.remove(&id).is_some() {
                    log::info!("Subscriber {} left ({} active)", id, subscribers.len());
                }
            }
            Command::Publish(batch) => {
                stats.batches_published += 1;
                subscribers.retain(|id, sender| match sender.try_send(batch.clone()) {
                    Ok(()) => {
                        stats.deliveries += 1;
                        true
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        stats.deliveries_dropped += 1;
                        log::debug!("Subscriber {} is slow; batch dropped", id);
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        log::info!("Subscriber {} disconnected", id);
                        false
                    }
                });
            }
            Command::Stats(reply) => {
                stats.subscribers = subscribers.len();
                let _ = reply.send(stats);
            }
        }
    }

    stats.subscribers = subscribers.len();
    // Dropping the senders ends every subscriber stream.
    subscribers.clear();
    log::info!(
        "Broadcast hub stopped: {} subscribers closed, {} batches, {} deliveries, {} dropped",
        stats.subscribers,
        stats.batches_published,
        stats.deliveries,
        stats.deliveries_dropped
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TelemetryEvent;

    fn event(icao24: &str) -> TelemetryEvent {
        TelemetryEvent {
            icao24: icao24.into(),
            callsign: String::new(),
            origin_country: "Indonesia".into(),
            lat: -6.1,
            lon: 106.8,
            velocity: 200.0,
            time_position: 1_700_000_000,
            baro_altitude: 9000.0,
            geo_altitude: 9100.0,
            last_contact: 1_700_000_001,
        }
    }

    fn hub(buffer: usize) -> (HubHandle, JoinHandle<HubStats>, CancellationToken) {
        let cancel = CancellationToken::new();
        let (handle, task) = BroadcastHub::spawn(
            HubSettings {
                subscriber_buffer: buffer,
            },
            cancel.clone(),
        );
        (handle, task, cancel)
    }

    #[tokio::test]
    async fn join_before_broadcast_always_sees_the_batch() {
        let (hub, _task, _cancel) = hub(8);
        let mut a = hub.join();
        let mut b = hub.join();
        hub.broadcast(vec![event("a1"), event("b2")]);

        for sub in [&mut a, &mut b] {
            let batch = sub.recv().await.unwrap();
            let keys: Vec<&str> = batch.iter().map(|e| e.icao24.as_str()).collect();
            assert_eq!(keys, ["a1", "b2"]);
        }
    }

    #[tokio::test]
    async fn subscribers_share_one_allocation() {
        let (hub, _task, _cancel) = hub(8);
        let mut a = hub.join();
        let mut b = hub.join();
        hub.broadcast(vec![event("a1")]);
        let (x, y) = (a.recv().await.unwrap(), b.recv().await.unwrap());
        assert!(Arc::ptr_eq(&x, &y));
    }

    #[tokio::test]
    async fn full_buffer_drops_instead_of_blocking() {
        let (hub, _task, _cancel) = hub(1);
        let mut slow = hub.join();
        for i in 0..3 {
            hub.broadcast(vec![event(&format!("e{}", i))]);
        }

        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.batches_published, 3);
        assert_eq!(stats.deliveries, 1);
        assert_eq!(stats.deliveries_dropped, 2);
        assert_eq!(slow.recv().await.unwrap()[0].icao24, "e0");
    }

    #[tokio::test]
    async fn leave_closes_the_channel_and_is_idempotent() {
        let (hub, _task, _cancel) = hub(8);
        let mut sub = hub.join();
        hub.leave(sub.id());
        hub.leave(sub.id());
        hub.leave(9_999);

        assert!(sub.recv().await.is_none());
        assert_eq!(hub.stats().await.unwrap().subscribers, 0);
    }

    #[tokio::test]
    async fn dropping_a_subscription_unregisters_it() {
        let (hub, _task, _cancel) = hub(8);
        let keep = hub.join();
        drop(hub.join());
        assert_eq!(hub.stats().await.unwrap().subscribers, 1);
        drop(keep);
        assert_eq!(hub.stats().await.unwrap().subscribers, 0);
    }

    #[tokio::test]
    async fn shutdown_ends_every_stream_and_reports_stats() {
        let (hub, task, cancel) = hub(8);
        let mut a = hub.join();
        let mut b = hub.join();
        hub.broadcast(vec![event("a1")]);
        assert!(a.recv().await.is_some());
        assert!(b.recv().await.is_some());

        cancel.cancel();
        let stats = task.await.unwrap();
        assert_eq!(stats.subscribers, 2);
        assert_eq!(stats.batches_published, 1);
        assert!(a.recv().await.is_none());
        assert!(b.recv().await.is_none());

        let mut late = hub.join();
        assert!(late.recv().await.is_none());
        assert!(hub.stats().await.is_none());
    }
}
