//! # OpenSky Poller
//!
//! A ticker-driven producer loop. Each tick runs one fetch cycle wrapped in the
//! retry executor and publishes every resulting event to the outbound topic.
//!
//! ## Key Design Principles:
//! - **Fixed cadence**: the first tick fires one full interval after start, and
//!   missed ticks are delayed rather than bursted.
//! - **Per-event containment**: a publish failure is logged for that event and
//!   the rest of the batch still goes out.
//! - **Escalation**: consecutive cycles that exhaust their retries are counted.
//!   Reaching the threshold returns [`PollerError::Escalated`] to the caller,
//!   which is expected to stop the process. Any successful cycle resets the count.
//! - **Cooperative shutdown**: the cancellation token is observed at every tick
//!   boundary and while a cycle is in flight.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{FetchError, PollerError, PublishError};
use crate::models::TelemetryEvent;
use crate::retrieve::{retry, FetchStates, RetryPolicy};
use crate::transport::TopicProducer;

/// # Poller Settings
#[derive(Debug, Clone)]
pub struct PollerSettings {
    /// Time between ticks.
    pub interval: Duration,
    /// Retry policy wrapped around each fetch.
    pub retry: RetryPolicy,
    /// Consecutive failed cycles that trigger escalation.
    pub escalation_threshold: u32,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            escalation_threshold: 5,
        }
    }
}

/// Outcome of one successful fetch cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Records decoded from the upstream snapshot.
    pub fetched: usize,
    /// Events accepted by the topic.
    pub published: usize,
    /// Events that failed to encode or publish.
    pub failed: usize,
}

/// # Poller
///
/// Generic over the fetch seam and the topic backend so tests can drive it with
/// fakes and the in-memory topic.
pub struct Poller<F: ?Sized, P: ?Sized> {
    fetcher: Arc<F>,
    producer: Arc<P>,
    settings: PollerSettings,
}

impl<F, P> Poller<F, P>
where
    F: FetchStates + ?Sized,
    P: TopicProducer + ?Sized,
{
    /// Creates a poller. Nothing runs until [`Poller::run`] is awaited.
    pub fn new(fetcher: Arc<F>, producer: Arc<P>, settings: PollerSettings) -> Self {
        Self {
            fetcher,
            producer,
            settings,
        }
    }

    /// # Main Execution Loop
    ///
    /// Returns `Ok(())` when cancelled and `Err(PollerError::Escalated)` when the
    /// upstream stayed unavailable for `escalation_threshold` cycles in a row.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), PollerError> {
        let period = self.settings.interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures: u32 = 0;

        log::info!(
            "Poller started (interval {:?}, escalation after {} failed cycles)",
            period,
            self.settings.escalation_threshold
        );

        loop {
            // --- Phase 1: Wait for the next tick or shutdown ---
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // --- Phase 2: Fetch and publish ---
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    log::info!("Shutdown requested mid-cycle; abandoning current fetch.");
                    break;
                }
                outcome = self.cycle() => outcome,
            };

            // --- Phase 3: Track consecutive failures ---
            match outcome {
                Ok(report) => {
                    if failures > 0 {
                        log::info!("Upstream recovered after {} failed cycle(s).", failures);
                    }
                    failures = 0;
                    log::info!(
                        "Cycle complete: fetched={} published={} failed={}",
                        report.fetched,
                        report.published,
                        report.failed
                    );
                }
                Err(e) => {
                    failures += 1;
                    log::error!(
                        "Cycle failed after {} attempts ({}/{} consecutive): {}",
                        self.settings.retry.attempts.max(1),
                        failures,
                        self.settings.escalation_threshold,
                        e
                    );
                    if failures >= self.settings.escalation_threshold {
                        return Err(PollerError::Escalated {
                            failures,
                            last_error: e,
                        });
                    }
                }
            }
        }

        log::info!("Poller stopped.");
        Ok(())
    }

    /// Runs one fetch (with retries) and publishes the result.
    pub async fn cycle(&self) -> Result<CycleReport, FetchError> {
        let records = retry(&self.settings.retry, || self.fetcher.fetch_states()).await?;

        let mut report = CycleReport {
            fetched: records.len(),
            ..CycleReport::default()
        };
        for record in &records {
            let event = TelemetryEvent::from(record);
            match self.publish(&event).await {
                Ok(()) => report.published += 1,
                Err(e) => {
                    report.failed += 1;
                    log::warn!("Dropping event: {}", e);
                }
            }
        }
        Ok(report)
    }

    async fn publish(&self, event: &TelemetryEvent) -> Result<(), PublishError> {
        let payload = event.to_payload().map_err(|e| PublishError::Encode {
            key: event.icao24.clone(),
            reason: e.to_string(),
        })?;
        self.producer.publish(event.key(), &payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StateRecord;
    use crate::transport::memory::MemoryTopic;
    use crate::transport::TopicConsumer;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn record(icao24: &str) -> StateRecord {
        StateRecord {
            icao24: icao24.into(),
            callsign: None,
            origin_country: "Indonesia".into(),
            time_position: Some(1_700_000_000),
            last_contact: 1_700_000_000,
            longitude: None,
            latitude: Some(-6.12),
            baro_altitude: Some(3000.0),
            on_ground: false,
            velocity: None,
            true_track: None,
            vertical_rate: None,
            sensors: None,
            geo_altitude: None,
            squawk: None,
            spi: false,
            position_source: 0,
            category: None,
        }
    }

    /// Replays a script of outcomes, then repeats the fallback forever.
    struct ScriptedFetcher {
        script: Mutex<VecDeque<Result<Vec<StateRecord>, FetchError>>>,
        fallback: Result<Vec<StateRecord>, FetchError>,
        calls: AtomicU32,
    }

    impl ScriptedFetcher {
        fn new(
            script: Vec<Result<Vec<StateRecord>, FetchError>>,
            fallback: Result<Vec<StateRecord>, FetchError>,
        ) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                fallback,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl FetchStates for ScriptedFetcher {
        async fn fetch_states(&self) -> Result<Vec<StateRecord>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| self.fallback.clone())
        }
    }

    struct PickyProducer {
        refused: &'static str,
        accepted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TopicProducer for PickyProducer {
        async fn publish(&self, key: &str, _payload: &[u8]) -> Result<(), PublishError> {
            if key == self.refused {
                return Err(PublishError::Rejected {
                    key: key.into(),
                    reason: "full".into(),
                });
            }
            self.accepted.lock().unwrap().push(key.into());
            Ok(())
        }
    }

    fn fast_settings() -> PollerSettings {
        PollerSettings {
            interval: Duration::from_secs(10),
            retry: RetryPolicy {
                attempts: 3,
                initial_delay: Duration::from_secs(1),
                backoff_factor: 2.0,
            },
            escalation_threshold: 5,
        }
    }

    #[tokio::test]
    async fn cycle_publishes_each_event_keyed_by_icao24() {
        let fetcher = ScriptedFetcher::new(vec![], Ok(vec![record("a1"), record("b2")]));
        let (producer, mut consumer) = MemoryTopic::open("telemetry.raw");
        consumer.subscribe("telemetry.raw").await.unwrap();

        let poller = Poller::new(fetcher, Arc::new(producer), fast_settings());
        let report = poller.cycle().await.unwrap();
        assert_eq!(report, CycleReport { fetched: 2, published: 2, failed: 0 });

        for expected in ["a1", "b2"] {
            let msg = consumer.poll(Duration::from_millis(10)).await.unwrap().unwrap();
            assert_eq!(msg.key, expected);
            let event = TelemetryEvent::from_payload(&msg.payload).unwrap();
            assert_eq!(event.lon, 0.0);
            assert_eq!(event.velocity, 0.0);
        }
    }

    #[tokio::test]
    async fn one_failed_publish_does_not_abort_the_rest() {
        let fetcher = ScriptedFetcher::new(vec![], Ok(vec![record("a1"), record("bad"), record("c3")]));
        let producer = Arc::new(PickyProducer {
            refused: "bad",
            accepted: Mutex::new(Vec::new()),
        });

        let poller = Poller::new(fetcher, producer.clone(), fast_settings());
        let report = poller.cycle().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(*producer.accepted.lock().unwrap(), ["a1", "c3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn escalates_after_threshold_consecutive_failures() {
        let fetcher = ScriptedFetcher::new(vec![], Err(FetchError::Transport("down".into())));
        let (producer, _consumer) = MemoryTopic::open("t");
        let poller = Poller::new(fetcher.clone(), Arc::new(producer), fast_settings());

        let err = poller.run(CancellationToken::new()).await.unwrap_err();
        assert_eq!(
            err,
            PollerError::Escalated {
                failures: 5,
                last_error: FetchError::Transport("down".into()),
            }
        );
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 5 * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn a_success_resets_the_failure_count() {
        let down = || Err(FetchError::RateLimited);
        let mut script: Vec<_> = (0..4 * 3).map(|_| down()).collect();
        script.push(Ok(vec![record("a1")]));
        script.extend((0..4 * 3).map(|_| down()));
        let fetcher = ScriptedFetcher::new(script, Ok(vec![]));
        let (producer, _consumer) = MemoryTopic::open("t");
        let poller = Arc::new(Poller::new(fetcher.clone(), Arc::new(producer), fast_settings()));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let poller = poller.clone();
            let cancel = cancel.clone();
            async move { poller.run(cancel).await }
        });

        // Drain the whole script plus a few successful cycles afterwards.
        while !handle.is_finished() && fetcher.calls.load(Ordering::SeqCst) < 4 * 3 + 1 + 4 * 3 + 2 {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_waits_one_interval_and_cancel_stops_promptly() {
        let fetcher = ScriptedFetcher::new(vec![], Ok(vec![]));
        let (producer, _consumer) = MemoryTopic::open("t");
        let poller = Arc::new(Poller::new(fetcher.clone(), Arc::new(producer), fast_settings()));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn({
            let poller = poller.clone();
            let cancel = cancel.clone();
            async move { poller.run(cancel).await }
        });

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        cancel.cancel();
        assert_eq!(handle.await.unwrap(), Ok(()));
    }
}
