use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::firehose::consumer::cancelled;
use crate::firehose::{ConsumerConfig, ConsumerError, ConsumerParts, ConsumerStatus, StreamConsumer};
use crate::stats::IngestStats;
use crate::store::{CursorStore, StoreError};

/// Exponential reconnect delay
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first reconnect
    pub initial: Duration,
    /// Upper bound before jitter
    pub max: Duration,
    /// Growth factor per consecutive failure
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Delay after `retries` consecutive failures, with 50% to 150% jitter.
    #[must_use]
    pub fn duration(&self, retries: u32, rng: &mut impl Rng) -> Duration {
        let exponent = i32::try_from(retries).unwrap_or(i32::MAX);
        let base = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max.as_secs_f64());
        let jitter_factor = rng.random_range(0.5..1.5);
        Duration::from_secs_f64(capped * jitter_factor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Connecting,
    Streaming,
    Backoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorEvent {
    Start,
    Connected,
    Failed,
    BackoffElapsed,
    Stop,
}

/// Next supervisor state. Events that make no sense in the current state
/// leave it unchanged.
pub fn transition(state: SupervisorState, event: SupervisorEvent) -> SupervisorState {
    use SupervisorEvent as E;
    use SupervisorState as S;

    match (state, event) {
        (_, E::Stop) => S::Stopped,
        (S::Stopped, E::Start) => S::Connecting,
        (S::Connecting, E::Connected) => S::Streaming,
        (S::Connecting | S::Streaming, E::Failed) => S::Backoff,
        (S::Backoff, E::BackoffElapsed) => S::Connecting,
        (state, _) => state,
    }
}

struct SupervisorInner {
    consumer: StreamConsumer,
    backoff: BackoffConfig,
    state_tx: watch::Sender<SupervisorState>,
    failures: tokio::sync::Mutex<mpsc::UnboundedReceiver<ConsumerError>>,
    /// Consecutive failed connections without a handled frame
    retries: AtomicU32,
}

impl SupervisorInner {
    fn apply(&self, event: SupervisorEvent) -> SupervisorState {
        let mut next = SupervisorState::Stopped;
        self.state_tx.send_modify(|state| {
            next = transition(*state, event);
            *state = next;
        });
        next
    }

    fn state(&self) -> SupervisorState {
        *self.state_tx.borrow()
    }

    async fn supervise(self: Arc<Self>, mut cancel_rx: watch::Receiver<bool>) {
        let mut failures = self.failures.lock().await;
        // failures from a previous run were already handled by it
        while failures.try_recv().is_ok() {}

        let mut status_rx = self.consumer.subscribe_status();
        let mut rng = StdRng::from_os_rng();
        self.retries.store(0, Ordering::Relaxed);

        loop {
            let handled_before = self.consumer.stats().handled();
            self.consumer.start();

            let error = loop {
                tokio::select! {
                    _ = cancelled(&mut cancel_rx) => return,
                    Some(error) = failures.recv() => break error,
                    Ok(()) = status_rx.changed() => {
                        let status = *status_rx.borrow_and_update();
                        if status == ConsumerStatus::Streaming
                            && self.state() == SupervisorState::Connecting
                        {
                            self.apply(SupervisorEvent::Connected);
                            info!("Ingestion streaming");
                        }
                    }
                }
            };

            self.apply(SupervisorEvent::Failed);
            self.consumer.stop().await;

            // a connection that fails before handling any frame keeps growing
            // the delay, even if it reached Streaming
            if self.consumer.stats().handled() > handled_before {
                self.retries.store(0, Ordering::Relaxed);
            }
            let retries = self.retries.load(Ordering::Relaxed);
            let delay = self.backoff.duration(retries, &mut rng);
            self.retries.store(retries.saturating_add(1), Ordering::Relaxed);
            warn!(error = %error, retries, delay_ms = delay.as_millis() as u64, "Ingestion failed, reconnecting after backoff");

            tokio::select! {
                _ = cancelled(&mut cancel_rx) => return,
                _ = tokio::time::sleep(delay) => {}
            }
            self.apply(SupervisorEvent::BackoffElapsed);
        }
    }
}

struct RunningTask {
    cancel_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Keeps one stream consumer running, reconnecting with backoff after each
/// failure until stopped.
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
    cursors: CursorStore,
    cursor_stream: String,
    task: Mutex<Option<RunningTask>>,
}

impl Supervisor {
    pub fn new(parts: ConsumerParts, config: ConsumerConfig, backoff: BackoffConfig) -> Self {
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        let cursors = parts.cursors.clone();
        let cursor_stream = config.cursor_stream.clone();
        let consumer = StreamConsumer::new(
            parts,
            config,
            Arc::new(move |error| {
                let _ = failure_tx.send(error);
            }),
        );
        let (state_tx, _) = watch::channel(SupervisorState::Stopped);

        Self {
            inner: Arc::new(SupervisorInner {
                consumer,
                backoff,
                state_tx,
                failures: tokio::sync::Mutex::new(failure_rx),
                retries: AtomicU32::new(0),
            }),
            cursors,
            cursor_stream,
            task: Mutex::new(None),
        }
    }

    /// Begin ingesting. Does nothing when already running. Must be called
    /// from within a tokio runtime.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        if self.inner.apply(SupervisorEvent::Start) != SupervisorState::Connecting {
            return;
        }

        info!(stream = %self.cursor_stream, "Starting ingestion supervisor");
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.supervise(cancel_rx).await });
        *task = Some(RunningTask { cancel_tx, handle });
    }

    /// Stop reconnecting, stop the consumer, and persist the last offered
    /// cursor position.
    pub async fn stop(&self) -> Result<(), StoreError> {
        let running = self.task.lock().take();
        if let Some(running) = running {
            let _ = running.cancel_tx.send(true);
            if let Err(e) = running.handle.await {
                warn!(error = %e, "Supervisor task ended abnormally");
            }
        }
        self.inner.consumer.stop().await;
        self.inner.apply(SupervisorEvent::Stop);

        if let Some(seq) = self.cursors.last_offered(&self.cursor_stream) {
            self.cursors.force_write(&self.cursor_stream, seq)?;
            info!(stream = %self.cursor_stream, seq, "Saved cursor on shutdown");
        }
        Ok(())
    }

    pub fn state(&self) -> SupervisorState {
        self.inner.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SupervisorState> {
        self.inner.state_tx.subscribe()
    }

    pub fn stats(&self) -> IngestStats {
        self.inner.consumer.stats()
    }

    /// Failed connections since the last one that handled a frame
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.retries.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firehose::consumer::tests::{create_frame, parts, wait_until, FakeSource};
    use crate::store::{count_statuses, Database};
    use SupervisorEvent as E;
    use SupervisorState as S;

    #[test]
    fn test_transitions() {
        assert_eq!(transition(S::Stopped, E::Start), S::Connecting);
        assert_eq!(transition(S::Connecting, E::Connected), S::Streaming);
        assert_eq!(transition(S::Connecting, E::Failed), S::Backoff);
        assert_eq!(transition(S::Streaming, E::Failed), S::Backoff);
        assert_eq!(transition(S::Backoff, E::BackoffElapsed), S::Connecting);
        for state in [S::Stopped, S::Connecting, S::Streaming, S::Backoff] {
            assert_eq!(transition(state, E::Stop), S::Stopped);
        }
    }

    #[test]
    fn test_out_of_place_events_keep_state() {
        assert_eq!(transition(S::Stopped, E::Failed), S::Stopped);
        assert_eq!(transition(S::Stopped, E::Connected), S::Stopped);
        assert_eq!(transition(S::Streaming, E::Start), S::Streaming);
        assert_eq!(transition(S::Backoff, E::Connected), S::Backoff);
        assert_eq!(transition(S::Connecting, E::BackoffElapsed), S::Connecting);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = BackoffConfig {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
            multiplier: 2.0,
        };
        let mut rng = StdRng::seed_from_u64(7);

        for retries in 0..10 {
            let base = (0.1 * 2f64.powi(retries as i32)).min(1.0);
            let delay = config.duration(retries, &mut rng).as_secs_f64();
            assert!(delay >= base * 0.5 - 1e-9, "retry {retries}: {delay}");
            assert!(delay <= base * 1.5 + 1e-9, "retry {retries}: {delay}");
        }
        let huge = config.duration(u32::MAX, &mut rng);
        assert!(huge <= Duration::from_millis(1500));
    }

    fn fast_backoff() -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(50),
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_reconnects_from_cursor_after_failure() {
        let db = Database::in_memory().unwrap();
        let source = Arc::new(FakeSource::default());
        let first = source.push_connection();
        let second = source.push_connection();
        let supervisor = Supervisor::new(
            parts(&db, source.clone(), Duration::ZERO),
            ConsumerConfig::default(),
            fast_backoff(),
        );

        supervisor.start();
        wait_until(|| supervisor.state() == S::Streaming).await;
        first.unbounded_send(Ok(create_frame("did:plc:a", "r1", 10, "👍"))).unwrap();
        wait_until(|| supervisor.stats().upserted == 1).await;

        drop(first);
        wait_until(|| source.connects() == 2).await;
        wait_until(|| supervisor.state() == S::Streaming).await;
        assert_eq!(*source.cursors.lock(), vec![None, Some(10)]);

        assert_eq!(supervisor.consecutive_failures(), 1);

        second.unbounded_send(Ok(create_frame("did:plc:a", "r2", 11, "👎"))).unwrap();
        wait_until(|| supervisor.stats().upserted == 2).await;
        assert_eq!(count_statuses(&db).unwrap(), 2);

        supervisor.stop().await.unwrap();
        assert_eq!(supervisor.state(), S::Stopped);
    }

    #[tokio::test]
    async fn test_keeps_retrying_while_source_is_down() {
        let db = Database::in_memory().unwrap();
        let source = Arc::new(FakeSource::default());
        let supervisor = Supervisor::new(
            parts(&db, source.clone(), Duration::ZERO),
            ConsumerConfig::default(),
            fast_backoff(),
        );

        supervisor.start();
        wait_until(|| source.connects() >= 3).await;
        assert_ne!(supervisor.state(), S::Streaming);

        supervisor.stop().await.unwrap();
        assert_eq!(supervisor.state(), S::Stopped);
    }

    #[tokio::test]
    async fn test_stop_saves_last_offered_cursor() {
        let db = Database::in_memory().unwrap();
        let source = Arc::new(FakeSource::default());
        let tx = source.push_connection();
        let supervisor = Supervisor::new(
            parts(&db, source.clone(), Duration::from_secs(30)),
            ConsumerConfig::default(),
            fast_backoff(),
        );
        let cursors = CursorStore::new(&db);

        supervisor.start();
        for seq in 1..=3 {
            tx.unbounded_send(Ok(create_frame("did:plc:a", &format!("r{seq}"), seq, "👍")))
                .unwrap();
        }
        wait_until(|| supervisor.stats().upserted == 3).await;
        assert_eq!(cursors.read("jetstream").unwrap(), Some(1));

        supervisor.stop().await.unwrap();
        assert_eq!(cursors.read("jetstream").unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_backoff_grows_when_connections_fail_before_any_frame_is_handled() {
        let db = Database::in_memory().unwrap();
        let source = Arc::new(FakeSource::default());
        let senders: Vec<_> = (0..4)
            .map(|i| {
                let tx = source.push_connection();
                tx.unbounded_send(Ok(create_frame("did:plc:a", &format!("r{i}"), 10 + i, "👍")))
                    .unwrap();
                tx
            })
            .collect();
        db.connection().lock().execute("DROP TABLE status", []).unwrap();
        let supervisor = Supervisor::new(
            parts(&db, source.clone(), Duration::ZERO),
            ConsumerConfig::default(),
            fast_backoff(),
        );

        supervisor.start();
        wait_until(|| source.connects() >= 4).await;
        // every connection reached Streaming, then failed on apply
        assert!(supervisor.consecutive_failures() >= 3);
        assert_eq!(supervisor.stats().handled(), 0);
        assert!(supervisor.stats().apply_failures >= 3);
        assert!(source.cursors.lock().iter().all(Option::is_none));

        supervisor.stop().await.unwrap();
        drop(senders);
    }
}
