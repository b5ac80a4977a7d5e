use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::source::{EventSource, TransportError};
use super::types::{decode_frame, CommitEvent, Operation, StreamEvent};
use crate::constants::{APPLY_MAX_ATTEMPTS, APPLY_RETRY_DELAY, DEFAULT_CURSOR_STREAM, STATUS_COLLECTION};
use crate::lexicon::RecordValidator;
use crate::models::{now_timestamp, Change, Upsert};
use crate::stats::{FrameOutcome, IngestStats, SharedIngestStats};
use crate::store::{ApplyOutcome, CursorStore, Materializer, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("stream closed: {0}")]
    Closed(String),
    #[error("failed to read starting cursor")]
    Cursor(#[source] StoreError),
    #[error("failed to apply change for {uri}")]
    Apply {
        uri: String,
        #[source]
        source: StoreError,
    },
}

/// Called once each time the consumer stops on a failure.
pub type ErrorReporter = Arc<dyn Fn(ConsumerError) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerStatus {
    Stopped,
    Connecting,
    Streaming,
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Collections requested from the stream; commits for anything else are
    /// dropped before validation.
    pub collections: Vec<String>,
    /// Cursor row this consumer reads on start and offers positions to
    pub cursor_stream: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            collections: vec![STATUS_COLLECTION.to_string()],
            cursor_stream: DEFAULT_CURSOR_STREAM.to_string(),
        }
    }
}

/// Everything the ingestion pipeline reads from or writes to.
#[derive(Clone)]
pub struct ConsumerParts {
    pub source: Arc<dyn EventSource>,
    pub validator: Arc<dyn RecordValidator>,
    pub materializer: Materializer,
    pub cursors: CursorStore,
    pub stats: SharedIngestStats,
}

struct Pipeline {
    parts: ConsumerParts,
    config: ConsumerConfig,
    on_error: ErrorReporter,
    status_tx: watch::Sender<ConsumerStatus>,
}

struct RunningTask {
    cancel_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Single-connection consumer of the event stream.
///
/// Frames are handled strictly in arrival order on one task: decode, filter,
/// validate, apply, then offer the sequence to the cursor store. The consumer
/// never reconnects on its own; failures go to the error reporter and the
/// caller decides when to start again.
pub struct StreamConsumer {
    pipeline: Arc<Pipeline>,
    task: Mutex<Option<RunningTask>>,
}

impl StreamConsumer {
    pub fn new(parts: ConsumerParts, config: ConsumerConfig, on_error: ErrorReporter) -> Self {
        let (status_tx, _) = watch::channel(ConsumerStatus::Stopped);
        Self {
            pipeline: Arc::new(Pipeline {
                parts,
                config,
                on_error,
                status_tx,
            }),
            task: Mutex::new(None),
        }
    }

    /// Spawn the receive loop. Does nothing while a previous run is still
    /// active. Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|running| !running.handle.is_finished()) {
            debug!("Stream consumer already running");
            return;
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.pipeline.status_tx.send_replace(ConsumerStatus::Connecting);
        let pipeline = self.pipeline.clone();
        let handle = tokio::spawn(async move { pipeline.run(cancel_rx).await });
        *task = Some(RunningTask { cancel_tx, handle });
    }

    /// Cancel the pending receive and wait for the loop to exit. A change that
    /// was already decoded finishes applying first.
    pub async fn stop(&self) {
        let running = self.task.lock().take();
        if let Some(running) = running {
            let _ = running.cancel_tx.send(true);
            if let Err(e) = running.handle.await {
                warn!(error = %e, "Stream consumer task ended abnormally");
            }
        }
        self.pipeline.status_tx.send_replace(ConsumerStatus::Stopped);
    }

    pub fn status(&self) -> ConsumerStatus {
        *self.pipeline.status_tx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConsumerStatus> {
        self.pipeline.status_tx.subscribe()
    }

    pub fn stats(&self) -> IngestStats {
        self.pipeline.parts.stats.snapshot()
    }
}

/// Resolves once `stop()` has been requested or the consumer handle is gone.
pub(crate) async fn cancelled(cancel_rx: &mut watch::Receiver<bool>) {
    let _ = cancel_rx.wait_for(|cancel| *cancel).await;
}

impl Pipeline {
    async fn run(self: Arc<Self>, mut cancel_rx: watch::Receiver<bool>) {
        match self.consume(&mut cancel_rx).await {
            Ok(()) => info!("Stream consumer stopped"),
            Err(e) => {
                warn!(error = %e, "Stream consumer stopped on failure");
                (self.on_error)(e);
            }
        }
        self.status_tx.send_replace(ConsumerStatus::Stopped);
    }

    async fn consume(&self, cancel_rx: &mut watch::Receiver<bool>) -> Result<(), ConsumerError> {
        let stream = &self.config.cursor_stream;
        let cursor = self.parts.cursors.read(stream).map_err(ConsumerError::Cursor)?;
        info!(stream = %stream, cursor = ?cursor, "Connecting to event stream");

        let mut frames = tokio::select! {
            _ = cancelled(cancel_rx) => return Ok(()),
            connected = self.parts.source.connect(cursor, &self.config.collections) => connected?,
        };
        self.status_tx.send_replace(ConsumerStatus::Streaming);

        loop {
            let next = tokio::select! {
                _ = cancelled(cancel_rx) => return Ok(()),
                next = frames.next() => next,
            };
            match next {
                Some(Ok(text)) => self.handle_frame(&text).await?,
                Some(Err(e)) => return Err(e.into()),
                None => return Err(ConsumerError::Closed("stream ended".to_string())),
            }
        }
    }

    async fn handle_frame(&self, text: &str) -> Result<(), ConsumerError> {
        let event = match decode_frame(text) {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "Skipping undecodable frame");
                self.parts.stats.record(FrameOutcome::Undecodable, None);
                return Ok(());
            }
        };

        let sequence = event.sequence();
        let outcome = match event {
            StreamEvent::Commit(commit) => match self.handle_commit(&commit).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.parts.stats.record(FrameOutcome::ApplyFailed, Some(sequence));
                    return Err(e);
                }
            },
            StreamEvent::Identity { .. } | StreamEvent::Account { .. } => FrameOutcome::Ignored,
        };
        self.offer_cursor(sequence);
        self.parts.stats.record(outcome, Some(sequence));
        Ok(())
    }

    async fn handle_commit(&self, commit: &CommitEvent) -> Result<FrameOutcome, ConsumerError> {
        if !self.config.collections.iter().any(|c| *c == commit.collection) {
            return Ok(FrameOutcome::Filtered);
        }

        let uri = commit.uri().to_string();
        let change = match commit.operation {
            Operation::Create | Operation::Update => {
                let Some(record) = commit.record.as_ref() else {
                    debug!(uri = %uri, "Commit without a record body");
                    return Ok(FrameOutcome::Rejected);
                };
                match self.parts.validator.validate(record, &commit.collection) {
                    Ok(fields) => Change::Upsert(Upsert {
                        uri,
                        author_did: commit.did.clone(),
                        fields,
                        indexed_at: now_timestamp(),
                        sequence: Some(commit.sequence),
                    }),
                    Err(rejection) => {
                        debug!(uri = %uri, reason = %rejection, "Rejected record");
                        return Ok(FrameOutcome::Rejected);
                    }
                }
            }
            Operation::Delete => Change::Delete {
                uri,
                sequence: Some(commit.sequence),
            },
        };

        let outcome = self.apply_with_retry(&change).await?;
        Ok(FrameOutcome::Applied(outcome))
    }

    async fn apply_with_retry(&self, change: &Change) -> Result<ApplyOutcome, ConsumerError> {
        let mut attempt = 1;
        loop {
            match self.parts.materializer.apply(change) {
                Ok(outcome) => return Ok(outcome),
                Err(e) if attempt < APPLY_MAX_ATTEMPTS => {
                    warn!(uri = change.uri(), attempt, error = %e, "Apply failed, retrying");
                    tokio::time::sleep(APPLY_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(ConsumerError::Apply {
                        uri: change.uri().to_string(),
                        source: e,
                    })
                }
            }
        }
    }

    fn offer_cursor(&self, sequence: i64) {
        let stream = &self.config.cursor_stream;
        match self.parts.cursors.write_throttled(stream, sequence) {
            Ok(true) => {
                if let Err(e) = self.parts.materializer.prune_tombstones(sequence) {
                    warn!(error = %e, "Failed to prune tombstones");
                }
            }
            Ok(false) => {}
            // the next durable write carries a later position anyway
            Err(e) => warn!(stream = %stream, sequence, error = %e, "Failed to write cursor"),
        }
    }
}
