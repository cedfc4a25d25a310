//! The drain loop.
//!
//! Connects the buffer accessor and the database client into the feeder's
//! cycle: acquire the exclusive lock, snapshot the buffer, bulk-load the
//! snapshot, truncate what was committed, release the lock, sleep. The
//! ordering within a cycle is the correctness property that prevents lost
//! or duplicated rows: truncation happens only after the server confirmed
//! the commit, and the lock covers the whole window.

mod signal;

use snafu::prelude::*;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::BufferFile;
use crate::client::PgClient;
use crate::config::Config;
use crate::emit;
use crate::error::{BufferSnafu, ConnectionSnafu, FeederError, LoadSnafu};
use crate::metrics::events::{BatchCommitted, CycleCompleted, CycleOutcome};

/// Statistics about the feeder run.
#[derive(Debug, Clone, Default)]
pub struct FeederStats {
    pub cycles: usize,
    pub batches_committed: usize,
    pub bytes_committed: u64,
    pub rows_committed: u64,
}

/// Result of a single drain cycle.
enum IterationResult {
    /// A batch was committed and the buffer trimmed.
    Drained { bytes: u64, rows: u64 },
    /// The buffer was empty; no protocol exchange was issued.
    Empty,
}

/// The feeder: one buffer file, one connection, one control flow.
#[derive(Debug)]
pub struct Feeder {
    config: Config,
    client: PgClient,
    buffer: BufferFile,
    stats: FeederStats,
    shutdown: CancellationToken,
}

impl Feeder {
    /// Connect to the database and adopt the buffer file.
    ///
    /// Exactly one connection attempt: if the server is unreachable the
    /// feeder exits and the supervisor decides when to try again. No lock
    /// is taken here; locking is strictly per-cycle.
    pub async fn new(config: Config, shutdown: CancellationToken) -> Result<Self, FeederError> {
        let buffer = match &config.buffer {
            Some(path) => BufferFile::open(path),
            None => BufferFile::from_stdin(),
        }
        .context(BufferSnafu)?;

        let mut client = PgClient::connect(config.conninfo.as_deref().unwrap_or(""))
            .await
            .context(ConnectionSnafu)?;
        client.verbose = config.verbose;

        Ok(Self {
            config,
            client,
            buffer,
            stats: FeederStats::default(),
            shutdown,
        })
    }

    /// Run drain cycles until shutdown is requested or an error occurs.
    ///
    /// The inter-cycle sleep races the cancellation token, so shutdown
    /// latency is bounded by the in-flight cycle, never by the poll
    /// interval. Errors are fatal: the loop neither retries nor backs off,
    /// and a load failure leaves the buffer untouched for the next run.
    pub async fn run(mut self) -> Result<FeederStats, FeederError> {
        let poll_interval = Duration::from_secs(self.config.poll_interval_secs);
        info!(relation = %self.config.relation, "Feeder ready");

        loop {
            if self.shutdown.is_cancelled() {
                info!("Shutdown requested");
                break;
            }

            match self.drain_cycle().await? {
                IterationResult::Drained { bytes, rows } => {
                    self.stats.batches_committed += 1;
                    self.stats.bytes_committed += bytes;
                    self.stats.rows_committed += rows;
                    info!(bytes, rows, "Batch committed");
                }
                IterationResult::Empty => {
                    debug!(
                        "Buffer empty, waiting {}s before next poll",
                        poll_interval.as_secs()
                    );
                }
            }
            self.stats.cycles += 1;

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested during poll wait");
                    break;
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }

        if let Err(e) = self.client.close().await {
            warn!("Connection teardown failed: {e}");
        }
        info!("Feeder stopped: {:?}", self.stats);
        Ok(self.stats)
    }

    /// One pass over the buffer: lock ≺ snapshot ≺ load ≺ truncate ≺ unlock.
    ///
    /// The guard releases the lock on drop, so a failed load still unlocks
    /// while leaving the buffer bytes in place.
    async fn drain_cycle(&mut self) -> Result<IterationResult, FeederError> {
        let guard = self.buffer.lock().await.context(BufferSnafu)?;

        let Some(snapshot) = guard.snapshot().context(BufferSnafu)? else {
            emit!(CycleCompleted {
                outcome: CycleOutcome::Empty
            });
            return Ok(IterationResult::Empty);
        };

        let bytes = snapshot.len();
        let rows = self
            .client
            .copy_in(&self.config.relation, snapshot.bytes())
            .await
            .context(LoadSnafu)?;

        let consumed = guard
            .consume(snapshot, self.config.truncate)
            .context(BufferSnafu)?;
        debug_assert_eq!(consumed, bytes);

        emit!(BatchCommitted { bytes, rows });
        emit!(CycleCompleted {
            outcome: CycleOutcome::Drained
        });
        Ok(IterationResult::Drained { bytes, rows })
    }
}

/// Run the feeder with the given configuration.
///
/// Wires the signal handler to a cancellation token and drives the drain
/// loop to completion.
pub async fn run_feeder(config: Config) -> Result<FeederStats, FeederError> {
    let shutdown = CancellationToken::new();

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            signal::shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let feeder = Feeder::new(config, shutdown).await?;
    feeder.run().await
}
