//! # Batch Governor
//!
//! Buffers accepted and ignored records in memory and persists them once
//! traffic has been quiet for the save delay. A burst therefore costs one
//! write per store instead of one per record.
//!
//! Buffers are swapped out under a short lock before any I/O, so records
//! arriving during a flush land in the next batch. A failed write is logged
//! and the batch is discarded; the live path never waits on disk.

use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::record::MessageRecord;
use super::store::JsonStore;

#[derive(Debug, Default)]
struct Pending {
    accepted: Vec<MessageRecord>,
    ignored: Vec<MessageRecord>,
    last_message: Option<Instant>,
}

/// Result of one flush.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub accepted: usize,
    pub ignored: usize,
    /// Records dropped because their store write failed.
    pub discarded: usize,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        self.accepted + self.ignored + self.discarded == 0
    }
}

#[derive(Debug)]
pub struct BatchGovernor {
    save_delay: Duration,
    pending: Mutex<Pending>,
    accepted_store: Arc<JsonStore>,
    ignored_store: Arc<JsonStore>,
    flushing: tokio::sync::Mutex<()>,
    flush_count: AtomicU64,
}

impl BatchGovernor {
    pub fn new(
        accepted_store: Arc<JsonStore>,
        ignored_store: Arc<JsonStore>,
        save_delay: Duration,
    ) -> Self {
        Self {
            save_delay,
            pending: Mutex::new(Pending::default()),
            accepted_store,
            ignored_store,
            flushing: tokio::sync::Mutex::new(()),
            flush_count: AtomicU64::new(0),
        }
    }

    pub fn accepted_store(&self) -> &Arc<JsonStore> {
        &self.accepted_store
    }

    pub fn ignored_store(&self) -> &Arc<JsonStore> {
        &self.ignored_store
    }

    pub fn save_delay(&self) -> Duration {
        self.save_delay
    }

    pub fn enqueue_accepted(&self, record: MessageRecord) {
        let mut pending = self.lock_pending();
        pending.accepted.push(record);
        pending.last_message = Some(Instant::now());
    }

    pub fn enqueue_ignored(&self, record: MessageRecord) {
        let mut pending = self.lock_pending();
        pending.ignored.push(record);
        pending.last_message = Some(Instant::now());
    }

    /// Buffered `(accepted, ignored)` record counts.
    pub fn pending_counts(&self) -> (usize, usize) {
        let pending = self.lock_pending();
        (pending.accepted.len(), pending.ignored.len())
    }

    /// Number of flushes that moved at least one record.
    pub fn flush_count(&self) -> u64 {
        self.flush_count.load(Ordering::Relaxed)
    }

    /// True once no record has arrived for a full save delay.
    pub fn is_quiet(&self) -> bool {
        match self.lock_pending().last_message {
            Some(last) => last.elapsed() >= self.save_delay,
            None => true,
        }
    }

    /// Flushes only when traffic has gone quiet.
    pub async fn flush_if_quiet(&self) -> FlushReport {
        if !self.is_quiet() {
            return FlushReport::default();
        }
        self.flush().await
    }

    /// Writes both buffers now, regardless of recent traffic.
    pub async fn flush(&self) -> FlushReport {
        let _flushing = self.flushing.lock().await;

        let (accepted, ignored) = {
            let mut pending = self.lock_pending();
            (mem::take(&mut pending.accepted), mem::take(&mut pending.ignored))
        };

        let mut report = FlushReport::default();
        match write_batch(&self.accepted_store, accepted, "accepted").await {
            Ok(n) => report.accepted = n,
            Err(n) => report.discarded += n,
        }
        match write_batch(&self.ignored_store, ignored, "ignored").await {
            Ok(n) => report.ignored = n,
            Err(n) => report.discarded += n,
        }

        if !report.is_empty() {
            self.flush_count.fetch_add(1, Ordering::Relaxed);
        }
        report
    }

    /// Ticks every save delay until `cancel` fires, then flushes whatever is
    /// left.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let period = self.save_delay.max(Duration::from_millis(10));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        log::info!("Batch governor started (save delay {:?})", self.save_delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.flush_if_quiet().await;
                }
            }
        }

        let report = self.flush().await;
        log::info!(
            "Batch governor stopped. Final flush: {} accepted, {} ignored, {} discarded",
            report.accepted,
            report.ignored,
            report.discarded
        );
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().expect("Governor lock poisoned")
    }
}

/// `Ok(written)` or `Err(discarded)`.
async fn write_batch(
    store: &JsonStore,
    batch: Vec<MessageRecord>,
    label: &str,
) -> Result<usize, usize> {
    if batch.is_empty() {
        return Ok(0);
    }

    match store.append(&batch).await {
        Ok(total) => {
            log::info!(
                "Saved {} {} message(s) to {} ({} total)",
                batch.len(),
                label,
                store.path().display(),
                total
            );
            Ok(batch.len())
        }
        Err(e) => {
            log::error!(
                "Failed to save {} {} message(s), batch discarded: {}",
                batch.len(),
                label,
                e
            );
            Err(batch.len())
        }
    }
}
