use crate::{
    codec::{ConnIdent, ConnMeta},
    error::NetflowError,
    map::{BatchOptions, Map},
    sink::{ErrorSink, NoopErrorSink},
    stats,
};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError, TryLockError},
    time::Duration,
};
use tokio::{
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};

pub const DEFAULT_HIGH_WATER_MARK: f64 = 0.7;
/// Marks below this are replaced by [`DEFAULT_HIGH_WATER_MARK`]
pub const MIN_HIGH_WATER_MARK: f64 = 0.1;
pub const DEFAULT_CLEANUP_WINDOW: Duration = Duration::from_secs(5);

/// Result of a cleanup pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CleanupOutcome {
    /// Entries left in the table
    pub entries: usize,
    pub evicted: usize,
}

/// Evicts the least recently observed connections once the fill ratio of
/// the `conn_track` table reaches the high-water mark.
#[derive(Clone)]
pub struct ConnTrackCleaner {
    map: Arc<Map<ConnIdent, ConnMeta>>,
    errors: Arc<dyn ErrorSink>,
    high_water_mark: f64,
    ifname: Arc<str>,
    // held for the duration of a pass
    pass: Arc<Mutex<()>>,
    ticker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ConnTrackCleaner {
    pub fn new(
        map: Arc<Map<ConnIdent, ConnMeta>>,
        errors: Option<Arc<dyn ErrorSink>>,
        high_water_mark: f64,
        ifname: &str,
    ) -> Self {
        Self {
            map,
            errors: errors.unwrap_or_else(|| Arc::new(NoopErrorSink)),
            high_water_mark,
            ifname: Arc::from(ifname),
            pass: Arc::default(),
            ticker: Arc::default(),
        }
    }

    pub fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }

    /// Runs [`Self::cleanup`] every `interval`.
    pub fn start(&self, interval: Duration) -> Result<(), NetflowError> {
        let mut ticker = self.ticker.lock().unwrap_or_else(PoisonError::into_inner);
        if ticker.is_some() {
            return Err(NetflowError::CleanupAlreadyRunning);
        }

        let cleaner = self.clone();
        *ticker = Some(tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + interval, interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                cleaner.cleanup();
            }
        }));

        log::debug!(
            "[{}] conn_track cleanup every {:?}, high-water mark {}",
            self.ifname,
            interval,
            self.high_water_mark
        );
        Ok(())
    }

    pub fn stop(&self) {
        let ticker = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(ticker) = ticker {
            ticker.abort();
        }
    }

    /// Single cleanup pass. Returns `None` if another pass is in progress
    /// or the pass failed, the failure going to the error sink.
    pub fn cleanup(&self) -> Option<CleanupOutcome> {
        let _pass = match self.pass.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => {
                log::debug!("[{}] conn_track cleanup already running", self.ifname);
                return None;
            }
        };

        let current = match self.map.get_all(BatchOptions::default()) {
            Ok(current) => current,
            Err(e) => {
                self.errors.on_error(e);
                return None;
            }
        };

        let mut by_timestamp: BTreeMap<u32, Vec<ConnIdent>> = BTreeMap::new();
        for (ident, meta) in current.iter() {
            by_timestamp
                .entry(meta.last_observed)
                .or_default()
                .push(*ident);
        }

        let cap = self.map.cap().max(1) as f64;
        let fill = current.len() as f64 / cap;
        if fill < self.high_water_mark {
            stats::set_conntrack_entries(&self.ifname, current.len());
            return Some(CleanupOutcome {
                entries: current.len(),
                evicted: 0,
            });
        }

        // ceil((fill - hwm) * cap) without the rounding error of the subtraction
        let keep = (self.high_water_mark * cap).floor() as usize;
        let min_to_delete = current.len().saturating_sub(keep);
        let mut to_delete = Vec::with_capacity(min_to_delete);
        for keys in by_timestamp.into_values() {
            if to_delete.len() >= min_to_delete {
                break;
            }
            // whole buckets only, entries of the same age go together
            to_delete.extend(keys);
        }

        if let Err(e) = self.map.delete_all(&to_delete, BatchOptions::default()) {
            self.errors.on_error(e);
            return None;
        }

        let outcome = CleanupOutcome {
            entries: current.len() - to_delete.len(),
            evicted: to_delete.len(),
        };
        stats::set_conntrack_entries(&self.ifname, outcome.entries);
        log::debug!(
            "[{}] conn_track evicted {} entries, {} left",
            self.ifname,
            outcome.evicted,
            outcome.entries
        );

        Some(outcome)
    }
}
