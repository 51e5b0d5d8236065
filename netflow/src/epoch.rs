//! Monotonic clock shared with the NAT program.
//!
//! The kernel program stamps connection tracking entries with the value
//! found at [`NatConfigKey::CurrentEpoch`], the seconds elapsed since the
//! epoch started.

use crate::{
    codec::NatConfigKey,
    error::NetflowError,
    map::Map,
    sink::{ErrorSink, NoopErrorSink},
};
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};

pub const DEFAULT_EPOCH_SYNC_WINDOW: Duration = Duration::from_secs(1);

#[derive(Default)]
struct State {
    ticker: Option<JoinHandle<()>>,
    started: bool,
    done: bool,
}

#[derive(Clone)]
pub struct Epoch {
    config: Arc<Map<NatConfigKey, u32>>,
    start: Instant,
    errors: Arc<dyn ErrorSink>,
    state: Arc<Mutex<State>>,
}

impl Epoch {
    pub fn new(config: Arc<Map<NatConfigKey, u32>>) -> Self {
        Self {
            config,
            start: Instant::now(),
            errors: Arc::new(NoopErrorSink),
            state: Arc::default(),
        }
    }

    pub fn with_start(self, start: Instant) -> Self {
        Self { start, ..self }
    }

    pub fn with_error_sink(self, errors: Arc<dyn ErrorSink>) -> Self {
        Self { errors, ..self }
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    /// Seconds since start, saturated to the width of the kernel slot.
    pub fn current(&self) -> u32 {
        self.start.elapsed().as_secs().min(u32::MAX as u64) as u32
    }

    /// Writes the current epoch, does nothing once stopped.
    pub fn sync(&self) -> Result<(), NetflowError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.done {
            return Ok(());
        }

        self.config.put(&NatConfigKey::CurrentEpoch, &self.current())
    }

    /// Writes the epoch every `interval` until stopped. Failed writes are
    /// reported to the error sink and retried on the next tick.
    pub fn start_sync(&self, interval: Duration) -> Result<(), NetflowError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.started {
            return Err(NetflowError::AlreadySyncing);
        }
        state.started = true;

        let epoch = self.clone();
        state.ticker = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = epoch.sync() {
                    epoch.errors.on_error(e);
                }
            }
        }));

        Ok(())
    }

    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.done = true;
        if let Some(ticker) = state.ticker.take() {
            ticker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sink::testing::RecordingErrorSink, table::MemTable};

    fn config_map() -> Arc<Map<NatConfigKey, u32>> {
        Arc::new(Map::new(MemTable::array("nat_config", 4, 4)).unwrap())
    }

    fn written(map: &Map<NatConfigKey, u32>) -> u32 {
        map.get(&NatConfigKey::CurrentEpoch).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn sync_writes_elapsed_seconds() {
        let map = config_map();
        let epoch = Epoch::new(map.clone()).with_start(Instant::now() - Duration::from_secs(5));

        epoch.sync().unwrap();
        assert!(written(&map) >= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn epoch_is_monotonic() {
        let map = config_map();
        let epoch = Epoch::new(map.clone());

        epoch.sync().unwrap();
        let first = written(&map);
        tokio::time::advance(Duration::from_secs(3)).await;
        epoch.sync().unwrap();
        let second = written(&map);

        assert_eq!(second - first, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_keeps_writing() {
        let map = config_map();
        let epoch = Epoch::new(map.clone());

        epoch.start_sync(DEFAULT_EPOCH_SYNC_WINDOW).unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(written(&map), 2);

        epoch.stop();
        tokio::time::sleep(Duration::from_secs(3)).await;
        epoch.sync().unwrap();
        assert_eq!(written(&map), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_fails() {
        let epoch = Epoch::new(config_map());
        epoch.start_sync(Duration::from_secs(1)).unwrap();
        assert!(matches!(
            epoch.start_sync(Duration::from_secs(1)),
            Err(NetflowError::AlreadySyncing)
        ));
        epoch.stop();
        epoch.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn failures_go_to_the_error_sink() {
        // no room for the epoch slot
        let map = Arc::new(Map::new(MemTable::hash("nat_config", 4, 4, 0)).unwrap());
        let errors = RecordingErrorSink::default();
        let epoch = Epoch::new(map).with_error_sink(Arc::new(errors.clone()));

        epoch.start_sync(Duration::from_secs(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(3500)).await;
        epoch.stop();

        assert_eq!(errors.errors().len(), 3);
    }
}
