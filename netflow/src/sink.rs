use crate::{codec::PacketRecord, error::NetflowError};
use std::sync::{Arc, PoisonError, RwLock};

/// Receives failures of background tasks: cleanup, epoch sync and capture.
pub trait ErrorSink: Send + Sync {
    fn on_error(&self, err: NetflowError);
}

/// Receives every packet emitted by a monitoring firewall.
pub trait PacketSink: Send + Sync {
    fn on_observed_packet(&self, pkt: &PacketRecord);
}

impl<F> ErrorSink for F
where
    F: Fn(NetflowError) + Send + Sync,
{
    fn on_error(&self, err: NetflowError) {
        self(err)
    }
}

impl<F> PacketSink for F
where
    F: Fn(&PacketRecord) + Send + Sync,
{
    fn on_observed_packet(&self, pkt: &PacketRecord) {
        self(pkt)
    }
}

/// Discards every error.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopErrorSink;

impl ErrorSink for NoopErrorSink {
    fn on_error(&self, _err: NetflowError) {}
}

/// Error sink slot shared by a service and its interfaces so that a sink
/// replaced at runtime reaches the tasks already running.
#[derive(Clone)]
pub struct SharedErrorSink(Arc<RwLock<Arc<dyn ErrorSink>>>);

impl Default for SharedErrorSink {
    fn default() -> Self {
        Self::new(Arc::new(NoopErrorSink))
    }
}

impl SharedErrorSink {
    pub fn new(sink: Arc<dyn ErrorSink>) -> Self {
        Self(Arc::new(RwLock::new(sink)))
    }

    pub fn replace(&self, sink: Arc<dyn ErrorSink>) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = sink;
    }

    fn current(&self) -> Arc<dyn ErrorSink> {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl ErrorSink for SharedErrorSink {
    fn on_error(&self, err: NetflowError) {
        // Release the slot before calling out, the sink may replace itself
        let sink = self.current();
        sink.on_error(err)
    }
}
