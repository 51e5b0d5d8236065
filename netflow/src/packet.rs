//! Reuse pool of decoded packet records.
//!
//! Records are taken with [`acquire`] and go back to the pool when the
//! returned [`PooledPacket`] is dropped, so a sink that panics or an early
//! return on error never leaks pool capacity.

use crate::codec::PacketRecord;
use once_cell::sync::Lazy;
use std::{
    ops::{Deref, DerefMut},
    sync::{Mutex, PoisonError},
};

/// Records kept for reuse, extra ones are freed on release.
const POOL_CAPACITY: usize = 1024;

static POOL: Lazy<PacketPool> = Lazy::new(|| PacketPool::new(POOL_CAPACITY));

pub struct PacketPool {
    free: Mutex<Vec<Box<PacketRecord>>>,
    capacity: usize,
}

impl PacketPool {
    fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    fn take(&'static self) -> PooledPacket {
        let record = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_default();
        PooledPacket {
            record: Some(record),
            pool: self,
        }
    }

    fn release(&self, mut record: Box<PacketRecord>) {
        *record = PacketRecord::default();
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.capacity {
            free.push(record);
        }
    }

    pub fn available(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Record on loan from the pool.
pub struct PooledPacket {
    record: Option<Box<PacketRecord>>,
    pool: &'static PacketPool,
}

impl Deref for PooledPacket {
    type Target = PacketRecord;

    fn deref(&self) -> &PacketRecord {
        // Only emptied by drop
        self.record.as_deref().unwrap_or(&*EMPTY)
    }
}

impl DerefMut for PooledPacket {
    fn deref_mut(&mut self) -> &mut PacketRecord {
        self.record.get_or_insert_with(Box::default)
    }
}

impl Drop for PooledPacket {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            self.pool.release(record);
        }
    }
}

impl std::fmt::Debug for PooledPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        (**self).fmt(f)
    }
}

static EMPTY: Lazy<PacketRecord> = Lazy::new(PacketRecord::default);

/// Takes a cleared record from the global pool.
pub fn acquire() -> PooledPacket {
    POOL.take()
}

pub fn pool() -> &'static PacketPool {
    &POOL
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::Transport;

    #[test]
    fn records_are_reused_and_cleared() {
        let pool: &'static PacketPool = Box::leak(Box::new(PacketPool::new(4)));

        let mut pkt = pool.take();
        pkt.dest_port = 443;
        pkt.transport = Transport::Tcp;
        let addr = &*pkt as *const PacketRecord;
        drop(pkt);
        assert_eq!(pool.available(), 1);

        let pkt = pool.take();
        assert_eq!(&*pkt as *const PacketRecord, addr);
        assert_eq!(*pkt, PacketRecord::default());
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn pool_is_bounded() {
        let pool: &'static PacketPool = Box::leak(Box::new(PacketPool::new(2)));
        let loans = (0..5).map(|_| pool.take()).collect::<Vec<_>>();
        drop(loans);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn released_on_unwind() {
        let pool: &'static PacketPool = Box::leak(Box::new(PacketPool::new(2)));
        let result = std::panic::catch_unwind(|| {
            let _pkt = pool.take();
            panic!("sink failed");
        });
        assert!(result.is_err());
        assert_eq!(pool.available(), 1);
    }
}
