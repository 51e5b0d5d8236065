//! Byte level access to key/value tables.
//!
//! [`RawTable`] is the seam between the typed [`crate::map::Map`] and the
//! storage: [`KernelTable`] goes through aya's map types for single
//! elements and issues the bpf(2) batch commands on the same descriptor,
//! while [`MemTable`] keeps the entries in process memory for mocked
//! environments.

use crate::{
    error::{NetflowError, TableError},
    features::{self, Feature},
    sys::{self, BpfMapUpdateFlags},
};
use aya::maps::{Array, HashMap as AyaHashMap, IterableMap, Map, MapData, MapError};
use netflow_common as common;
use std::{
    collections::BTreeMap,
    error::Error as _,
    io,
    os::fd::{AsFd, AsRawFd, RawFd},
    sync::{Arc, Mutex, MutexGuard},
};

/// Result of one batch lookup round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchRead {
    /// Entries copied into the key and value buffers
    pub count: u32,
    /// No entries left after this round
    pub done: bool,
}

pub trait RawTable: Send + Sync {
    fn name(&self) -> &str;
    fn key_size(&self) -> usize;
    fn value_size(&self) -> usize;
    fn max_entries(&self) -> u32;

    fn lookup(&self, key: &[u8], value: &mut [u8]) -> Result<(), TableError>;
    fn update(&mut self, key: &[u8], value: &[u8]) -> Result<(), TableError>;
    fn delete(&mut self, key: &[u8]) -> Result<(), TableError>;

    /// Snapshot of the present keys, at most `max_entries` of them.
    fn keys(&self) -> Result<Vec<Vec<u8>>, TableError>;

    /// Size of the opaque cursor passed between batch lookup rounds.
    fn cursor_size(&self) -> usize {
        self.key_size().max(8)
    }

    fn lookup_batch(
        &self,
        cursor: Option<&[u8]>,
        next_cursor: &mut [u8],
        keys: &mut [u8],
        values: &mut [u8],
        count: u32,
    ) -> Result<BatchRead, TableError>;

    /// Returns the number of entries written.
    fn update_batch(&mut self, keys: &[u8], values: &[u8], count: u32)
        -> Result<u32, TableError>;

    /// Returns the number of entries deleted.
    fn delete_batch(&mut self, keys: &[u8], count: u32) -> Result<u32, TableError>;

    fn batch_supported(&self) -> bool {
        features::check(Feature::MapBatchApi)
    }
}

type Ident = [u8; common::CONN_IDENT_SIZE];

/// The map layouts declared by the kernel objects.
enum TypedMap {
    Rules(AyaHashMap<MapData, Ident, [u8; common::FIREWALL_RULE_SIZE]>),
    Conns(AyaHashMap<MapData, Ident, [u8; common::CONN_META_SIZE]>),
    Config(Array<MapData, [u8; 4]>),
}

fn fixed<const N: usize>(op: &'static str, buf: &[u8]) -> Result<[u8; N], TableError> {
    <[u8; N]>::try_from(buf).map_err(|_| TableError::Io {
        op,
        source: io::Error::from_raw_os_error(libc::EINVAL),
    })
}

fn map_error(op: &'static str, err: MapError) -> TableError {
    if matches!(err, MapError::KeyNotFound | MapError::ElementNotFound) {
        return TableError::NotFound;
    }
    // deletes of absent keys come back as a failed syscall
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            if io_err.raw_os_error() == Some(libc::ENOENT) {
                return TableError::NotFound;
            }
        }
        source = cause.source();
    }
    TableError::Map { op, source: err }
}

/// Table backed by a map of a loaded kernel object.
pub struct KernelTable {
    name: String,
    map: TypedMap,
    key_size: usize,
    value_size: usize,
    max_entries: u32,
}

impl KernelTable {
    pub fn new(name: &str, map: Map) -> Result<Self, NetflowError> {
        let (is_array, info) = match &map {
            Map::HashMap(m) | Map::LruHashMap(m) => (false, m.info()),
            Map::Array(m) => (true, m.info()),
            _ => {
                return Err(NetflowError::MissingMap(format!(
                    "{} is not a hash or array map",
                    name
                )))
            }
        };
        let info =
            info.map_err(|e| NetflowError::kernel(format!("Can't get info for map {}", name), e))?;
        let value_size = info.value_size() as usize;
        let typed = |e: MapError| NetflowError::kernel(format!("Unexpected layout of map {}", name), e);

        let map = match (is_array, value_size) {
            (true, _) => TypedMap::Config(Array::try_from(map).map_err(typed)?),
            (false, common::FIREWALL_RULE_SIZE) => {
                TypedMap::Rules(AyaHashMap::try_from(map).map_err(typed)?)
            }
            (false, common::CONN_META_SIZE) => {
                TypedMap::Conns(AyaHashMap::try_from(map).map_err(typed)?)
            }
            (false, other) => {
                return Err(NetflowError::MissingMap(format!(
                    "{} has values of {} bytes",
                    name, other
                )))
            }
        };

        Ok(Self {
            name: name.to_string(),
            key_size: info.key_size() as usize,
            value_size,
            max_entries: info.max_entries(),
            map,
        })
    }

    fn fd(&self) -> RawFd {
        let data = match &self.map {
            TypedMap::Rules(m) => m.map(),
            TypedMap::Conns(m) => m.map(),
            TypedMap::Config(m) => m.map(),
        };
        data.fd().as_fd().as_raw_fd()
    }
}

impl RawTable for KernelTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn key_size(&self) -> usize {
        self.key_size
    }

    fn value_size(&self) -> usize {
        self.value_size
    }

    fn max_entries(&self) -> u32 {
        self.max_entries
    }

    fn lookup(&self, key: &[u8], value: &mut [u8]) -> Result<(), TableError> {
        let op = "lookup";
        let found = match &self.map {
            TypedMap::Rules(m) => m.get(&fixed(op, key)?, 0).map(|v| v.to_vec()),
            TypedMap::Conns(m) => m.get(&fixed(op, key)?, 0).map(|v| v.to_vec()),
            TypedMap::Config(m) => m
                .get(&u32::from_le_bytes(fixed(op, key)?), 0)
                .map(|v| v.to_vec()),
        }
        .map_err(|e| map_error(op, e))?;

        if found.len() != value.len() {
            return Err(TableError::Io {
                op,
                source: io::Error::from_raw_os_error(libc::EINVAL),
            });
        }
        value.copy_from_slice(&found);
        Ok(())
    }

    fn update(&mut self, key: &[u8], value: &[u8]) -> Result<(), TableError> {
        let op = "update";
        let flags = BpfMapUpdateFlags::ANY.bits();
        match &mut self.map {
            TypedMap::Rules(m) => m.insert(fixed(op, key)?, fixed(op, value)?, flags),
            TypedMap::Conns(m) => m.insert(fixed(op, key)?, fixed(op, value)?, flags),
            TypedMap::Config(m) => {
                m.set(u32::from_le_bytes(fixed(op, key)?), fixed(op, value)?, flags)
            }
        }
        .map_err(|e| map_error(op, e))
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), TableError> {
        let op = "delete";
        match &mut self.map {
            TypedMap::Rules(m) => m.remove(&fixed(op, key)?),
            TypedMap::Conns(m) => m.remove(&fixed(op, key)?),
            TypedMap::Config(_) => return Err(TableError::Unsupported(op)),
        }
        .map_err(|e| map_error(op, e))
    }

    fn keys(&self) -> Result<Vec<Vec<u8>>, TableError> {
        // bounded, keys deleted under the walk make the kernel restart it
        let limit = self.max_entries as usize;
        let collect = |keys: &mut dyn Iterator<Item = Result<Ident, MapError>>| {
            keys.take(limit)
                .map(|k| k.map(|k| k.to_vec()).map_err(|e| map_error("next key", e)))
                .collect()
        };
        match &self.map {
            TypedMap::Rules(m) => collect(&mut m.keys()),
            TypedMap::Conns(m) => collect(&mut m.keys()),
            TypedMap::Config(m) => Ok((0..m.len()).map(|i| i.to_le_bytes().to_vec()).collect()),
        }
    }

    fn lookup_batch(
        &self,
        cursor: Option<&[u8]>,
        next_cursor: &mut [u8],
        keys: &mut [u8],
        values: &mut [u8],
        count: u32,
    ) -> Result<BatchRead, TableError> {
        let mut read = count;
        match sys::lookup_batch(self.fd(), cursor, next_cursor, keys, values, &mut read) {
            Ok(()) => Ok(BatchRead {
                count: read,
                done: false,
            }),
            // ENOENT marks the end of the table, the final entries are valid
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(BatchRead {
                count: read,
                done: true,
            }),
            Err(e) => Err(TableError::Io {
                op: "lookup batch",
                source: e,
            }),
        }
    }

    fn update_batch(
        &mut self,
        keys: &[u8],
        values: &[u8],
        count: u32,
    ) -> Result<u32, TableError> {
        let mut written = count;
        sys::update_batch(self.fd(), keys, values, &mut written, BpfMapUpdateFlags::ANY)
            .map_err(|e| TableError::Io {
                op: "update batch",
                source: e,
            })?;
        Ok(written)
    }

    fn delete_batch(&mut self, keys: &[u8], count: u32) -> Result<u32, TableError> {
        let mut deleted = count;
        sys::delete_batch(self.fd(), keys, &mut deleted)
            .map_err(|e| TableError::io("delete batch", e))?;
        Ok(deleted)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemKind {
    Hash,
    /// `u32` indexed, every slot always present
    Array,
}

/// Element operations served by a [`MemTable`], batch ones count per element.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpCounters {
    pub lookups: u64,
    pub updates: u64,
    pub deletes: u64,
}

impl OpCounters {
    pub fn writes(&self) -> u64 {
        self.updates + self.deletes
    }
}

struct MemInner {
    kind: MemKind,
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    batch: bool,
    ops: OpCounters,
}

/// In-memory table with kernel map semantics. Clones share the entries.
#[derive(Clone)]
pub struct MemTable {
    name: String,
    key_size: usize,
    value_size: usize,
    max_entries: u32,
    inner: Arc<Mutex<MemInner>>,
}

fn errno(op: &'static str, code: i32) -> TableError {
    TableError::io(op, io::Error::from_raw_os_error(code))
}

impl MemTable {
    pub fn hash(name: &str, key_size: usize, value_size: usize, max_entries: u32) -> Self {
        Self::new(name, MemKind::Hash, key_size, value_size, max_entries)
    }

    pub fn array(name: &str, value_size: usize, max_entries: u32) -> Self {
        let table = Self::new(name, MemKind::Array, 4, value_size, max_entries);
        if let Ok(mut inner) = table.inner.lock() {
            for idx in 0..max_entries {
                inner
                    .entries
                    .insert(idx.to_le_bytes().to_vec(), vec![0; value_size]);
            }
        }
        table
    }

    fn new(name: &str, kind: MemKind, key_size: usize, value_size: usize, max: u32) -> Self {
        Self {
            name: name.to_string(),
            key_size,
            value_size,
            max_entries: max,
            inner: Arc::new(Mutex::new(MemInner {
                kind,
                entries: BTreeMap::new(),
                batch: true,
                ops: OpCounters::default(),
            })),
        }
    }

    /// Makes the table report whether the batch API is available.
    pub fn with_batch_support(self, supported: bool) -> Self {
        if let Ok(mut inner) = self.inner.lock() {
            inner.batch = supported;
        }
        self
    }

    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ops(&self) -> OpCounters {
        self.lock().map(|inner| inner.ops).unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemInner>, TableError> {
        self.inner.lock().map_err(|_| errno("lock", libc::EDEADLK))
    }

    fn check_key(&self, op: &'static str, key: &[u8]) -> Result<(), TableError> {
        if key.len() != self.key_size {
            return Err(errno(op, libc::EINVAL));
        }
        Ok(())
    }

    fn put_one(&self, inner: &mut MemInner, key: &[u8], value: &[u8]) -> Result<(), TableError> {
        self.check_key("update", key)?;
        if value.len() != self.value_size {
            return Err(errno("update", libc::EINVAL));
        }
        match inner.kind {
            MemKind::Array if !inner.entries.contains_key(key) => {
                return Err(errno("update", libc::E2BIG))
            }
            MemKind::Hash
                if !inner.entries.contains_key(key)
                    && inner.entries.len() >= self.max_entries as usize =>
            {
                return Err(errno("update", libc::E2BIG))
            }
            _ => {}
        }
        inner.ops.updates += 1;
        inner.entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete_one(&self, inner: &mut MemInner, key: &[u8]) -> Result<(), TableError> {
        self.check_key("delete", key)?;
        if inner.kind == MemKind::Array {
            return Err(errno("delete", libc::EINVAL));
        }
        inner.entries.remove(key).ok_or(TableError::NotFound)?;
        inner.ops.deletes += 1;
        Ok(())
    }
}

impl RawTable for MemTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn key_size(&self) -> usize {
        self.key_size
    }

    fn value_size(&self) -> usize {
        self.value_size
    }

    fn max_entries(&self) -> u32 {
        self.max_entries
    }

    fn lookup(&self, key: &[u8], value: &mut [u8]) -> Result<(), TableError> {
        self.check_key("lookup", key)?;
        let mut inner = self.lock()?;
        inner.ops.lookups += 1;
        let found = inner.entries.get(key).ok_or(TableError::NotFound)?;
        value.copy_from_slice(found);
        Ok(())
    }

    fn update(&mut self, key: &[u8], value: &[u8]) -> Result<(), TableError> {
        let mut inner = self.lock()?;
        self.put_one(&mut inner, key, value)
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), TableError> {
        let mut inner = self.lock()?;
        self.delete_one(&mut inner, key)
    }

    fn keys(&self) -> Result<Vec<Vec<u8>>, TableError> {
        let inner = self.lock()?;
        Ok(inner.entries.keys().cloned().collect())
    }

    fn lookup_batch(
        &self,
        cursor: Option<&[u8]>,
        next_cursor: &mut [u8],
        keys: &mut [u8],
        values: &mut [u8],
        count: u32,
    ) -> Result<BatchRead, TableError> {
        let mut inner = self.lock()?;
        if !inner.batch {
            return Err(TableError::Unsupported("lookup batch"));
        }

        let start = match cursor {
            Some(c) if c.len() >= 4 => u32::from_le_bytes([c[0], c[1], c[2], c[3]]) as usize,
            Some(_) => return Err(errno("lookup batch", libc::EINVAL)),
            None => 0,
        };

        let mut read = 0;
        for (i, (k, v)) in inner
            .entries
            .iter()
            .skip(start)
            .take(count as usize)
            .enumerate()
        {
            keys[i * self.key_size..(i + 1) * self.key_size].copy_from_slice(k);
            values[i * self.value_size..(i + 1) * self.value_size].copy_from_slice(v);
            read += 1;
        }
        inner.ops.lookups += read as u64;

        let next = start + read;
        next_cursor[..4].copy_from_slice(&(next as u32).to_le_bytes());
        Ok(BatchRead {
            count: read as u32,
            done: next >= inner.entries.len(),
        })
    }

    fn update_batch(
        &mut self,
        keys: &[u8],
        values: &[u8],
        count: u32,
    ) -> Result<u32, TableError> {
        let mut inner = self.lock()?;
        if !inner.batch {
            return Err(TableError::Unsupported("update batch"));
        }
        for i in 0..count as usize {
            let key = &keys[i * self.key_size..(i + 1) * self.key_size];
            let value = &values[i * self.value_size..(i + 1) * self.value_size];
            self.put_one(&mut inner, key, value)?;
        }
        Ok(count)
    }

    fn delete_batch(&mut self, keys: &[u8], count: u32) -> Result<u32, TableError> {
        let mut inner = self.lock()?;
        if !inner.batch {
            return Err(TableError::Unsupported("delete batch"));
        }
        for i in 0..count as usize {
            self.delete_one(&mut inner, &keys[i * self.key_size..(i + 1) * self.key_size])?;
        }
        Ok(count)
    }

    fn batch_supported(&self) -> bool {
        self.lock().map(|inner| inner.batch).unwrap_or(false)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Delegates to a [`MemTable`] but can break writes or the batch cursor.
    pub struct FaultyTable {
        inner: MemTable,
        fail_writes: bool,
        stuck_cursor: bool,
        short_rounds: bool,
    }

    impl FaultyTable {
        pub fn new(inner: MemTable) -> Self {
            Self {
                inner,
                fail_writes: false,
                stuck_cursor: false,
                short_rounds: false,
            }
        }

        pub fn failing_writes(self) -> Self {
            Self {
                fail_writes: true,
                ..self
            }
        }

        pub fn stuck_cursor(self) -> Self {
            Self {
                stuck_cursor: true,
                ..self
            }
        }

        /// Batch lookups return one entry less than asked for, as the kernel
        /// does when a round ends on a bucket boundary.
        pub fn short_rounds(self) -> Self {
            Self {
                short_rounds: true,
                ..self
            }
        }

        fn check_write(&self, op: &'static str) -> Result<(), TableError> {
            if self.fail_writes {
                return Err(errno(op, libc::EPERM));
            }
            Ok(())
        }
    }

    impl RawTable for FaultyTable {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn key_size(&self) -> usize {
            self.inner.key_size()
        }

        fn value_size(&self) -> usize {
            self.inner.value_size()
        }

        fn max_entries(&self) -> u32 {
            self.inner.max_entries()
        }

        fn lookup(&self, key: &[u8], value: &mut [u8]) -> Result<(), TableError> {
            self.inner.lookup(key, value)
        }

        fn update(&mut self, key: &[u8], value: &[u8]) -> Result<(), TableError> {
            self.check_write("update")?;
            self.inner.update(key, value)
        }

        fn delete(&mut self, key: &[u8]) -> Result<(), TableError> {
            self.check_write("delete")?;
            self.inner.delete(key)
        }

        fn keys(&self) -> Result<Vec<Vec<u8>>, TableError> {
            self.inner.keys()
        }

        fn lookup_batch(
            &self,
            cursor: Option<&[u8]>,
            next_cursor: &mut [u8],
            keys: &mut [u8],
            values: &mut [u8],
            count: u32,
        ) -> Result<BatchRead, TableError> {
            if self.stuck_cursor {
                return Ok(BatchRead {
                    count: 0,
                    done: false,
                });
            }
            let count = if self.short_rounds {
                count.saturating_sub(1).max(1)
            } else {
                count
            };
            self.inner
                .lookup_batch(cursor, next_cursor, keys, values, count)
        }

        fn update_batch(
            &mut self,
            keys: &[u8],
            values: &[u8],
            count: u32,
        ) -> Result<u32, TableError> {
            self.check_write("update batch")?;
            self.inner.update_batch(keys, values, count)
        }

        fn delete_batch(&mut self, keys: &[u8], count: u32) -> Result<u32, TableError> {
            self.check_write("delete batch")?;
            self.inner.delete_batch(keys, count)
        }

        fn batch_supported(&self) -> bool {
            self.inner.batch_supported()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_table_semantics() {
        let mut table = MemTable::hash("t", 4, 4, 2);
        let mut value = [0_u8; 4];

        assert!(matches!(
            table.lookup(&[1, 0, 0, 0], &mut value),
            Err(TableError::NotFound)
        ));
        table.update(&[1, 0, 0, 0], &[7, 0, 0, 0]).unwrap();
        table.update(&[2, 0, 0, 0], &[8, 0, 0, 0]).unwrap();
        table.update(&[2, 0, 0, 0], &[9, 0, 0, 0]).unwrap();
        assert!(table.update(&[3, 0, 0, 0], &[1, 0, 0, 0]).is_err());

        table.lookup(&[2, 0, 0, 0], &mut value).unwrap();
        assert_eq!(value, [9, 0, 0, 0]);

        table.delete(&[1, 0, 0, 0]).unwrap();
        assert!(matches!(
            table.delete(&[1, 0, 0, 0]),
            Err(TableError::NotFound)
        ));
        assert_eq!(table.len(), 1);
        assert_eq!(table.ops().writes(), 4);
    }

    #[test]
    fn array_table_semantics() {
        let mut table = MemTable::array("cfg", 4, 4);
        let mut value = [1_u8; 4];
        table.lookup(&[3, 0, 0, 0], &mut value).unwrap();
        assert_eq!(value, [0; 4]);
        assert!(table.update(&[4, 0, 0, 0], &[1, 0, 0, 0]).is_err());
        assert!(table.delete(&[0, 0, 0, 0]).is_err());
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn keys_lists_every_present_key() {
        let mut table = MemTable::hash("t", 4, 4, 8);
        for k in [3_u32, 1, 2] {
            table.update(&k.to_le_bytes(), &[0; 4]).unwrap();
        }
        table.delete(&2_u32.to_le_bytes()).unwrap();

        let seen = table
            .keys()
            .unwrap()
            .iter()
            .map(|k| u32::from_le_bytes(k[..].try_into().unwrap()))
            .collect::<Vec<_>>();
        assert_eq!(seen, vec![1, 3]);

        let array = MemTable::array("cfg", 4, 2);
        assert_eq!(array.keys().unwrap().len(), 2);
    }

    #[test]
    fn map_errors_for_absent_keys_are_not_found() {
        assert!(matches!(
            map_error("lookup", MapError::KeyNotFound),
            TableError::NotFound
        ));
        assert!(matches!(
            map_error("delete", MapError::ElementNotFound),
            TableError::NotFound
        ));
        let other = map_error("update", MapError::OutOfBounds { index: 9, max_entries: 2 });
        assert!(matches!(other, TableError::Map { op: "update", .. }));
    }

    #[test]
    fn batch_reads_in_rounds() {
        let mut table = MemTable::hash("t", 4, 4, 8);
        for k in 0_u32..5 {
            table.update(&k.to_le_bytes(), &k.to_le_bytes()).unwrap();
        }

        let mut keys = [0_u8; 12];
        let mut values = [0_u8; 12];
        let mut cursor = [0_u8; 8];
        let mut next = [0_u8; 8];

        let read = table
            .lookup_batch(None, &mut next, &mut keys, &mut values, 3)
            .unwrap();
        assert_eq!(read, BatchRead { count: 3, done: false });

        cursor.copy_from_slice(&next);
        let read = table
            .lookup_batch(Some(&cursor), &mut next, &mut keys, &mut values, 3)
            .unwrap();
        assert_eq!(read, BatchRead { count: 2, done: true });
        assert_eq!(&keys[4..8], &4_u32.to_le_bytes());
    }

    #[test]
    fn batch_can_be_disabled() {
        let mut table = MemTable::hash("t", 4, 4, 8).with_batch_support(false);
        assert!(!table.batch_supported());
        assert!(matches!(
            table.update_batch(&[0; 4], &[0; 4], 1),
            Err(TableError::Unsupported(_))
        ));
    }
}
