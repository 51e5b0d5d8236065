//! Typed access to kernel tables.

use crate::{
    codec::WireLayout,
    error::{NetflowError, TableError},
    table::RawTable,
};
use std::{
    collections::HashMap,
    hash::Hash,
    marker::PhantomData,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

pub const DEFAULT_BATCH_SIZE: u32 = 50;

/// Options of the bulk operations.
#[derive(Clone, Copy, Debug)]
pub struct BatchOptions {
    /// Entries transferred per batch command
    pub batch_size: u32,
    /// Use element commands even if the batch API is available
    pub use_fallback: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            use_fallback: false,
        }
    }
}

impl BatchOptions {
    pub fn fallback() -> Self {
        Self {
            use_fallback: true,
            ..Default::default()
        }
    }

    pub fn with_batch_size(self, batch_size: u32) -> Self {
        Self {
            batch_size: batch_size.max(1),
            ..self
        }
    }

    fn use_batch(&self, table: &dyn RawTable) -> bool {
        !self.use_fallback && table.batch_supported()
    }
}

/// Table with typed keys and values.
///
/// Readers share the table while any write is exclusive, so a [`Map::sync`]
/// is never interleaved with other updates from user space.
pub struct Map<K, V> {
    name: String,
    table: RwLock<Box<dyn RawTable>>,
    _kv: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Map<K, V>
where
    K: WireLayout + Eq + Hash + Clone,
    V: WireLayout + PartialEq + Clone,
{
    pub fn new<T: RawTable + 'static>(table: T) -> Result<Self, NetflowError> {
        Self::from_table(Box::new(table))
    }

    /// Fails unless the table layout matches the sizes of `K` and `V`.
    pub fn from_table(table: Box<dyn RawTable>) -> Result<Self, NetflowError> {
        if table.key_size() != K::SIZE || table.value_size() != V::SIZE {
            return Err(NetflowError::LayoutMismatch {
                table: table.name().to_string(),
                key: K::SIZE,
                value: V::SIZE,
                actual_key: table.key_size(),
                actual_value: table.value_size(),
            });
        }

        Ok(Self {
            name: table.name().to_string(),
            table: RwLock::new(table),
            _kv: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn read(&self) -> RwLockReadGuard<'_, Box<dyn RawTable>> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Box<dyn RawTable>> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn err(&self, e: TableError) -> NetflowError {
        NetflowError::table(&self.name, e)
    }

    /// Fails with [`NetflowError::KeyNotFound`] on a miss.
    pub fn get(&self, key: &K) -> Result<V, NetflowError> {
        let key = key.marshal()?;
        let mut value = vec![0_u8; V::SIZE];
        self.read()
            .lookup(&key, &mut value)
            .map_err(|e| self.err(e))?;
        Ok(V::unmarshal(&value)?)
    }

    pub fn put(&self, key: &K, value: &V) -> Result<(), NetflowError> {
        let key = key.marshal()?;
        let value = value.marshal()?;
        self.write().update(&key, &value).map_err(|e| self.err(e))
    }

    pub fn delete(&self, key: &K) -> Result<(), NetflowError> {
        let key = key.marshal()?;
        self.write().delete(&key).map_err(|e| self.err(e))
    }

    pub fn get_all(&self, opts: BatchOptions) -> Result<HashMap<K, V>, NetflowError> {
        let table = self.read();
        self.get_all_locked(table.as_ref(), opts)
    }

    pub fn put_all(&self, entries: &HashMap<K, V>, opts: BatchOptions) -> Result<(), NetflowError> {
        let mut table = self.write();
        let entries = entries.iter().collect::<Vec<_>>();
        self.put_all_locked(table.as_mut(), &entries, opts)
    }

    pub fn delete_all(&self, keys: &[K], opts: BatchOptions) -> Result<(), NetflowError> {
        let mut table = self.write();
        self.delete_all_locked(table.as_mut(), keys, opts)
    }

    /// Makes the table content equal to `desired`: keys not in `desired` are
    /// deleted, missing or different entries are written. Entries that
    /// already match are left alone.
    pub fn sync(&self, desired: &HashMap<K, V>, opts: BatchOptions) -> Result<(), NetflowError> {
        let mut table = self.write();
        let current = self.get_all_locked(table.as_ref(), opts)?;

        let to_delete = current
            .keys()
            .filter(|k| !desired.contains_key(*k))
            .cloned()
            .collect::<Vec<_>>();

        let to_insert = desired
            .iter()
            .filter(|(k, v)| current.get(*k) != Some(*v))
            .collect::<Vec<_>>();

        log::debug!(
            "[{}] sync: {} current, {} to delete, {} to insert",
            self.name,
            current.len(),
            to_delete.len(),
            to_insert.len()
        );

        NetflowError::join([
            self.delete_all_locked(table.as_mut(), &to_delete, opts),
            self.put_all_locked(table.as_mut(), &to_insert, opts),
        ])
    }

    /// Visits every entry once using the key iterator of the table.
    pub fn iterate<F: FnMut(K, V)>(&self, visit: F) -> Result<(), NetflowError> {
        let table = self.read();
        self.iterate_locked(table.as_ref(), visit)
    }

    pub fn cap(&self) -> u32 {
        self.read().max_entries()
    }

    fn iterate_locked<F: FnMut(K, V)>(
        &self,
        table: &dyn RawTable,
        mut visit: F,
    ) -> Result<(), NetflowError> {
        let keys = table.keys().map_err(|e| self.err(e))?;
        let mut value = vec![0_u8; V::SIZE];

        for key in keys {
            match table.lookup(&key, &mut value) {
                Ok(()) => visit(K::unmarshal(&key)?, V::unmarshal(&value)?),
                // deleted by the kernel in the meantime
                Err(TableError::NotFound) => continue,
                Err(e) => return Err(self.err(e)),
            }
        }

        Ok(())
    }

    fn get_all_locked(
        &self,
        table: &dyn RawTable,
        opts: BatchOptions,
    ) -> Result<HashMap<K, V>, NetflowError> {
        if !opts.use_batch(table) {
            let mut result = HashMap::new();
            self.iterate_locked(table, |k, v| {
                result.insert(k, v);
            })?;
            return Ok(result);
        }

        let batch = opts.batch_size.max(1);
        // rounds may stop short of `batch`, every round but the last reads one entry at least
        let max_rounds = u64::from(table.max_entries()) + 1;
        let mut keys = vec![0_u8; K::SIZE * batch as usize];
        let mut values = vec![0_u8; V::SIZE * batch as usize];
        let mut cursor = vec![0_u8; table.cursor_size()];
        let mut next_cursor = vec![0_u8; table.cursor_size()];
        let mut result = HashMap::new();

        for round in 0..max_rounds {
            let prev = if round == 0 { None } else { Some(&cursor[..]) };
            let read = table
                .lookup_batch(prev, &mut next_cursor, &mut keys, &mut values, batch)
                .map_err(|e| self.err(e))?;

            for i in 0..read.count as usize {
                let k = K::unmarshal(&keys[i * K::SIZE..(i + 1) * K::SIZE])?;
                let v = V::unmarshal(&values[i * V::SIZE..(i + 1) * V::SIZE])?;
                result.insert(k, v);
            }

            if read.done {
                return Ok(result);
            }

            if read.count == 0 {
                break;
            }

            std::mem::swap(&mut cursor, &mut next_cursor);
        }

        Err(NetflowError::BatchStalled(self.name.clone()))
    }

    fn put_all_locked(
        &self,
        table: &mut dyn RawTable,
        entries: &[(&K, &V)],
        opts: BatchOptions,
    ) -> Result<(), NetflowError> {
        if entries.is_empty() {
            return Ok(());
        }

        if !opts.use_batch(table) {
            for (k, v) in entries {
                table
                    .update(&k.marshal()?, &v.marshal()?)
                    .map_err(|e| self.err(e))?;
            }
            return Ok(());
        }

        for chunk in entries.chunks(opts.batch_size.max(1) as usize) {
            let mut keys = vec![0_u8; K::SIZE * chunk.len()];
            let mut values = vec![0_u8; V::SIZE * chunk.len()];
            for (i, (k, v)) in chunk.iter().enumerate() {
                k.marshal_to(&mut keys[i * K::SIZE..(i + 1) * K::SIZE])?;
                v.marshal_to(&mut values[i * V::SIZE..(i + 1) * V::SIZE])?;
            }
            table
                .update_batch(&keys, &values, chunk.len() as u32)
                .map_err(|e| self.err(e))?;
        }

        Ok(())
    }

    fn delete_all_locked(
        &self,
        table: &mut dyn RawTable,
        keys: &[K],
        opts: BatchOptions,
    ) -> Result<(), NetflowError> {
        if keys.is_empty() {
            return Ok(());
        }

        if !opts.use_batch(table) {
            for k in keys {
                table.delete(&k.marshal()?).map_err(|e| self.err(e))?;
            }
            return Ok(());
        }

        for chunk in keys.chunks(opts.batch_size.max(1) as usize) {
            let mut buf = vec![0_u8; K::SIZE * chunk.len()];
            for (i, k) in chunk.iter().enumerate() {
                k.marshal_to(&mut buf[i * K::SIZE..(i + 1) * K::SIZE])?;
            }
            table
                .delete_batch(&buf, chunk.len() as u32)
                .map_err(|e| self.err(e))?;
        }

        Ok(())
    }
}
