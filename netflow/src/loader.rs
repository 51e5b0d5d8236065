//! Sources of the kernel object files.
//!
//! The default loaders hand out the objects staged into `OUT_DIR` by the
//! build script. They are empty when the crate was built without
//! `NETFLOW_EBPF_DIR`, in which case loading fails with
//! [`NetflowError::MissingObject`] and a [`FileLoader`] must be set instead.

use crate::error::NetflowError;
use aya::include_bytes_aligned;
use std::{
    borrow::Cow,
    path::{Path, PathBuf},
};

const FIREWALL_OBJECT: &[u8] = include_bytes_aligned!(concat!(env!("OUT_DIR"), "/firewall.o"));
const NAT_OBJECT: &[u8] = include_bytes_aligned!(concat!(env!("OUT_DIR"), "/nat.o"));

pub trait ProgramLoader: Send + Sync {
    fn load_program(&self) -> Result<Cow<'_, [u8]>, NetflowError>;
}

/// Object held in memory.
#[derive(Clone, Debug)]
pub struct BytesLoader {
    name: &'static str,
    object: Cow<'static, [u8]>,
}

impl BytesLoader {
    pub fn new(name: &'static str, object: impl Into<Cow<'static, [u8]>>) -> Self {
        Self {
            name,
            object: object.into(),
        }
    }

    /// Firewall object embedded at build time.
    pub fn firewall() -> Self {
        Self::new("firewall.o", FIREWALL_OBJECT)
    }

    /// NAT object embedded at build time.
    pub fn nat() -> Self {
        Self::new("nat.o", NAT_OBJECT)
    }
}

impl ProgramLoader for BytesLoader {
    fn load_program(&self) -> Result<Cow<'_, [u8]>, NetflowError> {
        if self.object.is_empty() {
            return Err(NetflowError::MissingObject(self.name));
        }
        Ok(Cow::Borrowed(&self.object))
    }
}

/// Reads the object from disk on every load.
#[derive(Clone, Debug)]
pub struct FileLoader {
    path: PathBuf,
}

impl FileLoader {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ProgramLoader for FileLoader {
    fn load_program(&self) -> Result<Cow<'_, [u8]>, NetflowError> {
        let object = std::fs::read(&self.path).map_err(|source| NetflowError::ObjectRead {
            path: self.path.clone(),
            source,
        })?;
        log::debug!("Read {} bytes from: {}", object.len(), self.path.display());
        Ok(Cow::Owned(object))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_is_missing() {
        let loader = BytesLoader::new("firewall.o", Vec::new());
        assert!(matches!(
            loader.load_program(),
            Err(NetflowError::MissingObject("firewall.o"))
        ));

        let loader = BytesLoader::new("nat.o", &b"\x7fELF"[..]);
        assert_eq!(&*loader.load_program().unwrap(), b"\x7fELF");
    }

    #[test]
    fn file_loader_reads_from_disk() {
        let path = std::env::temp_dir().join(format!("netflow-loader-{}.o", std::process::id()));
        std::fs::write(&path, b"object").unwrap();

        let loader = FileLoader::new(&path);
        assert_eq!(&*loader.load_program().unwrap(), b"object");

        std::fs::remove_file(&path).unwrap();
        assert!(matches!(
            loader.load_program(),
            Err(NetflowError::ObjectRead { .. })
        ));
    }
}
