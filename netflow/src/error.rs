use std::{io, net::IpAddr};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failures of the fixed layout encoding of kernel structures.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("{type_name} does not marshal into {actual} bytes, expected {expected}")]
    LengthMismatch {
        type_name: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{type_name} requires {expected} bytes but got {actual}")]
    ShortBuffer {
        type_name: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("only IPv4 addresses are supported, got {0}")]
    Ipv6Unsupported(IpAddr),
}

/// Errors of the byte level table operations.
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("key not found")]
    NotFound,
    #[error("{op} failed, {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("{op} failed, {source}")]
    Map {
        op: &'static str,
        #[source]
        source: aya::maps::MapError,
    },
    #[error("{0} is not supported by this table")]
    Unsupported(&'static str),
}

impl TableError {
    pub(crate) fn io(op: &'static str, source: io::Error) -> Self {
        if source.raw_os_error() == Some(libc::ENOENT) {
            Self::NotFound
        } else {
            Self::Io { op, source }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NetflowError {
    /// Lookup miss, callers rely on telling it apart from real failures
    #[error("key not found")]
    KeyNotFound,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("table {table}: {source}")]
    Table {
        table: String,
        #[source]
        source: TableError,
    },
    #[error("table {table} has {actual_key}/{actual_value} byte key/value, expected {key}/{value}")]
    LayoutMismatch {
        table: String,
        key: usize,
        value: usize,
        actual_key: usize,
        actual_value: usize,
    },
    #[error("table {0}: batch cursor did not advance")]
    BatchStalled(String),
    #[error("map is missing: {0}")]
    MissingMap(String),
    #[error("program is missing: {0}")]
    MissingProgram(String),
    #[error("no kernel object available for {0}, set NETFLOW_EBPF_DIR at build time or use a file loader")]
    MissingObject(&'static str),
    #[error("can't read {path}, {source}")]
    ObjectRead {
        path: std::path::PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{context}, {source}")]
    Kernel {
        context: String,
        #[source]
        source: BoxError,
    },
    #[error("could not determine monitor mode")]
    UnknownMonitorMode,
    #[error("conn_track cleanup already running")]
    CleanupAlreadyRunning,
    #[error("already syncing epoch")]
    AlreadySyncing,
    #[error("invalid destination '{input}', {reason}")]
    InvalidDestination { input: String, reason: String },
    #[error("invalid configuration, {0}")]
    Config(String),
    #[error("no IPv4 address found for interface {0}")]
    NoInterfaceAddress(String),
    #[error("remove limit on locked memory failed, {0}")]
    MemLock(String),
    #[error("interface {0} is not attached")]
    NotAttached(String),
    #[error("interface {0} was detached while attaching")]
    Detached(String),
    #[error("packet transport closed")]
    TransportClosed,
    #[error("lost {0} events")]
    LostEvents(usize),
    #[error("{}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Multiple(Vec<NetflowError>),
}

impl NetflowError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::KeyNotFound)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::TransportClosed)
    }

    pub(crate) fn table(table: &str, source: TableError) -> Self {
        match source {
            TableError::NotFound => Self::KeyNotFound,
            source => Self::Table {
                table: table.to_string(),
                source,
            },
        }
    }

    pub(crate) fn kernel<C: Into<String>, E: Into<BoxError>>(context: C, source: E) -> Self {
        Self::Kernel {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Appends the failure of a rollback step to this error.
    pub(crate) fn and_cleanup(self, cleanup: Result<(), NetflowError>) -> Self {
        match cleanup {
            Ok(()) => self,
            Err(other) => {
                let mut errors = self.into_vec();
                errors.extend(other.into_vec());
                Self::Multiple(errors)
            }
        }
    }

    fn into_vec(self) -> Vec<NetflowError> {
        match self {
            Self::Multiple(errors) => errors,
            e => vec![e],
        }
    }

    /// Collects independent results, keeping every failure instead of the first.
    pub fn join<I>(results: I) -> Result<(), NetflowError>
    where
        I: IntoIterator<Item = Result<(), NetflowError>>,
    {
        let mut errors = Vec::new();
        for result in results {
            if let Err(e) = result {
                errors.extend(e.into_vec());
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(NetflowError::Multiple(errors)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_keeps_every_failure() {
        let joined = NetflowError::join([
            Ok(()),
            Err(NetflowError::KeyNotFound),
            Err(NetflowError::TransportClosed),
        ]);
        match joined {
            Err(NetflowError::Multiple(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn join_single_failure_is_not_wrapped() {
        let joined = NetflowError::join([Ok(()), Err(NetflowError::KeyNotFound)]);
        assert!(joined.unwrap_err().is_not_found());
        assert!(NetflowError::join([Ok(()), Ok(())]).is_ok());
    }

    #[test]
    fn cleanup_failures_are_appended() {
        let err = NetflowError::MissingMap("firewall_rules".into())
            .and_cleanup(Err(NetflowError::TransportClosed));
        assert_eq!(
            err.to_string(),
            "map is missing: firewall_rules; packet transport closed"
        );

        let err = NetflowError::KeyNotFound.and_cleanup(Ok(()));
        assert!(err.is_not_found());
    }

    #[test]
    fn enoent_is_a_miss() {
        let err = TableError::io("lookup", io::Error::from_raw_os_error(libc::ENOENT));
        assert!(matches!(err, TableError::NotFound));
        assert!(NetflowError::table("t", err).is_not_found());

        let err = TableError::io("lookup", io::Error::from_raw_os_error(libc::EPERM));
        assert!(!NetflowError::table("t", err).is_not_found());
    }
}
