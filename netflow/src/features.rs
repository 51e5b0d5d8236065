//! Kernel capability checks.
//!
//! A test map is created at most once per process unless it failed for a reason
//! that says nothing about the kernel (e.g. missing privileges), in which
//! case the next check tries again.

use crate::sys::{self, BpfMapUpdateFlags};
use aya_obj::generated::bpf_map_type;
use once_cell::sync::Lazy;
use std::{collections::HashMap, io, sync::Mutex};

// Linux internal errno returned for unsupported operations
const ENOTSUPP: i32 = 524;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Feature {
    PerfEventArray,
    RingBuf,
    MapBatchApi,
}

static CACHE: Lazy<Mutex<HashMap<Feature, bool>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Returns true if the running kernel supports `feature`.
pub fn check(feature: Feature) -> bool {
    if let Ok(cache) = CACHE.lock() {
        if let Some(supported) = cache.get(&feature) {
            return *supported;
        }
    }

    let supported = match try_feature(feature) {
        Ok(()) => true,
        Err(e) if is_unsupported(&e) => false,
        Err(e) => {
            log::warn!("Can't check {:?} support, {}", feature, e);
            return false;
        }
    };

    log::debug!("Feature {:?} supported: {}", feature, supported);
    if let Ok(mut cache) = CACHE.lock() {
        cache.insert(feature, supported);
    }
    supported
}

fn is_unsupported(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EINVAL) | Some(libc::EOPNOTSUPP) | Some(ENOTSUPP)
    )
}

fn try_feature(feature: Feature) -> io::Result<()> {
    match feature {
        Feature::PerfEventArray => {
            sys::create_map(
                bpf_map_type::BPF_MAP_TYPE_PERF_EVENT_ARRAY as u32,
                4,
                4,
                1,
            )?;
        }
        Feature::RingBuf => {
            // Size must be a page aligned power of 2
            sys::create_map(bpf_map_type::BPF_MAP_TYPE_RINGBUF as u32, 0, 0, 4096)?;
        }
        Feature::MapBatchApi => {
            use std::os::fd::AsRawFd;
            let map = sys::create_map(bpf_map_type::BPF_MAP_TYPE_HASH as u32, 4, 4, 1)?;
            let mut count = 1;
            sys::update_batch(
                map.as_raw_fd(),
                &1_u32.to_le_bytes(),
                &1_u32.to_le_bytes(),
                &mut count,
                BpfMapUpdateFlags::ANY,
            )?;
        }
    }
    Ok(())
}
