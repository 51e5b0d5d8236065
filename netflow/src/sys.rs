//! The bpf(2) batch map commands, which aya does not expose, and map
//! creation for the feature checks.

use aya_obj::generated::{bpf_cmd, BPF_ANY, BPF_EXIST, BPF_F_LOCK, BPF_NOEXIST};
use std::{
    io,
    mem::size_of,
    os::fd::{FromRawFd, OwnedFd, RawFd},
};

bitflags::bitflags! {
/// Flags for BPF_MAP_UPDATE_ELEM command
#[derive(Clone, Copy, Debug, Default)]
pub struct BpfMapUpdateFlags: u64 {
/// 0, create new element or update existing
const ANY = BPF_ANY as u64;
/// 1, create new element if it didn't exist
const NOEXIST = BPF_NOEXIST as u64;
/// 2, update existing element
const EXIST = BPF_EXIST as u64;
/// 4, spin_lock-ed map_lookup/map_update
const F_LOCK = BPF_F_LOCK as u64;
}
}

// Prefixes of the `union bpf_attr` members used below. The kernel accepts
// a shorter attr and zero fills the remaining fields.

#[repr(C)]
#[derive(Default)]
struct BatchAttr {
    in_batch: u64,
    out_batch: u64,
    keys: u64,
    values: u64,
    count: u32,
    map_fd: u32,
    elem_flags: u64,
    flags: u64,
}

#[repr(C)]
#[derive(Default)]
struct MapCreateAttr {
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    map_flags: u32,
}

fn sys_bpf<T>(cmd: bpf_cmd, attr: &mut T) -> io::Result<i64> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            cmd as libc::c_long,
            attr as *mut T,
            size_of::<T>() as libc::c_uint,
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as i64)
    }
}

#[inline]
fn ptr(buf: &[u8]) -> u64 {
    buf.as_ptr() as u64
}

#[inline]
fn mut_ptr(buf: &mut [u8]) -> u64 {
    buf.as_mut_ptr() as u64
}

/// Reads up to `count` entries starting at `in_batch` (`None` is the start
/// of the table). On return `count` holds the number of entries copied,
/// which is also valid when the call fails with ENOENT at the end.
pub fn lookup_batch(
    fd: RawFd,
    in_batch: Option<&[u8]>,
    out_batch: &mut [u8],
    keys: &mut [u8],
    values: &mut [u8],
    count: &mut u32,
) -> io::Result<()> {
    let mut attr = BatchAttr {
        in_batch: in_batch.map_or(0, ptr),
        out_batch: mut_ptr(out_batch),
        keys: mut_ptr(keys),
        values: mut_ptr(values),
        count: *count,
        map_fd: fd as u32,
        ..Default::default()
    };
    let ret = sys_bpf(bpf_cmd::BPF_MAP_LOOKUP_BATCH, &mut attr);
    *count = attr.count;
    ret.map(|_| ())
}

pub fn update_batch(
    fd: RawFd,
    keys: &[u8],
    values: &[u8],
    count: &mut u32,
    flags: BpfMapUpdateFlags,
) -> io::Result<()> {
    let mut attr = BatchAttr {
        keys: ptr(keys),
        values: ptr(values),
        count: *count,
        map_fd: fd as u32,
        elem_flags: flags.bits(),
        ..Default::default()
    };
    let ret = sys_bpf(bpf_cmd::BPF_MAP_UPDATE_BATCH, &mut attr);
    *count = attr.count;
    ret.map(|_| ())
}

pub fn delete_batch(fd: RawFd, keys: &[u8], count: &mut u32) -> io::Result<()> {
    let mut attr = BatchAttr {
        keys: ptr(keys),
        count: *count,
        map_fd: fd as u32,
        ..Default::default()
    };
    let ret = sys_bpf(bpf_cmd::BPF_MAP_DELETE_BATCH, &mut attr);
    *count = attr.count;
    ret.map(|_| ())
}

/// Creates an anonymous map, only used for probing kernel features.
pub fn create_map(
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
) -> io::Result<OwnedFd> {
    let mut attr = MapCreateAttr {
        map_type,
        key_size,
        value_size,
        max_entries,
        map_flags: 0,
    };
    let fd = sys_bpf(bpf_cmd::BPF_MAP_CREATE, &mut attr)?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}
