use crate::error::NetflowError;
use libc::{sockaddr_in, sockaddr_in6, sockaddr_ll};
use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr},
};

pub fn remove_memlock() -> Result<(), NetflowError> {
    // Bump the memlock rlimit. This is needed for older kernels that don't use the
    // new memcg based accounting, see https://lwn.net/Articles/837122/
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        Err(NetflowError::MemLock(str_errno()))
    } else {
        Ok(())
    }
}

fn cstr_to_string(cstr_buff: *const libc::c_char) -> String {
    let str = unsafe { std::ffi::CStr::from_ptr(cstr_buff) };
    str.to_string_lossy().to_string()
}

pub fn str_error(err: i32) -> String {
    let mut buff = [0 as libc::c_char; 256];
    let rc = unsafe { libc::strerror_r(err, buff.as_mut_ptr(), buff.len()) };

    if rc != 0 {
        format!("errno={}, unknown", err)
    } else {
        cstr_to_string(buff.as_ptr())
    }
}

pub fn str_errno() -> String {
    let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
    str_error(errno)
}

pub fn ifindex(ifname: &str) -> Result<u32, NetflowError> {
    let c_interface = std::ffi::CString::new(ifname)
        .map_err(|e| NetflowError::kernel(format!("Invalid interface name {}", ifname), e))?;
    let if_index = unsafe { libc::if_nametoindex(c_interface.as_ptr()) };
    if if_index == 0 {
        Err(NetflowError::kernel(
            format!("No interface named {}", ifname),
            std::io::Error::last_os_error(),
        ))
    } else {
        Ok(if_index)
    }
}

#[derive(Default, Clone, Debug)]
pub struct NetIf {
    pub ifindex: u32,
    pub mac: [u8; 6],
    /// In the order reported by the kernel
    pub ips: Vec<IpAddr>,
}

impl NetIf {
    pub fn first_ipv4(&self) -> Option<Ipv4Addr> {
        self.ips.iter().find_map(|ip| match ip {
            IpAddr::V4(ip) => Some(*ip),
            IpAddr::V6(_) => None,
        })
    }
}

pub fn get_netifs() -> Result<HashMap<String, NetIf>, NetflowError> {
    let mut ifs = HashMap::new();
    let mut ifaddrs: *mut libc::ifaddrs = core::ptr::null_mut();
    let rc = unsafe { libc::getifaddrs(&mut ifaddrs) };

    if rc != 0 {
        return Err(NetflowError::kernel(
            "failed to get net interfaces",
            std::io::Error::last_os_error(),
        ));
    }

    let mut next_ifa = ifaddrs;

    while !next_ifa.is_null() {
        let ifa = unsafe { (*next_ifa).ifa_addr };

        if ifa.is_null() {
            next_ifa = unsafe { (*next_ifa).ifa_next };
            continue;
        }

        let ifname = cstr_to_string(unsafe { (*next_ifa).ifa_name });
        let netif: &mut NetIf = ifs.entry(ifname).or_default();

        match unsafe { (*ifa).sa_family } as i32 {
            libc::AF_PACKET => {
                let lladdr = ifa as *const sockaddr_ll;
                netif.mac = unsafe { *((*lladdr).sll_addr.as_ptr() as *const [u8; 6]) };
                netif.ifindex = unsafe { (*lladdr).sll_ifindex } as u32;
            }
            libc::AF_INET => {
                let sa = ifa as *const sockaddr_in;
                // s_addr is in network order, keep the memory layout
                let addr = unsafe { (*sa).sin_addr.s_addr };
                netif.ips.push(IpAddr::from(addr.to_ne_bytes()));
            }
            libc::AF_INET6 => {
                let sa = ifa as *const sockaddr_in6;
                let ip = IpAddr::from(unsafe { (*sa).sin6_addr.s6_addr });
                netif.ips.push(ip);
            }
            _ => {}
        }

        next_ifa = unsafe { (*next_ifa).ifa_next };
    }

    unsafe { libc::freeifaddrs(ifaddrs) };

    Ok(ifs)
}

/// First IPv4 address assigned to `ifname`.
pub fn primary_ipv4(ifname: &str) -> Result<Ipv4Addr, NetflowError> {
    get_netifs()?
        .get(ifname)
        .and_then(NetIf::first_ipv4)
        .ok_or_else(|| NetflowError::NoInterfaceAddress(ifname.to_string()))
}
