#![no_std]

//! Structures and names shared between the kernel programs and the user
//! space control plane. The layouts below are the ABI of the kernel tables:
//! field order, width and padding must not change without rebuilding both
//! sides.

pub const VERSION: u32 = 0x0000001;

pub const CONN_IDENT_SIZE: usize = 12;
pub const CONN_META_SIZE: usize = 16;
pub const FIREWALL_RULE_SIZE: usize = 8;
pub const OBSERVED_PACKET_SIZE: usize = 16;

/// Transport protocol as seen by the kernel programs (`enum transport_proto`).
pub mod proto {
    pub const UNSPECIFIED: u32 = 0;
    pub const TCP: u32 = 1;
    pub const UDP: u32 = 2;
}

/// XDP verdicts used as firewall policies.
pub mod xdp {
    pub const DROP: u32 = 1;
    pub const PASS: u32 = 2;
}

/// Kernel table names.
pub mod maps {
    pub const FIREWALL_RULES: &str = "firewall_rules";
    /// Per-CPU perf event array with observed packets
    pub const OBSERVED_PACKETS: &str = "observed_packets";
    /// Ring buffer variant of the observed packets transport
    pub const OBSERVED_PACKETS_RING: &str = "observed_packets_ring";
    pub const NAT_CONFIG: &str = "nat_config";
    pub const NAT_TRANSLATIONS: &str = "nat_translations";
    pub const CONN_TRACK: &str = "conn_track";
}

/// Program function names inside the kernel objects.
pub mod progs {
    pub const FW_RING: &str = "xdp_ingress_ring";
    pub const FW_PERF: &str = "xdp_ingress_perf";
    pub const FW_MOCK: &str = "xdp_mock";
    pub const NAT_INGRESS: &str = "ingress";
    pub const NAT_EGRESS: &str = "egress";
    pub const NAT_MOCK: &str = "nat_mock";
}

/// Read-only globals patched at load time.
pub mod globals {
    /// `u32` XDP verdict applied when no rule matches
    pub const DEFAULT_POLICY: &str = "DEFAULT_POLICY";
    /// `u8` flag, emit packets that matched no rule
    pub const EMIT_UNMATCHED: &str = "EMIT_UNMATCHED";
    /// `u32` primary IPv4 address of the interface, network byte order
    pub const INTERFACE_IP: &str = "INTERFACE_IP";
}

/// Indexes of the `nat_config` array.
pub mod natcfg {
    pub const CURRENT_EPOCH_IDX: u32 = 0;
    pub const CONFIG_OPTIONS_COUNT: u32 = 4;
}

/// Key of the rule, translation and connection tracking tables.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnIdent {
    /// IPv4 address (big-endian)
    pub ip: u32,
    pub port: u16,
    pub transport: u32,
}

/// Value of the translation and connection tracking tables.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnMeta {
    /// IPv4 address (big-endian)
    pub ip: u32,
    pub port: u16,
    pub transport: u32,
    /// Epoch seconds of the last packet that matched this entry
    pub last_observed: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FirewallRule {
    pub policy: u32,
    pub monitor_traffic: bool,
}

/// Event emitted for every monitored packet.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ObservedPacket {
    pub source_ip: u32,
    pub dest_ip: u32,
    pub source_port: u16,
    pub dest_port: u16,
    pub transport: u32,
}

const _: () = assert!(core::mem::size_of::<ConnIdent>() == CONN_IDENT_SIZE);
const _: () = assert!(core::mem::size_of::<ConnMeta>() == CONN_META_SIZE);
const _: () = assert!(core::mem::size_of::<FirewallRule>() == FIREWALL_RULE_SIZE);
const _: () = assert!(core::mem::size_of::<ObservedPacket>() == OBSERVED_PACKET_SIZE);
