//! Fixed layout encoding of the kernel table keys, values and events.
//!
//! Every type mirrors a `repr(C)` struct of `netflow-common` byte for byte:
//! multi-byte integers are little-endian, IPv4 addresses are stored as their
//! four octets in network order and padding bytes are written as zero.

use crate::{
    error::CodecError,
    protocols::{PacketPolicy, Transport},
};
use netflow_common as common;
use std::net::{IpAddr, Ipv4Addr};

pub trait WireLayout: Sized {
    /// Exact size of the kernel struct
    const SIZE: usize;
    const NAME: &'static str;

    /// Encodes into `buf` which must be exactly [`Self::SIZE`] bytes.
    fn marshal_to(&self, buf: &mut [u8]) -> Result<(), CodecError>;

    /// Decodes the first [`Self::SIZE`] bytes of `buf`.
    fn unmarshal(buf: &[u8]) -> Result<Self, CodecError>;

    fn marshal(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = vec![0_u8; Self::SIZE];
        self.marshal_to(&mut buf)?;
        Ok(buf)
    }
}

fn check_dst<T: WireLayout>(buf: &[u8]) -> Result<(), CodecError> {
    if buf.len() != T::SIZE {
        return Err(CodecError::LengthMismatch {
            type_name: T::NAME,
            expected: T::SIZE,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn check_src<T: WireLayout>(buf: &[u8]) -> Result<(), CodecError> {
    if buf.len() < T::SIZE {
        return Err(CodecError::ShortBuffer {
            type_name: T::NAME,
            expected: T::SIZE,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn ipv4_octets(addr: &IpAddr) -> Result<[u8; 4], CodecError> {
    match addr {
        IpAddr::V4(ip) => Ok(ip.octets()),
        IpAddr::V6(_) => Err(CodecError::Ipv6Unsupported(*addr)),
    }
}

#[inline]
fn get_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

#[inline]
fn get_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

#[inline]
fn get_ipv4(buf: &[u8], at: usize) -> Ipv4Addr {
    Ipv4Addr::new(buf[at], buf[at + 1], buf[at + 2], buf[at + 3])
}

/// Key of the rules, translations and connection tracking tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnIdent {
    pub addr: IpAddr,
    pub port: u16,
    pub transport: Transport,
}

impl ConnIdent {
    pub fn new(addr: impl Into<IpAddr>, port: u16, transport: Transport) -> Self {
        Self {
            addr: addr.into(),
            port,
            transport,
        }
    }
}

impl WireLayout for ConnIdent {
    const SIZE: usize = common::CONN_IDENT_SIZE;
    const NAME: &'static str = "ConnIdent";

    fn marshal_to(&self, buf: &mut [u8]) -> Result<(), CodecError> {
        check_dst::<Self>(buf)?;
        buf[0..4].copy_from_slice(&ipv4_octets(&self.addr)?);
        buf[4..6].copy_from_slice(&self.port.to_le_bytes());
        buf[6..8].fill(0);
        buf[8..12].copy_from_slice(&(self.transport as u32).to_le_bytes());
        Ok(())
    }

    fn unmarshal(buf: &[u8]) -> Result<Self, CodecError> {
        check_src::<Self>(buf)?;
        Ok(Self {
            addr: get_ipv4(buf, 0).into(),
            port: get_u16(buf, 4),
            transport: get_u32(buf, 8).into(),
        })
    }
}

/// Value of the translations and connection tracking tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnMeta {
    pub addr: IpAddr,
    pub port: u16,
    pub transport: Transport,
    /// Epoch seconds written by the kernel on the last match
    pub last_observed: u32,
}

impl WireLayout for ConnMeta {
    const SIZE: usize = common::CONN_META_SIZE;
    const NAME: &'static str = "ConnMeta";

    fn marshal_to(&self, buf: &mut [u8]) -> Result<(), CodecError> {
        check_dst::<Self>(buf)?;
        let ident = ConnIdent::new(self.addr, self.port, self.transport);
        ident.marshal_to(&mut buf[..ConnIdent::SIZE])?;
        buf[12..16].copy_from_slice(&self.last_observed.to_le_bytes());
        Ok(())
    }

    fn unmarshal(buf: &[u8]) -> Result<Self, CodecError> {
        check_src::<Self>(buf)?;
        let ident = ConnIdent::unmarshal(buf)?;
        Ok(Self {
            addr: ident.addr,
            port: ident.port,
            transport: ident.transport,
            last_observed: get_u32(buf, 12),
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FirewallRule {
    pub policy: PacketPolicy,
    pub monitor_traffic: bool,
}

impl WireLayout for FirewallRule {
    const SIZE: usize = common::FIREWALL_RULE_SIZE;
    const NAME: &'static str = "FirewallRule";

    fn marshal_to(&self, buf: &mut [u8]) -> Result<(), CodecError> {
        check_dst::<Self>(buf)?;
        buf[0..4].copy_from_slice(&self.policy.xdp_action().to_le_bytes());
        buf[4..8].copy_from_slice(&(self.monitor_traffic as u32).to_le_bytes());
        Ok(())
    }

    fn unmarshal(buf: &[u8]) -> Result<Self, CodecError> {
        check_src::<Self>(buf)?;
        Ok(Self {
            policy: get_u32(buf, 0).into(),
            monitor_traffic: get_u32(buf, 4) > 0,
        })
    }
}

/// Packet emitted by the firewall for monitored traffic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PacketRecord {
    pub source_ip: Ipv4Addr,
    pub dest_ip: Ipv4Addr,
    pub source_port: u16,
    pub dest_port: u16,
    pub transport: Transport,
}

impl Default for PacketRecord {
    fn default() -> Self {
        Self {
            source_ip: Ipv4Addr::UNSPECIFIED,
            dest_ip: Ipv4Addr::UNSPECIFIED,
            source_port: 0,
            dest_port: 0,
            transport: Transport::Unspecified,
        }
    }
}

impl PacketRecord {
    /// Decodes in place, used by the pooled read path.
    pub fn decode_from(&mut self, buf: &[u8]) -> Result<(), CodecError> {
        check_src::<Self>(buf)?;
        self.source_ip = get_ipv4(buf, 0);
        self.dest_ip = get_ipv4(buf, 4);
        self.source_port = get_u16(buf, 8);
        self.dest_port = get_u16(buf, 10);
        self.transport = get_u32(buf, 12).into();
        Ok(())
    }
}

impl WireLayout for PacketRecord {
    const SIZE: usize = common::OBSERVED_PACKET_SIZE;
    const NAME: &'static str = "PacketRecord";

    fn marshal_to(&self, buf: &mut [u8]) -> Result<(), CodecError> {
        check_dst::<Self>(buf)?;
        buf[0..4].copy_from_slice(&self.source_ip.octets());
        buf[4..8].copy_from_slice(&self.dest_ip.octets());
        buf[8..10].copy_from_slice(&self.source_port.to_le_bytes());
        buf[10..12].copy_from_slice(&self.dest_port.to_le_bytes());
        buf[12..16].copy_from_slice(&(self.transport as u32).to_le_bytes());
        Ok(())
    }

    fn unmarshal(buf: &[u8]) -> Result<Self, CodecError> {
        let mut pkt = Self::default();
        pkt.decode_from(buf)?;
        Ok(pkt)
    }
}

/// Index of the `nat_config` array.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NatConfigKey {
    CurrentEpoch,
}

impl NatConfigKey {
    pub fn index(self) -> u32 {
        match self {
            NatConfigKey::CurrentEpoch => common::natcfg::CURRENT_EPOCH_IDX,
        }
    }
}

impl WireLayout for NatConfigKey {
    const SIZE: usize = 4;
    const NAME: &'static str = "NatConfigKey";

    fn marshal_to(&self, buf: &mut [u8]) -> Result<(), CodecError> {
        self.index().marshal_to(buf)
    }

    fn unmarshal(buf: &[u8]) -> Result<Self, CodecError> {
        check_src::<Self>(buf)?;
        // Only the epoch slot is used by user space
        Ok(NatConfigKey::CurrentEpoch)
    }
}

impl WireLayout for u32 {
    const SIZE: usize = 4;
    const NAME: &'static str = "u32";

    fn marshal_to(&self, buf: &mut [u8]) -> Result<(), CodecError> {
        check_dst::<Self>(buf)?;
        buf.copy_from_slice(&self.to_le_bytes());
        Ok(())
    }

    fn unmarshal(buf: &[u8]) -> Result<Self, CodecError> {
        check_src::<Self>(buf)?;
        Ok(get_u32(buf, 0))
    }
}
