//! User space control plane of the netflow kernel programs: typed access to
//! their maps, the XDP firewall with packet capture and the TC based NAT
//! with connection tracking upkeep.

pub mod codec;
pub mod config;
pub mod conntrack;
pub mod endpoint;
pub mod epoch;
pub mod error;
pub mod features;
pub mod firewall;
pub mod helpers;
pub mod loader;
pub mod map;
pub mod nat;
pub mod packet;
pub mod prog;
pub mod protocols;
pub mod sink;
pub mod stats;
mod sys;
pub mod table;
pub mod transport;

pub use codec::{ConnIdent, ConnMeta, FirewallRule, NatConfigKey, PacketRecord, WireLayout};
pub use config::{Config, ConfigFile, FirewallInterfaceConfig, NatTableSpec, NatTargetSpec};
pub use error::NetflowError;
pub use firewall::{Firewall, MonitorMode};
pub use map::{BatchOptions, Map};
pub use nat::Nat;
pub use protocols::{NatTarget, PacketPolicy, Transport};
pub use sink::{ErrorSink, NoopErrorSink, PacketSink};
