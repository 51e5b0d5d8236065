use clap::ValueEnum;
use netflow_common::{proto, xdp};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};

/// Transport protocol understood by the kernel programs.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, ValueEnum, Debug)]
pub enum Transport {
    #[default]
    Unspecified = proto::UNSPECIFIED as isize,
    Tcp = proto::TCP as isize,
    Udp = proto::UDP as isize,
}

impl From<u32> for Transport {
    fn from(v: u32) -> Self {
        for e in Self::value_variants() {
            if *e as u32 == v {
                return *e;
            }
        }
        Self::Unspecified
    }
}

/// Verdict applied by the firewall to a matched packet.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default, ValueEnum, Debug)]
pub enum PacketPolicy {
    #[default]
    Drop = xdp::DROP as isize,
    Pass = xdp::PASS as isize,
}

impl PacketPolicy {
    /// XDP action written into the rules table and the `DEFAULT_POLICY` global
    pub fn xdp_action(self) -> u32 {
        self as u32
    }
}

impl From<u32> for PacketPolicy {
    fn from(v: u32) -> Self {
        if v == xdp::PASS {
            Self::Pass
        } else {
            Self::Drop
        }
    }
}

/// Where a NAT translation redirects the destination address to.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default, ValueEnum, Debug)]
pub enum NatTarget {
    /// Primary IPv4 address of the attached interface
    #[default]
    Interface,
    /// Static address given by `translate_to`
    Ip,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} '{input}'")]
pub struct ParseEnumError {
    kind: &'static str,
    input: String,
}

// Text forms are case-insensitive and the empty string selects the default.
macro_rules! text_enum {
    ($ty:ty, $kind:literal) => {
        impl FromStr for $ty {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s.is_empty() {
                    return Ok(Self::default());
                }
                <$ty as ValueEnum>::from_str(s, true).map_err(|_| ParseEnumError {
                    kind: $kind,
                    input: s.to_string(),
                })
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.to_possible_value() {
                    Some(v) => f.write_str(v.get_name()),
                    None => write!(f, "{:?}", self),
                }
            }
        }

        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(de::Error::custom)
            }
        }
    };
}

text_enum!(Transport, "transport");
text_enum!(PacketPolicy, "packet policy");
text_enum!(NatTarget, "nat target");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!("TCP".parse::<Transport>().unwrap(), Transport::Tcp);
        assert_eq!("udp".parse::<Transport>().unwrap(), Transport::Udp);
        assert_eq!("Pass".parse::<PacketPolicy>().unwrap(), PacketPolicy::Pass);
        assert_eq!("IP".parse::<NatTarget>().unwrap(), NatTarget::Ip);
        assert_eq!("".parse::<NatTarget>().unwrap(), NatTarget::Interface);
        assert_eq!("".parse::<PacketPolicy>().unwrap(), PacketPolicy::Drop);
        assert!("icmp".parse::<Transport>().is_err());
        assert!("reject".parse::<PacketPolicy>().is_err());
    }

    #[test]
    fn wire_values() {
        assert_eq!(Transport::from(1), Transport::Tcp);
        assert_eq!(Transport::from(2), Transport::Udp);
        assert_eq!(Transport::from(17), Transport::Unspecified);
        assert_eq!(PacketPolicy::Drop.xdp_action(), 1);
        assert_eq!(PacketPolicy::Pass.xdp_action(), 2);
        assert_eq!(PacketPolicy::from(2), PacketPolicy::Pass);
    }

    #[test]
    fn display_uses_lowercase_names() {
        assert_eq!(Transport::Tcp.to_string(), "tcp");
        assert_eq!(PacketPolicy::Pass.to_string(), "pass");
        assert_eq!(NatTarget::Interface.to_string(), "interface");
    }
}
