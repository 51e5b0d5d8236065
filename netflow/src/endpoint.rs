use crate::{codec::ConnIdent, error::NetflowError, protocols::Transport};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{
    fmt,
    net::{IpAddr, Ipv4Addr},
    str::FromStr,
};

/// Destination matched by rules and translations, written as
/// `[ip:]port/proto`. A missing address stands for any address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Destination {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub transport: Transport,
}

impl Destination {
    pub fn is_wildcard_ip(&self) -> bool {
        self.ip.is_unspecified()
    }

    pub fn ident(&self) -> ConnIdent {
        ConnIdent::new(self.ip, self.port, self.transport)
    }
}

impl FromStr for Destination {
    type Err = NetflowError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| NetflowError::InvalidDestination {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let (addr, port_proto) = match input.rsplit_once(':') {
            Some((addr, rest)) => (Some(addr), rest),
            None => (None, input),
        };

        let ip = match addr {
            None => Ipv4Addr::UNSPECIFIED,
            Some(addr) => match addr.parse::<IpAddr>() {
                Ok(IpAddr::V4(ip)) => ip,
                Ok(IpAddr::V6(_)) => return Err(invalid("only IPv4 addresses are supported")),
                Err(e) => return Err(invalid(&format!("bad address '{}', {}", addr, e))),
            },
        };

        let (port, proto) = port_proto
            .split_once('/')
            .ok_or_else(|| invalid("expected <port>/<proto>"))?;

        let port = port
            .parse::<u16>()
            .map_err(|e| invalid(&format!("bad port '{}', {}", port, e)))?;

        let transport = match proto.parse::<Transport>() {
            Ok(Transport::Unspecified) | Err(_) => {
                return Err(invalid(&format!("unknown protocol '{}'", proto)))
            }
            Ok(t) => t,
        };

        Ok(Self {
            ip,
            port,
            transport,
        })
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_wildcard_ip() {
            write!(f, "{}/{}", self.port, self.transport)
        } else {
            write!(f, "{}:{}/{}", self.ip, self.port, self.transport)
        }
    }
}

impl Serialize for Destination {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Destination {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
