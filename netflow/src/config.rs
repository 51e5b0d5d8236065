use crate::{
    codec::{ConnIdent, ConnMeta, FirewallRule},
    conntrack::{DEFAULT_CLEANUP_WINDOW, DEFAULT_HIGH_WATER_MARK, MIN_HIGH_WATER_MARK},
    endpoint::Destination,
    error::NetflowError,
    protocols::{NatTarget, PacketPolicy, Transport},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fs::OpenOptions,
    io::{Read, Write},
    net::Ipv4Addr,
    path::{Path, PathBuf},
    time::Duration,
};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallInterfaceConfig {
    pub remove_mem_lock: bool,
    /// Verdict for packets no rule matches
    pub default_policy: PacketPolicy,
    /// Emit packets no rule matches, also the default of [`RuleEntry::monitor`]
    pub monitor: bool,
    pub rules: Vec<RuleEntry>,
}

impl FirewallInterfaceConfig {
    /// Content of the rules table for this configuration. Later entries
    /// win over earlier ones with the same destination.
    pub fn desired_rules(&self) -> HashMap<ConnIdent, FirewallRule> {
        self.rules
            .iter()
            .map(|entry| (entry.dest.ident(), entry.rule(self.monitor)))
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuleEntry {
    #[serde(default)]
    pub policy: PacketPolicy,
    #[serde(alias = "destination")]
    pub dest: Destination,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor: Option<bool>,
}

impl RuleEntry {
    pub fn monitor_traffic(&self, default: bool) -> bool {
        self.monitor.unwrap_or(default)
    }

    pub fn rule(&self, default_monitor: bool) -> FirewallRule {
        FirewallRule {
            policy: self.policy,
            monitor_traffic: self.monitor_traffic(default_monitor),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnTrackConfig {
    /// Fill ratio that triggers eviction, values below 0.1 use 0.7
    pub high_water_mark: f64,
    /// Zero uses the default of 5s
    #[serde(with = "duration")]
    pub cleanup_window: Duration,
}

impl ConnTrackConfig {
    pub fn effective_high_water_mark(&self) -> f64 {
        if self.high_water_mark < MIN_HIGH_WATER_MARK {
            DEFAULT_HIGH_WATER_MARK
        } else {
            self.high_water_mark
        }
    }

    pub fn effective_cleanup_window(&self) -> Duration {
        if self.cleanup_window.is_zero() {
            DEFAULT_CLEANUP_WINDOW
        } else {
            self.cleanup_window
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NatTargetSpec {
    #[serde(alias = "destination")]
    pub dest: Destination,
    #[serde(default)]
    pub redirect_to: NatTarget,
    /// Required when redirecting to [`NatTarget::Ip`]
    #[serde(
        default,
        alias = "translateTo",
        skip_serializing_if = "Option::is_none"
    )]
    pub translate_to: Option<Ipv4Addr>,
}

impl NatTargetSpec {
    pub fn translation(
        &self,
        interface_addr: Ipv4Addr,
    ) -> Result<(ConnIdent, ConnMeta), NetflowError> {
        let addr = match self.redirect_to {
            NatTarget::Interface => interface_addr,
            NatTarget::Ip => self.translate_to.ok_or_else(|| {
                NetflowError::Config(format!("translation of {} has no translate_to", self.dest))
            })?,
        };

        // the port and transport of the destination are kept by the kernel
        let to = ConnMeta {
            addr: addr.into(),
            port: 0,
            transport: Transport::Unspecified,
            last_observed: 0,
        };
        Ok((self.dest.ident(), to))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatTableSpec {
    pub conn_track: ConnTrackConfig,
    pub translations: Vec<NatTargetSpec>,
}

impl NatTableSpec {
    /// Content of the translations table, fails on the first invalid target.
    pub fn desired_translations(
        targets: &[NatTargetSpec],
        interface_addr: Ipv4Addr,
    ) -> Result<HashMap<ConnIdent, ConnMeta>, NetflowError> {
        targets
            .iter()
            .map(|target| target.translation(interface_addr))
            .collect()
    }
}

/// Interfaces managed by `netflowd`, keyed by interface name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub firewall: BTreeMap<String, FirewallInterfaceConfig>,
    pub nat: BTreeMap<String, NatTableSpec>,
}

impl Config {
    pub fn from_toml(contents: &str) -> Result<Self, NetflowError> {
        toml::from_str(contents).map_err(|e| NetflowError::Config(e.to_string()))
    }

    pub fn description(&self) -> String {
        let rules = self
            .firewall
            .values()
            .fold(0, |acc, fw| acc + fw.rules.len());
        let translations = self
            .nat
            .values()
            .fold(0, |acc, nat| acc + nat.translations.len());
        format!(
            "Firewall: {rules} rules in {} netifs, NAT: {translations} translations in {} netifs",
            self.firewall.len(),
            self.nat.len()
        )
    }
}

pub struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn load(&self) -> Result<Config, NetflowError> {
        let display = self.path.display();
        let exists = self
            .path
            .try_exists()
            .map_err(|e| NetflowError::Config(format!("can't check {}, {}", display, e)))?;
        if !exists {
            return Err(NetflowError::Config(format!(
                "config file does not exist, {}",
                display
            )));
        }

        let read_err =
            |e: std::io::Error| NetflowError::Config(format!("can't read {}, {}", display, e));
        let mut file = OpenOptions::new()
            .read(true)
            .open(&self.path)
            .map_err(read_err)?;
        let mut contents = String::new();
        let size = file.read_to_string(&mut contents).map_err(read_err)?;

        log::info!("Read {} bytes from: {}", size, display);

        let cfg = Config::from_toml(&contents)?;

        log::info!("Found in config: {}", cfg.description());
        Ok(cfg)
    }

    pub fn save(&self, cfg: &Config) -> Result<(), NetflowError> {
        let display = self.path.display();
        let contents =
            toml::to_string(cfg).map_err(|e| NetflowError::Config(e.to_string()))?;

        if self.path.exists() {
            log::info!("Config file will be overridden, {}", display);
        }

        let write_err =
            |e: std::io::Error| NetflowError::Config(format!("can't write {}, {}", display, e));
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .map_err(write_err)?;
        file.write_all(contents.as_bytes()).map_err(write_err)?;

        log::info!("Wrote {} bytes to config file: {}", contents.len(), display);
        Ok(())
    }
}

/// Durations written as `500ms`, `5s`, `1m` or `1h`. Plain integers are seconds.
pub mod duration {
    use serde::{de, Deserializer, Serializer};
    use std::{fmt, time::Duration};

    pub fn parse(input: &str) -> Result<Duration, String> {
        let input = input.trim();
        let split = input
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(input.len());
        let (value, unit) = input.split_at(split);
        let value = value
            .parse::<u64>()
            .map_err(|_| format!("invalid duration '{}'", input))?;

        let secs = |scale: u64| {
            value
                .checked_mul(scale)
                .map(Duration::from_secs)
                .ok_or_else(|| format!("duration '{}' is too large", input))
        };

        match unit.trim() {
            "ms" => Ok(Duration::from_millis(value)),
            "" | "s" => Ok(Duration::from_secs(value)),
            "m" => secs(60),
            "h" => secs(3600),
            other => Err(format!("unknown unit '{}' in duration '{}'", other, input)),
        }
    }

    pub fn format(value: &Duration) -> String {
        let millis = value.as_millis();
        if millis % 1000 == 0 {
            format!("{}s", millis / 1000)
        } else {
            format!("{}ms", millis)
        }
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        struct DurationVisitor;

        impl<'de> de::Visitor<'de> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a duration such as 500ms, 5s, 1m or 1h")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
                parse(v).map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
                Ok(Duration::from_secs(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
                u64::try_from(v)
                    .map(Duration::from_secs)
                    .map_err(|_| E::custom("negative duration"))
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[firewall.eth0]
remove_mem_lock = true
default_policy = "pass"
monitor = true

[[firewall.eth0.rules]]
policy = "drop"
dest = "8080/tcp"
monitor = false

[[firewall.eth0.rules]]
policy = "Pass"
destination = "192.168.0.1:53/UDP"

[nat.eth0.conn_track]
high_water_mark = 0.8
cleanup_window = "500ms"

[[nat.eth0.translations]]
dest = "0.0.0.0:80/tcp"
redirect_to = "interface"

[[nat.eth0.translations]]
dest = "443/tcp"
redirect_to = "ip"
translateTo = "10.10.0.5"
"#;

    #[test]
    fn parses_firewall_and_nat_tables() {
        let cfg = Config::from_toml(SAMPLE).unwrap();

        let fw = &cfg.firewall["eth0"];
        assert!(fw.remove_mem_lock);
        assert_eq!(fw.default_policy, PacketPolicy::Pass);
        assert_eq!(fw.rules.len(), 2);
        assert_eq!(fw.rules[1].dest.transport, Transport::Udp);
        assert!(!fw.rules[0].monitor_traffic(fw.monitor));
        assert!(fw.rules[1].monitor_traffic(fw.monitor));

        let nat = &cfg.nat["eth0"];
        assert_eq!(nat.conn_track.cleanup_window, Duration::from_millis(500));
        assert_eq!(nat.conn_track.effective_high_water_mark(), 0.8);
        assert_eq!(nat.translations[1].redirect_to, NatTarget::Ip);
        assert_eq!(
            nat.translations[1].translate_to,
            Some(Ipv4Addr::new(10, 10, 0, 5))
        );
    }

    #[test]
    fn malformed_destination_is_rejected() {
        let err = Config::from_toml(
            r#"
[[firewall.lo.rules]]
dest = "80-tcp"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, NetflowError::Config(_)));
    }

    #[test]
    fn conn_track_defaults() {
        let cfg = ConnTrackConfig::default();
        assert_eq!(cfg.effective_high_water_mark(), DEFAULT_HIGH_WATER_MARK);
        assert_eq!(cfg.effective_cleanup_window(), DEFAULT_CLEANUP_WINDOW);

        let cfg = ConnTrackConfig {
            high_water_mark: 0.05,
            cleanup_window: Duration::from_secs(30),
        };
        assert_eq!(cfg.effective_high_water_mark(), DEFAULT_HIGH_WATER_MARK);
        assert_eq!(cfg.effective_cleanup_window(), Duration::from_secs(30));
    }

    #[test]
    fn durations() {
        assert_eq!(duration::parse("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(duration::parse("5s"), Ok(Duration::from_secs(5)));
        assert_eq!(duration::parse("2m"), Ok(Duration::from_secs(120)));
        assert_eq!(duration::parse("1h"), Ok(Duration::from_secs(3600)));
        assert_eq!(duration::parse("7"), Ok(Duration::from_secs(7)));
        assert!(duration::parse("5d").is_err());
        assert!(duration::parse("ms").is_err());
        assert!(duration::parse("307445734561825861m").is_err());
        assert!(duration::parse("5124095576030432h").is_err());
        let overflow = "[nat.eth0.conn_track]\ncleanup_window = \"307445734561825861m\"\n";
        assert!(Config::from_toml(overflow).is_err());
        assert_eq!(duration::format(&Duration::from_millis(1500)), "1500ms");
        assert_eq!(duration::format(&Duration::from_secs(5)), "5s");
    }

    #[test]
    fn later_rules_win() {
        let cfg = FirewallInterfaceConfig {
            monitor: true,
            rules: vec![
                RuleEntry {
                    policy: PacketPolicy::Drop,
                    dest: "80/tcp".parse().unwrap(),
                    monitor: None,
                },
                RuleEntry {
                    policy: PacketPolicy::Pass,
                    dest: "0.0.0.0:80/tcp".parse().unwrap(),
                    monitor: Some(false),
                },
            ],
            ..Default::default()
        };

        let rules = cfg.desired_rules();
        assert_eq!(rules.len(), 1);
        let rule = rules.values().next().unwrap();
        assert_eq!(rule.policy, PacketPolicy::Pass);
        assert!(!rule.monitor_traffic);
    }

    #[test]
    fn translations_resolve_their_address() {
        let iface = Ipv4Addr::new(10, 0, 0, 1);
        let targets = vec![
            NatTargetSpec {
                dest: "80/tcp".parse().unwrap(),
                redirect_to: NatTarget::Interface,
                translate_to: None,
            },
            NatTargetSpec {
                dest: "53/udp".parse().unwrap(),
                redirect_to: NatTarget::Ip,
                translate_to: Some(Ipv4Addr::new(192, 168, 0, 53)),
            },
        ];

        let desired = NatTableSpec::desired_translations(&targets, iface).unwrap();
        assert_eq!(desired[&targets[0].dest.ident()].addr, iface);
        assert_eq!(
            desired[&targets[1].dest.ident()].addr,
            Ipv4Addr::new(192, 168, 0, 53)
        );

        let missing = NatTargetSpec {
            translate_to: None,
            ..targets[1].clone()
        };
        assert!(matches!(
            missing.translation(iface),
            Err(NetflowError::Config(_))
        ));
    }

    #[test]
    fn saved_config_loads_back() {
        let path = std::env::temp_dir().join(format!("netflow-config-{}.toml", std::process::id()));
        let file = ConfigFile::new(&path);
        let cfg = Config::from_toml(SAMPLE).unwrap();

        file.save(&cfg).unwrap();
        assert_eq!(file.load().unwrap(), cfg);
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(file.load(), Err(NetflowError::Config(_))));
    }
}
