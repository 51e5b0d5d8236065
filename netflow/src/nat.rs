//! Destination NAT on the TC hooks of a network interface.
//!
//! Besides the programs and the translations table, every attached
//! interface runs an [`Epoch`] ticker feeding the kernel clock and a
//! [`ConnTrackCleaner`] keeping `conn_track` below its high-water mark.

use crate::{
    codec::{ConnIdent, ConnMeta, NatConfigKey},
    config::{NatTableSpec, NatTargetSpec},
    conntrack::ConnTrackCleaner,
    epoch::{Epoch, DEFAULT_EPOCH_SYNC_WINDOW},
    error::NetflowError,
    loader::{BytesLoader, ProgramLoader},
    map::{BatchOptions, Map},
    prog::{AttachedProg, Attachment, AyaDatapath, Datapath, GlobalValue, Hook, ProgramSpec},
    sink::{ErrorSink, SharedErrorSink},
    stats,
};
use netflow_common::{globals, maps, progs};
use std::{
    collections::HashMap,
    net::Ipv4Addr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

/// Programs attached on the ingress and egress hooks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NatPrograms {
    pub ingress: &'static str,
    pub egress: &'static str,
}

impl NatPrograms {
    pub const DEFAULT: Self = Self {
        ingress: progs::NAT_INGRESS,
        egress: progs::NAT_EGRESS,
    };

    /// The mock program cloned on both hooks.
    pub const MOCK: Self = Self {
        ingress: progs::NAT_MOCK,
        egress: progs::NAT_MOCK,
    };

    pub fn program_spec(self, ifname: &str, interface_addr: Ipv4Addr) -> ProgramSpec {
        let excluded = [progs::NAT_INGRESS, progs::NAT_EGRESS, progs::NAT_MOCK]
            .into_iter()
            .filter(|name| *name != self.ingress && *name != self.egress)
            .collect();

        ProgramSpec {
            ifname: ifname.to_string(),
            attachments: vec![
                Attachment::new(self.ingress, Hook::TcIngress),
                Attachment::new(self.egress, Hook::TcEgress),
            ],
            excluded,
            globals: vec![(
                globals::INTERFACE_IP,
                GlobalValue::U32(u32::from_le_bytes(interface_addr.octets())),
            )],
            max_entries: vec![],
        }
    }
}

pub struct NatInstance {
    ifname: String,
    interface_addr: Ipv4Addr,
    prog: Mutex<Box<dyn AttachedProg>>,
    translations: Map<ConnIdent, ConnMeta>,
    epoch: Epoch,
    cleaner: ConnTrackCleaner,
}

impl NatInstance {
    pub fn ifname(&self) -> &str {
        &self.ifname
    }

    pub fn interface_addr(&self) -> Ipv4Addr {
        self.interface_addr
    }

    pub fn translations(&self) -> &Map<ConnIdent, ConnMeta> {
        &self.translations
    }

    pub fn epoch(&self) -> &Epoch {
        &self.epoch
    }

    pub fn cleaner(&self) -> &ConnTrackCleaner {
        &self.cleaner
    }

    fn start(&self, spec: &NatTableSpec) -> Result<(), NetflowError> {
        self.epoch.sync()?;
        self.cleaner
            .start(spec.conn_track.effective_cleanup_window())?;
        self.epoch.start_sync(DEFAULT_EPOCH_SYNC_WINDOW)?;
        self.sync_translations(&spec.translations)
    }

    /// Reconciles the translations table with `targets`. Invalid targets
    /// fail the call before anything is written.
    pub fn sync_translations(&self, targets: &[NatTargetSpec]) -> Result<(), NetflowError> {
        let desired = NatTableSpec::desired_translations(targets, self.interface_addr)?;
        self.translations.sync(&desired, BatchOptions::default())
    }

    /// Stops the tickers and detaches the programs.
    pub fn close(&self) -> Result<(), NetflowError> {
        self.epoch.stop();
        self.cleaner.stop();
        let result = self
            .prog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stop();
        stats::forget_interface(&self.ifname);
        log::info!("[{}] NAT detached", self.ifname);
        result
    }
}

enum Slot {
    Attaching,
    Attached(Arc<NatInstance>),
}

struct State {
    loader: Arc<dyn ProgramLoader>,
    programs: NatPrograms,
    interfaces: HashMap<String, Slot>,
}

pub struct Nat {
    errors: SharedErrorSink,
    datapath: Arc<dyn Datapath>,
    state: Mutex<State>,
}

impl Default for Nat {
    fn default() -> Self {
        Self::new()
    }
}

impl Nat {
    pub fn new() -> Self {
        Self {
            errors: SharedErrorSink::default(),
            datapath: Arc::new(AyaDatapath),
            state: Mutex::new(State {
                loader: Arc::new(BytesLoader::nat()),
                programs: NatPrograms::DEFAULT,
                interfaces: HashMap::new(),
            }),
        }
    }

    pub fn with_error_sink(self, sink: Arc<dyn ErrorSink>) -> Self {
        self.set_error_sink(sink);
        self
    }

    pub fn with_program_loader(self, loader: Arc<dyn ProgramLoader>) -> Self {
        self.set_program_loader(loader);
        self
    }

    pub fn with_datapath(self, datapath: Arc<dyn Datapath>) -> Self {
        Self { datapath, ..self }
    }

    /// Attaches `nat_mock` on both hooks instead of the translating programs.
    pub fn with_mocking(self, mock: bool) -> Self {
        self.lock().programs = if mock {
            NatPrograms::MOCK
        } else {
            NatPrograms::DEFAULT
        };
        self
    }

    pub fn with_programs(self, programs: NatPrograms) -> Self {
        self.lock().programs = programs;
        self
    }

    /// Applies to the running interfaces as well.
    pub fn set_error_sink(&self, sink: Arc<dyn ErrorSink>) {
        self.errors.replace(sink);
    }

    pub fn set_program_loader(&self, loader: Arc<dyn ProgramLoader>) {
        self.lock().loader = loader;
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Loads the NAT programs on `ifname`, starts its tickers and writes
    /// the translations of `spec`. Does nothing if the interface is
    /// attached or being attached. On failure everything started so far is
    /// stopped again.
    pub fn attach_to_interface(&self, ifname: &str, spec: &NatTableSpec) -> Result<(), NetflowError> {
        let (programs, loader) = {
            let mut state = self.lock();
            if state.interfaces.contains_key(ifname) {
                return Ok(());
            }
            state.interfaces.insert(ifname.to_string(), Slot::Attaching);
            (state.programs, state.loader.clone())
        };

        let result = self.start_instance(ifname, spec, programs, loader.as_ref());

        let mut state = self.lock();
        let inst = match result {
            Ok(inst) => inst,
            Err(e) => {
                state.interfaces.remove(ifname);
                return Err(e);
            }
        };

        let orphan = match state.interfaces.get_mut(ifname) {
            Some(slot) if matches!(slot, Slot::Attaching) => {
                *slot = Slot::Attached(Arc::new(inst));
                None
            }
            _ => Some(inst),
        };
        drop(state);

        match orphan {
            None => {
                log::info!("[{}] NAT attached, {:?}", ifname, programs);
                Ok(())
            }
            Some(inst) => {
                let err = NetflowError::Detached(ifname.to_string());
                Err(err.and_cleanup(inst.close()))
            }
        }
    }

    fn start_instance(
        &self,
        ifname: &str,
        spec: &NatTableSpec,
        programs: NatPrograms,
        loader: &dyn ProgramLoader,
    ) -> Result<NatInstance, NetflowError> {
        let interface_addr = self.datapath.interface_ipv4(ifname)?;
        // check the targets before touching the kernel
        NatTableSpec::desired_translations(&spec.translations, interface_addr)?;

        let object = loader.load_program()?;
        let mut prog = self
            .datapath
            .start(&object, &programs.program_spec(ifname, interface_addr))?;

        let tables = take_tables(prog.as_mut());
        let (config, translations, conn_track) = match tables {
            Ok(tables) => tables,
            Err(e) => return Err(e.and_cleanup(prog.stop())),
        };

        let errors: Arc<dyn ErrorSink> = Arc::new(self.errors.clone());
        let inst = NatInstance {
            ifname: ifname.to_string(),
            interface_addr,
            prog: Mutex::new(prog),
            translations,
            epoch: Epoch::new(Arc::new(config)).with_error_sink(errors.clone()),
            cleaner: ConnTrackCleaner::new(
                Arc::new(conn_track),
                Some(errors),
                spec.conn_track.effective_high_water_mark(),
                ifname,
            ),
        };

        if let Err(e) = inst.start(spec) {
            return Err(e.and_cleanup(inst.close()));
        }

        Ok(inst)
    }

    fn instance(&self, ifname: &str) -> Result<Arc<NatInstance>, NetflowError> {
        match self.lock().interfaces.get(ifname) {
            Some(Slot::Attached(inst)) => Ok(inst.clone()),
            _ => Err(NetflowError::NotAttached(ifname.to_string())),
        }
    }

    pub fn sync_translations(
        &self,
        ifname: &str,
        targets: &[NatTargetSpec],
    ) -> Result<(), NetflowError> {
        self.instance(ifname)?.sync_translations(targets)
    }

    pub fn detach_from_interface(&self, ifname: &str) -> Result<(), NetflowError> {
        let slot = self.lock().interfaces.remove(ifname);
        match slot {
            Some(Slot::Attached(inst)) => inst.close(),
            Some(Slot::Attaching) => Ok(()),
            None => Err(NetflowError::NotAttached(ifname.to_string())),
        }
    }

    pub fn attached_interfaces(&self) -> Vec<String> {
        let mut names = self
            .lock()
            .interfaces
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Attached(_)))
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    pub fn close(&self) -> Result<(), NetflowError> {
        let slots = std::mem::take(&mut self.lock().interfaces);
        NetflowError::join(slots.into_values().map(|slot| match slot {
            Slot::Attached(inst) => inst.close(),
            Slot::Attaching => Ok(()),
        }))
    }
}

type NatTables = (
    Map<NatConfigKey, u32>,
    Map<ConnIdent, ConnMeta>,
    Map<ConnIdent, ConnMeta>,
);

fn take_tables(prog: &mut dyn AttachedProg) -> Result<NatTables, NetflowError> {
    Ok((
        Map::from_table(prog.take_table(maps::NAT_CONFIG)?)?,
        Map::from_table(prog.take_table(maps::NAT_TRANSLATIONS)?)?,
        Map::from_table(prog.take_table(maps::CONN_TRACK)?)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ConnTrackConfig, conntrack::DEFAULT_HIGH_WATER_MARK, prog::testing::{FakeDatapath, StartGate},
        protocols::{NatTarget, Transport},
    };
    use std::{net::IpAddr, time::Duration};

    fn target(dest: &str, redirect_to: NatTarget, translate_to: Option<Ipv4Addr>) -> NatTargetSpec {
        NatTargetSpec {
            dest: dest.parse().unwrap(),
            redirect_to,
            translate_to,
        }
    }

    fn nat(datapath: &FakeDatapath) -> Nat {
        Nat::new()
            .with_datapath(Arc::new(datapath.clone()))
            .with_program_loader(Arc::new(BytesLoader::new("nat.o", &b"fake"[..])))
    }

    #[test]
    fn mock_programs_are_cloned_on_both_hooks() {
        let spec = NatPrograms::MOCK.program_spec("eth0", Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(
            spec.attachments,
            vec![
                Attachment::new(progs::NAT_MOCK, Hook::TcIngress),
                Attachment::new(progs::NAT_MOCK, Hook::TcEgress),
            ]
        );
        assert_eq!(spec.excluded, vec![progs::NAT_INGRESS, progs::NAT_EGRESS]);
        // octets in memory order
        assert_eq!(
            spec.globals,
            vec![(globals::INTERFACE_IP, GlobalValue::U32(0x0100_000a))]
        );

        let spec = NatPrograms::DEFAULT.program_spec("eth0", Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(spec.excluded, vec![progs::NAT_MOCK]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn attach_while_attaching_returns_without_starting() {
        let gate = StartGate::new();
        let datapath = FakeDatapath::default().gated_start(gate.clone());
        let nat = Arc::new(nat(&datapath).with_mocking(true));
        let spec = NatTableSpec {
            translations: vec![target("80/tcp", NatTarget::Interface, None)],
            ..Default::default()
        };

        let first = {
            let (nat, spec) = (nat.clone(), spec.clone());
            tokio::task::spawn_blocking(move || nat.attach_to_interface("eth0", &spec))
        };
        tokio::task::block_in_place(|| gate.wait_entered());

        nat.attach_to_interface("eth0", &spec).unwrap();
        assert_eq!(datapath.started().len(), 1);
        assert!(nat.attached_interfaces().is_empty());

        gate.release();
        first.await.unwrap().unwrap();
        assert_eq!(datapath.started().len(), 1);
        assert_eq!(nat.attached_interfaces(), vec!["eth0".to_string()]);
        nat.close().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn attach_writes_translations_and_epoch() {
        let datapath = FakeDatapath::default();
        let nat = nat(&datapath).with_mocking(true);
        let spec = NatTableSpec {
            conn_track: ConnTrackConfig {
                high_water_mark: 0.05,
                cleanup_window: Duration::ZERO,
            },
            translations: vec![
                target("80/tcp", NatTarget::Interface, None),
                target(
                    "192.168.0.5:53/udp",
                    NatTarget::Ip,
                    Some(Ipv4Addr::new(172, 16, 0, 9)),
                ),
            ],
        };

        nat.attach_to_interface("eth0", &spec).unwrap();
        nat.attach_to_interface("eth0", &spec).unwrap();
        assert_eq!(datapath.started().len(), 1);
        assert_eq!(datapath.started()[0].attachments[0].program, progs::NAT_MOCK);

        let inst = nat.instance("eth0").unwrap();
        assert_eq!(inst.cleaner().high_water_mark(), DEFAULT_HIGH_WATER_MARK);

        let translations = inst.translations().get_all(BatchOptions::default()).unwrap();
        let http = ConnIdent::new(Ipv4Addr::UNSPECIFIED, 80, Transport::Tcp);
        let dns = ConnIdent::new(Ipv4Addr::new(192, 168, 0, 5), 53, Transport::Udp);
        assert_eq!(translations.len(), 2);
        assert_eq!(translations[&http].addr, IpAddr::from(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(translations[&dns].addr, IpAddr::from(Ipv4Addr::new(172, 16, 0, 9)));

        // the first epoch is written during attach
        assert!(datapath.table("eth0", maps::NAT_CONFIG).ops().writes() >= 1);

        nat.sync_translations("eth0", &spec.translations[1..]).unwrap();
        let translations = inst.translations().get_all(BatchOptions::default()).unwrap();
        assert_eq!(translations.len(), 1);
        assert!(translations.contains_key(&dns));

        nat.close().unwrap();
        assert_eq!(datapath.stopped(), 1);
        assert!(nat.attached_interfaces().is_empty());
    }

    #[tokio::test]
    async fn invalid_target_aborts_before_start() {
        let datapath = FakeDatapath::default();
        let nat = nat(&datapath);
        let spec = NatTableSpec {
            translations: vec![target("80/tcp", NatTarget::Ip, None)],
            ..Default::default()
        };

        assert!(matches!(
            nat.attach_to_interface("eth0", &spec),
            Err(NetflowError::Config(_))
        ));
        assert!(datapath.started().is_empty());
        assert!(nat.attached_interfaces().is_empty());
    }

    #[tokio::test]
    async fn missing_address_aborts() {
        let datapath = FakeDatapath::default().without_address();
        let nat = nat(&datapath);

        assert!(matches!(
            nat.attach_to_interface("eth0", &NatTableSpec::default()),
            Err(NetflowError::NoInterfaceAddress(_))
        ));
        assert!(datapath.started().is_empty());
    }

    #[tokio::test]
    async fn missing_conn_track_rolls_back() {
        let datapath = FakeDatapath::default().without_table(maps::CONN_TRACK);
        let nat = nat(&datapath);

        let err = nat
            .attach_to_interface("eth0", &NatTableSpec::default())
            .unwrap_err();
        assert!(matches!(err, NetflowError::MissingMap(_)));
        assert_eq!(datapath.stopped(), 1);
        assert!(nat.attached_interfaces().is_empty());

        // the name is free again
        let nat = nat.with_datapath(Arc::new(FakeDatapath::default()));
        nat.attach_to_interface("eth0", &NatTableSpec::default())
            .unwrap();
        assert_eq!(nat.attached_interfaces(), vec!["eth0"]);
        nat.close().unwrap();
    }

    #[tokio::test]
    async fn detach_unknown_interface() {
        let nat = nat(&FakeDatapath::default());
        assert!(matches!(
            nat.detach_from_interface("eth0"),
            Err(NetflowError::NotAttached(_))
        ));
        assert!(matches!(
            nat.sync_translations("eth0", &[]),
            Err(NetflowError::NotAttached(_))
        ));
    }
}
