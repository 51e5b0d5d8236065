//! XDP firewall per network interface.
//!
//! Every attached interface runs one capture variant of the firewall
//! program, a rules table keyed by destination and, unless mocked, a
//! packet transport forwarding monitored packets to the [`PacketSink`].

use crate::{
    codec::{ConnIdent, FirewallRule},
    config::FirewallInterfaceConfig,
    error::NetflowError,
    features::{self, Feature},
    helpers,
    loader::{BytesLoader, ProgramLoader},
    map::{BatchOptions, Map},
    prog::{AttachedProg, Attachment, AyaDatapath, Datapath, GlobalValue, Hook, ProgramSpec},
    sink::{ErrorSink, PacketSink, SharedErrorSink},
    transport::{PacketTransport, TransportHandle},
};
use clap::ValueEnum;
use netflow_common::{globals, maps, progs};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
};

/// Size in bytes of the ring buffer transport
pub const RING_BUFFER_SIZE: u32 = 1 << 24;

static MEMLOCK: OnceLock<Result<(), String>> = OnceLock::new();

/// Removes the memlock limit once per process, later calls repeat the outcome.
pub(crate) fn remove_memlock_once() -> Result<(), NetflowError> {
    MEMLOCK
        .get_or_init(|| helpers::remove_memlock().map_err(|e| e.to_string()))
        .clone()
        .map_err(NetflowError::MemLock)
}

/// How observed packets travel from the firewall program to user space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ValueEnum)]
pub enum MonitorMode {
    RingBuffer,
    PerfEvent,
    /// No capture, the mock program only applies the rules
    Mock,
}

impl MonitorMode {
    /// Ring buffer when the kernel has it, perf event array otherwise.
    pub fn detect() -> Result<Self, NetflowError> {
        if features::check(Feature::RingBuf) {
            Ok(Self::RingBuffer)
        } else if features::check(Feature::PerfEventArray) {
            Ok(Self::PerfEvent)
        } else {
            Err(NetflowError::UnknownMonitorMode)
        }
    }

    pub fn program(self) -> &'static str {
        match self {
            Self::RingBuffer => progs::FW_RING,
            Self::PerfEvent => progs::FW_PERF,
            Self::Mock => progs::FW_MOCK,
        }
    }

    pub fn capture_map(self) -> Option<&'static str> {
        match self {
            Self::RingBuffer => Some(maps::OBSERVED_PACKETS_RING),
            Self::PerfEvent => Some(maps::OBSERVED_PACKETS),
            Self::Mock => None,
        }
    }

    /// Program spec of the firewall for `ifname`.
    pub fn program_spec(self, ifname: &str, cfg: &FirewallInterfaceConfig) -> ProgramSpec {
        let excluded = Self::value_variants()
            .iter()
            .filter(|mode| **mode != self)
            .map(|mode| mode.program())
            .collect();

        let max_entries = match self {
            Self::RingBuffer => vec![(maps::OBSERVED_PACKETS_RING, RING_BUFFER_SIZE)],
            _ => vec![],
        };

        ProgramSpec {
            ifname: ifname.to_string(),
            attachments: vec![Attachment::new(self.program(), Hook::Xdp)],
            excluded,
            globals: vec![
                (
                    globals::DEFAULT_POLICY,
                    GlobalValue::U32(cfg.default_policy.xdp_action()),
                ),
                (globals::EMIT_UNMATCHED, GlobalValue::U8(cfg.monitor as u8)),
            ],
            max_entries,
        }
    }
}

/// Firewall state of one attached interface.
pub struct FirewallInstance {
    ifname: String,
    prog: Mutex<Box<dyn AttachedProg>>,
    rules: Map<ConnIdent, FirewallRule>,
    transport: Option<TransportHandle>,
}

impl FirewallInstance {
    pub fn ifname(&self) -> &str {
        &self.ifname
    }

    pub fn rules(&self) -> &Map<ConnIdent, FirewallRule> {
        &self.rules
    }

    fn start_transport(
        &mut self,
        mode: MonitorMode,
        packets: Arc<dyn PacketSink>,
        errors: Arc<dyn ErrorSink>,
    ) -> Result<(), NetflowError> {
        let Some(map) = mode.capture_map() else {
            return Ok(());
        };

        let reader = self
            .prog
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take_capture(map, mode)?;
        self.transport = Some(PacketTransport::new(reader, packets, errors).spawn(&self.ifname));
        Ok(())
    }

    fn put_rules(&self, cfg: &FirewallInterfaceConfig) -> Result<(), NetflowError> {
        self.rules
            .put_all(&cfg.desired_rules(), BatchOptions::default())
    }

    /// Replaces the rules table content with the rules of `cfg`.
    pub fn sync_config(&self, cfg: &FirewallInterfaceConfig) -> Result<(), NetflowError> {
        self.rules
            .sync(&cfg.desired_rules(), BatchOptions::default())
    }

    /// Stops the transport and detaches the program.
    pub fn close(&self) -> Result<(), NetflowError> {
        if let Some(transport) = &self.transport {
            transport.close();
        }
        let result = self
            .prog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stop();
        log::info!("[{}] Firewall detached", self.ifname);
        result
    }
}

enum Slot {
    /// Placeholder while the program starts outside of the registry lock
    Attaching,
    Attached(Arc<FirewallInstance>),
}

struct State {
    loader: Arc<dyn ProgramLoader>,
    monitor_mode: Option<MonitorMode>,
    interfaces: HashMap<String, Slot>,
}

pub struct Firewall {
    packets: Arc<dyn PacketSink>,
    errors: SharedErrorSink,
    datapath: Arc<dyn Datapath>,
    state: Mutex<State>,
}

impl Firewall {
    pub fn new(packets: Arc<dyn PacketSink>) -> Self {
        Self {
            packets,
            errors: SharedErrorSink::default(),
            datapath: Arc::new(AyaDatapath),
            state: Mutex::new(State {
                loader: Arc::new(BytesLoader::firewall()),
                monitor_mode: None,
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

    /// Skips detection, `None` detects on the first attach.
    pub fn with_monitor_mode(self, mode: Option<MonitorMode>) -> Self {
        self.lock().monitor_mode = mode;
        self
    }

    /// Attaches the mock program without packet capture.
    pub fn with_mocking(self, mock: bool) -> Self {
        if mock {
            self.lock().monitor_mode = Some(MonitorMode::Mock);
        }
        self
    }

    /// Applies to the running interfaces as well.
    pub fn set_error_sink(&self, sink: Arc<dyn ErrorSink>) {
        self.errors.replace(sink);
    }

    /// Used by the next attach.
    pub fn set_program_loader(&self, loader: Arc<dyn ProgramLoader>) {
        self.lock().loader = loader;
    }

    pub fn monitor_mode(&self) -> Option<MonitorMode> {
        self.lock().monitor_mode
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Loads the firewall on `ifname` and writes the rules of `cfg`. Does
    /// nothing if the interface is attached or being attached. On failure
    /// everything started so far is stopped again.
    pub fn attach_to_interface(
        &self,
        ifname: &str,
        cfg: &FirewallInterfaceConfig,
    ) -> Result<(), NetflowError> {
        if self.lock().interfaces.contains_key(ifname) {
            return Ok(());
        }

        if cfg.remove_mem_lock {
            remove_memlock_once()?;
        }

        let (mode, loader) = {
            let mut state = self.lock();
            if state.interfaces.contains_key(ifname) {
                return Ok(());
            }
            let mode = match state.monitor_mode {
                Some(mode) => mode,
                None => {
                    let mode = MonitorMode::detect()?;
                    log::info!("Firewall monitor mode: {:?}", mode);
                    state.monitor_mode = Some(mode);
                    mode
                }
            };
            state.interfaces.insert(ifname.to_string(), Slot::Attaching);
            (mode, state.loader.clone())
        };

        let result = self.start_instance(ifname, cfg, mode, loader.as_ref());

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
            // detached meanwhile
            _ => Some(inst),
        };
        drop(state);

        match orphan {
            None => {
                log::info!("[{}] Firewall attached in {:?} mode", ifname, mode);
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
        cfg: &FirewallInterfaceConfig,
        mode: MonitorMode,
        loader: &dyn ProgramLoader,
    ) -> Result<FirewallInstance, NetflowError> {
        let object = loader.load_program()?;
        let spec = mode.program_spec(ifname, cfg);
        let mut prog = self.datapath.start(&object, &spec)?;

        let rules = match prog
            .take_table(maps::FIREWALL_RULES)
            .and_then(Map::from_table)
        {
            Ok(rules) => rules,
            Err(e) => return Err(e.and_cleanup(prog.stop())),
        };

        let mut inst = FirewallInstance {
            ifname: ifname.to_string(),
            prog: Mutex::new(prog),
            rules,
            transport: None,
        };

        let errors: Arc<dyn ErrorSink> = Arc::new(self.errors.clone());
        let started = inst
            .start_transport(mode, self.packets.clone(), errors)
            .and_then(|()| inst.put_rules(cfg));
        if let Err(e) = started {
            return Err(e.and_cleanup(inst.close()));
        }

        Ok(inst)
    }

    fn instance(&self, ifname: &str) -> Result<Arc<FirewallInstance>, NetflowError> {
        match self.lock().interfaces.get(ifname) {
            Some(Slot::Attached(inst)) => Ok(inst.clone()),
            _ => Err(NetflowError::NotAttached(ifname.to_string())),
        }
    }

    /// Reconciles the rules table of `ifname` with `cfg`.
    pub fn sync_config(
        &self,
        ifname: &str,
        cfg: &FirewallInterfaceConfig,
    ) -> Result<(), NetflowError> {
        self.instance(ifname)?.sync_config(cfg)
    }

    pub fn detach_from_interface(&self, ifname: &str) -> Result<(), NetflowError> {
        let slot = self.lock().interfaces.remove(ifname);
        match slot {
            Some(Slot::Attached(inst)) => inst.close(),
            // the attaching call rolls back on its own
            Some(Slot::Attaching) => Ok(()),
            None => Err(NetflowError::NotAttached(ifname.to_string())),
        }
    }

    /// Names of the attached interfaces, sorted.
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

    /// Detaches every interface, keeping every failure.
    pub fn close(&self) -> Result<(), NetflowError> {
        let slots = std::mem::take(&mut self.lock().interfaces);
        NetflowError::join(slots.into_values().map(|slot| match slot {
            Slot::Attached(inst) => inst.close(),
            Slot::Attaching => Ok(()),
        }))
    }
}
