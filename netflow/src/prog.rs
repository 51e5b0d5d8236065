//! Loading and attaching of the kernel objects.
//!
//! [`Datapath`] is the seam between the Firewall/NAT lifecycle and the
//! kernel: [`AyaDatapath`] loads objects with aya while tests run the
//! services against in-memory tables.

use crate::{
    error::NetflowError,
    firewall::MonitorMode,
    helpers,
    table::{KernelTable, RawTable},
    transport::{CaptureReader, DEFAULT_CHANNEL_CAPACITY},
};
use aya::{
    programs::{
        tc::{self, SchedClassifier, SchedClassifierLinkId, TcAttachType},
        xdp::XdpLinkId,
        Xdp, XdpFlags,
    },
    Btf, Ebpf, EbpfLoader,
};
use aya_log::EbpfLogger;
use std::{collections::HashSet, io, net::Ipv4Addr};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Hook {
    Xdp,
    TcIngress,
    TcEgress,
}

/// Program function attached to a hook of the interface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub program: &'static str,
    pub hook: Hook,
}

impl Attachment {
    pub fn new(program: &'static str, hook: Hook) -> Self {
        Self { program, hook }
    }
}

/// Value of a read-only global patched before load.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GlobalValue {
    U32(u32),
    U8(u8),
}

/// What to load from an object and where to attach it.
///
/// The same program may appear in several attachments, it is loaded once
/// and attached to every hook.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProgramSpec {
    pub ifname: String,
    pub attachments: Vec<Attachment>,
    /// Programs of the object left unloaded
    pub excluded: Vec<&'static str>,
    pub globals: Vec<(&'static str, GlobalValue)>,
    pub max_entries: Vec<(&'static str, u32)>,
}

pub trait Datapath: Send + Sync {
    /// Loads `object` and attaches the programs of `spec`. Nothing stays
    /// attached when this fails.
    fn start(&self, object: &[u8], spec: &ProgramSpec)
        -> Result<Box<dyn AttachedProg>, NetflowError>;

    fn interface_ipv4(&self, ifname: &str) -> Result<Ipv4Addr, NetflowError> {
        helpers::primary_ipv4(ifname)
    }
}

/// Loaded object with attached programs.
pub trait AttachedProg: Send {
    /// Hands out a table of the object, each name can be taken once.
    fn take_table(&mut self, name: &str) -> Result<Box<dyn RawTable>, NetflowError>;

    fn take_capture(&mut self, name: &str, mode: MonitorMode)
        -> Result<CaptureReader, NetflowError>;

    /// Detaches every program. Safe to call more than once.
    fn stop(&mut self) -> Result<(), NetflowError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AyaDatapath;

impl Datapath for AyaDatapath {
    fn start(
        &self,
        object: &[u8],
        spec: &ProgramSpec,
    ) -> Result<Box<dyn AttachedProg>, NetflowError> {
        let ifname = &spec.ifname;
        let btf = Btf::from_sys_fs().ok();
        let mut loader = EbpfLoader::new();
        loader.btf(btf.as_ref());

        for (name, value) in &spec.globals {
            match value {
                GlobalValue::U32(v) => loader.set_global(name, v, true),
                GlobalValue::U8(v) => loader.set_global(name, v, true),
            };
        }
        for (name, max) in &spec.max_entries {
            loader.set_max_entries(name, *max);
        }

        let mut bpf = loader.load(object).map_err(|e| {
            NetflowError::kernel(format!("[{}] Failed to load the program blob", ifname), e)
        })?;

        if let Err(e) = EbpfLogger::init(&mut bpf) {
            // This can happen if all log statements are removed from eBPF program.
            log::warn!("[{}] Failed to initialize eBPF logger: {}", ifname, e);
        }

        if !spec.excluded.is_empty() {
            log::debug!("[{}] Skip programs: {:?}", ifname, spec.excluded);
        }

        let mut prog = AyaProg {
            ifname: ifname.clone(),
            bpf: Some(bpf),
            loaded: HashSet::new(),
            links: vec![],
        };

        for attachment in &spec.attachments {
            if let Err(e) = prog.attach(attachment) {
                return Err(e.and_cleanup(prog.stop()));
            }
        }

        Ok(Box::new(prog))
    }
}

enum LinkHandle {
    Xdp(&'static str, XdpLinkId),
    Tc(&'static str, SchedClassifierLinkId),
}

struct AyaProg {
    ifname: String,
    bpf: Option<Ebpf>,
    loaded: HashSet<&'static str>,
    links: Vec<LinkHandle>,
}

impl AyaProg {
    fn bpf(&mut self) -> Result<&mut Ebpf, NetflowError> {
        self.bpf
            .as_mut()
            .ok_or_else(|| NetflowError::NotAttached(self.ifname.clone()))
    }

    fn attach(&mut self, attachment: &Attachment) -> Result<(), NetflowError> {
        let name = attachment.program;
        let ifname = self.ifname.clone();
        let first_load = self.loaded.insert(name);

        let link = match attachment.hook {
            Hook::Xdp => {
                let program = self.xdp(name)?;
                if first_load {
                    program.load().map_err(|e| {
                        NetflowError::kernel(format!("Failed to load program {}", name), e)
                    })?;
                }
                let id = program
                    .attach(&ifname, XdpFlags::default())
                    .map_err(|e| {
                        NetflowError::kernel(format!("Failed to attach xdp on {}", ifname), e)
                    })?;
                LinkHandle::Xdp(name, id)
            }
            Hook::TcIngress | Hook::TcEgress => {
                clsact_added(&ifname, tc::qdisc_add_clsact(&ifname))?;

                let attach_type = if attachment.hook == Hook::TcIngress {
                    TcAttachType::Ingress
                } else {
                    TcAttachType::Egress
                };
                let program = self.classifier(name)?;
                if first_load {
                    program.load().map_err(|e| {
                        NetflowError::kernel(format!("Failed to load program {}", name), e)
                    })?;
                }
                let id = program.attach(&ifname, attach_type).map_err(|e| {
                    NetflowError::kernel(
                        format!("Failed to attach tc {:?} on {}", attach_type, ifname),
                        e,
                    )
                })?;
                LinkHandle::Tc(name, id)
            }
        };

        log::info!("[{}] Attached {} to {:?}", ifname, name, attachment.hook);
        self.links.push(link);
        Ok(())
    }

    fn xdp(&mut self, name: &str) -> Result<&mut Xdp, NetflowError> {
        self.bpf()?
            .program_mut(name)
            .ok_or_else(|| NetflowError::MissingProgram(name.to_string()))?
            .try_into()
            .map_err(|e| NetflowError::kernel(format!("{} is not an xdp program", name), e))
    }

    fn classifier(&mut self, name: &str) -> Result<&mut SchedClassifier, NetflowError> {
        self.bpf()?
            .program_mut(name)
            .ok_or_else(|| NetflowError::MissingProgram(name.to_string()))?
            .try_into()
            .map_err(|e| NetflowError::kernel(format!("{} is not a tc program", name), e))
    }

    fn detach(&mut self, link: LinkHandle) -> Result<(), NetflowError> {
        match link {
            LinkHandle::Xdp(name, id) => self
                .xdp(name)?
                .detach(id)
                .map_err(|e| NetflowError::kernel(format!("Failed to detach {}", name), e)),
            LinkHandle::Tc(name, id) => self
                .classifier(name)?
                .detach(id)
                .map_err(|e| NetflowError::kernel(format!("Failed to detach {}", name), e)),
        }
    }

    fn take_map(&mut self, name: &str) -> Result<aya::maps::Map, NetflowError> {
        self.bpf()?
            .take_map(name)
            .ok_or_else(|| NetflowError::MissingMap(name.to_string()))
    }
}

impl AttachedProg for AyaProg {
    fn take_table(&mut self, name: &str) -> Result<Box<dyn RawTable>, NetflowError> {
        let map = self.take_map(name)?;
        Ok(Box::new(KernelTable::new(name, map)?))
    }

    fn take_capture(
        &mut self,
        name: &str,
        mode: MonitorMode,
    ) -> Result<CaptureReader, NetflowError> {
        let map = self.take_map(name)?;
        match mode {
            MonitorMode::RingBuffer => CaptureReader::ring_buf(map),
            MonitorMode::PerfEvent => CaptureReader::perf_event(map, DEFAULT_CHANNEL_CAPACITY),
            MonitorMode::Mock => Err(NetflowError::UnknownMonitorMode),
        }
    }

    fn stop(&mut self) -> Result<(), NetflowError> {
        if self.bpf.is_none() {
            return Ok(());
        }

        let links = std::mem::take(&mut self.links);
        let result = NetflowError::join(links.into_iter().map(|link| self.detach(link)));

        // dropping the object releases whatever is still attached
        self.bpf = None;
        self.loaded.clear();
        log::info!("[{}] Programs detached", self.ifname);
        result
    }
}

/// The clsact qdisc is shared by every tc program of the interface, one left
/// from an earlier attach is reused.
fn clsact_added(ifname: &str, added: io::Result<()>) -> Result<(), NetflowError> {
    match added {
        Err(e) if e.kind() != io::ErrorKind::AlreadyExists => Err(NetflowError::kernel(
            format!("Failed to add clsact qdisc on {}", ifname),
            e,
        )),
        _ => Ok(()),
    }
}

impl Drop for AyaProg {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("[{}] {}", self.ifname, e);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existing_clsact_qdisc_is_reused() {
        let exists = io::Error::from(io::ErrorKind::AlreadyExists);
        assert!(clsact_added("eth0", Err(exists)).is_ok());
        assert!(clsact_added("eth0", Ok(())).is_ok());

        let denied = io::Error::from_raw_os_error(libc::EPERM);
        let err = clsact_added("eth0", Err(denied)).unwrap_err();
        assert!(matches!(err, NetflowError::Kernel { .. }));
        assert!(err.to_string().contains("clsact qdisc on eth0"));
    }
}
