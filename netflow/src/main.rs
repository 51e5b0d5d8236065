use anyhow::Context;
use clap::{builder::NonEmptyStringValueParser, Parser};
use log::{error, info, warn};
use netflow::{
    loader::FileLoader, stats, ConfigFile, Firewall, MonitorMode, Nat, NetflowError, PacketRecord,
};
use std::{path::PathBuf, sync::Arc};
use tokio::signal;

#[derive(Debug, Parser)]
struct Opt {
    /// TOML file with the `[firewall.<ifname>]` and `[nat.<ifname>]` tables
    #[clap(short, long, default_value = "netflow.toml")]
    config: PathBuf,

    /// Attach the mock programs: rules and translations are written but
    /// packets are neither captured nor translated
    #[clap(long)]
    mock: bool,

    /// Remove the locked memory limit for every firewall interface, needed
    /// by kernels without memcg based accounting
    #[clap(long)]
    remove_memlock: bool,

    /// Read `firewall.o` and `nat.o` from this directory instead of the
    /// objects embedded at build time
    #[clap(long, value_parser = NonEmptyStringValueParser::new())]
    object_dir: Option<String>,

    /// Force the packet capture transport, detected from the kernel otherwise
    #[clap(long, value_enum)]
    monitor_mode: Option<MonitorMode>,
}

fn log_packet(pkt: &PacketRecord) {
    info!(
        "{:?} {}:{} -> {}:{}",
        pkt.transport, pkt.source_ip, pkt.source_port, pkt.dest_ip, pkt.dest_port
    );
}

fn log_error(err: NetflowError) {
    error!("{}", err);
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let opt = Opt::parse();

    env_logger::init();

    let config = ConfigFile::new(&opt.config)
        .load()
        .context("Failed to load the config")?;
    info!("{}", config.description());

    let firewall = Firewall::new(Arc::new(log_packet))
        .with_error_sink(Arc::new(log_error))
        .with_monitor_mode(opt.monitor_mode)
        .with_mocking(opt.mock);
    let nat = Nat::new()
        .with_error_sink(Arc::new(log_error))
        .with_mocking(opt.mock);

    if let Some(dir) = &opt.object_dir {
        let dir = PathBuf::from(dir);
        info!("Using kernel objects from: {}", dir.display());
        firewall.set_program_loader(Arc::new(FileLoader::new(dir.join("firewall.o"))));
        nat.set_program_loader(Arc::new(FileLoader::new(dir.join("nat.o"))));
    }

    let attached = attach_all(&opt, &config, &firewall, &nat);

    if attached.is_ok() {
        info!("Waiting for Ctrl-C...");
        signal::ctrl_c().await?;
        info!("Exiting...");
    }

    if let Err(e) = firewall.close() {
        warn!("Firewall close failed, {}", e);
    }
    if let Err(e) = nat.close() {
        warn!("NAT close failed, {}", e);
    }

    let metrics = stats::gather();
    if !metrics.is_empty() {
        info!("Metrics:\n{}", metrics);
    }

    attached
}

fn attach_all(
    opt: &Opt,
    config: &netflow::Config,
    firewall: &Firewall,
    nat: &Nat,
) -> Result<(), anyhow::Error> {
    for (ifname, cfg) in &config.firewall {
        let mut cfg = cfg.clone();
        cfg.remove_mem_lock |= opt.remove_memlock;
        firewall
            .attach_to_interface(ifname, &cfg)
            .with_context(|| format!("Failed to attach the firewall to {}", ifname))?;
    }

    for (ifname, spec) in &config.nat {
        nat.attach_to_interface(ifname, spec)
            .with_context(|| format!("Failed to attach NAT to {}", ifname))?;
    }

    Ok(())
}
