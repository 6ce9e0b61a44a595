use std::{
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow, ensure};
use aya::pin::PinError;
use aya::programs::tc::{self, SchedClassifier, SchedClassifierLinkId, TcAttachType};
use aya::programs::xdp::XdpLinkId;
use aya::programs::{Program, ProgramError, Xdp, XdpFlags};
use aya::{Ebpf, EbpfLoader, include_bytes_aligned};
use clap::ValueEnum;
use log::{debug, info};
use tokio::signal;

use proto_counter_common::{MAP_IF_STATS, MAP_STATS};

const EBPF_BYTES: &[u8] = include_bytes_aligned!(concat!(env!("OUT_DIR"), "/proto-counter"));
const XDP_PROGRAM: &str = "xdp_proto_counter";
const TC_PROGRAM: &str = "tc_proto_counter";

pub const DEFAULT_PIN_DIR: &str = "/sys/fs/bpf/proto_counter";

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum AttachPoint {
    TcIngress,
    Xdp,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum XdpMode {
    Skb,
    Driver,
    Hw,
}

#[derive(Clone, Debug)]
pub struct AttachOptions {
    pub iface: String,
    pub pin_dir: PathBuf,
    pub attach_point: AttachPoint,
    pub xdp_mode: XdpMode,
    pub if_map_entries: u32,
}

pub async fn attach_program(opts: AttachOptions) -> Result<()> {
    validate_attach_options(&opts)?;
    bump_memlock_rlimit();

    let mut loader = EbpfLoader::new();
    #[allow(deprecated)]
    {
        // `set_max_entries` is currently the only stable API across our Aya pin.
        loader.set_max_entries(MAP_IF_STATS, opts.if_map_entries);
    }

    let mut bpf = loader
        .load(EBPF_BYTES)
        .context("failed to load eBPF object")?;

    for map_name in [MAP_STATS, MAP_IF_STATS] {
        pin_map(&mut bpf, map_name, &opts.pin_dir.join(map_name))?;
    }
    info!("counter maps pinned under {}", opts.pin_dir.display());

    let handle = match opts.attach_point {
        AttachPoint::Xdp => LinkHandle::Xdp(attach_xdp(&mut bpf, &opts.iface, opts.xdp_mode)?),
        AttachPoint::TcIngress => LinkHandle::Tc(attach_tc_ingress(&mut bpf, &opts.iface)?),
    };

    info!(
        "attached {:?} program to {}, press Ctrl+C to detach",
        opts.attach_point, opts.iface
    );

    signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;

    info!("detaching {:?} from {}", opts.attach_point, opts.iface);
    detach(&mut bpf, handle)
}

fn validate_attach_options(opts: &AttachOptions) -> Result<()> {
    ensure!(!opts.iface.is_empty(), "interface name must not be empty");
    ensure!(
        opts.if_map_entries > 0,
        "per-interface map size must be greater than zero"
    );
    Ok(())
}

// Older kernels account map memory against RLIMIT_MEMLOCK instead of memcg.
fn bump_memlock_rlimit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        debug!("remove limit on locked memory failed, ret is: {ret}");
    }
}

fn pin_map(bpf: &mut Ebpf, map_name: &str, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let map = bpf
        .map_mut(map_name)
        .with_context(|| format!("map {map_name} not found"))?;
    match map.pin(path) {
        Ok(()) => Ok(()),
        Err(PinError::SyscallError(err)) if err.io_error.kind() == io::ErrorKind::AlreadyExists => {
            debug!("map {map_name} already pinned at {}", path.display());
            Ok(())
        }
        Err(err) => Err(anyhow!(
            "failed to pin map {map_name} at {}: {err}",
            path.display()
        )),
    }
}

enum LinkHandle {
    Xdp(XdpLinkId),
    Tc(SchedClassifierLinkId),
}

fn attach_xdp(bpf: &mut Ebpf, iface: &str, mode: XdpMode) -> Result<XdpLinkId> {
    let program: &mut Xdp = typed_program(bpf, XDP_PROGRAM)?;
    program.load().context("failed to load xdp program")?;
    program
        .attach(iface, xdp_flags(mode))
        .with_context(|| format!("failed to attach xdp on {iface}"))
}

fn attach_tc_ingress(bpf: &mut Ebpf, iface: &str) -> Result<SchedClassifierLinkId> {
    // Fails harmlessly when the qdisc is already there.
    if let Err(err) = tc::qdisc_add_clsact(iface) {
        debug!("clsact qdisc on {iface} not added: {err}");
    }
    let program: &mut SchedClassifier = typed_program(bpf, TC_PROGRAM)?;
    program.load().context("failed to load tc program")?;
    program
        .attach(iface, TcAttachType::Ingress)
        .with_context(|| format!("failed to attach tc ingress on {iface}"))
}

fn detach(bpf: &mut Ebpf, handle: LinkHandle) -> Result<()> {
    match handle {
        LinkHandle::Xdp(id) => typed_program::<Xdp>(bpf, XDP_PROGRAM)?
            .detach(id)
            .context("failed to detach xdp program"),
        LinkHandle::Tc(id) => typed_program::<SchedClassifier>(bpf, TC_PROGRAM)?
            .detach(id)
            .context("failed to detach tc program"),
    }
}

fn typed_program<'a, P>(bpf: &'a mut Ebpf, name: &str) -> Result<&'a mut P>
where
    &'a mut P: TryFrom<&'a mut Program, Error = ProgramError>,
{
    bpf.program_mut(name)
        .with_context(|| format!("program {name} not found"))?
        .try_into()
        .with_context(|| format!("program {name} has the wrong type"))
}

fn xdp_flags(mode: XdpMode) -> XdpFlags {
    match mode {
        XdpMode::Skb => XdpFlags::SKB_MODE,
        XdpMode::Driver => XdpFlags::DRV_MODE,
        XdpMode::Hw => XdpFlags::HW_MODE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(iface: &str, entries: u32) -> AttachOptions {
        AttachOptions {
            iface: iface.to_string(),
            pin_dir: PathBuf::from(DEFAULT_PIN_DIR),
            attach_point: AttachPoint::TcIngress,
            xdp_mode: XdpMode::Skb,
            if_map_entries: entries,
        }
    }

    #[test]
    fn rejects_zero_sized_interface_map() {
        assert!(validate_attach_options(&options("eth0", 0)).is_err());
        assert!(validate_attach_options(&options("eth0", 4096)).is_ok());
    }

    #[test]
    fn rejects_empty_interface_name() {
        assert!(validate_attach_options(&options("", 4096)).is_err());
    }

    #[test]
    fn xdp_modes_map_to_flags() {
        assert_eq!(xdp_flags(XdpMode::Skb).bits(), XdpFlags::SKB_MODE.bits());
        assert_eq!(xdp_flags(XdpMode::Driver).bits(), XdpFlags::DRV_MODE.bits());
        assert_eq!(xdp_flags(XdpMode::Hw).bits(), XdpFlags::HW_MODE.bits());
    }
}
