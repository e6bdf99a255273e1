//! Loading of the TC classifier into the kernel and attachment to an interface.
//!
//! The [Policy] is written into the program's `POLICY` global at load time, so the
//! kernel side only ever sees an immutable policy.
//!
//! # Example
//!
//! ```no_run
//! use aya::programs::TcAttachType;
//! use tproxy_tc::loader::{TproxyProgram, DEFAULT_OBJECT};
//! use tproxy_tc_common::Policy;
//!
//! # fn main() -> Result<(), anyhow::Error> {
//! let mut program = TproxyProgram::load(&Policy::DEFAULT, DEFAULT_OBJECT)?;
//! program.attach("eth0", TcAttachType::Ingress)?;
//! // ...
//! program.detach()?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::{fs, io};

use anyhow::Context;
use aya::programs::tc::{self, SchedClassifierLinkId};
use aya::programs::{SchedClassifier, TcAttachType};
use aya::{Bpf, BpfLoader};
use aya_log::BpfLogger;
use log::{debug, trace, warn};
use tproxy_tc_common::Policy;

const PROGRAM: &str = "tproxy_tc";
const POLICY_GLOBAL: &str = "POLICY";

/// Object produced by `cargo xtask build-ebpf` for the current profile.
#[cfg(debug_assertions)]
pub const DEFAULT_OBJECT: &str = concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../target/bpfel-unknown-none/debug/tproxy-tc"
);
#[cfg(not(debug_assertions))]
pub const DEFAULT_OBJECT: &str = concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../target/bpfel-unknown-none/release/tproxy-tc"
);

/// The classifier eBPF program.
pub struct TproxyProgram {
    bpf: Bpf,
    link: Option<SchedClassifierLinkId>,
}

impl TproxyProgram {
    /// Loads the eBPF object at `object` into the kernel with `policy`.
    pub fn load(policy: &Policy, object: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        policy.validate()?;

        let object = object.as_ref();
        let mut bpf = BpfLoader::new()
            .set_global(POLICY_GLOBAL, policy)
            .load_file(object)
            .with_context(|| format!("failed to load {}", object.display()))?;

        if let Err(e) = BpfLogger::init(&mut bpf) {
            // This can happen if you remove all log statements from your eBPF program.
            warn!("failed to initialize eBPF logger: {}", e);
        }

        let mut program = Self { bpf, link: None };
        program.classifier()?.load()?;

        trace!("classifier program loaded");

        Ok(program)
    }

    /// Attaches the classifier to `iface`, creating the `clsact` qdisc if needed.
    pub fn attach(&mut self, iface: &str, direction: TcAttachType) -> Result<(), anyhow::Error> {
        if let Err(e) = tc::qdisc_add_clsact(iface) {
            if e.kind() != io::ErrorKind::AlreadyExists {
                return Err(e).with_context(|| format!("failed to add clsact qdisc to {iface}"));
            }
            debug!("clsact qdisc already present on {}", iface);
        }

        let link = self
            .classifier()?
            .attach(iface, direction)
            .with_context(|| format!("failed to attach classifier to {iface}"))?;
        self.link = Some(link);

        trace!("classifier attached iface={} direction={:?}", iface, direction);

        Ok(())
    }

    /// Detaches the classifier. Dropping the program detaches it as well.
    pub fn detach(mut self) -> Result<(), anyhow::Error> {
        if let Some(link) = self.link.take() {
            self.classifier()?.detach(link)?;
        }
        Ok(())
    }

    fn classifier(&mut self) -> Result<&mut SchedClassifier, anyhow::Error> {
        let program = self
            .bpf
            .program_mut(PROGRAM)
            .with_context(|| format!("program {PROGRAM} not found"))?;
        Ok(program.try_into()?)
    }
}

/// Index of network interface `iface`, read from sysfs.
pub fn ifindex(iface: &str) -> Result<u32, anyhow::Error> {
    if iface.is_empty() || iface.contains('/') {
        anyhow::bail!("invalid interface name {iface:?}");
    }

    let path = format!("/sys/class/net/{iface}/ifindex");
    let raw = fs::read_to_string(&path).with_context(|| format!("unknown interface {iface}"))?;

    parse_ifindex(&raw).with_context(|| format!("invalid ifindex in {path}"))
}

fn parse_ifindex(raw: &str) -> Result<u32, anyhow::Error> {
    let ifindex: u32 = raw.trim().parse()?;
    if ifindex == 0 {
        anyhow::bail!("ifindex 0 is not a valid interface");
    }
    Ok(ifindex)
}
