use std::net::SocketAddrV4;
use std::num::ParseIntError;
use std::path::PathBuf;

use anyhow::Context;
use aya::programs::TcAttachType;
use clap::{Parser, Subcommand, ValueEnum};
use log::debug;
use tproxy_tc_common::policy::{DROP_UDP_PORT, EXEMPT_PORT, PROXY_MARK, PROXY_PORT};
use tproxy_tc_common::synth::FrameBuilder;
use tproxy_tc_common::{classify, ExemptRange, PacketView, Policy, RedirectStrategy, Transport};

use crate::loader::DEFAULT_OBJECT;

/// Without a subcommand the classifier is attached, `tproxy-tc -i eth0` is the same as
/// `tproxy-tc attach -i eth0`.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(args_conflicts_with_subcommands = true, subcommand_negates_reqs = true)]
pub struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    attach: AttachArgs,
}

impl Args {
    pub fn command(self) -> Command {
        self.command.unwrap_or(Command::Attach(self.attach))
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Attach the classifier to an interface and keep it attached until Ctrl-C.
    Attach(AttachArgs),
    /// Classify a synthesized packet and print the disposition.
    Classify(ClassifyArgs),
}

#[derive(clap::Args, Debug)]
pub struct AttachArgs {
    /// Interface to attach to.
    #[arg(short, long, required = true)]
    pub iface: Option<String>,

    /// TC hook direction.
    #[arg(short, long, value_enum, default_value_t = Direction::Ingress)]
    pub direction: Direction,

    /// Don't check that the proxy listener is bound before attaching.
    #[arg(long)]
    pub skip_listener_check: bool,

    /// Compiled eBPF object.
    #[arg(long, default_value = DEFAULT_OBJECT)]
    pub bpf_object: PathBuf,

    #[command(flatten)]
    pub policy: PolicyArgs,
}

#[derive(clap::Args, Debug)]
pub struct ClassifyArgs {
    /// Transport protocol.
    #[arg(short, long, value_enum)]
    pub proto: Proto,

    /// Destination address.
    #[arg(long)]
    pub dst: SocketAddrV4,

    /// Source address.
    #[arg(long, default_value = "192.0.2.1:40000")]
    pub src: SocketAddrV4,

    #[command(flatten)]
    pub policy: PolicyArgs,
}

#[derive(clap::Args, Debug)]
pub struct PolicyArgs {
    /// Port of the transparent proxy listener.
    #[arg(long, default_value_t = PROXY_PORT)]
    pub proxy_port: u16,

    /// Mark set on redirected packets (decimal or 0x-prefixed).
    #[arg(long, default_value_t = PROXY_MARK, value_parser = parse_mark)]
    pub mark: u32,

    /// Destination port never redirected, 0 disables.
    #[arg(long, default_value_t = EXEMPT_PORT)]
    pub exempt_port: u16,

    /// UDP destination port dropped instead of redirected, 0 disables.
    #[arg(long, default_value_t = DROP_UDP_PORT)]
    pub drop_udp_port: u16,

    /// Destination network never redirected, repeatable. Replaces the default
    /// loopback/private/broadcast table.
    #[arg(long = "exempt", value_name = "CIDR")]
    pub exempt: Vec<ExemptRange>,

    /// How packets reach the proxy.
    #[arg(long, value_enum, default_value_t = Strategy::SocketAssign)]
    pub strategy: Strategy,

    /// Target interface of the forced redirect.
    #[arg(long, required_if_eq("strategy", "forced-redirect"))]
    pub redirect_iface: Option<String>,

    /// Redirect into the ingress path of the target interface.
    #[arg(long)]
    pub redirect_ingress: bool,
}

impl AttachArgs {
    pub fn iface(&self) -> Result<&str, anyhow::Error> {
        self.iface.as_deref().context("--iface is required")
    }
}

impl ClassifyArgs {
    /// Classifies a frame synthesized from the arguments and describes the outcome.
    pub fn dry_run(&self) -> Result<String, anyhow::Error> {
        let policy = self.policy.classification_policy()?;
        let frame = FrameBuilder::new(self.proto.into())
            .src_addr(self.src)
            .dst_addr(self.dst)
            .build();

        match PacketView::parse(&frame[..]) {
            Ok(view) => debug!("parsed {:?}", view),
            Err(e) => debug!("frame passes unparsed: {}", e),
        }

        Ok(format!(
            "{} {} -> {}: {}",
            Transport::from(self.proto).display(),
            self.src,
            self.dst,
            classify(&policy, &frame[..])
        ))
    }
}

impl PolicyArgs {
    /// The policy used for classification, with the default redirect strategy.
    pub fn classification_policy(&self) -> Result<Policy, anyhow::Error> {
        let mut policy = Policy::DEFAULT
            .with_proxy_port(self.proxy_port)
            .with_mark(self.mark)
            .with_exempt_port(self.exempt_port)
            .with_drop_udp_port(self.drop_udp_port);

        if !self.exempt.is_empty() {
            policy = policy.with_exempt_ranges(&self.exempt)?;
        }

        policy.validate()?;
        Ok(policy)
    }

    /// The full policy. `ifindex` resolves the forced redirect target interface.
    pub fn policy<F>(&self, ifindex: F) -> Result<Policy, anyhow::Error>
    where
        F: FnOnce(&str) -> Result<u32, anyhow::Error>,
    {
        let strategy = match self.strategy {
            Strategy::SocketAssign => RedirectStrategy::SocketAssign,
            Strategy::ForcedRedirect => {
                let iface = self
                    .redirect_iface
                    .as_deref()
                    .context("--redirect-iface is required by the forced redirect strategy")?;
                RedirectStrategy::ForcedRedirect {
                    ifindex: ifindex(iface)?,
                    ingress: self.redirect_ingress,
                }
            }
        };

        let policy = self.classification_policy()?.with_strategy(strategy);
        policy.validate()?;
        Ok(policy)
    }
}

fn parse_mark(s: &str) -> Result<u32, ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Direction {
    Ingress,
    Egress,
}

impl From<Direction> for TcAttachType {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Ingress => TcAttachType::Ingress,
            Direction::Egress => TcAttachType::Egress,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Strategy {
    /// Assign packets to the proxy socket, pass them when no listener is bound.
    SocketAssign,
    /// Mark packets and redirect them to an interface.
    ForcedRedirect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Proto {
    Tcp,
    Udp,
}

impl From<Proto> for Transport {
    fn from(proto: Proto) -> Self {
        match proto {
            Proto::Tcp => Transport::Tcp,
            Proto::Udp => Transport::Udp,
        }
    }
}
