//! Redirection policy: exempt ranges, ports, mark and redirect strategy.
//!
//! A [Policy] is built once (by the loader, or from [Policy::DEFAULT]) and never
//! mutated afterwards. The layout is `#[repr(C)]` without padding because the loader
//! writes it verbatim into the eBPF program's read-only `POLICY` global.

use core::fmt;

/// Port of the local transparent proxy listener.
pub const PROXY_PORT: u16 = 9420;
/// Mark set on redirected packets.
pub const PROXY_MARK: u32 = 0x2333;
/// Destination port never redirected (co-located container runtime).
pub const EXEMPT_PORT: u16 = 9277;
/// UDP destination port dropped instead of redirected (QUIC / HTTP/3).
pub const DROP_UDP_PORT: u16 = 443;
/// Capacity of the exemption table.
pub const MAX_EXEMPT_RANGES: usize = 8;

const STRATEGY_SOCKET_ASSIGN: u8 = 0;
const STRATEGY_FORCED_REDIRECT: u8 = 1;

/// A destination network that is never proxied, e.g. `10.0.0.0/8`.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ExemptRange {
    /// Network address (host order), always masked to the prefix.
    net: u32,
    prefix_len: u32,
}

impl ExemptRange {
    const EMPTY: Self = Self::new(0xffff_ffff, 32);

    /// Builds a range from a host order address. Prefixes above 32 are clamped and
    /// host bits of `net` are cleared.
    pub const fn new(net: u32, prefix_len: u8) -> Self {
        let prefix_len = if prefix_len > 32 { 32 } else { prefix_len as u32 };
        Self {
            net: net & mask(prefix_len),
            prefix_len,
        }
    }

    #[inline]
    pub const fn net(&self) -> u32 {
        self.net
    }

    #[inline]
    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len as u8
    }

    #[inline]
    pub const fn mask(&self) -> u32 {
        mask(self.prefix_len)
    }

    /// Whether the host order address `addr` belongs to this range.
    #[inline]
    pub const fn contains(&self, addr: u32) -> bool {
        addr & self.mask() == self.net
    }
}

#[inline]
const fn mask(prefix_len: u32) -> u32 {
    // `u32::MAX << 32` overflows.
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len)
    }
}

/// Loopback, RFC 1918 private networks and limited broadcast.
pub const DEFAULT_EXEMPT_RANGES: [ExemptRange; 5] = [
    ExemptRange::new(0x7f00_0000, 8),
    ExemptRange::new(0x0a00_0000, 8),
    ExemptRange::new(0xac10_0000, 12),
    ExemptRange::new(0xc0a8_0000, 16),
    ExemptRange::new(0xffff_ffff, 32),
];

/// How a redirected packet reaches the proxy.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(any(test, feature = "user"), derive(Debug))]
pub enum RedirectStrategy {
    /// Look up the proxy's socket and assign the packet to it. Falls back to a
    /// pass-through when no listener is bound.
    SocketAssign,
    /// Mark the packet and redirect it to interface `ifindex`, unconditionally.
    ForcedRedirect { ifindex: u32, ingress: bool },
}

#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(any(test, feature = "user"), derive(Debug))]
pub enum PolicyError {
    /// Not an `a.b.c.d[/len]` network.
    InvalidRange,
    TooManyExemptRanges(usize),
    ZeroProxyPort,
    MissingRedirectIfindex,
}

impl fmt::Display for PolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRange => f.write_str("invalid network, expected a.b.c.d/len"),
            Self::TooManyExemptRanges(n) => write!(
                f,
                "{n} exempt ranges given, at most {MAX_EXEMPT_RANGES} are supported"
            ),
            Self::ZeroProxyPort => f.write_str("proxy port must not be 0"),
            Self::MissingRedirectIfindex => {
                f.write_str("forced redirect needs a target interface index")
            }
        }
    }
}

#[cfg(feature = "user")]
impl std::error::Error for PolicyError {}

/// Classification policy.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    /// Port of the proxy listener, bound on the wildcard address.
    pub proxy_port: u16,
    /// Destination port that is always passed. `0` disables the exemption.
    pub exempt_port: u16,
    /// UDP destination port that is dropped. `0` disables the drop rule.
    pub drop_udp_port: u16,
    strategy: u8,
    redirect_ingress: u8,
    /// Mark attached to redirected packets.
    pub mark: u32,
    redirect_ifindex: u32,
    exempt_len: u32,
    exempt: [ExemptRange; MAX_EXEMPT_RANGES],
}

const _: [(); 84] = [(); core::mem::size_of::<Policy>()];

impl Policy {
    pub const DEFAULT: Self = Self {
        proxy_port: PROXY_PORT,
        exempt_port: EXEMPT_PORT,
        drop_udp_port: DROP_UDP_PORT,
        strategy: STRATEGY_SOCKET_ASSIGN,
        redirect_ingress: 0,
        mark: PROXY_MARK,
        redirect_ifindex: 0,
        exempt_len: DEFAULT_EXEMPT_RANGES.len() as u32,
        exempt: [
            DEFAULT_EXEMPT_RANGES[0],
            DEFAULT_EXEMPT_RANGES[1],
            DEFAULT_EXEMPT_RANGES[2],
            DEFAULT_EXEMPT_RANGES[3],
            DEFAULT_EXEMPT_RANGES[4],
            ExemptRange::EMPTY,
            ExemptRange::EMPTY,
            ExemptRange::EMPTY,
        ],
    };

    pub const fn with_proxy_port(mut self, port: u16) -> Self {
        self.proxy_port = port;
        self
    }

    pub const fn with_mark(mut self, mark: u32) -> Self {
        self.mark = mark;
        self
    }

    pub const fn with_exempt_port(mut self, port: u16) -> Self {
        self.exempt_port = port;
        self
    }

    pub const fn with_drop_udp_port(mut self, port: u16) -> Self {
        self.drop_udp_port = port;
        self
    }

    pub const fn with_strategy(mut self, strategy: RedirectStrategy) -> Self {
        match strategy {
            RedirectStrategy::SocketAssign => {
                self.strategy = STRATEGY_SOCKET_ASSIGN;
                self.redirect_ifindex = 0;
                self.redirect_ingress = 0;
            }
            RedirectStrategy::ForcedRedirect { ifindex, ingress } => {
                self.strategy = STRATEGY_FORCED_REDIRECT;
                self.redirect_ifindex = ifindex;
                self.redirect_ingress = ingress as u8;
            }
        }
        self
    }

    /// Replaces the whole exemption table.
    pub fn with_exempt_ranges(mut self, ranges: &[ExemptRange]) -> Result<Self, PolicyError> {
        if ranges.len() > MAX_EXEMPT_RANGES {
            return Err(PolicyError::TooManyExemptRanges(ranges.len()));
        }

        self.exempt = [ExemptRange::EMPTY; MAX_EXEMPT_RANGES];
        self.exempt[..ranges.len()].copy_from_slice(ranges);
        self.exempt_len = ranges.len() as u32;

        Ok(self)
    }

    pub fn exempt_ranges(&self) -> &[ExemptRange] {
        let len = (self.exempt_len as usize).min(MAX_EXEMPT_RANGES);
        &self.exempt[..len]
    }

    pub fn strategy(&self) -> RedirectStrategy {
        if self.strategy == STRATEGY_FORCED_REDIRECT {
            RedirectStrategy::ForcedRedirect {
                ifindex: self.redirect_ifindex,
                ingress: self.redirect_ingress != 0,
            }
        } else {
            RedirectStrategy::SocketAssign
        }
    }

    /// Whether packets going to the host order address `dst_addr` must never be
    /// proxied. Only the destination is considered.
    #[inline]
    pub fn is_exempt(&self, dst_addr: u32) -> bool {
        let len = self.exempt_len as usize;
        for i in 0..MAX_EXEMPT_RANGES {
            if i >= len {
                break;
            }
            if self.exempt[i].contains(dst_addr) {
                return true;
            }
        }
        false
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.proxy_port == 0 {
            return Err(PolicyError::ZeroProxyPort);
        }
        if self.exempt_len as usize > MAX_EXEMPT_RANGES {
            return Err(PolicyError::TooManyExemptRanges(self.exempt_len as usize));
        }
        if let RedirectStrategy::ForcedRedirect { ifindex: 0, .. } = self.strategy() {
            return Err(PolicyError::MissingRedirectIfindex);
        }
        Ok(())
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for Policy {}

#[cfg(any(test, feature = "user"))]
mod user {
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    use super::*;

    impl FromStr for ExemptRange {
        type Err = PolicyError;

        /// Parses `a.b.c.d/len`, or a bare address as a `/32`.
        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let (addr, prefix_len) = match s.split_once('/') {
                Some((addr, len)) => {
                    let len = len.parse::<u8>().map_err(|_| PolicyError::InvalidRange)?;
                    (addr, len)
                }
                None => (s, 32),
            };
            if prefix_len > 32 {
                return Err(PolicyError::InvalidRange);
            }
            let addr = addr
                .trim()
                .parse::<Ipv4Addr>()
                .map_err(|_| PolicyError::InvalidRange)?;

            Ok(Self::new(addr.into(), prefix_len))
        }
    }

    impl fmt::Display for ExemptRange {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}/{}", Ipv4Addr::from(self.net), self.prefix_len)
        }
    }

    impl fmt::Debug for ExemptRange {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            fmt::Display::fmt(self, f)
        }
    }

    impl fmt::Debug for Policy {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Policy")
                .field("proxy_port", &self.proxy_port)
                .field("mark", &format_args!("{:#x}", self.mark))
                .field("exempt_port", &self.exempt_port)
                .field("drop_udp_port", &self.drop_udp_port)
                .field("exempt", &self.exempt_ranges())
                .field("strategy", &self.strategy())
                .finish()
        }
    }
}
