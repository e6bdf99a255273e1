//! Bounds-checked Ethernet/IPv4/TCP/UDP header parsing.
//!
//! Every field read goes through [Frame::load], which refuses any range that is not
//! entirely inside the captured data. Multi-byte fields are decoded with
//! `from_be_bytes`, so the values held by [PacketView] are in host order whatever the
//! endianness of the machine running the parser.

use core::fmt;

/// Length of an Ethernet II header.
pub const ETH_HDR_LEN: usize = 14;
/// EtherType of IPv4.
pub const ETH_P_IP: u16 = 0x0800;
/// Length of an IPv4 header without options.
pub const IPV4_MIN_HDR_LEN: usize = 20;
/// Length of a TCP header without options.
pub const TCP_HDR_LEN: usize = 20;
/// Length of a UDP header.
pub const UDP_HDR_LEN: usize = 8;

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// Raw frame bytes that can be read with bounds checking.
pub trait Frame {
    /// Reads `N` bytes at `offset`, or `None` if any of them lies past the end of the
    /// valid data.
    fn load<const N: usize>(&self, offset: usize) -> Option<[u8; N]>;
}

impl Frame for [u8] {
    #[inline]
    fn load<const N: usize>(&self, offset: usize) -> Option<[u8; N]> {
        let end = offset.checked_add(N)?;
        self.get(offset..end)?.try_into().ok()
    }
}

/// Why a frame was not classified. All of these end up as a pass-through.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(any(test, feature = "user"), derive(Debug))]
pub enum ParseError {
    /// A header extends past the captured data.
    Truncated,
    /// The EtherType is not IPv4.
    NotIpv4(u16),
    /// IPv4 version or IHL field is invalid.
    BadIpHeader,
    /// IP protocol other than TCP or UDP.
    UnsupportedTransport(u8),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => f.write_str("truncated frame"),
            Self::NotIpv4(ether_type) => write!(f, "not an IPv4 frame (ethertype {ether_type:#06x})"),
            Self::BadIpHeader => f.write_str("malformed IPv4 header"),
            Self::UnsupportedTransport(proto) => write!(f, "unsupported IP protocol {proto}"),
        }
    }
}

/// Transport protocols the classifier redirects.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(any(test, feature = "user"), derive(Debug))]
pub enum Transport {
    Tcp = IPPROTO_TCP,
    Udp = IPPROTO_UDP,
}

impl Transport {
    #[inline]
    pub fn from_ip_proto(proto: u8) -> Option<Self> {
        match proto {
            IPPROTO_TCP => Some(Self::Tcp),
            IPPROTO_UDP => Some(Self::Udp),
            _ => None,
        }
    }

    pub fn display(&self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
        }
    }

    /// Length of the fixed transport header that must be present.
    #[inline]
    pub fn header_len(&self) -> usize {
        match self {
            Self::Tcp => TCP_HDR_LEN,
            Self::Udp => UDP_HDR_LEN,
        }
    }
}

/// The network layer of a frame.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(any(test, feature = "user"), derive(Debug))]
pub struct Ipv4Header {
    /// IP protocol number.
    pub protocol: u8,
    /// Source address (host order).
    pub src_addr: u32,
    /// Destination address (host order).
    pub dst_addr: u32,
    /// `IHL * 4`, between 20 and 60.
    pub header_len: usize,
}

/// Transport 4-tuple of a packet. Addresses and ports are in host order.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(any(test, feature = "user"), derive(Debug))]
pub struct Flow {
    pub transport: Transport,
    pub src_addr: u32,
    pub dst_addr: u32,
    pub src_port: u16,
    pub dst_port: u16,
}

impl Flow {
    /// Kernel socket tuple for this flow, in network order.
    #[inline]
    pub fn tuple(&self) -> SockTupleV4 {
        SockTupleV4 {
            saddr: self.src_addr.to_be(),
            daddr: self.dst_addr.to_be(),
            sport: self.src_port.to_be(),
            dport: self.dst_port.to_be(),
        }
    }
}

/// Layout of the IPv4 arm of the kernel's `struct bpf_sock_tuple`.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(any(test, feature = "user"), derive(Debug))]
pub struct SockTupleV4 {
    pub saddr: u32,
    pub daddr: u32,
    pub sport: u16,
    pub dport: u16,
}

impl SockTupleV4 {
    /// Tuple matching a socket listening on `0.0.0.0:port`.
    #[inline]
    pub fn listener(port: u16) -> Self {
        Self {
            saddr: 0,
            daddr: 0,
            sport: 0,
            dport: port.to_be(),
        }
    }
}

/// Immutable, fully bounds-checked view of one IPv4 TCP/UDP frame.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(any(test, feature = "user"), derive(Debug))]
pub struct PacketView {
    pub ip_header_len: usize,
    pub flow: Flow,
}

impl PacketView {
    /// Parses every layer of `frame`.
    pub fn parse<F: Frame + ?Sized>(frame: &F) -> Result<Self, ParseError> {
        let ip = parse_ipv4(frame)?;
        let flow = parse_transport(frame, &ip)?;

        Ok(Self {
            ip_header_len: ip.header_len,
            flow,
        })
    }
}

/// Parses the Ethernet and IPv4 headers.
///
/// The whole IPv4 header, options included, must be present: the declared IHL is
/// never trusted on its own.
#[inline]
pub fn parse_ipv4<F: Frame + ?Sized>(frame: &F) -> Result<Ipv4Header, ParseError> {
    let eth: [u8; ETH_HDR_LEN] = frame.load(0).ok_or(ParseError::Truncated)?;
    let ether_type = u16::from_be_bytes([eth[12], eth[13]]);
    if ether_type != ETH_P_IP {
        return Err(ParseError::NotIpv4(ether_type));
    }

    let ip: [u8; IPV4_MIN_HDR_LEN] = frame.load(ETH_HDR_LEN).ok_or(ParseError::Truncated)?;
    let version = ip[0] >> 4;
    let ihl = (ip[0] & 0x0f) as usize;
    if version != 4 || ihl < 5 {
        return Err(ParseError::BadIpHeader);
    }

    let header_len = ihl * 4;
    if header_len > IPV4_MIN_HDR_LEN {
        // Last byte of the options.
        frame
            .load::<1>(ETH_HDR_LEN + header_len - 1)
            .ok_or(ParseError::Truncated)?;
    }

    Ok(Ipv4Header {
        protocol: ip[9],
        src_addr: u32::from_be_bytes([ip[12], ip[13], ip[14], ip[15]]),
        dst_addr: u32::from_be_bytes([ip[16], ip[17], ip[18], ip[19]]),
        header_len,
    })
}

/// Parses the TCP or UDP header that follows the variable-length IPv4 header.
#[inline]
pub fn parse_transport<F: Frame + ?Sized>(frame: &F, ip: &Ipv4Header) -> Result<Flow, ParseError> {
    let transport =
        Transport::from_ip_proto(ip.protocol).ok_or(ParseError::UnsupportedTransport(ip.protocol))?;
    let offset = ETH_HDR_LEN + ip.header_len;

    // Source and destination ports share the same offsets in both headers; the rest
    // of the fixed header only has to be present.
    let ports: [u8; 4] = match transport {
        Transport::Tcp => {
            let tcp: [u8; TCP_HDR_LEN] = frame.load(offset).ok_or(ParseError::Truncated)?;
            [tcp[0], tcp[1], tcp[2], tcp[3]]
        }
        Transport::Udp => {
            let udp: [u8; UDP_HDR_LEN] = frame.load(offset).ok_or(ParseError::Truncated)?;
            [udp[0], udp[1], udp[2], udp[3]]
        }
    };

    Ok(Flow {
        transport,
        src_addr: ip.src_addr,
        dst_addr: ip.dst_addr,
        src_port: u16::from_be_bytes([ports[0], ports[1]]),
        dst_port: u16::from_be_bytes([ports[2], ports[3]]),
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::synth::FrameBuilder;

    #[test]
    fn slice_load_is_bounds_checked() {
        let buf = [1u8, 2, 3, 4];
        assert_eq!(buf[..].load::<2>(2), Some([3, 4]));
        assert_eq!(buf[..].load::<2>(3), None);
        assert_eq!(buf[..].load::<1>(usize::MAX), None);
    }

    #[test]
    fn parse_tcp() {
        let frame = FrameBuilder::tcp()
            .src([192, 0, 2, 7], 40123)
            .dst([8, 8, 8, 8], 443)
            .build();

        let view = PacketView::parse(&frame[..]).unwrap();
        assert_eq!(
            view,
            PacketView {
                ip_header_len: 20,
                flow: Flow {
                    transport: Transport::Tcp,
                    src_addr: 0xc000_0207,
                    dst_addr: 0x0808_0808,
                    src_port: 40123,
                    dst_port: 443,
                },
            }
        );
    }

    #[test]
    fn parse_udp_with_ip_options() {
        let frame = FrameBuilder::udp().dst([1, 1, 1, 1], 53).ihl(15).build();

        let view = PacketView::parse(&frame[..]).unwrap();
        assert_eq!(view.ip_header_len, 60);
        assert_eq!(view.flow.transport, Transport::Udp);
        assert_eq!(view.flow.dst_port, 53);
    }

    #[test]
    fn short_frames_are_truncated() {
        let frame = FrameBuilder::tcp().dst([8, 8, 8, 8], 80).build();

        for len in 0..frame.len() {
            assert_eq!(
                PacketView::parse(&frame[..len]),
                Err(ParseError::Truncated),
                "len={len}"
            );
        }
    }

    #[test]
    fn ihl_past_captured_data() {
        // IHL claims 60 bytes but only the fixed header and a UDP header are present.
        let mut frame = FrameBuilder::udp().dst([8, 8, 8, 8], 53).build();
        frame[ETH_HDR_LEN] = 0x4f;

        assert_eq!(parse_ipv4(&frame[..]), Err(ParseError::Truncated));
    }

    #[test]
    fn transport_after_ip_options_must_fit() {
        let frame = FrameBuilder::tcp().dst([8, 8, 8, 8], 80).ihl(6).build();
        let cut = &frame[..frame.len() - 1];

        assert!(parse_ipv4(cut).is_ok());
        assert_eq!(PacketView::parse(cut), Err(ParseError::Truncated));
    }

    #[test]
    fn rejects_non_ipv4() {
        let arp = FrameBuilder::tcp().ether_type(0x0806).build();
        assert_eq!(PacketView::parse(&arp[..]), Err(ParseError::NotIpv4(0x0806)));

        let mut bad_version = FrameBuilder::tcp().build();
        bad_version[ETH_HDR_LEN] = 0x65;
        assert_eq!(PacketView::parse(&bad_version[..]), Err(ParseError::BadIpHeader));

        let mut short_ihl = FrameBuilder::tcp().build();
        short_ihl[ETH_HDR_LEN] = 0x44;
        assert_eq!(PacketView::parse(&short_ihl[..]), Err(ParseError::BadIpHeader));
    }

    #[test]
    fn rejects_other_transports() {
        let icmp = FrameBuilder::tcp().ip_proto(1).build();
        assert_eq!(
            PacketView::parse(&icmp[..]),
            Err(ParseError::UnsupportedTransport(1))
        );
    }

    #[test]
    fn flow_tuple_is_network_order() {
        let flow = Flow {
            transport: Transport::Tcp,
            src_addr: 0x0a00_0001,
            dst_addr: 0x0808_0808,
            src_port: 1234,
            dst_port: 443,
        };
        let tuple = flow.tuple();

        assert_eq!(tuple.saddr.to_ne_bytes(), [10, 0, 0, 1]);
        assert_eq!(tuple.sport.to_ne_bytes(), [0x04, 0xd2]);
        assert_eq!(tuple.dport.to_ne_bytes(), [0x01, 0xbb]);
        assert_eq!(SockTupleV4::listener(9420).dport.to_ne_bytes(), [0x24, 0xcc]);
        assert_eq!(core::mem::size_of::<SockTupleV4>(), 12);
    }

    #[test]
    fn parse_error_messages() {
        assert_eq!(ParseError::Truncated.to_string(), "truncated frame");
        assert_eq!(
            ParseError::NotIpv4(0x86dd).to_string(),
            "not an IPv4 frame (ethertype 0x86dd)"
        );
        assert_eq!(ParseError::UnsupportedTransport(1).to_string(), "unsupported IP protocol 1");
    }
}
