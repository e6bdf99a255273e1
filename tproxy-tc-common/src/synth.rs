//! Synthesized Ethernet frames, for dry runs of a policy and for tests.

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::frame::{Transport, ETH_HDR_LEN, ETH_P_IP, IPV4_MIN_HDR_LEN};

/// Builds a minimal Ethernet + IPv4 + TCP/UDP frame with no payload.
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    transport: Transport,
    ether_type: u16,
    ip_proto: u8,
    ihl: u8,
    src: SocketAddrV4,
    dst: SocketAddrV4,
}

impl FrameBuilder {
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            ether_type: ETH_P_IP,
            ip_proto: transport as u8,
            ihl: 5,
            src: SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 40000),
            dst: SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 1), 80),
        }
    }

    pub fn tcp() -> Self {
        Self::new(Transport::Tcp)
    }

    pub fn udp() -> Self {
        Self::new(Transport::Udp)
    }

    pub fn src(self, addr: impl Into<Ipv4Addr>, port: u16) -> Self {
        self.src_addr(SocketAddrV4::new(addr.into(), port))
    }

    pub fn dst(self, addr: impl Into<Ipv4Addr>, port: u16) -> Self {
        self.dst_addr(SocketAddrV4::new(addr.into(), port))
    }

    pub fn src_addr(mut self, addr: SocketAddrV4) -> Self {
        self.src = addr;
        self
    }

    pub fn dst_addr(mut self, addr: SocketAddrV4) -> Self {
        self.dst = addr;
        self
    }

    pub fn ether_type(mut self, ether_type: u16) -> Self {
        self.ether_type = ether_type;
        self
    }

    /// Overrides the IP protocol field; the transport header keeps its original shape.
    pub fn ip_proto(mut self, proto: u8) -> Self {
        self.ip_proto = proto;
        self
    }

    /// IHL in 32-bit words, options are zero filled.
    pub fn ihl(mut self, ihl: u8) -> Self {
        self.ihl = ihl;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let ip_header_len = (self.ihl as usize * 4).max(IPV4_MIN_HDR_LEN);
        let transport_len = self.transport.header_len();
        let mut frame = Vec::with_capacity(ETH_HDR_LEN + ip_header_len + transport_len);

        // Ethernet: locally administered MACs.
        frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x02]);
        frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);
        frame.extend_from_slice(&self.ether_type.to_be_bytes());

        // IPv4
        let total_len = (ip_header_len + transport_len) as u16;
        frame.push(0x40 | (self.ihl & 0x0f));
        frame.push(0);
        frame.extend_from_slice(&total_len.to_be_bytes());
        frame.extend_from_slice(&[0, 0, 0x40, 0]);
        frame.push(64);
        frame.push(self.ip_proto);
        frame.extend_from_slice(&[0, 0]);
        frame.extend_from_slice(&self.src.ip().octets());
        frame.extend_from_slice(&self.dst.ip().octets());
        frame.resize(ETH_HDR_LEN + ip_header_len, 0);

        // Transport
        frame.extend_from_slice(&self.src.port().to_be_bytes());
        frame.extend_from_slice(&self.dst.port().to_be_bytes());
        match self.transport {
            Transport::Tcp => {
                frame.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 0]);
                // Data offset 5, SYN.
                frame.extend_from_slice(&[0x50, 0x02]);
                frame.extend_from_slice(&[0xff, 0xff, 0, 0, 0, 0]);
            }
            Transport::Udp => {
                frame.extend_from_slice(&(transport_len as u16).to_be_bytes());
                frame.extend_from_slice(&[0, 0]);
            }
        }

        frame
    }
}
