//! Per-packet disposition.
//!
//! The decision is a straight line with an early pass at every stage:
//!
//! ```text
//! Ethernet -> IPv4 -> exempt destination? -> TCP/UDP -> exempt port? -> UDP drop port? -> redirect
//! ```
//!
//! Anything that cannot be parsed is passed untouched: a classifier on the path of
//! every packet of an interface has to fail open.

use core::fmt;

use crate::frame::{parse_ipv4, parse_transport, Flow, Frame, ParseError, Transport};
use crate::policy::Policy;

/// What to do with a packet.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(any(test, feature = "user"), derive(Debug))]
pub enum Disposition {
    /// Let the packet continue unmodified.
    Pass,
    /// Silently discard the packet.
    Drop,
    /// Divert the packet to the local proxy.
    Redirect(Redirect),
}

impl Disposition {
    #[inline]
    pub fn redirect(&self) -> Option<&Redirect> {
        match self {
            Self::Redirect(redirect) => Some(redirect),
            _ => None,
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => f.write_str("pass"),
            Self::Drop => f.write_str("drop"),
            Self::Redirect(redirect) => write!(
                f,
                "redirect {} to proxy port {} mark {:#x}",
                redirect.flow.transport.display(),
                redirect.port,
                redirect.mark
            ),
        }
    }
}

/// A redirect decision.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(any(test, feature = "user"), derive(Debug))]
pub struct Redirect {
    /// Port of the proxy listener.
    pub port: u16,
    /// Mark to set on the packet.
    pub mark: u32,
    /// The flow being redirected.
    pub flow: Flow,
}

/// Classifies one frame against `policy`.
///
/// Pure: classifying the same bytes twice yields the same disposition.
#[inline]
pub fn classify<F: Frame + ?Sized>(policy: &Policy, frame: &F) -> Disposition {
    match try_classify(policy, frame) {
        Ok(disposition) => disposition,
        Err(_) => Disposition::Pass,
    }
}

#[inline(always)]
fn try_classify<F: Frame + ?Sized>(policy: &Policy, frame: &F) -> Result<Disposition, ParseError> {
    let ip = parse_ipv4(frame)?;

    if policy.is_exempt(ip.dst_addr) {
        return Ok(Disposition::Pass);
    }

    let flow = parse_transport(frame, &ip)?;

    if policy.exempt_port != 0 && flow.dst_port == policy.exempt_port {
        return Ok(Disposition::Pass);
    }

    if flow.transport == Transport::Udp
        && policy.drop_udp_port != 0
        && flow.dst_port == policy.drop_udp_port
    {
        return Ok(Disposition::Drop);
    }

    Ok(Disposition::Redirect(Redirect {
        port: policy.proxy_port,
        mark: policy.mark,
        flow,
    }))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::frame::ETH_HDR_LEN;
    use crate::policy::ExemptRange;
    use crate::synth::FrameBuilder;

    fn redirected(frame: &[u8]) -> Option<(u16, u32)> {
        classify(&Policy::DEFAULT, frame)
            .redirect()
            .map(|redirect| (redirect.port, redirect.mark))
    }

    #[test]
    fn tcp_syn_to_public_https_is_redirected() {
        let frame = FrameBuilder::tcp()
            .src([192, 0, 2, 10], 51000)
            .dst([8, 8, 8, 8], 443)
            .build();

        assert_eq!(
            classify(&Policy::DEFAULT, &frame[..]),
            Disposition::Redirect(Redirect {
                port: 9420,
                mark: 0x2333,
                flow: Flow {
                    transport: Transport::Tcp,
                    src_addr: u32::from_be_bytes([192, 0, 2, 10]),
                    dst_addr: u32::from_be_bytes([8, 8, 8, 8]),
                    src_port: 51000,
                    dst_port: 443,
                },
            })
        );
    }

    #[test]
    fn quic_is_dropped() {
        let frame = FrameBuilder::udp().dst([8, 8, 8, 8], 443).build();
        assert_eq!(classify(&Policy::DEFAULT, &frame[..]), Disposition::Drop);
    }

    #[test]
    fn lan_destination_is_passed() {
        let frame = FrameBuilder::tcp().dst([192, 168, 1, 5], 80).build();
        assert_eq!(classify(&Policy::DEFAULT, &frame[..]), Disposition::Pass);
    }

    #[test]
    fn exempt_port_is_passed() {
        for builder in [FrameBuilder::tcp(), FrameBuilder::udp()] {
            let frame = builder.dst([1, 2, 3, 4], 9277).build();
            assert_eq!(classify(&Policy::DEFAULT, &frame[..]), Disposition::Pass);
        }
    }

    #[test]
    fn arp_is_passed() {
        let frame = FrameBuilder::tcp()
            .ether_type(0x0806)
            .dst([8, 8, 8, 8], 443)
            .build();
        assert_eq!(classify(&Policy::DEFAULT, &frame[..]), Disposition::Pass);
    }

    #[test]
    fn exempt_destinations_pass_any_port_and_protocol() {
        let addrs: [[u8; 4]; 8] = [
            [127, 0, 0, 1],
            [127, 1, 2, 3],
            [10, 1, 2, 3],
            [172, 16, 0, 1],
            [172, 31, 255, 254],
            [192, 168, 0, 1],
            [192, 168, 100, 200],
            [255, 255, 255, 255],
        ];

        for addr in addrs {
            for port in [1, 53, 80, 443, 9277, 9420, 65535] {
                for builder in [FrameBuilder::tcp(), FrameBuilder::udp()] {
                    let frame = builder.dst(addr, port).build();
                    assert_eq!(
                        classify(&Policy::DEFAULT, &frame[..]),
                        Disposition::Pass,
                        "{addr:?}:{port}"
                    );
                }
            }
        }
    }

    #[test]
    fn source_address_is_not_exempt() {
        let frame = FrameBuilder::tcp()
            .src([192, 168, 1, 20], 40000)
            .dst([1, 1, 1, 1], 80)
            .build();
        assert_eq!(redirected(&frame), Some((9420, 0x2333)));
    }

    #[test]
    fn public_destinations_are_redirected() {
        for addr in [[1, 1, 1, 1], [172, 32, 0, 1], [11, 0, 0, 1], [100, 64, 0, 1]] {
            for port in [1, 22, 53, 80, 443, 8080, 9276, 9278] {
                let tcp = FrameBuilder::tcp().dst(addr, port).build();
                assert_eq!(redirected(&tcp), Some((9420, 0x2333)), "tcp {addr:?}:{port}");

                let udp = FrameBuilder::udp().dst(addr, port).build();
                let expected = if port == 443 { None } else { Some((9420, 0x2333)) };
                assert_eq!(redirected(&udp), expected, "udp {addr:?}:{port}");
            }
        }
    }

    #[test]
    fn other_protocols_are_passed() {
        for proto in [1, 47, 50, 132] {
            let frame = FrameBuilder::tcp().ip_proto(proto).dst([8, 8, 8, 8], 443).build();
            assert_eq!(classify(&Policy::DEFAULT, &frame[..]), Disposition::Pass);
        }
    }

    #[test]
    fn malformed_frames_fail_open() {
        let frame = FrameBuilder::udp().dst([8, 8, 8, 8], 443).build();
        for len in 0..frame.len() {
            assert_eq!(
                classify(&Policy::DEFAULT, &frame[..len]),
                Disposition::Pass,
                "len={len}"
            );
        }

        // IHL pointing past the captured data.
        let mut frame = FrameBuilder::tcp().dst([8, 8, 8, 8], 80).build();
        frame[ETH_HDR_LEN] = 0x4f;
        assert_eq!(classify(&Policy::DEFAULT, &frame[..]), Disposition::Pass);
    }

    #[test]
    fn transport_header_follows_ip_options() {
        // With 40 bytes of options, reading ports right after the fixed IPv4 header
        // would see zeros.
        let frame = FrameBuilder::udp().dst([8, 8, 8, 8], 443).ihl(15).build();
        assert_eq!(classify(&Policy::DEFAULT, &frame[..]), Disposition::Drop);
    }

    #[test]
    fn port_byte_order() {
        // 443 = 0x01bb; the byte-swapped value 0xbb01 (47873) must not be dropped.
        let swapped = FrameBuilder::udp()
            .dst([8, 8, 8, 8], u16::from_le_bytes(443u16.to_be_bytes()))
            .build();
        assert!(redirected(&swapped).is_some());

        let mut raw = FrameBuilder::udp().dst([8, 8, 8, 8], 0).build();
        let dport = ETH_HDR_LEN + 20 + 2;
        raw[dport..dport + 2].copy_from_slice(&[0x01, 0xbb]);
        assert_eq!(classify(&Policy::DEFAULT, &raw[..]), Disposition::Drop);
    }

    #[test]
    fn classification_is_idempotent() {
        let frames = [
            FrameBuilder::tcp().dst([8, 8, 4, 4], 443).build(),
            FrameBuilder::udp().dst([8, 8, 4, 4], 443).build(),
            FrameBuilder::udp().dst([10, 0, 0, 1], 53).build(),
        ];

        for frame in &frames {
            let copy = frame.clone();
            let first = classify(&Policy::DEFAULT, &frame[..]);
            assert_eq!(classify(&Policy::DEFAULT, &frame[..]), first);
            assert_eq!(frame, &copy);
        }
    }

    #[test]
    fn custom_policy() {
        let policy = Policy::DEFAULT
            .with_proxy_port(7890)
            .with_mark(1)
            .with_exempt_port(0)
            .with_drop_udp_port(0)
            .with_exempt_ranges(&[ExemptRange::new(u32::from_be_bytes([8, 8, 8, 0]), 24)])
            .unwrap();

        let exempt = FrameBuilder::tcp().dst([8, 8, 8, 8], 443).build();
        assert_eq!(classify(&policy, &exempt[..]), Disposition::Pass);

        let quic = FrameBuilder::udp().dst([1, 1, 1, 1], 443).build();
        let redirect = classify(&policy, &quic[..]);
        assert_eq!(redirect.redirect().map(|r| (r.port, r.mark)), Some((7890, 1)));

        let docker = FrameBuilder::tcp().dst([1, 1, 1, 1], 9277).build();
        assert!(classify(&policy, &docker[..]).redirect().is_some());

        let lan = FrameBuilder::tcp().dst([192, 168, 0, 1], 80).build();
        assert!(classify(&policy, &lan[..]).redirect().is_some());
    }

    #[test]
    fn display() {
        let frame = FrameBuilder::udp().dst([1, 1, 1, 1], 53).build();
        assert_eq!(
            classify(&Policy::DEFAULT, &frame[..]).to_string(),
            "redirect UDP to proxy port 9420 mark 0x2333"
        );
        assert_eq!(Disposition::Drop.to_string(), "drop");
    }
}
