#![no_std]
#![no_main]

use core::mem;

use aya_bpf::bindings::{bpf_sock, bpf_sock_tuple, TC_ACT_OK, TC_ACT_SHOT};
use aya_bpf::cty::c_void;
use aya_bpf::helpers::gen::{
    bpf_redirect, bpf_sk_assign, bpf_sk_lookup_udp, bpf_sk_release, bpf_skc_lookup_tcp,
};
use aya_bpf::BpfContext;
use aya_bpf::{macros::classifier, programs::TcContext};
use aya_log_ebpf::{debug, warn};

use tproxy_tc_common::{
    classify, Disposition, Frame, Policy, Redirect, RedirectStrategy, SockTupleV4, Transport,
};

/// Look sockets up in the network namespace of the packet.
const BPF_F_CURRENT_NETNS: u64 = -1i64 as u64;
const BPF_F_INGRESS: u64 = 1;
const BPF_TCP_LISTEN: u32 = 10;
const TUPLE_LEN: u32 = mem::size_of::<SockTupleV4>() as u32;

#[no_mangle]
#[link_section = "license"]
pub static _license: [u8; 4] = *b"GPL\0";

/// Classification policy, overwritten by the loader before the program is loaded.
#[no_mangle]
static POLICY: Policy = Policy::DEFAULT;

/// Decides for every IPv4 packet whether it is passed, dropped or diverted to the
/// local transparent proxy.
#[classifier(name = "tproxy_tc")]
pub fn tproxy_tc(ctx: TcContext) -> i32 {
    unsafe { try_tproxy_tc(ctx) }.unwrap_or(TC_ACT_OK)
}

/// Bounds-checked reads through `bpf_skb_load_bytes`.
struct SkbFrame<'a>(&'a TcContext);

impl Frame for SkbFrame<'_> {
    #[inline(always)]
    fn load<const N: usize>(&self, offset: usize) -> Option<[u8; N]> {
        self.0.load::<[u8; N]>(offset).ok()
    }
}

unsafe fn try_tproxy_tc(mut ctx: TcContext) -> Result<i32, i64> {
    let policy = core::ptr::read_volatile(&POLICY);

    match classify(&policy, &SkbFrame(&ctx)) {
        Disposition::Pass => Ok(TC_ACT_OK),
        Disposition::Drop => {
            debug!(&ctx, "drop udp dport={}", policy.drop_udp_port);
            Ok(TC_ACT_SHOT)
        }
        Disposition::Redirect(redirect) => match policy.strategy() {
            RedirectStrategy::SocketAssign => assign_socket(&mut ctx, &redirect),
            RedirectStrategy::ForcedRedirect { ifindex, ingress } => {
                Ok(force_redirect(&mut ctx, &redirect, ifindex, ingress))
            }
        },
    }
}

/// Hands the packet to the proxy socket, bypassing routing. Without a proxy socket
/// the packet goes on untouched.
unsafe fn assign_socket(ctx: &mut TcContext, redirect: &Redirect) -> Result<i32, i64> {
    let sk = lookup_proxy_socket(ctx, redirect);
    if sk.is_null() {
        debug!(ctx, "no proxy socket on port {}", redirect.port);
        return Ok(TC_ACT_OK);
    }

    let ret = bpf_sk_assign(ctx.as_ptr(), sk as *mut _, 0);
    bpf_sk_release(sk as *mut _);
    if ret != 0 {
        warn!(
            ctx,
            "sk_assign failed {:i}:{} ret={}",
            redirect.flow.dst_addr,
            redirect.flow.dst_port,
            ret
        );
        return Err(ret);
    }

    ctx.set_mark(redirect.mark);
    debug!(
        ctx,
        "assign {:i}:{} to proxy port {}",
        redirect.flow.dst_addr,
        redirect.flow.dst_port,
        redirect.port
    );
    Ok(TC_ACT_OK)
}

/// Returns a referenced socket, to be released by the caller, or null.
///
/// A TCP packet whose 4-tuple matches a local non-listening socket is assigned to that
/// socket, even when it belongs to the host rather than to the proxy: the segment is
/// delivered to the socket the kernel would have picked anyway, and the mark only steers
/// it to local delivery, which it already gets.
unsafe fn lookup_proxy_socket(ctx: &TcContext, redirect: &Redirect) -> *mut bpf_sock {
    let skb = ctx.as_ptr();

    match redirect.flow.transport {
        Transport::Tcp => {
            // An established proxied connection owns its own socket.
            let sk = lookup_tcp(skb, &mut redirect.flow.tuple());
            if !sk.is_null() {
                if (*sk).state != BPF_TCP_LISTEN {
                    return sk;
                }
                bpf_sk_release(sk as *mut _);
            }
            lookup_tcp(skb, &mut SockTupleV4::listener(redirect.port))
        }
        Transport::Udp => {
            let mut tuple = SockTupleV4::listener(redirect.port);
            bpf_sk_lookup_udp(
                skb,
                &mut tuple as *mut SockTupleV4 as *mut bpf_sock_tuple,
                TUPLE_LEN,
                BPF_F_CURRENT_NETNS,
                0,
            )
        }
    }
}

#[inline(always)]
unsafe fn lookup_tcp(skb: *mut c_void, tuple: &mut SockTupleV4) -> *mut bpf_sock {
    bpf_skc_lookup_tcp(
        skb,
        tuple as *mut SockTupleV4 as *mut bpf_sock_tuple,
        TUPLE_LEN,
        BPF_F_CURRENT_NETNS,
        0,
    )
}

/// Marks the packet and redirects it to the configured interface. There is no
/// fallback: a missing listener surfaces as a connection failure.
unsafe fn force_redirect(
    ctx: &mut TcContext,
    redirect: &Redirect,
    ifindex: u32,
    ingress: bool,
) -> i32 {
    ctx.set_mark(redirect.mark);
    debug!(
        ctx,
        "redirect {:i}:{} to ifindex {} ingress={}",
        redirect.flow.dst_addr,
        redirect.flow.dst_port,
        ifindex,
        ingress as u8
    );
    let flags = if ingress { BPF_F_INGRESS } else { 0 };
    bpf_redirect(ifindex, flags) as i32
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
