//! Packet classification shared by the TC eBPF program and the user-space loader.
//!
//! Everything in this crate is allocation free and `no_std` so that the exact same
//! decision logic runs in the kernel and in host tests.
#![cfg_attr(not(any(test, feature = "user")), no_std)]

pub mod classify;
pub mod frame;
pub mod policy;
#[cfg(any(test, feature = "user"))]
pub mod synth;

pub use classify::{classify, Disposition, Redirect};
pub use frame::{Flow, Frame, PacketView, ParseError, SockTupleV4, Transport};
pub use policy::{ExemptRange, Policy, PolicyError, RedirectStrategy};
