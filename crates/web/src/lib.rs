//! pvedash VNC bridge
//!
//! Asks the hypervisor for a one-time websocket ticket, serves an embedded
//! HTML/JS VNC client from a local ephemeral port, and reverse-proxies the
//! websocket upstream, forwarding whichever auth artifact (cookie or API
//! token) the session uses.

pub mod bridge;
pub mod static_files;
pub mod vnc_proxy;

pub use bridge::{VncBridge, VncSession};
