//! Transmit engine for a user-space TCP stack.
//!
//! This crate implements the output half of a TCP connection: it buffers
//! application writes into MSS-sized segments, paces them against the peer
//! window, the congestion window and the NIC's segmentation-offload limits,
//! and hands finished wire frames to an injected IP output hook. Incoming
//! ACK processing, timers and congestion control live with the embedder;
//! the engine exposes the retransmission entry points they drive.
//!
//! The environment (clock, buffer and segment allocators, IP output) is
//! injected through the [`TxHooks`] trait; per-connection state lives in a
//! plain [`TcpPcb`] passed into every call.

mod err;
pub use err::{Error, Result};

mod seq;
pub use seq::*;

mod pbuf;
pub use pbuf::*;

mod seg;
pub use seg::*;

mod hdr;
pub use hdr::*;

mod pcb;
pub use pcb::*;

mod config;
pub use config::TxConfig;

mod hooks;
pub use hooks::*;

mod write;
pub use write::{TxData, WriteFlags};

mod split;

mod output;

mod debug;
pub use debug::dump_segs;
