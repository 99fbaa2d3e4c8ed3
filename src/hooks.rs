//! The injected environment of the transmit engine.
//!
//! Everything the engine needs from the outside world (time, buffer and
//! segment allocation, routing, the actual frame transmission) is
//! reached through the [`TxHooks`] trait. The embedder implements it once
//! and constructs a [`TxEngine`] around it; no process-global state is
//! involved, so independent engines (and tests) never interfere.

use std::os::unix::io::RawFd;

use bitflags::bitflags;

use crate::{Error, Pbuf, PbufKind, Result, TcpPcb, TcpSeg, TcpState, TxConfig};

bitflags! {
    /// Qualifiers handed to the IP output hook along with a frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OutFlags: u16 {
        /// Locally accounted segment; must not reach the peer.
        const DUMMY = 0x0001;
        /// The frame exceeds one MSS; the NIC re-segments it.
        const TSO = 0x0002;
        /// Retransmission of previously sent sequence space.
        const REXMIT = 0x0004;
        /// Payload slices reference caller memory.
        const ZEROCOPY = 0x0008;
    }
}

/// Allocator hint forwarded from the write path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PbufDesc {
    /// Source file descriptor for file-backed writes.
    pub fd: Option<RawFd>,
}

/// A finished frame, borrowed for the duration of the IP output call.
///
/// `slices[0]` starts with the TCP header; the remaining entries are the
/// payload scatter list in order. The slice structure mirrors the
/// scatter-gather elements the NIC would receive.
#[derive(Debug)]
pub struct WireFrame<'a> {
    pub slices: Vec<&'a [u8]>,
    /// Length of the TCP header including options.
    pub tcp_hlen: u16,
}

impl WireFrame<'_> {
    pub fn total_len(&self) -> usize {
        self.slices.iter().map(|s| s.len()).sum()
    }

    /// Flatten the scatter list into one buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_len());
        for s in &self.slices {
            out.extend_from_slice(s);
        }
        out
    }
}

/// Environment of the engine, injected once at construction.
pub trait TxHooks {
    /// Wall-clock milliseconds; feeds the timestamp option.
    fn sys_now(&mut self) -> u32;

    /// Slow-timer ticks; feeds RTT sampling.
    fn tcp_ticks(&mut self) -> u32;

    /// MTU of the egress path for this connection.
    fn route_mtu(&mut self, pcb: &TcpPcb) -> u16;

    /// Allocate a transmit buffer. `None` signals exhaustion; the engine
    /// rolls back the operation in progress.
    fn pbuf_alloc(&mut self, kind: PbufKind, len: u32, desc: PbufDesc) -> Option<Box<Pbuf>>;

    /// Release a buffer chain. Implementations honor `refcnt`.
    fn pbuf_free(&mut self, p: Box<Pbuf>);

    /// Allocate a blank segment record.
    fn seg_alloc(&mut self) -> Option<TcpSeg>;

    /// Release a segment record (its buffer chain has been detached).
    fn seg_free(&mut self, seg: TcpSeg);

    /// Observe a TCP state transition of the connection `conn_id`.
    fn on_state_change(&mut self, conn_id: u64, state: TcpState);

    /// Frame and transmit. [`Error::WouldBlock`] reports transient
    /// backpressure; the engine re-offers the segment on the next
    /// `output()`.
    fn ip_output(
        &mut self,
        frame: WireFrame<'_>,
        seg: Option<&TcpSeg>,
        pcb: &TcpPcb,
        flags: OutFlags,
    ) -> Result<()>;
}

/// Congestion response signals the engine raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcSignal {
    /// Three duplicate ACKs observed; fast retransmit was performed.
    DupAcks,
}

/// Pluggable congestion response. Installed per PCB; when absent the
/// engine applies its built-in NewReno-style adjustment.
pub trait CcAlgo: std::fmt::Debug {
    fn cong_signal(
        &mut self,
        signal: CcSignal,
        cwnd: &mut u32,
        ssthresh: &mut u32,
        mss: u16,
        snd_wnd: u32,
    );
}

/// The transmit engine: injected hooks plus stack-wide configuration.
///
/// All per-connection state stays in [`TcpPcb`] values owned by the
/// embedder.
#[derive(Debug)]
pub struct TxEngine<H: TxHooks> {
    pub hooks: H,
    pub cfg: TxConfig,
}

impl<H: TxHooks> TxEngine<H> {
    pub fn new(hooks: H) -> Self {
        Self {
            hooks,
            cfg: TxConfig::default(),
        }
    }

    pub fn with_config(hooks: H, cfg: TxConfig) -> Self {
        Self { hooks, cfg }
    }

    /// Transition the connection state, notifying the observer hook.
    pub fn set_state(&mut self, pcb: &mut TcpPcb, state: TcpState) {
        pcb.state = state;
        self.hooks.on_state_change(pcb.conn_id, state);
    }

    /// Clamp the PCB's MSS to what the egress path can carry.
    pub fn update_route_mss(&mut self, pcb: &mut TcpPcb) {
        let mtu = self.hooks.route_mtu(pcb);
        let eff = mtu.saturating_sub(40).max(1);
        let mss = pcb.mss.min(eff);
        pcb.update_mss(mss);
    }

    /// Allocate a buffer, falling back to the PCB's prefetched singleton
    /// when the allocator is exhausted mid-operation.
    pub(crate) fn alloc_pbuf(
        &mut self,
        pcb: &mut TcpPcb,
        kind: PbufKind,
        len: u32,
        desc: PbufDesc,
    ) -> Option<Box<Pbuf>> {
        if let Some(p) = self.hooks.pbuf_alloc(kind, len, desc) {
            return Some(p);
        }
        if kind == PbufKind::Ram {
            if let Some(mut p) = pcb.pbuf_alloc.take() {
                p.reset_ram(len);
                return Some(p);
            }
        }
        None
    }

    /// Release a segment together with its buffer chain.
    pub(crate) fn free_seg(&mut self, mut seg: TcpSeg) {
        if let Some(p) = seg.p.take() {
            self.hooks.pbuf_free(p);
        }
        self.hooks.seg_free(seg);
    }

    pub(crate) fn mem_err(&mut self, pcb: &mut TcpPcb) -> Error {
        pcb.flags |= crate::PcbFlags::NAGLEMEMERR;
        Error::MemExhausted
    }
}
