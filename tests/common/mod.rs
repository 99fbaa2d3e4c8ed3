#![allow(dead_code)]

use tcpout::*;

/// A recorded frame as the IP output hook saw it.
#[derive(Debug, Clone)]
pub struct Frame {
    pub bytes: Vec<u8>,
    pub sge: usize,
    pub tcp_hlen: usize,
    pub flags: OutFlags,
}

impl Frame {
    pub fn hdr(&self) -> TcpHdr {
        TcpHdr::from_buffer(&self.bytes[..20]).unwrap()
    }

    pub fn options(&self) -> Vec<TcpOption> {
        parse_options(&self.bytes[20..self.tcp_hlen]).unwrap()
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[self.tcp_hlen..]
    }
}

/// Test double for the engine's environment: counting allocators with
/// programmable failure, a recording IP output hook and a settable clock.
#[derive(Debug, Default)]
pub struct StubHooks {
    pub now: u32,
    pub ticks: u32,
    pub mtu: u16,
    pub frames: Vec<Frame>,
    pub states: Vec<(u64, TcpState)>,

    pub pbuf_allocs: usize,
    pub pbuf_frees: usize,
    pub seg_allocs: usize,
    pub seg_frees: usize,

    /// Refuse pbuf allocations once this many have been served.
    pub pbuf_budget: Option<usize>,
    /// Refuse segment allocations once this many have been served.
    pub seg_budget: Option<usize>,
    /// Report backpressure for this many upcoming transmissions.
    pub wouldblock: usize,
    /// Fail hard for this many upcoming transmissions.
    pub io_errors: usize,
}

impl StubHooks {
    pub fn new() -> Self {
        Self {
            mtu: 1500,
            ..Self::default()
        }
    }

    pub fn last(&self) -> &Frame {
        self.frames.last().expect("no frame was emitted")
    }
}

impl TxHooks for StubHooks {
    fn sys_now(&mut self) -> u32 {
        self.now
    }

    fn tcp_ticks(&mut self) -> u32 {
        self.ticks
    }

    fn route_mtu(&mut self, _pcb: &TcpPcb) -> u16 {
        self.mtu
    }

    fn pbuf_alloc(&mut self, kind: PbufKind, len: u32, _desc: PbufDesc) -> Option<Box<Pbuf>> {
        if let Some(budget) = self.pbuf_budget {
            if self.pbuf_allocs >= budget {
                return None;
            }
        }
        self.pbuf_allocs += 1;
        match kind {
            PbufKind::Ram => Some(Box::new(Pbuf::ram(len))),
            PbufKind::Zerocopy => Some(Box::new(Pbuf::zerocopy(len))),
            PbufKind::Stack => None,
        }
    }

    fn pbuf_free(&mut self, p: Box<Pbuf>) {
        self.pbuf_frees += p.clen() as usize;
    }

    fn seg_alloc(&mut self) -> Option<TcpSeg> {
        if let Some(budget) = self.seg_budget {
            if self.seg_allocs >= budget {
                return None;
            }
        }
        self.seg_allocs += 1;
        Some(TcpSeg::blank())
    }

    fn seg_free(&mut self, _seg: TcpSeg) {
        self.seg_frees += 1;
    }

    fn on_state_change(&mut self, conn_id: u64, state: TcpState) {
        self.states.push((conn_id, state));
    }

    fn ip_output(
        &mut self,
        frame: WireFrame<'_>,
        _seg: Option<&TcpSeg>,
        _pcb: &TcpPcb,
        flags: OutFlags,
    ) -> Result<()> {
        if self.wouldblock > 0 {
            self.wouldblock -= 1;
            return Err(Error::WouldBlock);
        }
        if self.io_errors > 0 {
            self.io_errors -= 1;
            return Err(Error::IoError);
        }
        self.frames.push(Frame {
            bytes: frame.to_vec(),
            sge: frame.slices.len(),
            tcp_hlen: frame.tcp_hlen as usize,
            flags,
        });
        Ok(())
    }
}

/// An established connection with deterministic sequence numbers and the
/// given MSS and windows.
pub fn established(mss: u16, wnd: u32) -> (TxEngine<StubHooks>, TcpPcb) {
    let mut eng = TxEngine::new(StubHooks::new());
    let mut pcb = TcpPcb::new(TCP_PRIO_NORMAL);

    pcb.local_port = 2000;
    pcb.remote_port = 1024;
    pcb.conn_id = 1;
    pcb.update_mss(mss);
    pcb.advtsd_mss = mss;

    set_iss(&mut pcb, 10_000);
    pcb.snd_wnd = wnd;
    pcb.snd_wnd_max = wnd.max(4 * mss as u32);
    pcb.cwnd = wnd;
    pcb.rcv_nxt = 7_000;

    eng.set_state(&mut pcb, TcpState::Established);
    (eng, pcb)
}

pub fn set_iss(pcb: &mut TcpPcb, iss: u32) {
    pcb.snd_nxt = iss;
    pcb.snd_lbb = iss;
    pcb.lastack = iss;
    pcb.rtseq = 0;
}

/// Acknowledge everything outstanding, freeing the segments the way the
/// input path would.
pub fn ack_all(eng: &mut TxEngine<StubHooks>, pcb: &mut TcpPcb) {
    while let Some(mut seg) = pcb.unacked.pop_front() {
        pcb.lastack = seg.seqno.wrapping_add(seg.tcplen());
        pcb.snd_buf += seg.len;
        pcb.snd_queuelen -= seg.chain_len();
        if let Some(p) = seg.p.take() {
            eng.hooks.pbuf_free(p);
        }
        eng.hooks.seg_free(seg);
    }
    pcb.rtime = -1;
}

/// Reassemble the payload bytes of every recorded data frame in sequence
/// order, relative to `start`.
pub fn reassemble(frames: &[Frame], start: u32) -> Vec<u8> {
    let mut chunks: Vec<(u32, Vec<u8>)> = frames
        .iter()
        .filter(|f| !f.payload().is_empty())
        .map(|f| (f.hdr().seqno.wrapping_sub(start), f.payload().to_vec()))
        .collect();
    chunks.sort_by_key(|(off, _)| *off);

    let mut out = Vec::new();
    for (off, chunk) in chunks {
        assert_eq!(off as usize, out.len(), "non-contiguous payload");
        out.extend_from_slice(&chunk);
    }
    out
}

/// Snapshot of every protocol-visible PCB field, for transactional
/// failure checks. The Nagle memory-error flag is excluded: a failed
/// write records it so the next output flushes a trailing ACK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcbSnapshot {
    pub state: TcpState,
    pub flags: PcbFlags,
    pub snd_nxt: u32,
    pub snd_lbb: u32,
    pub lastack: u32,
    pub snd_wnd: u32,
    pub cwnd: u32,
    pub ssthresh: u32,
    pub snd_buf: u32,
    pub snd_queuelen: u32,
    pub unsent_oversize: u16,
    pub snd_sml_snt: u32,
    pub rtime: i16,
    pub nrtx: u8,
    pub unsent: Vec<(u32, u32, u32)>,
    pub unacked: Vec<(u32, u32, u32)>,
}

pub fn snapshot(pcb: &TcpPcb) -> PcbSnapshot {
    let shape = |q: &std::collections::VecDeque<TcpSeg>| {
        q.iter()
            .map(|s| (s.seqno, s.len, s.chain_len()))
            .collect::<Vec<_>>()
    };
    PcbSnapshot {
        state: pcb.state(),
        flags: pcb.flags - PcbFlags::NAGLEMEMERR,
        snd_nxt: pcb.snd_nxt,
        snd_lbb: pcb.snd_lbb,
        lastack: pcb.lastack,
        snd_wnd: pcb.snd_wnd,
        cwnd: pcb.cwnd,
        ssthresh: pcb.ssthresh,
        snd_buf: pcb.snd_buf,
        snd_queuelen: pcb.snd_queuelen,
        unsent_oversize: pcb.unsent_oversize,
        snd_sml_snt: pcb.snd_sml_snt,
        rtime: pcb.rtime,
        nrtx: pcb.nrtx,
        unsent: shape(&pcb.unsent),
        unacked: shape(&pcb.unacked),
    }
}

/// Check the queue-ordering and byte-conservation invariants that must
/// hold after every public call.
pub fn assert_queues_consistent(pcb: &TcpPcb) {
    for q in [&pcb.unsent, &pcb.unacked] {
        for pair in q.iter().collect::<Vec<_>>().windows(2) {
            assert_eq!(
                pair[0].seqno.wrapping_add(pair[0].tcplen()),
                pair[1].seqno,
                "queue not contiguous"
            );
        }
    }
    if let (Some(last_unacked), Some(first_unsent)) = (pcb.unacked.back(), pcb.unsent.front()) {
        assert!(
            last_unacked.seqno.wrapping_add(last_unacked.len) <= first_unsent.seqno,
            "unacked overlaps unsent"
        );
    }

    // every buffered byte (SYN/FIN phantoms included) is on exactly one
    // queue until acknowledged
    let queued: u32 = pcb
        .unsent
        .iter()
        .chain(pcb.unacked.iter())
        .map(|s| s.tcplen())
        .sum();
    assert_eq!(
        queued,
        pcb.snd_lbb.wrapping_sub(pcb.lastack),
        "byte conservation"
    );
}
