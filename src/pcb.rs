//! Per-connection transmit state.

use std::collections::VecDeque;
use std::fmt::Debug;
use std::net::{IpAddr, Ipv4Addr};

use bitflags::bitflags;

use crate::{CcAlgo, Pbuf, TcpSeg};

pub const TCP_PRIO_MIN: u8 = 1;
pub const TCP_PRIO_NORMAL: u8 = 64;
pub const TCP_PRIO_MAX: u8 = 127;

/// Sentinel for the segment-count credit; queue growth is refused past it.
pub const TCP_SNDQUEUELEN_OVERFLOW: u32 = 0xFFFFFF - 3;

/// Configured receive window constant, advertised on RST segments.
pub const TCP_WND: u32 = 0xFFFF;

/// Conservative default MSS (RFC 879).
pub const TCP_MSS_DEFAULT: u16 = 536;

const TCP_SND_BUF_DEFAULT: u32 = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum TcpState {
    #[default]
    Closed = 0,
    Listen = 1,
    SynSent = 2,
    SynRcvd = 3,
    Established = 4,
    FinWait1 = 5,
    FinWait2 = 6,
    CloseWait = 7,
    Closing = 8,
    LastAck = 9,
    TimeWait = 10,
}

bitflags! {
    /// Connection-level flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PcbFlags: u16 {
        /// Delayed ACK pending.
        const ACK_DELAY = 0x0001;
        /// Immediate ACK requested.
        const ACK_NOW = 0x0002;
        /// In fast recovery.
        const INFR = 0x0004;
        /// Timestamp option negotiated.
        const TIMESTAMP = 0x0008;
        /// Receive side shut down.
        const RXCLOSED = 0x0010;
        /// FIN enqueued locally.
        const FIN = 0x0020;
        /// Nagle algorithm disabled.
        const NODELAY = 0x0040;
        /// A write failed on memory; flush a trailing ACK on next output.
        const NAGLEMEMERR = 0x0080;
        /// Window-scale option negotiated.
        const WND_SCALE = 0x0100;
    }
}

/// Segmentation-offload limits of the egress NIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsoCaps {
    /// Maximum length of one memory buffer.
    pub max_buf_sz: u32,
    /// Maximum TCP payload of one offloaded transfer; zero disables TSO.
    pub max_payload_sz: u32,
    /// Maximum header length the NIC accepts in front of the payload.
    pub max_header_sz: u16,
    /// Maximum number of scatter-gather elements per transfer.
    pub max_send_sge: u32,
}

impl Default for TsoCaps {
    fn default() -> Self {
        Self {
            max_buf_sz: 0,
            max_payload_sz: 0,
            max_header_sz: 0,
            max_send_sge: 16,
        }
    }
}

/// The transmit half of a TCP protocol control block.
///
/// The engine owns no PCBs; the embedder stores them and passes them
/// `&mut` into every engine call. All fields are host byte order.
pub struct TcpPcb {
    // # Identity & routing
    pub local_ip: IpAddr,
    pub remote_ip: IpAddr,
    pub local_port: u16,
    pub remote_port: u16,
    pub is_ipv6: bool,
    pub tos: u8,
    pub ttl: u8,
    pub prio: u8,
    /// Opaque token handed to the state observer.
    pub conn_id: u64,

    // # Connection state
    pub(crate) state: TcpState,
    pub flags: PcbFlags,
    /// Set by the input path while it holds the PCB; `output()` no-ops.
    pub is_in_input: bool,
    /// The previous output iteration's last segment was dropped by the IP
    /// hook and sits alone on `unacked`.
    pub is_last_seg_dropped: bool,

    // # Sender sequence space
    pub snd_nxt: u32,
    pub snd_lbb: u32,
    pub lastack: u32,
    pub snd_wnd: u32,
    pub snd_wnd_max: u32,
    pub cwnd: u32,
    pub ssthresh: u32,

    // # Send buffer accounting
    pub snd_buf: u32,
    pub max_snd_buff: u32,
    pub snd_queuelen: u32,
    pub max_tcp_snd_queuelen: u32,
    pub max_unsent_len: u32,

    // # Queues (strictly seqno-ascending)
    pub unsent: VecDeque<TcpSeg>,
    pub unacked: VecDeque<TcpSeg>,

    // # Receiver-side fields consumed by the output path
    pub rcv_nxt: u32,
    pub rcv_ann_wnd: u32,
    pub rcv_ann_right_edge: u32,
    pub rcv_scale: u8,
    pub snd_scale: u8,

    // # MSS & options
    pub mss: u16,
    pub advtsd_mss: u16,
    pub enable_ts_opt: bool,
    pub ts_recent: u32,
    pub ts_lastacksent: u32,

    // # Oversize
    pub tcp_oversize_val: u16,
    /// Free bytes at the tail of the last unsent buffer.
    pub unsent_oversize: u16,

    // # TSO
    pub tso: TsoCaps,

    // # Nagle / Minshall
    pub snd_sml_snt: u32,
    pub snd_sml_add: u32,

    // # Retransmission
    pub rtime: i16,
    pub rto: i16,
    pub nrtx: u8,
    pub dupacks: u8,
    pub rttest: u32,
    pub rtseq: u32,
    pub ticks_since_data_sent: i32,

    // # Keepalive & persist
    pub keep_idle: u32,
    pub keep_intvl: u32,
    pub keep_cnt: u32,
    pub keep_cnt_sent: u8,
    pub persist_cnt: u32,
    pub persist_backoff: u8,
    pub quickack: u8,

    // # Prealloc singletons, replenished at the end of `output()`
    pub seg_alloc: Option<TcpSeg>,
    pub pbuf_alloc: Option<Box<Pbuf>>,

    // # Congestion response plug-in (`None` selects the built-in default)
    pub cc: Option<Box<dyn CcAlgo>>,
}

impl TcpPcb {
    pub fn new(prio: u8) -> Self {
        debug_assert!((TCP_PRIO_MIN..=TCP_PRIO_MAX).contains(&prio));
        let iss: u32 = rand::random();
        let mut pcb = Self {
            local_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            remote_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            local_port: 0,
            remote_port: 0,
            is_ipv6: false,
            tos: 0,
            ttl: 64,
            prio,
            conn_id: 0,

            state: TcpState::Closed,
            flags: PcbFlags::empty(),
            is_in_input: false,
            is_last_seg_dropped: false,

            snd_nxt: iss,
            snd_lbb: iss,
            lastack: iss,
            snd_wnd: TCP_WND,
            snd_wnd_max: TCP_WND,
            cwnd: TCP_MSS_DEFAULT as u32,
            ssthresh: u32::MAX,

            snd_buf: TCP_SND_BUF_DEFAULT,
            max_snd_buff: TCP_SND_BUF_DEFAULT,
            snd_queuelen: 0,
            max_tcp_snd_queuelen: 0,
            max_unsent_len: 0,

            unsent: VecDeque::new(),
            unacked: VecDeque::new(),

            rcv_nxt: 0,
            rcv_ann_wnd: TCP_WND,
            rcv_ann_right_edge: 0,
            rcv_scale: 0,
            snd_scale: 0,

            mss: TCP_MSS_DEFAULT,
            advtsd_mss: TCP_MSS_DEFAULT,
            enable_ts_opt: false,
            ts_recent: 0,
            ts_lastacksent: 0,

            tcp_oversize_val: 0,
            unsent_oversize: 0,

            tso: TsoCaps::default(),

            snd_sml_snt: 0,
            snd_sml_add: 0,

            rtime: -1,
            rto: 3,
            nrtx: 0,
            dupacks: 0,
            rttest: 0,
            rtseq: 0,
            ticks_since_data_sent: -1,

            keep_idle: 7_200_000,
            keep_intvl: 75_000,
            keep_cnt: 9,
            keep_cnt_sent: 0,
            persist_cnt: 0,
            persist_backoff: 0,
            quickack: 0,

            seg_alloc: None,
            pbuf_alloc: None,

            cc: None,
        };
        pcb.update_mss(TCP_MSS_DEFAULT);
        pcb
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    /// Whether `write()` currently accepts data.
    pub fn is_writable_state(&self) -> bool {
        matches!(
            self.state,
            TcpState::Established | TcpState::CloseWait | TcpState::SynSent | TcpState::SynRcvd
        )
    }

    /// Install a new MSS and recompute the limits coupled to it.
    pub fn update_mss(&mut self, snd_mss: u16) {
        debug_assert!(snd_mss > 0);
        self.mss = snd_mss;
        self.max_tcp_snd_queuelen = 16 * self.max_snd_buff / snd_mss as u32;
        self.max_unsent_len = 16 * self.max_snd_buff / snd_mss as u32;
        self.tcp_oversize_val = snd_mss;
    }

    /// MSS usable for payload, accounting for the timestamp option.
    pub fn usable_mss(&self) -> u16 {
        if self.flags.contains(PcbFlags::TIMESTAMP) {
            self.mss - 12
        } else {
            self.mss
        }
    }

    pub fn sndbuf(&self) -> u32 {
        self.snd_buf
    }

    pub fn sndqueuelen(&self) -> u32 {
        self.snd_queuelen
    }

    pub fn nagle_disable(&mut self) {
        self.flags |= PcbFlags::NODELAY;
    }

    pub fn nagle_enable(&mut self) {
        self.flags -= PcbFlags::NODELAY;
    }

    pub fn nagle_disabled(&self) -> bool {
        self.flags.contains(PcbFlags::NODELAY)
    }

    pub fn tso_enabled(&self) -> bool {
        self.tso.max_payload_sz != 0
    }

    pub fn set_keepalive(&mut self, idle: u32, intvl: u32, cnt: u32) {
        self.keep_idle = idle;
        self.keep_intvl = intvl;
        self.keep_cnt = cnt;
    }

    /// Nagle gate: transmission may proceed when nothing is outstanding,
    /// Nagle is disabled, or the unsent queue holds either several
    /// segments or one of at least MSS size.
    pub fn nagle_allows_output(&self) -> bool {
        self.unacked.is_empty()
            || self.flags.contains(PcbFlags::NODELAY)
            || self.unsent.len() > 1
            || self
                .unsent
                .front()
                .map_or(false, |seg| seg.len >= self.mss as u32)
    }

    /// Reset the transmit state for reuse of this PCB by a new connection.
    /// Both queues must have been drained and freed by the caller.
    pub fn recycle(&mut self) {
        debug_assert!(self.unsent.is_empty() && self.unacked.is_empty());
        let iss: u32 = rand::random();
        self.state = TcpState::Closed;
        self.flags = PcbFlags::empty();
        self.is_in_input = false;
        self.is_last_seg_dropped = false;
        self.snd_nxt = iss;
        self.snd_lbb = iss;
        self.lastack = iss;
        self.snd_wnd = TCP_WND;
        self.snd_wnd_max = TCP_WND;
        self.cwnd = self.mss as u32;
        self.ssthresh = u32::MAX;
        self.snd_buf = self.max_snd_buff;
        self.snd_queuelen = 0;
        self.unsent_oversize = 0;
        self.snd_sml_snt = 0;
        self.snd_sml_add = 0;
        self.rtime = -1;
        self.nrtx = 0;
        self.dupacks = 0;
        self.rttest = 0;
        self.rtseq = 0;
        self.ticks_since_data_sent = -1;
        self.keep_cnt_sent = 0;
        self.persist_cnt = 0;
        self.persist_backoff = 0;
        self.quickack = 0;
    }

    /// Payload bytes currently sitting on both queues.
    pub fn queued_bytes(&self) -> u32 {
        self.unsent.iter().chain(self.unacked.iter()).map(|s| s.len).sum()
    }
}

impl Debug for TcpPcb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TcpPcb {{ state: {:?}, snd: {{ nxt: {}, lbb: {}, acked: {}, wnd: {}, cwnd: {} }}, \
             buf: {{ free: {}, queuelen: {} }}, queues: {{ unsent: {}, unacked: {} }} }}",
            self.state,
            self.snd_nxt,
            self.snd_lbb,
            self.lastack,
            self.snd_wnd,
            self.cwnd,
            self.snd_buf,
            self.snd_queuelen,
            self.unsent.len(),
            self.unacked.len(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_mss_couples_limits() {
        let mut pcb = TcpPcb::new(TCP_PRIO_NORMAL);
        pcb.max_snd_buff = 64 * 1024;
        pcb.update_mss(1000);
        assert_eq!(pcb.mss, 1000);
        assert_eq!(pcb.max_unsent_len, 16 * 64 * 1024 / 1000);
        assert_eq!(pcb.max_tcp_snd_queuelen, pcb.max_unsent_len);
        assert_eq!(pcb.tcp_oversize_val, 1000);
    }

    #[test]
    fn nagle_gate() {
        let mut pcb = TcpPcb::new(TCP_PRIO_NORMAL);
        pcb.update_mss(1000);

        // nothing outstanding: always allowed
        assert!(pcb.nagle_allows_output());

        let mut outstanding = TcpSeg::blank();
        outstanding.len = 100;
        pcb.unacked.push_back(outstanding);
        assert!(!pcb.nagle_allows_output());

        // a full-sized head segment unblocks
        let mut seg = TcpSeg::blank();
        seg.len = 1000;
        pcb.unsent.push_back(seg);
        assert!(pcb.nagle_allows_output());

        // a small head segment alone does not
        pcb.unsent.front_mut().unwrap().len = 10;
        assert!(!pcb.nagle_allows_output());

        // two pending segments do
        let mut seg = TcpSeg::blank();
        seg.len = 10;
        pcb.unsent.push_back(seg);
        assert!(pcb.nagle_allows_output());

        pcb.unsent.pop_back();
        pcb.nagle_disable();
        assert!(pcb.nagle_allows_output());
    }

    #[test]
    fn recycle_resets_transmit_state() {
        let mut pcb = TcpPcb::new(TCP_PRIO_NORMAL);
        pcb.state = TcpState::Established;
        pcb.flags |= PcbFlags::FIN | PcbFlags::NAGLEMEMERR;
        pcb.snd_buf = 100;
        pcb.nrtx = 3;
        pcb.unsent_oversize = 512;
        pcb.rtime = 7;

        pcb.recycle();

        assert_eq!(pcb.state(), TcpState::Closed);
        assert!(pcb.flags.is_empty());
        assert_eq!(pcb.snd_buf, pcb.max_snd_buff);
        assert_eq!(pcb.nrtx, 0);
        assert_eq!(pcb.unsent_oversize, 0);
        assert_eq!(pcb.rtime, -1);
        assert_eq!(pcb.snd_nxt, pcb.snd_lbb);
        assert_eq!(pcb.snd_nxt, pcb.lastack);
    }

    #[test]
    fn usable_mss_reserves_timestamp_room() {
        let mut pcb = TcpPcb::new(TCP_PRIO_NORMAL);
        pcb.update_mss(1000);
        assert_eq!(pcb.usable_mss(), 1000);
        pcb.flags |= PcbFlags::TIMESTAMP;
        assert_eq!(pcb.usable_mss(), 988);
    }
}
