//! The write path: admission checks, three-phase segmentation and the
//! SYN/FIN control enqueue.

use std::io::IoSliceMut;
use std::os::unix::io::RawFd;

use bitflags::bitflags;
use bytes::Bytes;
use nix::sys::uio::preadv;

use crate::{
    dump_segs, opt_length, Error, PbufDesc, PbufKind, PcbFlags, Pbuf, Result, SegFlags, TcpHdr,
    TcpHdrFlags, TcpPcb, TcpSeg, TxEngine, TxHooks, TCP_HLEN, TCP_OPT_LEN_TS,
    TCP_SNDQUEUELEN_OVERFLOW,
};

bitflags! {
    /// Caller-facing flags of [`TxEngine::write`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WriteFlags: u16 {
        /// Data is copied into stack-owned memory.
        const COPY = 0x01;
        /// More data follows shortly; prefer oversized allocations.
        const MORE = 0x02;
        /// Retransmission of already-sent sequence space.
        const REXMIT = 0x08;
        /// Locally accounted segment that never reaches the peer.
        const DUMMY = 0x10;
        /// Large write intended for segmentation offload.
        const TSO = 0x20;
        /// Data is read from a file descriptor.
        const FILE = 0x40;
        /// Data stays in caller memory until acknowledged.
        const ZEROCOPY = 0x80;
    }
}

/// The data source of one write.
#[derive(Debug, Clone)]
pub enum TxData<'a> {
    /// Bytes copied into engine-owned buffers.
    Copy(&'a [u8]),
    /// Caller-owned bytes referenced until ACKed; the caller guarantees
    /// their lifetime.
    Zerocopy(Bytes),
    /// Bytes read from `fd` at `offset` by a vectored read.
    File { fd: RawFd, offset: i64, len: u32 },
}

impl TxData<'_> {
    pub fn len(&self) -> u32 {
        match self {
            TxData::Copy(s) => s.len() as u32,
            TxData::Zerocopy(b) => b.len() as u32,
            TxData::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

const MEM_ALIGNMENT: u32 = 4;

fn mem_align(size: u32) -> u32 {
    (size + MEM_ALIGNMENT - 1) & !(MEM_ALIGNMENT - 1)
}

/// Vectored-read batching limits: one `preadv` covers at most this many
/// segments or bytes.
const PIOV_MAX_SIZE: usize = 512;
const PIOV_MAX_LEN: u32 = 65536;

/// Fill the payload areas of `segs` from `fd` in one vectored read. Any
/// short or failed read aborts the whole write; partial writes are not
/// allowed.
fn preadv_fill(fd: RawFd, offset: i64, segs: &mut [TcpSeg], optlen: u32, expect: u32) -> bool {
    let mut iovs: Vec<IoSliceMut<'_>> = Vec::with_capacity(segs.len());
    for seg in segs.iter_mut() {
        let p = seg.p.as_mut().unwrap();
        let start = p.offset + (TCP_HLEN + optlen) as usize;
        let end = p.offset + p.len as usize;
        let slice = &mut p.raw_mut()[start..end];
        iovs.push(IoSliceMut::new(slice));
    }
    match preadv(fd, &mut iovs, offset) {
        Ok(n) => n == expect as usize,
        Err(_) => false,
    }
}

impl<H: TxHooks> TxEngine<H> {
    /// Enqueue data for sending, without sending it yet.
    ///
    /// Data is merged into the tail of the unsent queue where buffer slack
    /// and the MSS allow it, and cut into fresh segments beyond that. A
    /// following [`TxEngine::output`] drains whatever the windows permit.
    ///
    /// On any allocation failure the PCB is left exactly as it was and
    /// [`Error::MemExhausted`] is returned.
    pub fn write(&mut self, pcb: &mut TcpPcb, data: TxData<'_>, apiflags: WriteFlags) -> Result<()> {
        let mut apiflags = apiflags;
        let len = data.len();

        let is_zerocopy = matches!(data, TxData::Zerocopy(_));
        let is_file = matches!(data, TxData::File { .. });
        match &data {
            TxData::Copy(_) => apiflags |= WriteFlags::COPY,
            TxData::Zerocopy(_) => apiflags |= WriteFlags::ZEROCOPY,
            TxData::File { .. } => apiflags |= WriteFlags::FILE,
        }
        let kind = if is_zerocopy {
            PbufKind::Zerocopy
        } else {
            PbufKind::Ram
        };

        let byte_queued = pcb.snd_nxt.wrapping_sub(pcb.lastack);
        if len < pcb.mss as u32 && !apiflags.contains(WriteFlags::DUMMY) {
            pcb.snd_sml_add = pcb.unacked.front().map_or(0, |s| s.len) + byte_queued;
        }

        log::trace!(
            target: "tcpout",
            "write: len={} apiflags={:?} on {:?}",
            len,
            apiflags,
            pcb
        );

        let (file_fd, file_start) = match data {
            TxData::File { fd, offset, .. } => {
                if fd < 0 {
                    return Err(Error::InvalidArg);
                }
                (fd, offset)
            }
            _ => (-1, 0),
        };

        match self.write_checks(pcb, len) {
            Ok(()) => {}
            Err(Error::BufferTooSmall) => return Err(Error::MemExhausted),
            Err(e) => return Err(e),
        }
        if len == 0 {
            return Ok(());
        }

        let mut queuelen = pcb.snd_queuelen;

        let mut mss_local = self.xmit_size_goal(pcb, true);
        if is_zerocopy {
            mss_local = self.cfg.zc_tx_size;
        }

        let mut optflags = SegFlags::empty();
        if apiflags.contains(WriteFlags::DUMMY) {
            optflags |= SegFlags::DUMMY_MSG;
        }
        if is_zerocopy {
            optflags |= SegFlags::ZEROCOPY;
        }
        if pcb.flags.contains(PcbFlags::TIMESTAMP) {
            optflags |= SegFlags::TS;
        }
        let mut optlen = opt_length(optflags);
        let mss_local_minus_opts = (mss_local as u32).saturating_sub(optlen);
        if is_zerocopy {
            // options live in the side header area composed at emission
            optlen = 0;
        }

        let copy_src: &[u8] = match &data {
            TxData::Copy(s) => *s,
            _ => &[],
        };

        // Segmentation runs in three phases of increasing complexity:
        //
        //   1. Copy data into the oversized tail of the last unsent
        //      buffer.
        //   2. Chain one new pbuf onto the last unsent segment.
        //   3. Create new segments.
        //
        // Memory may run out at any point. All mutation is recorded in
        // local variables (`pos`, `oversize`, `concat_p`, `queue`,
        // `queuelen`) and committed only after every phase succeeded, so
        // a failed write leaves the PCB untouched.
        let mut pos: u32 = 0;
        let mut oversize: u16 = 0;
        let mut oversize_used: u16 = 0;
        let mut concat_p: Option<Box<Pbuf>> = None;

        if !pcb.unsent.is_empty() {
            let (mut space, tot_p, last_len) = {
                let last = pcb.unsent.back().unwrap();
                let unsent_optlen = opt_length(last.flags);
                let type_match = last.p.as_ref().map_or(true, |p| p.kind() == kind);
                let space = if type_match {
                    debug_assert!(mss_local as u32 >= last.len + unsent_optlen);
                    (mss_local as u32).saturating_sub(last.len + unsent_optlen)
                } else {
                    0
                };
                (space, last.chain_len(), last.len)
            };

            // Phase 1. Only the byte count is decided here; the copy into
            // the tail happens at commit.
            if pcb.unsent_oversize > 0 && !is_file && !is_zerocopy {
                oversize = pcb.unsent_oversize;
                oversize_used = (oversize as u32).min(len) as u16;
                pos += oversize_used as u32;
                oversize -= oversize_used;
                space = space.saturating_sub(oversize_used as u32);
            }
            debug_assert!(oversize == 0 || pos == len);

            // Phase 2. Segments holding SYN/FIN (len == 0) are never
            // extended, and the chain must stay within the NIC's
            // scatter-gather budget.
            if !is_file
                && !is_zerocopy
                && pos < len
                && space > 0
                && last_len > 0
                && tot_p < pcb.tso.max_send_sge
            {
                let seglen = space.min(len - pos);
                let Some((mut p, ovr)) = self.pbuf_prealloc(
                    pcb,
                    seglen,
                    space,
                    kind,
                    true,
                    true,
                    PbufDesc::default(),
                ) else {
                    log::trace!(
                        target: "tcpout",
                        "write: no memory for pbuf copy of {} bytes",
                        seglen
                    );
                    return Err(self.write_rollback(pcb, concat_p, Vec::new()));
                };
                oversize = ovr;
                p.data_mut()
                    .copy_from_slice(&copy_src[pos as usize..(pos + seglen) as usize]);
                pos += seglen;
                queuelen += p.clen();
                concat_p = Some(p);
            }
        } else {
            debug_assert_eq!(pcb.unsent_oversize, 0);
        }

        // Phase 3. New segments collect in `queue` until commit.
        let mut queue: Vec<TcpSeg> = Vec::new();
        let mut file_pending = 0usize;
        let mut file_pending_bytes = 0u32;
        let mut file_offset = file_start;

        while pos < len {
            let left = len - pos;
            let mut max_len = mss_local_minus_opts;
            let seglen = left.min(max_len);
            if is_zerocopy {
                // exact-size buffers; referenced memory has no slack
                max_len = seglen;
            }

            let desc = PbufDesc {
                fd: is_file.then_some(file_fd),
            };
            let Some((mut p, ovr)) =
                self.pbuf_prealloc(pcb, seglen + optlen, max_len, kind, true, queue.is_empty(), desc)
            else {
                log::trace!(
                    target: "tcpout",
                    "write: no memory for pbuf copy of {} bytes",
                    seglen
                );
                return Err(self.write_rollback(pcb, concat_p, queue));
            };
            oversize = ovr;
            debug_assert!(p.len >= seglen);

            match &data {
                TxData::Zerocopy(b) => {
                    p.set_zerocopy_window(b.slice(pos as usize..(pos + seglen) as usize));
                }
                TxData::File { .. } => {
                    // filled below by the batched vectored read
                }
                TxData::Copy(src) => {
                    p.data_mut()[optlen as usize..]
                        .copy_from_slice(&src[pos as usize..(pos + seglen) as usize]);
                }
            }

            queuelen += p.clen();
            if queuelen > pcb.max_unsent_len || queuelen > TCP_SNDQUEUELEN_OVERFLOW {
                log::trace!(
                    target: "tcpout",
                    "write: queue too long {} ({})",
                    queuelen,
                    pcb.max_unsent_len
                );
                self.hooks.pbuf_free(p);
                return Err(self.write_rollback(pcb, concat_p, queue));
            }

            let seg = match self.create_segment(
                pcb,
                Some(p),
                TcpHdrFlags::empty(),
                pcb.snd_lbb.wrapping_add(pos),
                optflags,
            ) {
                Ok(seg) => seg,
                Err(p) => {
                    if let Some(p) = p {
                        self.hooks.pbuf_free(p);
                    }
                    return Err(self.write_rollback(pcb, concat_p, queue));
                }
            };
            log::trace!(
                target: "tcpout",
                "write: queueing {}:{}",
                seg.seqno,
                seg.seqno.wrapping_add(seg.tcplen())
            );
            queue.push(seg);
            pos += seglen;

            if is_file {
                file_pending += 1;
                file_pending_bytes += seglen;
                if pos >= len || file_pending >= PIOV_MAX_SIZE || file_pending_bytes >= PIOV_MAX_LEN
                {
                    let start = queue.len() - file_pending;
                    if !preadv_fill(
                        file_fd,
                        file_offset,
                        &mut queue[start..],
                        optlen,
                        file_pending_bytes,
                    ) {
                        return Err(self.write_rollback(pcb, concat_p, queue));
                    }
                    file_offset += file_pending_bytes as i64;
                    file_pending = 0;
                    file_pending_bytes = 0;
                }
            }
        }

        // All three phases succeeded; commit the transaction.

        // Phase 1: copy into the preallocated tail and bump the chain
        // length fields.
        if oversize_used > 0 {
            let last = pcb.unsent.back_mut().unwrap();
            last.p
                .as_mut()
                .unwrap()
                .extend_tail(&copy_src[..oversize_used as usize]);
            last.len += oversize_used as u32;
        }
        pcb.unsent_oversize = oversize;

        // Phase 2: concatenate concat_p onto the last unsent segment.
        if let Some(cp) = concat_p {
            let add = cp.tot_len;
            let last = pcb.unsent.back_mut().unwrap();
            last.p.as_mut().unwrap().cat(cp);
            last.len += add;
        }

        // Phase 3: splice the new segments onto unsent.
        pcb.unsent.extend(queue);

        pcb.snd_lbb = pcb.snd_lbb.wrapping_add(len);
        pcb.snd_buf -= len;
        pcb.snd_queuelen = queuelen;
        log::trace!(
            target: "tcpout",
            "write: queuelen {} (after enqueued)",
            pcb.snd_queuelen
        );
        if pcb.snd_queuelen != 0 {
            debug_assert!(!pcb.unacked.is_empty() || !pcb.unsent.is_empty());
        }

        if self.cfg.enable_push_flag {
            if let Some(last) = pcb.unsent.back_mut() {
                last.hdr.flags |= TcpHdrFlags::PSH;
            }
        }

        log::trace!(
            target: "tcpout",
            "write: mss: {:<5} unsent {}",
            mss_local,
            dump_segs(&pcb.unsent)
        );
        Ok(())
    }

    /// Enqueue a header-only segment carrying SYN and/or FIN.
    ///
    /// Queue-length limits are bypassed for FIN so closing is always
    /// possible. SYN and FIN occupy one phantom byte of sequence space but
    /// never draw on `snd_buf`.
    pub fn enqueue_flags(&mut self, pcb: &mut TcpPcb, flags: TcpHdrFlags) -> Result<()> {
        log::trace!(
            target: "tcpout",
            "enqueue_flags: queuelen: {}",
            pcb.snd_queuelen
        );
        debug_assert!(
            flags.intersects(TcpHdrFlags::SYN | TcpHdrFlags::FIN),
            "enqueue_flags needs either SYN or FIN"
        );

        if (pcb.snd_queuelen >= pcb.max_unsent_len
            || pcb.snd_queuelen > TCP_SNDQUEUELEN_OVERFLOW)
            && !flags.contains(TcpHdrFlags::FIN)
        {
            log::trace!(
                target: "tcpout",
                "enqueue_flags: too long queue {} (max {})",
                pcb.snd_queuelen,
                pcb.max_unsent_len
            );
            return Err(self.mem_err(pcb));
        }

        let mut optflags = SegFlags::empty();
        if flags.contains(TcpHdrFlags::SYN) {
            optflags |= SegFlags::MSS;
            if self.cfg.enable_wnd_scale
                && (pcb.state() != crate::TcpState::SynRcvd
                    || pcb.flags.contains(PcbFlags::WND_SCALE))
            {
                // In a <SYN,ACK> the window-scale option may only be sent
                // if the remote host offered one in its SYN.
                optflags |= SegFlags::WNDSCALE;
            }
            if pcb.enable_ts_opt && !flags.contains(TcpHdrFlags::ACK) {
                // initial timestamp announcement, connecting side only;
                // the accepting side replies in kind
                optflags |= SegFlags::TS;
            }
        }
        if pcb.flags.contains(PcbFlags::TIMESTAMP) {
            optflags |= SegFlags::TS;
        }
        let optlen = opt_length(optflags);

        let Some(p) = self.alloc_pbuf(pcb, PbufKind::Ram, optlen, PbufDesc::default()) else {
            return Err(self.mem_err(pcb));
        };

        let seg = match self.create_segment(pcb, Some(p), flags, pcb.snd_lbb, optflags) {
            Ok(seg) => seg,
            Err(p) => {
                if let Some(p) = p {
                    self.hooks.pbuf_free(p);
                }
                return Err(self.mem_err(pcb));
            }
        };
        debug_assert_eq!(seg.len, 0);

        log::trace!(
            target: "tcpout",
            "enqueue_flags: queueing {}:{} ({:?})",
            seg.seqno,
            seg.seqno.wrapping_add(seg.tcplen()),
            flags
        );

        let clen = seg.chain_len();
        pcb.unsent.push_back(seg);
        // the new unsent tail has no free tail space
        pcb.unsent_oversize = 0;

        if flags.intersects(TcpHdrFlags::SYN | TcpHdrFlags::FIN) {
            pcb.snd_lbb = pcb.snd_lbb.wrapping_add(1);
        }
        if flags.contains(TcpHdrFlags::FIN) {
            pcb.flags |= PcbFlags::FIN;
        }

        pcb.snd_queuelen += clen;
        log::trace!(
            target: "tcpout",
            "enqueue_flags: queuelen {} (after enqueued)",
            pcb.snd_queuelen
        );
        Ok(())
    }

    /// Create a segment with a prefilled header around `p`, drawing on the
    /// PCB's prefetched record first. With `p == None` a blank record is
    /// returned for prefetching. On failure the untouched `p` is handed
    /// back to the caller.
    pub(crate) fn create_segment(
        &mut self,
        pcb: &mut TcpPcb,
        p: Option<Box<Pbuf>>,
        hdr_flags: TcpHdrFlags,
        seqno: u32,
        optflags: SegFlags,
    ) -> std::result::Result<TcpSeg, Option<Box<Pbuf>>> {
        let optlen = opt_length(optflags);

        let mut seg = match pcb.seg_alloc.take() {
            Some(seg) => seg,
            None => match self.hooks.seg_alloc() {
                Some(seg) => seg,
                None => {
                    log::trace!(target: "tcpout", "create_segment: no memory");
                    return Err(p);
                }
            },
        };

        let Some(mut p) = p else {
            seg.p = None;
            return Ok(seg);
        };

        seg.flags = optflags;
        seg.len = p.tot_len
            - if optflags.contains(SegFlags::ZEROCOPY) {
                0
            } else {
                optlen
            };
        seg.seqno = seqno;

        if !optflags.contains(SegFlags::ZEROCOPY) {
            // expose room for the TCP header in front of the options
            if !p.header_adjust(TCP_HLEN as i32) {
                log::trace!(
                    target: "tcpout",
                    "create_segment: no room for TCP header in pbuf"
                );
                self.hooks.seg_free(seg);
                return Err(Some(p));
            }
        }

        seg.hdr = TcpHdr {
            src: pcb.local_port,
            dest: pcb.remote_port,
            seqno,
            // ackno and wnd are finalized at emission
            ackno: 0,
            hdrlen_words: (5 + optlen / 4) as u8,
            flags: hdr_flags,
            wnd: 0,
            chksum: 0,
            urgp: 0,
        };
        seg.p = Some(p);
        Ok(seg)
    }

    /// Allocate a RAM pbuf of `length` usable bytes, rounded up towards
    /// `max_length` when the Nagle algorithm is likely to defer
    /// transmission. The slack lets the next write extend the buffer in
    /// place instead of allocating again.
    pub(crate) fn pbuf_prealloc(
        &mut self,
        pcb: &mut TcpPcb,
        length: u32,
        max_length: u32,
        kind: PbufKind,
        defer_likely: bool,
        first_seg: bool,
        desc: PbufDesc,
    ) -> Option<(Box<Pbuf>, u16)> {
        let mut alloc = length;
        if length < max_length
            && (defer_likely
                || (!pcb.flags.contains(PcbFlags::NODELAY)
                    && (!first_seg || !pcb.unsent.is_empty() || !pcb.unacked.is_empty())))
        {
            alloc = max_length.min(mem_align(length + pcb.tcp_oversize_val as u32));
        }
        let mut p = self.alloc_pbuf(pcb, kind, alloc, desc)?;
        debug_assert!(p.next.is_none(), "prealloc needs an unchained pbuf");
        let oversize = (p.len - length) as u16;
        // trim to the currently used size
        p.len = length;
        p.tot_len = length;
        Some((p, oversize))
    }

    /// The segmentation goal: MSS adjusted for the timestamp option, the
    /// TSO buffer size when requested, and never more than half the
    /// largest window the peer ever announced.
    pub(crate) fn xmit_size_goal(&self, pcb: &TcpPcb, use_max: bool) -> u16 {
        let mut size = pcb.mss as u32;
        if pcb.flags.contains(PcbFlags::TIMESTAMP) {
            // segments must hold at least one data byte next to the option
            size = size.max(TCP_OPT_LEN_TS + 1);
        }
        if use_max && pcb.tso_enabled() && pcb.tso.max_buf_sz != 0 {
            size = size.max(pcb.tso.max_buf_sz);
        }
        size = size.min(pcb.snd_wnd_max >> 1);
        size.min(u16::MAX as u32) as u16
    }

    fn write_checks(&mut self, pcb: &mut TcpPcb, len: u32) -> Result<()> {
        if !pcb.is_writable_state() {
            log::trace!(target: "tcpout", "write called in invalid state {:?}", pcb.state());
            return Err(Error::InvalidState);
        }
        if len == 0 {
            return Ok(());
        }
        if len > pcb.snd_buf {
            log::trace!(
                target: "tcpout",
                "write: too much data (len={} > snd_buf={})",
                len,
                pcb.snd_buf
            );
            pcb.flags |= PcbFlags::NAGLEMEMERR;
            return Err(Error::BufferTooSmall);
        }
        log::trace!(target: "tcpout", "write: queuelen: {}", pcb.snd_queuelen);
        if pcb.snd_queuelen >= pcb.max_unsent_len || pcb.snd_queuelen > TCP_SNDQUEUELEN_OVERFLOW {
            log::trace!(
                target: "tcpout",
                "write: too long queue {} (max {})",
                pcb.snd_queuelen,
                pcb.max_unsent_len
            );
            pcb.flags |= PcbFlags::NAGLEMEMERR;
            return Err(Error::MemExhausted);
        }
        if pcb.snd_queuelen == 0 {
            debug_assert!(pcb.unacked.is_empty() && pcb.unsent.is_empty());
        }
        Ok(())
    }

    fn write_rollback(
        &mut self,
        pcb: &mut TcpPcb,
        concat_p: Option<Box<Pbuf>>,
        queue: Vec<TcpSeg>,
    ) -> Error {
        if let Some(p) = concat_p {
            self.hooks.pbuf_free(p);
        }
        for seg in queue {
            self.free_seg(seg);
        }
        log::trace!(
            target: "tcpout",
            "write: queuelen {} (with mem err)",
            pcb.snd_queuelen
        );
        self.mem_err(pcb)
    }
}
