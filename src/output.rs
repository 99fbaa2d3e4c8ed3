//! The output side: draining the unsent queue, emitting single segments,
//! control-segment transmission and the retransmission entry points.

use std::io::{Cursor, Write};

use crate::{
    build_options, dump_segs, opt_length, seq_lt, Error, IntoBytestream, OutFlags, PbufDesc,
    Pbuf, PbufKind, PcbFlags, Result, SegFlags, TcpHdr, TcpHdrFlags, TcpPcb, TcpSeg, TcpState,
    TxEngine, TxHooks, WireFrame, TCP_HLEN, TCP_MSS_DEFAULT, TCP_OPT_LEN_TS, TCP_WND,
};

fn serialize_hdr(hdr: &TcpHdr, opts: &[u8], region: &mut [u8]) -> Result<()> {
    let mut cursor = Cursor::new(region);
    hdr.into_bytestream(&mut cursor).map_err(|_| Error::IoError)?;
    cursor.write_all(opts).map_err(|_| Error::IoError)?;
    Ok(())
}

impl<H: TxHooks> TxEngine<H> {
    /// Find out what can be sent and send it.
    ///
    /// Walks `unsent` head-first, splitting and joining segments to fit
    /// the effective window and the NIC's offload limits, and hands each
    /// finished segment to the IP output hook. Sent payload-bearing
    /// segments move to `unacked`; backpressure from the hook leaves the
    /// segment queued for the next call.
    pub fn output(&mut self, pcb: &mut TcpPcb) -> Result<()> {
        // The input path will invoke output() itself once it is done;
        // running here would interleave mutation of the shared counters.
        if pcb.is_in_input {
            return Ok(());
        }

        let wnd = pcb.snd_wnd.min(pcb.cwnd);
        log::trace!(
            target: "tcpout",
            "output: snd_wnd {}, cwnd {}, wnd {}",
            pcb.snd_wnd,
            pcb.cwnd,
            wnd
        );

        if pcb.is_last_seg_dropped && pcb.unacked.len() == 1 {
            // The previous iteration's segment never left the host; pull
            // it back in front of the unsent queue and try again.
            pcb.is_last_seg_dropped = false;
            let seg = pcb.unacked.pop_front().unwrap();
            pcb.unsent.push_front(seg);
        }

        // An immediate ACK with no sendable data becomes an empty ACK;
        // otherwise it piggybacks on the data below.
        let head_fits = pcb.unsent.front().map_or(false, |seg| {
            seg.seqno.wrapping_sub(pcb.lastack).wrapping_add(seg.len) <= wnd
        });
        if pcb.flags.contains(PcbFlags::ACK_NOW) && !head_fits {
            return self.send_empty_ack(pcb);
        }

        if !pcb.unsent.is_empty() {
            log::trace!(
                target: "tcpout",
                "output: wnd: {:<5} unsent {}",
                wnd,
                dump_segs(&pcb.unsent)
            );
        }

        let mut rc: Result<()> = Ok(());
        while rc.is_ok() && !pcb.unsent.is_empty() {
            // A TSO mark can only be left over from an earlier pass; the
            // join and split steps below re-derive it.
            pcb.unsent[0].flags -= SegFlags::TSO;

            // A partially retransmitted multi-buffer segment is cut into
            // per-buffer segments so a freed interior buffer cannot race
            // the retransmit.
            {
                let seg = &pcb.unsent[0];
                if seq_lt(seg.seqno, pcb.snd_nxt)
                    && seg.p.as_ref().map_or(false, |p| p.len != p.tot_len)
                {
                    self.split_rexmit(pcb, 0);
                }
            }

            // With nothing in flight, a segment overrunning the window is
            // split so the fitting part goes out now.
            {
                let seg = &pcb.unsent[0];
                if pcb.unacked.is_empty()
                    && wnd > 0
                    && seg.len.wrapping_add(seg.seqno.wrapping_sub(pcb.lastack)) > wnd
                {
                    debug_assert!(!seg.is_dummy(), "no window for a dummy segment");
                    self.split_segment(pcb, 0, wnd);
                }
            }

            let (seqno, len, dummy) = {
                let seg = &pcb.unsent[0];
                (seg.seqno, seg.len, seg.is_dummy())
            };

            if seqno.wrapping_sub(pcb.lastack).wrapping_add(len) > wnd {
                break;
            }
            debug_assert!(
                !pcb.unsent[0].hdr.flags.contains(TcpHdrFlags::RST),
                "RST is never sent from the data path"
            );

            // Nagle with Minshall's refinement: hold a small segment back
            // while another small segment is outstanding. A prior memory
            // error or a pending FIN overrides the hold so the tail ACK
            // is not delayed indefinitely.
            if !pcb.nagle_allows_output()
                && !dummy
                && !pcb.flags.intersects(PcbFlags::NAGLEMEMERR | PcbFlags::FIN)
            {
                if pcb.snd_sml_snt > pcb.unacked.front().map_or(0, |s| s.len) {
                    break;
                } else {
                    let pair = pcb.unsent.get(1).map_or(0, |s| s.len) + len;
                    if pair <= pcb.snd_sml_add {
                        pcb.snd_sml_snt = pcb.snd_sml_add;
                    }
                }
            }

            if pcb.tso_enabled() {
                self.tso_segment(pcb, 0, wnd);
            }

            // A dummy segment must not swallow a pending ACK.
            if dummy && pcb.flags.intersects(PcbFlags::ACK_DELAY | PcbFlags::ACK_NOW) {
                let _ = self.send_empty_ack(pcb);
            }

            let mut seg = pcb.unsent.pop_front().unwrap();
            if pcb.state() != TcpState::SynSent {
                seg.hdr.flags |= TcpHdrFlags::ACK;
                pcb.flags -= PcbFlags::ACK_DELAY | PcbFlags::ACK_NOW;
            }

            rc = self.output_segment(&mut seg, pcb);
            if rc.is_err() && !pcb.unacked.is_empty() {
                // Keep the segment at the head for the next output();
                // with unacked segments around, RTO will drive a resend.
                pcb.unsent.push_front(seg);
                break;
            }
            if rc == Err(Error::WouldBlock) {
                pcb.is_last_seg_dropped = true;
            }

            let tcplen = seg.tcplen();
            let snd_nxt_new = seg.seqno.wrapping_add(tcplen);
            if seq_lt(pcb.snd_nxt, snd_nxt_new) && !seg.is_dummy() {
                pcb.snd_nxt = snd_nxt_new;
            }

            if tcplen > 0 {
                if seg.is_dummy() {
                    // Locally accounted only: hand the reservation back.
                    pcb.snd_lbb = pcb.snd_lbb.wrapping_sub(seg.len);
                    pcb.snd_buf += seg.len;
                    pcb.snd_queuelen -= seg.chain_len();
                    self.free_seg(seg);
                } else if pcb
                    .unacked
                    .back()
                    .map_or(false, |tail| seq_lt(seg.seqno, tail.seqno))
                {
                    // A fast-retransmitted segment belongs before the
                    // tail; walk to its sorted slot.
                    let pos = pcb
                        .unacked
                        .iter()
                        .position(|s| !seq_lt(s.seqno, seg.seqno))
                        .unwrap_or(pcb.unacked.len());
                    pcb.unacked.insert(pos, seg);
                } else {
                    pcb.unacked.push_back(seg);
                }
            } else {
                // empty segments are not tracked for retransmission
                self.free_seg(seg);
            }
        }

        if pcb.unsent.is_empty() {
            pcb.unsent_oversize = 0;
        }
        pcb.flags -= PcbFlags::NAGLEMEMERR;

        // Refill the per-connection singletons that guarantee progress
        // inside the failure-sensitive split paths.
        if pcb.seg_alloc.is_none() {
            if let Ok(shell) =
                self.create_segment(pcb, None, TcpHdrFlags::empty(), 0, SegFlags::empty())
            {
                pcb.seg_alloc = Some(shell);
            }
        }
        if pcb.pbuf_alloc.is_none() {
            pcb.pbuf_alloc = self
                .hooks
                .pbuf_alloc(PbufKind::Ram, 0, PbufDesc::default());
        }

        match rc {
            Err(Error::WouldBlock) => Ok(()),
            other => other,
        }
    }

    /// Finalize and transmit one segment over the IP output hook.
    pub(crate) fn output_segment(&mut self, seg: &mut TcpSeg, pcb: &mut TcpPcb) -> Result<()> {
        seg.hdr.ackno = pcb.rcv_nxt;

        if seg.flags.contains(SegFlags::WNDSCALE) {
            // The window of the SYN segment that carries the scale option
            // is itself never scaled.
            seg.hdr.wnd = pcb.rcv_ann_wnd.min(0xFFFF) as u16;
        } else {
            seg.hdr.wnd = (pcb.rcv_ann_wnd >> pcb.rcv_scale).min(0xFFFF) as u16;
        }

        let dummy = seg.is_dummy();
        if !dummy {
            pcb.rcv_ann_right_edge = pcb.rcv_nxt.wrapping_add(pcb.rcv_ann_wnd);
            pcb.ts_lastacksent = pcb.rcv_nxt;

            if pcb.rtime == -1 {
                pcb.rtime = 0;
            }
            if pcb.ticks_since_data_sent == -1 {
                pcb.ticks_since_data_sent = 0;
            }
            if pcb.rttest == 0 {
                pcb.rttest = self.hooks.tcp_ticks();
                pcb.rtseq = seg.seqno;
                log::trace!(target: "tcpout", "output_segment: rtseq {}", pcb.rtseq);
            }
        }

        log::trace!(
            target: "tcpout",
            "output_segment: {}:{}",
            seg.seqno,
            seg.seqno.wrapping_add(seg.len)
        );

        // the checksum is filled in downstream or by the NIC
        seg.hdr.chksum = 0;

        let ts_now = if seg.flags.contains(SegFlags::TS) {
            self.hooks.sys_now()
        } else {
            0
        };
        let opts = build_options(seg.flags, pcb.advtsd_mss, pcb.rcv_scale, ts_now, pcb.ts_recent);
        let tcp_hlen = (TCP_HLEN as usize + opts.len()) as u16;

        let mut flags = OutFlags::empty();
        if dummy {
            flags |= OutFlags::DUMMY;
        }
        if seg.flags.contains(SegFlags::TSO) {
            flags |= OutFlags::TSO;
        }
        if seq_lt(seg.seqno, pcb.snd_nxt) {
            flags |= OutFlags::REXMIT;
        }
        if seg.flags.contains(SegFlags::ZEROCOPY) {
            flags |= OutFlags::ZEROCOPY;
        }

        if seg.is_zerocopy() {
            // The header has no room inside caller memory; synthesize a
            // stack-resident node in front of the payload chain.
            let mut hdr_buf = seg.hdr.into_buffer().map_err(|_| Error::IoError)?;
            hdr_buf.extend_from_slice(&opts);

            let mut slices = Vec::with_capacity(1 + seg.chain_len() as usize);
            slices.push(&hdr_buf[..]);
            if let Some(p) = seg.p.as_deref() {
                slices.extend(p.slices());
            }
            let frame = WireFrame { slices, tcp_hlen };
            self.hooks.ip_output(frame, Some(seg), pcb, flags)
        } else {
            let hdr = seg.hdr;
            {
                let p = seg.p.as_mut().unwrap();
                let region = &mut p.data_mut()[..tcp_hlen as usize];
                serialize_hdr(&hdr, &opts, region)?;
            }
            let p = seg.p.as_deref().unwrap();
            let frame = WireFrame {
                slices: p.slices(),
                tcp_hlen,
            };
            self.hooks.ip_output(frame, Some(seg), pcb, flags)
        }
    }

    /// Send a FIN, preferably by folding it onto the last unsent segment.
    pub fn send_fin(&mut self, pcb: &mut TcpPcb) -> Result<()> {
        if let Some(last) = pcb.unsent.back_mut() {
            if !last
                .hdr
                .flags
                .intersects(TcpHdrFlags::SYN | TcpHdrFlags::FIN | TcpHdrFlags::RST)
            {
                // fold the FIN onto the pending data; it still occupies
                // one byte of sequence space
                last.hdr.flags |= TcpHdrFlags::FIN;
                pcb.flags |= PcbFlags::FIN;
                pcb.snd_lbb = pcb.snd_lbb.wrapping_add(1);
                return Ok(());
            }
        }
        self.enqueue_flags(pcb, TcpHdrFlags::FIN)
    }

    /// Send an ACK carrying no data.
    pub fn send_empty_ack(&mut self, pcb: &mut TcpPcb) -> Result<()> {
        let optflags = if pcb.flags.contains(PcbFlags::TIMESTAMP) {
            SegFlags::TS
        } else {
            SegFlags::empty()
        };
        let optlen = opt_length(optflags);

        let Some(p) = self.output_alloc_header(pcb, optlen, 0) else {
            log::trace!(target: "tcpout", "send_empty_ack: could not allocate pbuf");
            return Err(Error::MemExhausted);
        };
        log::trace!(
            target: "tcpout",
            "send_empty_ack: sending ACK for {}",
            pcb.rcv_nxt
        );
        pcb.flags -= PcbFlags::ACK_DELAY | PcbFlags::ACK_NOW;
        pcb.ts_lastacksent = pcb.rcv_nxt;

        let hdr = self.ctrl_hdr(pcb, pcb.snd_nxt, optlen);
        self.emit_ctrl(pcb, p, hdr, optflags, &[])
    }

    /// Send a standalone RST+ACK with caller-supplied sequence numbers.
    pub fn rst(&mut self, pcb: &mut TcpPcb, seqno: u32, ackno: u32) -> Result<()> {
        let Some(mut p) = self.alloc_pbuf(pcb, PbufKind::Ram, 0, PbufDesc::default()) else {
            log::trace!(target: "tcpout", "rst: could not allocate pbuf");
            return Err(Error::MemExhausted);
        };
        let ok = p.header_adjust(TCP_HLEN as i32);
        debug_assert!(ok);

        let hdr = TcpHdr {
            src: pcb.local_port,
            dest: pcb.remote_port,
            seqno,
            ackno,
            hdrlen_words: 5,
            flags: TcpHdrFlags::RST | TcpHdrFlags::ACK,
            wnd: TCP_WND.min(0xFFFF) as u16,
            chksum: 0,
            urgp: 0,
        };
        self.emit_ctrl(pcb, p, hdr, SegFlags::empty(), &[])?;
        log::trace!(target: "tcpout", "rst: seqno {} ackno {}", seqno, ackno);
        Ok(())
    }

    /// Keep an idle connection alive: an empty ACK one byte to the left
    /// of `snd_nxt`.
    pub fn keepalive(&mut self, pcb: &mut TcpPcb) -> Result<()> {
        log::trace!(
            target: "tcpout",
            "keepalive: sending KEEPALIVE probe to {} (sent {})",
            pcb.remote_ip,
            pcb.keep_cnt_sent
        );

        let optflags = if pcb.flags.contains(PcbFlags::TIMESTAMP) {
            SegFlags::TS
        } else {
            SegFlags::empty()
        };
        let optlen = opt_length(optflags);

        let seqno = pcb.snd_nxt.wrapping_sub(1);
        let Some(p) = self.output_alloc_header(pcb, optlen, 0) else {
            log::trace!(target: "tcpout", "keepalive: could not allocate pbuf");
            return Err(Error::MemExhausted);
        };
        pcb.ts_lastacksent = pcb.rcv_nxt;

        let hdr = self.ctrl_hdr(pcb, seqno, optlen);
        self.emit_ctrl(pcb, p, hdr, optflags, &[])?;

        if pcb.ticks_since_data_sent == -1 {
            pcb.ticks_since_data_sent = 0;
        }
        log::trace!(
            target: "tcpout",
            "keepalive: seqno {} ackno {}",
            seqno,
            pcb.rcv_nxt
        );
        Ok(())
    }

    /// Probe a closed peer window with one byte (or the pending FIN) from
    /// the head of the unsent queue. The segment itself is not split; the
    /// probe byte may be acknowledged without the window opening, so
    /// `snd_nxt` advances tentatively.
    pub fn zero_window_probe(&mut self, pcb: &mut TcpPcb) -> Result<()> {
        log::trace!(
            target: "tcpout",
            "zero_window_probe: sending ZERO WINDOW probe to {}",
            pcb.remote_ip
        );

        let (is_fin, seqno, probe_byte) = {
            // persist timer should be off while the send buffer is empty
            let Some(head) = pcb.unsent.front() else {
                return Ok(());
            };
            let is_fin = head.hdr.flags.contains(TcpHdrFlags::FIN) && head.len == 0;
            let byte = if is_fin { 0 } else { head.first_payload_byte() };
            (is_fin, head.seqno, byte)
        };
        let datalen: u32 = if is_fin { 0 } else { 1 };

        let optflags = if pcb.flags.contains(PcbFlags::TIMESTAMP) {
            SegFlags::TS
        } else {
            SegFlags::empty()
        };
        let optlen = opt_length(optflags);

        let Some(p) = self.output_alloc_header(pcb, optlen, datalen) else {
            log::trace!(target: "tcpout", "zero_window_probe: no memory for pbuf");
            return Err(Error::MemExhausted);
        };
        pcb.ts_lastacksent = pcb.rcv_nxt;

        let mut hdr = self.ctrl_hdr(pcb, seqno, optlen);
        if is_fin {
            hdr.flags = TcpHdrFlags::ACK | TcpHdrFlags::FIN;
        }

        let nxt = seqno.wrapping_add(1);
        if seq_lt(pcb.snd_nxt, nxt) {
            pcb.snd_nxt = nxt;
        }

        let payload = [probe_byte];
        self.emit_ctrl(pcb, p, hdr, optflags, &payload[..datalen as usize])?;

        log::trace!(
            target: "tcpout",
            "zero_window_probe: seqno {} ackno {}",
            seqno,
            pcb.rcv_nxt
        );
        Ok(())
    }

    /// Requeue every unacked segment for retransmission and drive the
    /// output loop. Invoked by the slow timer on RTO.
    pub fn rexmit_rto(&mut self, pcb: &mut TcpPcb) -> Result<()> {
        if pcb.unacked.is_empty() {
            return Ok(());
        }

        // unsent becomes (unacked ++ unsent), in order
        while let Some(seg) = pcb.unacked.pop_back() {
            pcb.unsent.push_front(seg);
        }

        pcb.nrtx = pcb.nrtx.wrapping_add(1);
        // retransmitted sequence space gives no usable RTT samples
        pcb.rttest = 0;

        self.output(pcb)
    }

    /// Requeue only the first unacked segment, keeping `unsent` sorted.
    /// The caller decides when to invoke `output`.
    pub fn rexmit(&mut self, pcb: &mut TcpPcb) {
        let Some(seg) = pcb.unacked.pop_front() else {
            return;
        };

        let pos = pcb
            .unsent
            .iter()
            .position(|s| !seq_lt(s.seqno, seg.seqno))
            .unwrap_or(pcb.unsent.len());
        let at_tail = pos == pcb.unsent.len();
        pcb.unsent.insert(pos, seg);
        if at_tail {
            pcb.unsent_oversize = 0;
        }

        pcb.nrtx = pcb.nrtx.wrapping_add(1);
        pcb.rttest = 0;
    }

    /// Fast retransmit after three duplicate ACKs: resend the first
    /// unacked segment once and shrink the congestion window, through the
    /// PCB's congestion plug-in when one is installed.
    pub fn rexmit_fast(&mut self, pcb: &mut TcpPcb) {
        if pcb.unacked.is_empty() || pcb.flags.contains(PcbFlags::INFR) {
            return;
        }

        log::trace!(
            target: "tcpout",
            "rexmit_fast: dupacks {} ({}), fast retransmit {}",
            pcb.dupacks,
            pcb.lastack,
            pcb.unacked[0].seqno
        );
        self.rexmit(pcb);

        if let Some(mut cc) = pcb.cc.take() {
            cc.cong_signal(
                crate::CcSignal::DupAcks,
                &mut pcb.cwnd,
                &mut pcb.ssthresh,
                pcb.mss,
                pcb.snd_wnd,
            );
            pcb.cc = Some(cc);
        } else {
            // halve to the smaller of cwnd and the advertised window,
            // floored at two segments
            pcb.ssthresh = if pcb.cwnd > pcb.snd_wnd {
                pcb.snd_wnd / 2
            } else {
                pcb.cwnd / 2
            };
            if pcb.ssthresh < 2 * pcb.mss as u32 {
                pcb.ssthresh = 2 * pcb.mss as u32;
            }
            pcb.cwnd = pcb.ssthresh + 3 * pcb.mss as u32;
        }

        pcb.flags |= PcbFlags::INFR;
    }

    /// Whether `data_len` more bytes (plus their per-segment timestamp
    /// option overhead) fit the effective window, given what is already
    /// queued.
    pub fn is_wnd_available(&self, pcb: &TcpPcb, data_len: u32) -> bool {
        let wnd = pcb.snd_wnd.min(pcb.cwnd) as i64;

        let mut tot_opts_hdrs_len = 0i64;
        if pcb.flags.contains(PcbFlags::TIMESTAMP) {
            let fallback = if pcb.mss != 0 { pcb.mss } else { TCP_MSS_DEFAULT };
            let mut mss_local = (pcb.mss as u32).min(pcb.snd_wnd_max / 2) as u16;
            if mss_local == 0 {
                mss_local = fallback;
            }
            tot_opts_hdrs_len =
                TCP_OPT_LEN_TS as i64 * (1 + (data_len as i64 - 1) / mss_local as i64);
        }

        let span = |q: &std::collections::VecDeque<TcpSeg>| -> i64 {
            match (q.front(), q.back()) {
                (Some(first), Some(last)) => {
                    last.seqno.wrapping_sub(first.seqno).wrapping_add(last.len) as i64
                }
                _ => 0,
            }
        };
        let tot_unacked = span(&pcb.unacked);
        let tot_unsent = span(&pcb.unsent);

        (wnd - tot_unacked) >= (tot_unsent + tot_opts_hdrs_len + data_len as i64)
    }

    /// Header-only transmit buffer for the control senders; refreshes the
    /// announced right window edge like any other sent packet.
    fn output_alloc_header(
        &mut self,
        pcb: &mut TcpPcb,
        optlen: u32,
        datalen: u32,
    ) -> Option<Box<Pbuf>> {
        let mut p = self.alloc_pbuf(pcb, PbufKind::Ram, optlen + datalen, PbufDesc::default())?;
        let ok = p.header_adjust(TCP_HLEN as i32);
        debug_assert!(ok, "control pbuf must hold the TCP header");
        pcb.rcv_ann_right_edge = pcb.rcv_nxt.wrapping_add(pcb.rcv_ann_wnd);
        Some(p)
    }

    fn ctrl_hdr(&self, pcb: &TcpPcb, seqno: u32, optlen: u32) -> TcpHdr {
        TcpHdr {
            src: pcb.local_port,
            dest: pcb.remote_port,
            seqno,
            ackno: pcb.rcv_nxt,
            hdrlen_words: (5 + optlen / 4) as u8,
            flags: TcpHdrFlags::ACK,
            wnd: (pcb.rcv_ann_wnd >> pcb.rcv_scale).min(0xFFFF) as u16,
            chksum: 0,
            urgp: 0,
        }
    }

    /// Serialize and transmit a header-only (or probe) frame, then hand
    /// the buffer back to the allocator. Backpressure on control frames
    /// is not tracked; the next timer tick simply sends another.
    fn emit_ctrl(
        &mut self,
        pcb: &TcpPcb,
        mut p: Box<Pbuf>,
        hdr: TcpHdr,
        optflags: SegFlags,
        data: &[u8],
    ) -> Result<()> {
        let ts_now = if optflags.contains(SegFlags::TS) {
            self.hooks.sys_now()
        } else {
            0
        };
        let opts = build_options(optflags, pcb.advtsd_mss, pcb.rcv_scale, ts_now, pcb.ts_recent);
        let hlen = TCP_HLEN as usize + opts.len();

        {
            let region = p.data_mut();
            serialize_hdr(&hdr, &opts, &mut region[..hlen])?;
            region[hlen..hlen + data.len()].copy_from_slice(data);
        }

        let frame = WireFrame {
            slices: p.slices(),
            tcp_hlen: hlen as u16,
        };
        let _ = self.hooks.ip_output(frame, None, pcb, OutFlags::empty());

        self.hooks.pbuf_free(p);
        Ok(())
    }
}
