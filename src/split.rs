//! Segment-boundary transforms: TSO joins, window-fit splits and the
//! retransmission conversions.
//!
//! Every transform here mutates segments that already sit on the unsent
//! queue. Failure paths restore any touched buffer fields, so an
//! allocation failure never corrupts the chain; at worst the segment
//! stays in its previous shape.

use crate::{
    dump_segs, opt_length, seq_geq, seq_lt, move_hdr_flags, PbufDesc, PbufKind, PcbFlags,
    SegFlags, TcpHdrFlags, TcpPcb, TxEngine, TxHooks, TCP_HLEN,
};

impl<H: TxHooks> TxEngine<H> {
    /// Join the run of equal-flag segments starting at `idx` into one
    /// offloaded transfer.
    ///
    /// Merging stops at retransmitted or special segments, at the TSO
    /// payload and scatter-gather caps, at the window edge, and always
    /// before the queue tail (so the cached tail stays valid). When the
    /// resulting payload exceeds one MSS the segment is flagged for
    /// offload.
    pub(crate) fn tso_segment(&mut self, pcb: &mut TcpPcb, idx: usize, wnd: u32) {
        let (seqno, flags, hdrf) = {
            let seg = &pcb.unsent[idx];
            (seg.seqno, seg.flags, seg.hdr.flags)
        };
        let max_payload_sz = pcb
            .tso
            .max_payload_sz
            .min(wnd.wrapping_sub(seqno.wrapping_sub(pcb.lastack)));

        let mergeable = !seq_lt(seqno, pcb.snd_nxt)
            && !flags.intersects(SegFlags::TSO | SegFlags::DUMMY_MSG | SegFlags::NOMERGE)
            && (hdrf - (TcpHdrFlags::ACK | TcpHdrFlags::PSH)).is_empty();

        // Merge successors while the caps hold. The final queue element
        // is never consumed, which keeps the cached tail valid.
        if mergeable
            && pcb.unsent[idx].len <= max_payload_sz
            && pcb.unsent[idx].chain_len() <= pcb.tso.max_send_sge
        {
            let mut tot_len = pcb.unsent[idx].len;
            let mut tot_p = pcb.unsent[idx].chain_len();

            loop {
                if idx + 2 >= pcb.unsent.len() {
                    break;
                }
                {
                    let cur = &pcb.unsent[idx + 1];
                    if cur.flags != flags
                        || !(cur.hdr.flags - (TcpHdrFlags::ACK | TcpHdrFlags::PSH)).is_empty()
                    {
                        break;
                    }
                    if tot_len + cur.len > max_payload_sz {
                        break;
                    }
                    if tot_p + cur.chain_len() > pcb.tso.max_send_sge {
                        break;
                    }
                }

                let mut cur = pcb.unsent.remove(idx + 1).unwrap();
                tot_len += cur.len;
                tot_p += cur.chain_len();

                let cur_len = cur.len;
                let mut cp = cur.p.take().unwrap();
                if !cur.flags.contains(SegFlags::ZEROCOPY) {
                    // skip the consumed segment's header bytes
                    cp.offset += cur.hdr.hdrlen_bytes() as usize;
                }
                let rest = cp.tot_len - cp.len;
                cp.len = cur_len - rest;
                cp.tot_len = cur_len;

                pcb.unsent[idx].len += cur_len;
                pcb.unsent[idx].p.as_mut().unwrap().cat(cp);
                // the record is released; its buffers moved over
                self.hooks.seg_free(cur);
            }
        }

        // Anything beyond one MSS must go out as an offloaded transfer,
        // merged or not.
        let seg = &mut pcb.unsent[idx];
        if seg.len + opt_length(seg.flags) > pcb.mss as u32 {
            seg.flags |= SegFlags::TSO;
        }

        log::trace!(
            target: "tcpout",
            "tso_segment: max: {:<5} unsent {}",
            max_payload_sz,
            dump_segs(&pcb.unsent)
        );
    }

    /// Turn the multi-buffer segment at `idx` into one segment per buffer.
    ///
    /// A spurious retransmission can race the ACK that frees an interior
    /// buffer while the retransmit still references its bytes; after this
    /// split each buffer completes or is freed on its own. The segment is
    /// marked `NOMERGE` so later passes do not re-join it.
    pub(crate) fn split_rexmit(&mut self, pcb: &mut TcpPcb, idx: usize) {
        let mut optflags = SegFlags::empty();
        if pcb.flags.contains(PcbFlags::TIMESTAMP) {
            optflags |= SegFlags::TS;
        }
        let mut optlen = opt_length(optflags);

        let hdr_delta = if pcb.unsent[idx].flags.contains(SegFlags::ZEROCOPY) {
            optflags |= SegFlags::ZEROCOPY;
            optlen = 0;
            0
        } else {
            TCP_HLEN
        };

        pcb.unsent[idx].flags |= SegFlags::NOMERGE;

        let mut cur = idx;
        loop {
            if pcb.unsent[cur].p.as_ref().unwrap().next.is_none() {
                break;
            }

            let seqno_new;
            let inherited;
            let mut cp = {
                let seg = &mut pcb.unsent[cur];
                let p = seg.p.as_mut().unwrap();
                seqno_new = seg.seqno.wrapping_add(p.len - hdr_delta - optlen);
                inherited = seg.flags;
                p.next.take().unwrap()
            };
            // make room for the options this buffer needs standalone
            cp.offset -= optlen as usize;
            cp.len += optlen;
            cp.tot_len += optlen;

            let mut newseg = match self.create_segment(
                pcb,
                Some(cp),
                TcpHdrFlags::empty(),
                seqno_new,
                optflags,
            ) {
                Ok(seg) => seg,
                Err(p) => {
                    if let Some(mut p) = p {
                        p.offset += optlen as usize;
                        p.len -= optlen;
                        p.tot_len -= optlen;
                        pcb.unsent[cur].p.as_mut().unwrap().next = Some(p);
                    }
                    return;
                }
            };
            newseg.flags = inherited;

            {
                let seg = &mut pcb.unsent[cur];
                let p = seg.p.as_mut().unwrap();
                seg.len = p.len - hdr_delta - optlen;
                p.tot_len = p.len;
                move_hdr_flags(seg, &mut newseg, TcpHdrFlags::FIN | TcpHdrFlags::RST);
            }

            if cur + 1 == pcb.unsent.len() {
                // splitting the tail leaves no usable slack behind it
                pcb.unsent_oversize = 0;
            }
            pcb.unsent.insert(cur + 1, newseg);
            cur += 1;
        }
    }

    /// Fit the first transmission of the segment at `idx` into the bytes
    /// the window still allows.
    ///
    /// Either the head buffer itself is carved in two, or a multi-buffer
    /// chain is snipped between nodes. The right half becomes a new
    /// segment immediately after `idx`; FIN/RST travel with it. Segments
    /// whose head buffer is in flight, and dummy segments, are refused.
    pub(crate) fn split_segment(&mut self, pcb: &mut TcpPcb, idx: usize, wnd: u32) {
        let (seqno, seg_flags, head_ref, head_len, head_tot, has_next) = {
            let seg = &pcb.unsent[idx];
            let p = seg.p.as_ref().expect("split of a headerless segment");
            (
                seg.seqno,
                seg.flags,
                p.refcnt,
                p.len,
                p.tot_len,
                p.next.is_some(),
            )
        };

        if seqno.wrapping_sub(pcb.lastack) >= wnd || head_ref > 1 {
            return;
        }
        if seg_flags.contains(SegFlags::DUMMY_MSG) {
            return;
        }

        let is_zerocopy = seg_flags.contains(SegFlags::ZEROCOPY);
        let lentosend = wnd - seqno.wrapping_sub(pcb.lastack);
        let mss_local = self.xmit_size_goal(pcb, false) as u32;

        let mut optflags = SegFlags::empty();
        if pcb.flags.contains(PcbFlags::TIMESTAMP) {
            optflags |= SegFlags::TS;
        }
        let mut optlen = opt_length(optflags);
        let (hdr_delta, kind) = if is_zerocopy {
            optflags |= SegFlags::ZEROCOPY;
            optlen = 0;
            (0, PbufKind::Zerocopy)
        } else {
            (TCP_HLEN, PbufKind::Ram)
        };

        let was_last = idx + 1 == pcb.unsent.len();

        if head_len > hdr_delta + optlen + lentosend {
            // First buffer is too big: carve its tail into a new buffer.
            let lentoqueue = head_len - (hdr_delta + optlen) - lentosend;
            let max_length = if is_zerocopy {
                lentoqueue + optlen
            } else {
                mss_local
            };

            let Some((mut p, oversize)) = self.pbuf_prealloc(
                pcb,
                lentoqueue + optlen,
                max_length,
                kind,
                false,
                false,
                PbufDesc::default(),
            ) else {
                log::trace!(
                    target: "tcpout",
                    "split_segment: no memory for pbuf copy of {} bytes",
                    lentoqueue + optlen
                );
                return;
            };

            if is_zerocopy {
                let window = pcb.unsent[idx]
                    .p
                    .as_ref()
                    .unwrap()
                    .zerocopy_slice(lentosend as usize, lentoqueue as usize);
                p.set_zerocopy_window(window);
            } else {
                let seg = &pcb.unsent[idx];
                let src_start = seg.payload_start() + lentosend as usize;
                let src =
                    &seg.p.as_ref().unwrap().raw()[src_start..src_start + lentoqueue as usize];
                p.data_mut()[optlen as usize..].copy_from_slice(src);
            }

            p.tot_len = head_tot - lentosend - hdr_delta;
            p.next = pcb.unsent[idx].p.as_mut().unwrap().next.take();

            let mut newseg = match self.create_segment(
                pcb,
                Some(p),
                TcpHdrFlags::empty(),
                seqno.wrapping_add(lentosend),
                optflags,
            ) {
                Ok(seg) => seg,
                Err(p) => {
                    if let Some(mut p) = p {
                        // reattach the detached chain before dropping the
                        // copy
                        pcb.unsent[idx].p.as_mut().unwrap().next = p.next.take();
                        self.hooks.pbuf_free(p);
                    }
                    log::trace!(target: "tcpout", "split_segment: no memory for segment");
                    return;
                }
            };

            {
                let seg = &mut pcb.unsent[idx];
                let sp = seg.p.as_mut().unwrap();
                sp.len -= lentoqueue;
                sp.tot_len = sp.len;
                seg.len = sp.len - (hdr_delta + optlen);
                newseg.flags = seg.flags;
                move_hdr_flags(seg, &mut newseg, TcpHdrFlags::FIN | TcpHdrFlags::RST);
            }

            if self.cfg.enable_push_flag {
                newseg.hdr.flags |= TcpHdrFlags::PSH;
            }

            pcb.snd_queuelen += 1;
            if was_last {
                pcb.unsent_oversize = oversize;
            }
            pcb.unsent.insert(idx + 1, newseg);
        } else if has_next {
            // Chain of several buffers with a small head: snip where the
            // window runs out. At least one buffer is sent.
            let hdr_opt = hdr_delta + optlen;
            let (cut, headchainlen) = {
                let seg = &pcb.unsent[idx];
                let mut headchainlen = head_len;
                let mut keep = 1usize;
                let mut tail = seg.p.as_deref().unwrap();
                let mut nextp = tail.next.as_deref();
                loop {
                    let Some(n) = nextp else {
                        debug_assert!(false, "split_segment: whole chain fits the window");
                        return;
                    };
                    if headchainlen + n.len - hdr_opt > lentosend {
                        break;
                    }
                    if tail.refcnt > 1 {
                        // node still referenced by an in-flight transmit
                        return;
                    }
                    headchainlen += n.len;
                    keep += 1;
                    tail = n;
                    nextp = tail.next.as_deref();
                }
                (keep, headchainlen)
            };

            let mut detached = pcb.unsent[idx]
                .p
                .as_mut()
                .unwrap()
                .nth_mut(cut - 1)
                .next
                .take()
                .unwrap();
            // make room for the options the remainder needs standalone
            if optlen > 0 {
                detached.offset -= optlen as usize;
                detached.len += optlen;
                detached.tot_len += optlen;
            }

            let newseg_seqno = seqno.wrapping_add(headchainlen - hdr_opt);
            let mut newseg = match self.create_segment(
                pcb,
                Some(detached),
                TcpHdrFlags::empty(),
                newseg_seqno,
                optflags,
            ) {
                Ok(seg) => seg,
                Err(p) => {
                    if let Some(mut p) = p {
                        if optlen > 0 {
                            p.offset += optlen as usize;
                            p.len -= optlen;
                            p.tot_len -= optlen;
                        }
                        pcb.unsent[idx].p.as_mut().unwrap().nth_mut(cut - 1).next = Some(p);
                    }
                    log::trace!(target: "tcpout", "split_segment: no memory for segment");
                    return;
                }
            };

            {
                let seg = &mut pcb.unsent[idx];
                seg.len = headchainlen - hdr_opt;
                let mut remaining = headchainlen;
                let mut cur = Some(seg.p.as_mut().unwrap().as_mut());
                while let Some(p) = cur {
                    p.tot_len = remaining;
                    remaining -= p.len;
                    cur = p.next.as_deref_mut();
                }
                newseg.flags = seg.flags;
                move_hdr_flags(seg, &mut newseg, TcpHdrFlags::FIN | TcpHdrFlags::RST);
            }

            if was_last {
                pcb.unsent_oversize = 0;
            }
            pcb.unsent.insert(idx + 1, newseg);
        } else {
            debug_assert!(false, "split_segment: nothing to split");
            return;
        }

        log::trace!(
            target: "tcpout",
            "split_segment: max: {:<5} unsent {}",
            lentosend,
            dump_segs(&pcb.unsent)
        );
    }

    /// Prepare a previously offloaded segment at `idx` for retransmission.
    ///
    /// A TSO segment whose buffers are still in flight, or which no
    /// longer fits the window, is undone: one segment per buffer, each of
    /// those window-split down to MSS-sized pieces. A free segment that
    /// still fits keeps its shape and merely sheds the offload flag when
    /// small enough.
    pub fn rexmit_segment(&mut self, pcb: &mut TcpPcb, idx: usize, wnd: u32) {
        let (seqno, seg_len, head_ref) = {
            let seg = &pcb.unsent[idx];
            let p = seg.p.as_ref().expect("retransmit of a headerless segment");
            (seg.seqno, seg.len, p.refcnt)
        };

        if seq_geq(seqno, pcb.snd_nxt) {
            return;
        }

        let mss_local = self.xmit_size_goal(pcb, false) as u32;

        if head_ref == 1 && seg_len.wrapping_add(seqno.wrapping_sub(pcb.lastack)) <= wnd {
            // send completed and the window covers it: retransmit as-is
            if seg_len <= mss_local {
                pcb.unsent[idx].flags -= SegFlags::TSO;
            }
            return;
        }

        let mut optflags = SegFlags::empty();
        if pcb.flags.contains(PcbFlags::TIMESTAMP) {
            optflags |= SegFlags::TS;
        }
        let mut optlen = opt_length(optflags);
        let mss_local_minus_opts = mss_local - optlen;

        let hdr_delta = if pcb.unsent[idx].flags.contains(SegFlags::ZEROCOPY) {
            optflags |= SegFlags::ZEROCOPY;
            optlen = 0;
            0
        } else {
            TCP_HLEN
        };

        pcb.unsent[idx].flags -= SegFlags::TSO;

        let mut cur = idx;
        loop {
            if pcb.unsent[cur].p.as_ref().unwrap().next.is_none() {
                break;
            }

            // Prefetch a segment record so the chain surgery below cannot
            // fail after buffers were already detached.
            if pcb.seg_alloc.is_none() {
                match self.create_segment(pcb, None, TcpHdrFlags::empty(), 0, SegFlags::empty()) {
                    Ok(shell) => pcb.seg_alloc = Some(shell),
                    Err(_) => {
                        log::trace!(target: "tcpout", "rexmit_segment: no memory for segment");
                        return;
                    }
                }
            }

            let seqno_new;
            let inherited;
            let mut cp = {
                let seg = &mut pcb.unsent[cur];
                let p = seg.p.as_mut().unwrap();
                seqno_new = seg.seqno.wrapping_add(p.len - hdr_delta - optlen);
                inherited = seg.flags;
                p.next.take().unwrap()
            };
            cp.offset -= optlen as usize;
            cp.len += optlen;
            cp.tot_len += optlen;

            let mut newseg = match self.create_segment(
                pcb,
                Some(cp),
                TcpHdrFlags::empty(),
                seqno_new,
                optflags,
            ) {
                Ok(seg) => seg,
                Err(p) => {
                    if let Some(mut p) = p {
                        p.offset += optlen as usize;
                        p.len -= optlen;
                        p.tot_len -= optlen;
                        pcb.unsent[cur].p.as_mut().unwrap().next = Some(p);
                    }
                    let seg = &mut pcb.unsent[cur];
                    if seg.len + opt_length(seg.flags) > pcb.mss as u32 {
                        seg.flags |= SegFlags::TSO;
                    }
                    return;
                }
            };
            newseg.flags = inherited;

            {
                let seg = &mut pcb.unsent[cur];
                let p = seg.p.as_mut().unwrap();
                seg.len = p.len - hdr_delta - optlen;
                p.tot_len = p.len;
                move_hdr_flags(seg, &mut newseg, TcpHdrFlags::FIN | TcpHdrFlags::RST);
            }

            if cur + 1 == pcb.unsent.len() {
                pcb.unsent_oversize = 0;
            }
            pcb.unsent.insert(cur + 1, newseg);

            let (ok, last) =
                self.split_one_segment(pcb, cur, mss_local_minus_opts, optflags, optlen);
            if !ok {
                let ns = &mut pcb.unsent[last + 1];
                if ns.len + opt_length(ns.flags) > pcb.mss as u32 {
                    ns.flags |= SegFlags::TSO;
                }
                return;
            }
            cur = last + 1;
        }

        let (ok, _) = self.split_one_segment(pcb, cur, mss_local_minus_opts, optflags, optlen);
        if !ok {
            log::trace!(target: "tcpout", "rexmit_segment: no memory for segment");
        }

        log::trace!(
            target: "tcpout",
            "rexmit_segment: cwnd: {:<5} unsent {}",
            pcb.cwnd,
            dump_segs(&pcb.unsent)
        );
    }

    /// Cut the single-buffer segment at `idx` into `lentosend`-sized
    /// pieces, each in its own buffer. Returns success and the index of
    /// the last piece produced.
    fn split_one_segment(
        &mut self,
        pcb: &mut TcpPcb,
        idx: usize,
        lentosend: u32,
        optflags: SegFlags,
        optlen: u32,
    ) -> (bool, usize) {
        let is_zerocopy = optflags.contains(SegFlags::ZEROCOPY);
        let (hdr_delta, kind) = if is_zerocopy {
            (0, PbufKind::Zerocopy)
        } else {
            (TCP_HLEN, PbufKind::Ram)
        };

        let was_last = idx + 1 == pcb.unsent.len();
        let max_length_init = pcb.unsent[idx].p.as_ref().unwrap().len;

        let mut cur = idx;
        let mut ok = true;
        let mut last_oversize: u16 = 0;

        loop {
            let (single, seg_len, head_tot, seqno) = {
                let seg = &pcb.unsent[cur];
                let p = seg.p.as_ref().unwrap();
                (p.next.is_none(), seg.len, p.tot_len, seg.seqno)
            };
            if !(single && seg_len > lentosend) {
                break;
            }

            let lentoqueue = seg_len - lentosend;
            let max_length = if is_zerocopy {
                lentoqueue + optlen
            } else {
                max_length_init
            };

            let Some((mut p, ovr)) = self.pbuf_prealloc(
                pcb,
                lentoqueue + optlen,
                max_length,
                kind,
                false,
                false,
                PbufDesc::default(),
            ) else {
                log::trace!(
                    target: "tcpout",
                    "split_one_segment: no memory for pbuf copy of {} bytes",
                    lentoqueue + optlen
                );
                ok = false;
                break;
            };
            last_oversize = ovr;

            // Prefetch the segment record up front; failure here must not
            // leave a detached buffer behind.
            if pcb.seg_alloc.is_none() {
                match self.create_segment(pcb, None, TcpHdrFlags::empty(), 0, SegFlags::empty()) {
                    Ok(shell) => pcb.seg_alloc = Some(shell),
                    Err(_) => {
                        log::trace!(
                            target: "tcpout",
                            "split_one_segment: no memory for segment"
                        );
                        self.hooks.pbuf_free(p);
                        ok = false;
                        break;
                    }
                }
            }

            if is_zerocopy {
                let window = pcb.unsent[cur]
                    .p
                    .as_ref()
                    .unwrap()
                    .zerocopy_slice(lentosend as usize, lentoqueue as usize);
                p.set_zerocopy_window(window);
            } else {
                let seg = &pcb.unsent[cur];
                let src_start = seg.payload_start() + lentosend as usize;
                let src =
                    &seg.p.as_ref().unwrap().raw()[src_start..src_start + lentoqueue as usize];
                p.data_mut()[optlen as usize..].copy_from_slice(src);
            }

            p.tot_len = head_tot - lentosend - hdr_delta;

            let mut newseg = match self.create_segment(
                pcb,
                Some(p),
                TcpHdrFlags::empty(),
                seqno.wrapping_add(lentosend),
                optflags,
            ) {
                Ok(seg) => seg,
                Err(p) => {
                    if let Some(p) = p {
                        self.hooks.pbuf_free(p);
                    }
                    ok = false;
                    break;
                }
            };
            newseg.flags = pcb.unsent[cur].flags;

            {
                let seg = &mut pcb.unsent[cur];
                let sp = seg.p.as_mut().unwrap();
                sp.len -= lentoqueue;
                sp.tot_len = sp.len;
                seg.len = sp.len - (hdr_delta + optlen);
            }

            pcb.unsent.insert(cur + 1, newseg);
            pcb.snd_queuelen += 1;
            cur += 1;
        }

        {
            let seg = &mut pcb.unsent[cur];
            if seg.len + opt_length(seg.flags) > pcb.mss as u32 {
                seg.flags |= SegFlags::TSO;
            }
        }
        if was_last {
            pcb.unsent_oversize = if ok { last_oversize } else { 0 };
        }
        if cur != idx {
            let moved = pcb.unsent[idx].hdr.flags & (TcpHdrFlags::FIN | TcpHdrFlags::RST);
            if !moved.is_empty() {
                pcb.unsent[idx].hdr.flags -= TcpHdrFlags::FIN | TcpHdrFlags::RST;
                pcb.unsent[cur].hdr.flags |= moved;
            }
        }
        (ok, cur)
    }
}
