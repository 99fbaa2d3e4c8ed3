//! Outgoing TCP segments.

use bitflags::bitflags;

use crate::{Pbuf, TcpHdr, TcpHdrFlags};

bitflags! {
    /// Per-segment option flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegFlags: u8 {
        /// Include the MSS option (SYN only).
        const MSS = 0x01;
        /// Include the window-scale option (SYN only).
        const WNDSCALE = 0x02;
        /// Include the timestamp option.
        const TS = 0x04;
        /// Locally accounted segment that never reaches the peer.
        const DUMMY_MSG = 0x08;
        /// Hand the segment to the NIC as one large offloaded transfer.
        const TSO = 0x10;
        /// Payload references caller memory; the header lives outside the
        /// buffer chain.
        const ZEROCOPY = 0x20;
        /// Keep this segment out of TSO joins.
        const NOMERGE = 0x40;
    }
}

impl Default for SegFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// One outgoing TCP PDU queued on `unsent` or `unacked`.
///
/// `len` counts payload bytes only; the phantom sequence byte of SYN and
/// FIN is accounted by [`TcpSeg::tcplen`]. For RAM segments the first
/// buffer of `p` also holds the wire image of the header in front of the
/// payload; for zero-copy segments the header is synthesized at emission.
#[derive(Debug, Default)]
pub struct TcpSeg {
    pub seqno: u32,
    pub len: u32,
    pub p: Option<Box<Pbuf>>,
    pub hdr: TcpHdr,
    pub flags: SegFlags,
}

impl TcpSeg {
    /// A blank record, as handed out by segment allocators.
    pub fn blank() -> Self {
        Self::default()
    }

    /// Sequence space consumed by this segment: payload bytes plus one for
    /// SYN or FIN.
    pub fn tcplen(&self) -> u32 {
        let phantom = self
            .hdr
            .flags
            .intersects(TcpHdrFlags::SYN | TcpHdrFlags::FIN);
        self.len + u32::from(phantom)
    }

    pub fn is_dummy(&self) -> bool {
        self.flags.contains(SegFlags::DUMMY_MSG)
    }

    pub fn is_zerocopy(&self) -> bool {
        self.flags.contains(SegFlags::ZEROCOPY)
    }

    /// Start of the payload within the head buffer's storage.
    pub fn payload_start(&self) -> usize {
        let p = self.p.as_ref().expect("segment without buffer chain");
        if self.is_zerocopy() {
            p.offset
        } else {
            p.offset + self.hdr.hdrlen_bytes() as usize
        }
    }

    /// First payload byte, as sampled by the zero-window probe.
    pub fn first_payload_byte(&self) -> u8 {
        let start = self.payload_start();
        self.p.as_ref().expect("segment without buffer chain").raw()[start]
    }

    /// Number of buffers in this segment's chain.
    pub fn chain_len(&self) -> u32 {
        self.p.as_ref().map_or(0, |p| p.clen())
    }
}

/// Move the masked header flags from `from` onto `to`. Splits use this to
/// keep FIN and RST on the rightmost fragment.
pub fn move_hdr_flags(from: &mut TcpSeg, to: &mut TcpSeg, mask: TcpHdrFlags) {
    let moved = from.hdr.flags & mask;
    if !moved.is_empty() {
        to.hdr.flags |= moved;
        from.hdr.flags -= mask;
    }
}
