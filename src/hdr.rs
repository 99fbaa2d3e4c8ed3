//! TCP header and option encoding.
//!
//! The wire image follows RFC 793: ports, sequence and acknowledgement
//! numbers in network byte order, the data offset in 32-bit words. Options
//! are emitted in a fixed order with NOP padding so every option stays
//! 32-bit aligned: MSS (kind 2, len 4), one NOP followed by window scale
//! (kind 3, len 3), two NOPs followed by timestamps (kind 8, len 10).

use std::io::{Cursor, Error, ErrorKind, Read, Write};

use bitflags::bitflags;
use bytestream::{ByteOrder::BigEndian, StreamReader, StreamWriter};

use crate::SegFlags;

/// Length of the option-less TCP header.
pub const TCP_HLEN: u32 = 20;

/// Wire length of the timestamp option including its two NOP pads.
pub const TCP_OPT_LEN_TS: u32 = 12;

/// Conversion of a value into a big-endian byte stream.
pub trait IntoBytestream {
    type Error;

    fn into_bytestream(&self, stream: &mut impl Write) -> Result<(), Self::Error>;

    fn into_buffer(&self) -> Result<Vec<u8>, Self::Error> {
        let mut buffer = Vec::new();
        self.into_bytestream(&mut buffer)?;
        Ok(buffer)
    }
}

/// Extraction of a value from a big-endian byte stream.
pub trait FromBytestream: Sized {
    type Error;

    fn from_bytestream(stream: &mut Cursor<impl AsRef<[u8]>>) -> Result<Self, Self::Error>;

    fn from_buffer(buffer: impl AsRef<[u8]>) -> Result<Self, Self::Error> {
        let mut cursor = Cursor::new(buffer);
        Self::from_bytestream(&mut cursor)
    }
}

bitflags! {
    /// Flag bits of the TCP header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TcpHdrFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

/// A TCP header in host byte order. Options are kept out of the struct and
/// appended by [`build_options`] when the segment is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHdr {
    pub src: u16,
    pub dest: u16,
    pub seqno: u32,
    pub ackno: u32,
    /// Data offset in 32-bit words (5 without options).
    pub hdrlen_words: u8,
    pub flags: TcpHdrFlags,
    pub wnd: u16,
    pub chksum: u16,
    pub urgp: u16,
}

impl TcpHdr {
    /// Header length in bytes as declared by the data-offset field.
    pub fn hdrlen_bytes(&self) -> u32 {
        self.hdrlen_words as u32 * 4
    }
}

impl Default for TcpHdr {
    fn default() -> Self {
        Self {
            src: 0,
            dest: 0,
            seqno: 0,
            ackno: 0,
            hdrlen_words: 5,
            flags: TcpHdrFlags::empty(),
            wnd: 0,
            chksum: 0,
            urgp: 0,
        }
    }
}

impl IntoBytestream for TcpHdr {
    type Error = Error;
    fn into_bytestream(&self, stream: &mut impl Write) -> Result<(), Self::Error> {
        self.src.write_to(stream, BigEndian)?;
        self.dest.write_to(stream, BigEndian)?;
        self.seqno.write_to(stream, BigEndian)?;
        self.ackno.write_to(stream, BigEndian)?;

        ((self.hdrlen_words << 4) & 0b1111_0000).write_to(stream, BigEndian)?;
        self.flags.bits().write_to(stream, BigEndian)?;
        self.wnd.write_to(stream, BigEndian)?;
        self.chksum.write_to(stream, BigEndian)?;
        self.urgp.write_to(stream, BigEndian)?;

        Ok(())
    }
}

impl FromBytestream for TcpHdr {
    type Error = Error;
    fn from_bytestream(stream: &mut Cursor<impl AsRef<[u8]>>) -> Result<Self, Self::Error> {
        let src = u16::read_from(stream, BigEndian)?;
        let dest = u16::read_from(stream, BigEndian)?;
        let seqno = u32::read_from(stream, BigEndian)?;
        let ackno = u32::read_from(stream, BigEndian)?;

        let hdrlen_words = u8::read_from(stream, BigEndian)? >> 4;
        let flags = TcpHdrFlags::from_bits_truncate(u8::read_from(stream, BigEndian)?);
        let wnd = u16::read_from(stream, BigEndian)?;
        let chksum = u16::read_from(stream, BigEndian)?;
        let urgp = u16::read_from(stream, BigEndian)?;

        Ok(Self {
            src,
            dest,
            seqno,
            ackno,
            hdrlen_words,
            flags,
            wnd,
            chksum,
            urgp,
        })
    }
}

/// Wire length of the options selected by `optflags`, padding included.
pub fn opt_length(optflags: SegFlags) -> u32 {
    let mut len = 0;
    if optflags.contains(SegFlags::MSS) {
        len += 4;
    }
    if optflags.contains(SegFlags::WNDSCALE) {
        len += 4;
    }
    if optflags.contains(SegFlags::TS) {
        len += TCP_OPT_LEN_TS;
    }
    len
}

/// Build the option bytes for `optflags` in emission order.
pub fn build_options(
    optflags: SegFlags,
    advtsd_mss: u16,
    rcv_scale: u8,
    ts_now: u32,
    ts_recent: u32,
) -> Vec<u8> {
    let mut opts = Vec::with_capacity(opt_length(optflags) as usize);
    if optflags.contains(SegFlags::MSS) {
        opts.extend_from_slice(&[2, 4]);
        opts.extend_from_slice(&advtsd_mss.to_be_bytes());
    }
    if optflags.contains(SegFlags::WNDSCALE) {
        opts.extend_from_slice(&[1, 3, 3, rcv_scale]);
    }
    if optflags.contains(SegFlags::TS) {
        opts.extend_from_slice(&[1, 1, 8, 10]);
        opts.extend_from_slice(&ts_now.to_be_bytes());
        opts.extend_from_slice(&ts_recent.to_be_bytes());
    }
    opts
}

/// A parsed TCP option, used by tests and debug tooling to inspect emitted
/// frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpOption {
    MaximumSegmentSize(u16),
    WindowScale(u8),
    Timestamp(u32, u32),
    Nop,
    EndOfOptionsList,
}

/// Parse the option bytes of a TCP header.
pub fn parse_options(buf: &[u8]) -> Result<Vec<TcpOption>, Error> {
    let mut stream = Cursor::new(buf);
    let mut options = Vec::new();
    while (stream.position() as usize) < buf.len() {
        let kind = u8::read_from(&mut stream, BigEndian)?;
        match kind {
            0 => {
                options.push(TcpOption::EndOfOptionsList);
                break;
            }
            1 => options.push(TcpOption::Nop),
            2 => {
                let _len = u8::read_from(&mut stream, BigEndian)?;
                let mss = u16::read_from(&mut stream, BigEndian)?;
                options.push(TcpOption::MaximumSegmentSize(mss));
            }
            3 => {
                let _len = u8::read_from(&mut stream, BigEndian)?;
                let scale = u8::read_from(&mut stream, BigEndian)?;
                options.push(TcpOption::WindowScale(scale));
            }
            8 => {
                let _len = u8::read_from(&mut stream, BigEndian)?;
                let tsval = u32::read_from(&mut stream, BigEndian)?;
                let tsecr = u32::read_from(&mut stream, BigEndian)?;
                options.push(TcpOption::Timestamp(tsval, tsecr));
            }
            _ => {
                let len = u8::read_from(&mut stream, BigEndian)?;
                let mut skipped = vec![0u8; (len as usize).saturating_sub(2)];
                stream.read_exact(&mut skipped)?;
            }
        }
    }
    Ok(options)
}
