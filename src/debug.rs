//! Trace-log helpers.

use crate::TcpSeg;

/// Summarize a segment queue for trace output: segment count and payload
/// bytes, buffer count and buffered bytes.
pub fn dump_segs<'a>(segs: impl IntoIterator<Item = &'a TcpSeg>) -> String {
    let mut seg_num = 0usize;
    let mut seg_len = 0u64;
    let mut pbuf_num = 0usize;
    let mut pbuf_len = 0u64;

    for seg in segs {
        seg_num += 1;
        seg_len += seg.len as u64;
        let mut cur = seg.p.as_deref();
        while let Some(p) = cur {
            pbuf_num += 1;
            pbuf_len += p.len as u64;
            cur = p.next.as_deref();
        }
    }

    format!(
        "[seg] num: {seg_num:<2} len: {seg_len:<6} [pbuf] num: {pbuf_num:<2} len: {pbuf_len:<6}"
    )
}
