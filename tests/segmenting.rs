mod common;

use common::*;
use tcpout::*;

#[test]
fn write_then_output_segments_by_mss() {
    let (mut eng, mut pcb) = established(1000, 5000);
    let start = pcb.snd_lbb;

    let data: Vec<u8> = (0..2500u32).map(|i| i as u8).collect();
    eng.write(&mut pcb, TxData::Copy(&data), WriteFlags::empty())
        .unwrap();

    assert_eq!(pcb.unsent.len(), 3);
    assert_eq!(pcb.snd_lbb, start + 2500);
    assert_eq!(pcb.snd_buf, pcb.max_snd_buff - 2500);
    assert_queues_consistent(&pcb);

    eng.output(&mut pcb).unwrap();

    let frames = &eng.hooks.frames;
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0].payload().len(), 1000);
    assert_eq!(frames[1].payload().len(), 1000);
    assert_eq!(frames[2].payload().len(), 500);
    assert_eq!(frames[0].hdr().seqno, start);
    assert_eq!(frames[1].hdr().seqno, start + 1000);
    assert_eq!(frames[2].hdr().seqno, start + 2000);
    assert!(frames[2].hdr().flags.contains(TcpHdrFlags::PSH));
    assert!(!frames[0].hdr().flags.contains(TcpHdrFlags::PSH));
    for frame in frames {
        assert!(frame.hdr().flags.contains(TcpHdrFlags::ACK));
        assert_eq!(frame.hdr().ackno, pcb.rcv_nxt);
    }

    assert_eq!(pcb.snd_nxt, start + 2500);
    assert_eq!(pcb.unacked.len(), 3);
    assert!(pcb.unsent.is_empty());
    assert_eq!(pcb.unsent_oversize, 0);
    assert_queues_consistent(&pcb);

    assert_eq!(reassemble(frames, start), data);
}

#[test]
fn small_writes_coalesce_into_tail_slack() {
    let (mut eng, mut pcb) = established(1000, 10_000);
    let start = pcb.snd_lbb;

    eng.write(&mut pcb, TxData::Copy(&[0xAA; 100]), WriteFlags::empty())
        .unwrap();
    assert_eq!(pcb.unsent.len(), 1);
    assert_eq!(pcb.unsent_oversize, 900);
    assert_eq!(pcb.snd_queuelen, 1);

    // the second write lands in the slack of the first buffer
    eng.write(&mut pcb, TxData::Copy(&[0xBB; 200]), WriteFlags::empty())
        .unwrap();
    assert_eq!(pcb.unsent.len(), 1);
    assert_eq!(pcb.unsent[0].len, 300);
    assert_eq!(pcb.unsent_oversize, 700);
    assert_eq!(pcb.snd_queuelen, 1);
    assert_queues_consistent(&pcb);

    eng.output(&mut pcb).unwrap();
    assert_eq!(eng.hooks.frames.len(), 1);
    let frame = eng.hooks.last();
    assert_eq!(frame.payload().len(), 300);
    assert_eq!(&frame.payload()[..100], &[0xAA; 100]);
    assert_eq!(&frame.payload()[100..], &[0xBB; 200]);
    assert_eq!(frame.hdr().seqno, start);
}

#[test]
fn chained_buffer_extends_last_segment() {
    let (mut eng, mut pcb) = established(1000, 10_000);

    // small slack so the follow-up write must chain a second buffer
    pcb.tcp_oversize_val = 200;
    eng.write(&mut pcb, TxData::Copy(&[1u8; 100]), WriteFlags::empty())
        .unwrap();
    assert_eq!(pcb.unsent_oversize, 200);

    eng.write(&mut pcb, TxData::Copy(&[2u8; 500]), WriteFlags::empty())
        .unwrap();

    // oversize fill plus one concatenated buffer, still one segment
    assert_eq!(pcb.unsent.len(), 1);
    assert_eq!(pcb.unsent[0].len, 600);
    assert_eq!(pcb.unsent[0].chain_len(), 2);
    assert_eq!(pcb.snd_queuelen, 2);
    assert_queues_consistent(&pcb);

    eng.output(&mut pcb).unwrap();
    let frame = eng.hooks.last();
    assert_eq!(frame.payload().len(), 600);
    assert_eq!(frame.sge, 2);
    assert_eq!(&frame.payload()[..100], &[1u8; 100]);
    assert_eq!(&frame.payload()[100..200], &[2u8; 100]);
}

#[test]
fn route_mtu_clamps_the_mss() {
    let (mut eng, mut pcb) = established(1000, 10_000);
    eng.hooks.mtu = 600;

    eng.update_route_mss(&mut pcb);

    // IP + TCP base headers leave 560 bytes of payload
    assert_eq!(pcb.mss, 560);
    assert_eq!(pcb.tcp_oversize_val, 560);

    eng.write(&mut pcb, TxData::Copy(&[1u8; 1000]), WriteFlags::empty())
        .unwrap();
    eng.output(&mut pcb).unwrap();
    assert_eq!(eng.hooks.frames[0].payload().len(), 560);
    assert_eq!(eng.hooks.frames[1].payload().len(), 440);
}

#[test]
fn empty_write_is_a_no_op() {
    let (mut eng, mut pcb) = established(1000, 5000);
    let snap = snapshot(&pcb);

    eng.write(&mut pcb, TxData::Copy(&[]), WriteFlags::empty())
        .unwrap();
    assert_eq!(snapshot(&pcb), snap);
}
