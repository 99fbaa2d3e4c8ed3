mod common;

use common::*;
use tcpout::*;

#[test]
fn send_window_stops_the_drain() {
    let (mut eng, mut pcb) = established(1000, 5000);
    pcb.snd_wnd = 1000;
    pcb.cwnd = 5000;
    let start = pcb.snd_lbb;

    let data = vec![7u8; 4000];
    eng.write(&mut pcb, TxData::Copy(&data), WriteFlags::MORE)
        .unwrap();
    assert_eq!(pcb.unsent.len(), 4);

    eng.output(&mut pcb).unwrap();

    assert_eq!(eng.hooks.frames.len(), 1);
    assert_eq!(eng.hooks.frames[0].payload().len(), 1000);
    assert_eq!(eng.hooks.frames[0].hdr().seqno, start);
    assert_eq!(pcb.unsent.len(), 3);
    assert_eq!(pcb.unacked.len(), 1);
    assert_eq!(pcb.snd_nxt, start + 1000);
    assert_queues_consistent(&pcb);
}

#[test]
fn congestion_window_caps_the_drain() {
    let (mut eng, mut pcb) = established(1000, 10_000);
    pcb.cwnd = 2000;

    eng.write(&mut pcb, TxData::Copy(&vec![1u8; 4000]), WriteFlags::empty())
        .unwrap();
    eng.output(&mut pcb).unwrap();

    assert_eq!(eng.hooks.frames.len(), 2);
    assert_eq!(pcb.unsent.len(), 2);
    assert_eq!(pcb.unacked.len(), 2);
}

#[test]
fn zero_window_holds_data_and_ack_now_sends_empty_ack() {
    let (mut eng, mut pcb) = established(1000, 5000);
    pcb.snd_wnd = 0;

    eng.write(&mut pcb, TxData::Copy(&[9u8; 500]), WriteFlags::empty())
        .unwrap();

    // no window, no ACK request: nothing leaves
    eng.output(&mut pcb).unwrap();
    assert!(eng.hooks.frames.is_empty());
    assert_eq!(pcb.unsent.len(), 1);

    // an immediate-ACK request still produces exactly one empty ACK
    pcb.flags |= PcbFlags::ACK_NOW;
    eng.output(&mut pcb).unwrap();

    assert_eq!(eng.hooks.frames.len(), 1);
    let frame = eng.hooks.last();
    assert!(frame.payload().is_empty());
    assert_eq!(frame.hdr().flags, TcpHdrFlags::ACK);
    assert_eq!(frame.hdr().seqno, pcb.snd_nxt);
    assert_eq!(frame.hdr().ackno, pcb.rcv_nxt);
    assert!(!pcb.flags.contains(PcbFlags::ACK_NOW));
    assert_eq!(pcb.unsent.len(), 1);
    assert!(pcb.unacked.is_empty());
}

#[test]
fn window_availability_accounts_for_queued_data() {
    let (mut eng, mut pcb) = established(1000, 3000);

    assert!(eng.is_wnd_available(&pcb, 3000));
    assert!(!eng.is_wnd_available(&pcb, 3001));

    eng.write(&mut pcb, TxData::Copy(&[1u8; 1000]), WriteFlags::empty())
        .unwrap();
    eng.output(&mut pcb).unwrap();
    assert!(eng.is_wnd_available(&pcb, 2000));
    assert!(!eng.is_wnd_available(&pcb, 2001));

    // pending unsent data counts as well
    eng.write(&mut pcb, TxData::Copy(&[2u8; 1500]), WriteFlags::empty())
        .unwrap();
    assert!(eng.is_wnd_available(&pcb, 500));
    assert!(!eng.is_wnd_available(&pcb, 501));
}

#[test]
fn head_segment_is_split_to_fit_the_window() {
    let (mut eng, mut pcb) = established(1000, 10_000);
    pcb.snd_wnd = 700;
    pcb.cwnd = 700;
    let start = pcb.snd_lbb;

    let data: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
    eng.write(&mut pcb, TxData::Copy(&data), WriteFlags::empty())
        .unwrap();
    assert_eq!(pcb.unsent.len(), 2);

    eng.output(&mut pcb).unwrap();

    // exactly the window's worth went out, the remainder was requeued
    assert_eq!(eng.hooks.frames.len(), 1);
    assert_eq!(eng.hooks.frames[0].payload().len(), 700);
    assert_eq!(pcb.unsent.len(), 2);
    assert_eq!(pcb.unsent[0].seqno, start + 700);
    assert_eq!(pcb.unsent[0].len, 300);
    assert_queues_consistent(&pcb);

    // once the window opens and the flight is acknowledged, the rest
    // drains
    ack_all(&mut eng, &mut pcb);
    pcb.snd_wnd = 10_000;
    pcb.cwnd = 10_000;
    eng.output(&mut pcb).unwrap();

    assert!(pcb.unsent.is_empty());
    assert_eq!(reassemble(&eng.hooks.frames, start), data);
}
