mod common;

use common::*;
use tcpout::*;

#[test]
fn exhausted_buffer_allocator_rolls_back_the_write() {
    let (mut eng, mut pcb) = established(1000, 5000);

    eng.write(&mut pcb, TxData::Copy(&[1u8; 500]), WriteFlags::empty())
        .unwrap();
    let snap = snapshot(&pcb);

    // no further buffers
    eng.hooks.pbuf_budget = Some(eng.hooks.pbuf_allocs);
    let err = eng.write(&mut pcb, TxData::Copy(&vec![2u8; 2000]), WriteFlags::empty());

    assert_eq!(err, Err(Error::MemExhausted));
    assert!(pcb.flags.contains(PcbFlags::NAGLEMEMERR));
    assert_eq!(snapshot(&pcb), snap);
}

#[test]
fn exhausted_segment_allocator_rolls_back_and_frees_buffers() {
    let (mut eng, mut pcb) = established(1000, 5000);
    let snap = snapshot(&pcb);

    eng.hooks.seg_budget = Some(0);
    let err = eng.write(&mut pcb, TxData::Copy(&vec![1u8; 1500]), WriteFlags::empty());

    assert_eq!(err, Err(Error::MemExhausted));
    assert_eq!(snapshot(&pcb), snap);
    // the buffer allocated for the failed segment went back
    assert!(eng.hooks.pbuf_frees > 0);
}

#[test]
fn mid_write_failure_frees_the_partial_queue() {
    let (mut eng, mut pcb) = established(1000, 10_000);
    let snap = snapshot(&pcb);

    // three buffers succeed, the fourth fails mid-write
    eng.hooks.pbuf_budget = Some(3);
    let err = eng.write(&mut pcb, TxData::Copy(&vec![1u8; 4000]), WriteFlags::empty());

    assert_eq!(err, Err(Error::MemExhausted));
    assert_eq!(snapshot(&pcb), snap);
    assert_eq!(eng.hooks.pbuf_frees, 3);
    assert_eq!(eng.hooks.seg_frees, 3);
}

#[test]
fn queue_length_limit_rejects_the_write() {
    let (mut eng, mut pcb) = established(1000, 5000);
    pcb.max_unsent_len = 2;

    eng.write(&mut pcb, TxData::Copy(&vec![1u8; 2000]), WriteFlags::empty())
        .unwrap();
    let snap = snapshot(&pcb);

    let err = eng.write(&mut pcb, TxData::Copy(&[2u8; 100]), WriteFlags::empty());
    assert_eq!(err, Err(Error::MemExhausted));
    assert!(pcb.flags.contains(PcbFlags::NAGLEMEMERR));
    assert_eq!(snapshot(&pcb), snap);
}

#[test]
fn queue_growth_beyond_the_limit_rolls_back_mid_write() {
    let (mut eng, mut pcb) = established(1000, 10_000);
    pcb.max_unsent_len = 3;
    let snap = snapshot(&pcb);

    let err = eng.write(&mut pcb, TxData::Copy(&vec![1u8; 4000]), WriteFlags::empty());
    assert_eq!(err, Err(Error::MemExhausted));
    assert_eq!(snapshot(&pcb), snap);
}

#[test]
fn write_beyond_snd_buf_is_rejected() {
    let (mut eng, mut pcb) = established(1000, 5000);
    pcb.snd_buf = 100;
    let snap = snapshot(&pcb);

    let err = eng.write(&mut pcb, TxData::Copy(&[1u8; 200]), WriteFlags::empty());
    assert_eq!(err, Err(Error::MemExhausted));
    assert!(pcb.flags.contains(PcbFlags::NAGLEMEMERR));
    assert_eq!(snapshot(&pcb), snap);
}

#[test]
fn write_outside_a_sending_state_is_rejected() {
    let (mut eng, mut pcb) = established(1000, 5000);
    eng.set_state(&mut pcb, TcpState::TimeWait);
    let snap = snapshot(&pcb);

    let err = eng.write(&mut pcb, TxData::Copy(&[1u8; 100]), WriteFlags::empty());
    assert_eq!(err, Err(Error::InvalidState));
    assert!(!pcb.flags.contains(PcbFlags::NAGLEMEMERR));
    assert_eq!(snapshot(&pcb), snap);
}

#[test]
fn memory_error_overrides_the_nagle_hold() {
    let (mut eng, mut pcb) = established(1000, 10_000);

    // a held-back small segment (see the nagle tests)
    eng.write(&mut pcb, TxData::Copy(&[1u8; 600]), WriteFlags::empty())
        .unwrap();
    eng.output(&mut pcb).unwrap();
    eng.write(&mut pcb, TxData::Copy(&[2u8; 300]), WriteFlags::empty())
        .unwrap();
    eng.output(&mut pcb).unwrap();
    eng.write(&mut pcb, TxData::Copy(&[3u8; 800]), WriteFlags::empty())
        .unwrap();
    eng.output(&mut pcb).unwrap();
    assert_eq!(eng.hooks.frames.len(), 2);

    // a failed write must not leave the tail stuck behind the hold
    pcb.snd_buf = 0;
    let _ = eng.write(&mut pcb, TxData::Copy(&[4u8; 100]), WriteFlags::empty());
    assert!(pcb.flags.contains(PcbFlags::NAGLEMEMERR));

    eng.output(&mut pcb).unwrap();
    assert_eq!(eng.hooks.frames.len(), 3);
    assert_eq!(eng.hooks.last().payload().len(), 800);
    assert!(!pcb.flags.contains(PcbFlags::NAGLEMEMERR));
}
