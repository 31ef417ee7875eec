mod common;

use common::{setup, DeviceCmd, DeviceModel};
use rfnoc_link_lib::error::RfnocError;
use rfnoc_link_lib::mgmt::SepAddr;
use rfnoc_link_lib::stream::StreamBuffParams;
use rfnoc_link_lib::CoreConfig;

fn sep_addr() -> SepAddr {
    SepAddr {
        device_id: 2,
        instance: 0,
    }
}

fn capacity() -> StreamBuffParams {
    StreamBuffParams {
        bytes: 65536,
        packets: 128,
    }
}

#[test]
fn test_poke_then_peek_roundtrip() {
    let (mut mgr, _device) = setup(DeviceModel::single_sep(capacity()), CoreConfig::default());
    let (_, remote) = mgr.connect_host_to_device(sep_addr()).expect("connect");
    let mut ep = mgr.create_ctrl_endpoint(remote, 0).expect("ctrl endpoint");

    ep.poke32(0x40, 0xDEAD_BEEF).expect("poke");
    assert_eq!(ep.peek32(0x40).expect("peek"), 0xDEAD_BEEF);

    // An untouched register reads back zero.
    assert_eq!(ep.peek32(0x80).expect("peek untouched"), 0);
}

#[test]
fn test_poke64_peek64() {
    let (mut mgr, _device) = setup(DeviceModel::single_sep(capacity()), CoreConfig::default());
    let (_, remote) = mgr.connect_host_to_device(sep_addr()).expect("connect");
    let mut ep = mgr.create_ctrl_endpoint(remote, 0).expect("ctrl endpoint");

    ep.poke64(0x100, 0x0123_4567_89AB_CDEF).expect("poke64");
    assert_eq!(ep.peek64(0x100).expect("peek64"), 0x0123_4567_89AB_CDEF);
}

#[test]
fn test_block_transfers() {
    let (mut mgr, _device) = setup(DeviceModel::single_sep(capacity()), CoreConfig::default());
    let (_, remote) = mgr.connect_host_to_device(sep_addr()).expect("connect");
    let mut ep = mgr.create_ctrl_endpoint(remote, 0).expect("ctrl endpoint");

    // Longer than one transaction's 15-word budget, to exercise
    // chunking.
    let data: Vec<u32> = (0..40u32).map(|i| i * 3).collect();
    ep.block_poke32(0x1000, &data).expect("block poke");
    let read = ep.block_peek32(0x1000, data.len()).expect("block peek");
    assert_eq!(read, data);
}

#[test]
fn test_masked_poke() {
    let (mut mgr, _device) = setup(DeviceModel::single_sep(capacity()), CoreConfig::default());
    let (_, remote) = mgr.connect_host_to_device(sep_addr()).expect("connect");
    let mut ep = mgr.create_ctrl_endpoint(remote, 0).expect("ctrl endpoint");

    ep.poke32(0x40, 0xFFFF_0000).expect("poke");
    ep.poke32_masked(0x40, 0x0000_1234, 0x0000_FFFF)
        .expect("masked poke");
    assert_eq!(ep.peek32(0x40).expect("peek"), 0xFFFF_1234);
}

#[test]
fn test_sleep_with_ack() {
    let (mut mgr, _device) = setup(DeviceModel::single_sep(capacity()), CoreConfig::default());
    let (_, remote) = mgr.connect_host_to_device(sep_addr()).expect("connect");
    let mut ep = mgr.create_ctrl_endpoint(remote, 0).expect("ctrl endpoint");

    ep.sleep(1000, true).expect("acked sleep");
    ep.sleep(1000, false).expect("posted sleep");
}

#[test]
fn test_many_writes_stay_within_ack_bound() {
    let mut cfg = CoreConfig::default();
    cfg.ctrl.max_outstanding_acks = 4;
    let (mut mgr, _device) = setup(DeviceModel::single_sep(capacity()), cfg);
    let (_, remote) = mgr.connect_host_to_device(sep_addr()).expect("connect");
    let mut ep = mgr.create_ctrl_endpoint(remote, 0).expect("ctrl endpoint");

    // Far more writes than the bound; the endpoint must reclaim ack
    // slots rather than overflow.
    for i in 0..64u32 {
        ep.poke32(0x2000 + i * 4, i).expect("poke");
    }
    for i in 0..64u32 {
        assert_eq!(ep.peek32(0x2000 + i * 4).expect("peek"), i);
    }
}

#[test]
fn test_timeout_marks_endpoint_degraded() {
    let mut cfg = CoreConfig::default();
    cfg.ctrl.timeout_ms = 50;
    let (mut mgr, device) = setup(DeviceModel::single_sep(capacity()), cfg);
    let (_, remote) = mgr.connect_host_to_device(sep_addr()).expect("connect");
    let mut ep = mgr.create_ctrl_endpoint(remote, 0).expect("ctrl endpoint");

    device
        .cmd
        .send(DeviceCmd::MuteCtrl { on: true })
        .expect("mute");
    std::thread::sleep(std::time::Duration::from_millis(10));

    let err = ep.peek32(0x40).expect_err("response must time out");
    assert!(matches!(err, RfnocError::Timeout(_)), "got {err:?}");
    assert!(ep.is_degraded());

    // The caller may retry after the device comes back.
    device
        .cmd
        .send(DeviceCmd::MuteCtrl { on: false })
        .expect("unmute");
    std::thread::sleep(std::time::Duration::from_millis(10));
    assert_eq!(ep.peek32(0x40).expect("retry succeeds"), 0);
}
