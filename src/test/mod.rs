
use crate::codec::{encode, FrameDecoder};
use crate::config::{BridgeConfig, ReadMode};
use crate::device::MockDevice;
use crate::error::BridgeError;
use crate::{Bridge, BridgeState, Listener};
use packets::{udp_seq, PacketFactory};
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

struct Harness {
    dev: MockDevice,
    bridge: Bridge,
    path: PathBuf,
    _dir: TempDir,
}

fn harness(config: BridgeConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vpn-tun.sock");
    let listener = Listener::bind(&path, config.socket_mode, config.socket_buffer_size).unwrap();
    let dev = MockDevice::new();
    let bridge = Bridge::new(Box::new(dev.clone()), listener, &config);
    Harness {
        dev,
        bridge,
        path,
        _dir: dir,
    }
}

fn pump_until(bridge: &mut Bridge, mut done: impl FnMut(&Bridge) -> bool) -> bool {
    for _ in 0..200 {
        if done(bridge) {
            return true;
        }
        bridge.poll_once().unwrap();
    }
    done(bridge)
}

fn connect(h: &mut Harness) -> UnixStream {
    let before = h.bridge.session_count();
    let client = UnixStream::connect(&h.path).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    assert!(pump_until(&mut h.bridge, |bridge| bridge.session_count() == before + 1));
    client
}

fn read_frame(client: &mut UnixStream) -> Vec<u8> {
    let mut header = [0u8; 4];
    client.read_exact(&mut header).unwrap();
    let mut payload = vec![0u8; u32::from_be_bytes(header) as usize];
    client.read_exact(&mut payload).unwrap();
    payload
}

fn assert_nothing_pending(client: &mut UnixStream) {
    client.set_nonblocking(true).unwrap();
    let mut buf = [0u8; 16];
    match client.read(&mut buf) {
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        other => panic!("expected no more data, got {:?}", other),
    }
    client.set_nonblocking(false).unwrap();
}

fn device_packets(h: &mut Harness, want: usize) -> Vec<Vec<u8>> {
    let mut got = Vec::new();
    for _ in 0..200 {
        got.extend(h.dev.sent_packets());
        if got.len() >= want {
            break;
        }
        h.bridge.poll_once().unwrap();
    }
    got
}

#[test]
fn test_client_frame_reaches_device() {
    let mut h = harness(BridgeConfig::default());
    let mut client = connect(&mut h);

    client
        .write_all(&[0x00, 0x00, 0x00, 0x04, 0xDE, 0xAD, 0xBE, 0xEF])
        .unwrap();

    let got = device_packets(&mut h, 1);
    assert_eq!(got, vec![vec![0xDE, 0xAD, 0xBE, 0xEF]]);
    assert_eq!(h.bridge.stats().packets_to_device, 1);
}

#[test]
fn test_device_packet_reaches_every_client() {
    let mut h = harness(BridgeConfig::default());
    let mut a = connect(&mut h);
    let mut b = connect(&mut h);

    h.dev.inject_packet(&[0xAA, 0xBB, 0xCC]);
    h.bridge.poll_once().unwrap();

    for client in [&mut a, &mut b] {
        let mut wire = [0u8; 7];
        client.read_exact(&mut wire).unwrap();
        assert_eq!(wire, [0x00, 0x00, 0x00, 0x03, 0xAA, 0xBB, 0xCC]);
        assert_nothing_pending(client);
    }
    assert_eq!(h.bridge.stats().packets_from_device, 1);
}

#[test]
fn test_fan_out_preserves_read_order() {
    let mut h = harness(BridgeConfig::default());
    let mut a = connect(&mut h);
    let mut b = connect(&mut h);

    for seq in 1..=3 {
        h.dev
            .inject_packet(&PacketFactory::udp("10.8.0.1", "10.8.0.2", seq, 64));
    }
    h.bridge.poll_once().unwrap();

    for client in [&mut a, &mut b] {
        let seqs: Vec<u32> = (0..3).map(|_| udp_seq(&read_frame(client))).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_nothing_pending(client);
    }
}

#[test]
fn test_single_read_mode_takes_one_packet_per_poll() {
    let mut h = harness(BridgeConfig {
        device_read_mode: ReadMode::Single,
        ..Default::default()
    });
    let mut client = connect(&mut h);

    for seq in 1..=3 {
        h.dev
            .inject_packet(&PacketFactory::udp("10.8.0.1", "10.8.0.2", seq, 32));
    }

    h.bridge.poll_once().unwrap();
    assert_eq!(udp_seq(&read_frame(&mut client)), 1);
    assert_nothing_pending(&mut client);

    h.bridge.poll_once().unwrap();
    h.bridge.poll_once().unwrap();
    assert_eq!(udp_seq(&read_frame(&mut client)), 2);
    assert_eq!(udp_seq(&read_frame(&mut client)), 3);
}

#[test]
fn test_oversized_frame_closes_only_that_client() {
    let mut h = harness(BridgeConfig::default());
    let mut bad = connect(&mut h);
    let mut good = connect(&mut h);

    bad.write_all(&[0x00, 0x01, 0x00, 0x00, 0x45, 0x00]).unwrap();
    assert!(pump_until(&mut h.bridge, |bridge| bridge.session_count() == 1));

    assert!(h.dev.sent_packets().is_empty());
    assert!(h.bridge.is_device_open());

    let mut buf = [0u8; 1];
    match bad.read(&mut buf) {
        Ok(0) => {}
        Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {}
        other => panic!("expected the bridge to hang up, got {:?}", other),
    }

    h.dev.inject_packet(&[0xAA, 0xBB, 0xCC]);
    h.bridge.poll_once().unwrap();
    assert_eq!(read_frame(&mut good), vec![0xAA, 0xBB, 0xCC]);
}

#[test]
fn test_zero_length_frame_is_a_violation() {
    let mut h = harness(BridgeConfig::default());
    let mut client = connect(&mut h);

    client.write_all(&[0, 0, 0, 0]).unwrap();
    assert!(pump_until(&mut h.bridge, |bridge| bridge.session_count() == 0));
    assert!(h.dev.sent_packets().is_empty());
}

#[test]
fn test_disconnect_does_not_disturb_other_clients() {
    let mut h = harness(BridgeConfig::default());
    let a = connect(&mut h);
    let mut b = connect(&mut h);

    drop(a);
    assert!(pump_until(&mut h.bridge, |bridge| bridge.session_count() == 1));

    let packet = PacketFactory::udp("10.8.0.1", "10.8.0.2", 7, 100);
    h.dev.inject_packet(&packet);
    h.bridge.poll_once().unwrap();
    assert_eq!(read_frame(&mut b), packet);

    b.write_all(&encode(&packet).unwrap()).unwrap();
    assert_eq!(device_packets(&mut h, 1), vec![packet]);
    assert_eq!(h.bridge.stats().connections, 2);
}

#[test]
fn test_slow_client_loses_frames_not_alignment() {
    const ROUNDS: u32 = 100;
    // stays under the default datagram queue length of the mock
    const PER_ROUND: u32 = 8;
    const TOTAL: u64 = (ROUNDS * PER_ROUND) as u64;

    let mut h = harness(BridgeConfig {
        socket_buffer_size: 4096,
        ..Default::default()
    });
    let mut client = connect(&mut h);

    let mut seq = 0;
    for _ in 0..ROUNDS {
        for _ in 0..PER_ROUND {
            seq += 1;
            h.dev
                .inject_packet(&PacketFactory::udp("10.8.0.1", "10.8.0.2", seq, 1400));
        }
        h.bridge.poll_once().unwrap();
    }
    assert_eq!(h.bridge.stats().packets_from_device, TOTAL);
    let drops = h.bridge.stats().fanout_drops;
    assert!(drops > 0, "client never fell behind");

    client.set_nonblocking(true).unwrap();
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; 65_536];
    let mut seqs = Vec::new();
    for _ in 0..10_000 {
        match client.read(&mut buf) {
            Ok(n) => {
                let mut input = &buf[..n];
                while !input.is_empty() {
                    if let Some(packet) = decoder.decode(&mut input).unwrap() {
                        seqs.push(udp_seq(&packet));
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if seqs.len() as u64 + drops == TOTAL && decoder.buffered() == 0 {
                    break;
                }
                h.bridge.poll_once().unwrap();
            }
            Err(e) => panic!("client read failed: {}", e),
        }
    }

    assert_eq!(seqs.len() as u64 + drops, TOTAL);
    assert_eq!(decoder.buffered(), 0);
    assert!(seqs.windows(2).all(|w| w[0] < w[1]), "frames out of order");
    assert_eq!(h.bridge.session_count(), 1);
}

#[test]
fn test_rejected_packet_is_dropped_and_client_kept() {
    let mut h = harness(BridgeConfig::default());
    let mut client = connect(&mut h);
    h.dev.fail_writes_with(libc::EINVAL);

    client.write_all(&encode(&[0xFF; 8]).unwrap()).unwrap();
    assert!(pump_until(&mut h.bridge, |bridge| bridge.stats().device_drops == 1));
    assert_eq!(h.bridge.session_count(), 1);
    assert!(h.bridge.is_device_open());
}

#[test]
fn test_shutdown_twice_leaves_nothing_behind() {
    let mut h = harness(BridgeConfig::default());
    let mut client = connect(&mut h);
    assert!(h.path.exists());

    h.bridge.shutdown();
    h.bridge.shutdown();

    assert_eq!(h.bridge.state(), BridgeState::Stopped);
    assert_eq!(h.bridge.session_count(), 0);
    assert!(!h.bridge.is_device_open());
    assert!(!h.path.exists());

    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).unwrap(), 0);
}

#[test]
fn test_shutdown_without_clients() {
    let mut h = harness(BridgeConfig::default());
    h.bridge.shutdown();
    assert!(!h.path.exists());
    assert!(!h.bridge.is_device_open());
}

#[test]
fn test_run_stops_on_flag() {
    let mut h = harness(BridgeConfig::default());
    let stop = h.bridge.stop_handle();

    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        stop.store(true, Ordering::Relaxed);
    });

    h.bridge.run().unwrap();
    stopper.join().unwrap();

    assert_eq!(h.bridge.state(), BridgeState::Stopped);
    assert!(!h.path.exists());
}

#[test]
fn test_device_failure_is_fatal() {
    let mut h = harness(BridgeConfig::default());
    let mut client = UnixStream::connect(&h.path).unwrap();
    client.write_all(&encode(&[0x45; 20]).unwrap()).unwrap();
    h.dev.fail_writes_with(libc::EIO);

    // safety net so a regression fails instead of hanging
    let stop = h.bridge.stop_handle();
    thread::spawn(move || {
        thread::sleep(Duration::from_secs(5));
        stop.store(true, Ordering::Relaxed);
    });

    let result = h.bridge.run();
    assert!(matches!(result, Err(BridgeError::DeviceIo(_))));
    assert!(!h.bridge.is_device_open());
    assert!(!h.path.exists());
}
