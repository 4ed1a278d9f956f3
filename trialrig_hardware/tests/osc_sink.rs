use std::net::UdpSocket;
use std::time::Duration;

use trialrig_hardware::{OscArg, OscSink, encode_message, trial_info_messages};
use trialrig_traits::{TrialInfo, TrialInfoSink};

fn info() -> TrialInfo {
    TrialInfo {
        trial_num: 12,
        position: -35,
        stim_phase: 1.5,
        contrast: 0.25,
        stim_freq: 0.1,
        stim_angle: 0.0,
        stim_gain: 4.0,
        stim_sigma: 7.0,
        stim_reverse: 0,
    }
}

#[test]
fn float_message_layout() {
    let bytes = encode_message("/c", &[OscArg::Float(0.25)]).unwrap();
    let mut expected = vec![b'/', b'c', 0, 0, b',', b'f', 0, 0];
    expected.extend_from_slice(&0.25f32.to_be_bytes());
    assert_eq!(bytes, expected);
}

#[test]
fn addresses_follow_renderer_order() {
    let addresses: Vec<_> = trial_info_messages(&info())
        .iter()
        .map(|(a, _)| *a)
        .collect();
    assert_eq!(addresses, ["/t", "/p", "/h", "/c", "/f", "/a", "/g", "/s", "/r"]);
    let msgs = trial_info_messages(&info());
    assert_eq!(msgs[1].1, OscArg::Int(-35));
    assert_eq!(msgs[8].1, OscArg::Int(0));
}

#[test]
fn loopback_receives_every_field() {
    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    receiver
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut sink = OscSink::connect(receiver.local_addr().unwrap()).unwrap();
    sink.send(&info()).unwrap();

    let mut buf = [0u8; 64];
    let mut packets = Vec::new();
    for _ in 0..9 {
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        packets.push(buf[..n].to_vec());
    }
    assert_eq!(packets[0], encode_message("/t", &[OscArg::Int(12)]).unwrap());
    assert_eq!(
        packets[6],
        encode_message("/g", &[OscArg::Float(4.0)]).unwrap()
    );
    assert!(packets.iter().all(|p| p.len() == 12));
}
