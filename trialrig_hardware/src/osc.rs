//! Trial-info broadcast to the stimulus renderer as OSC 1.0 over UDP.
//!
//! One message per field, sent in a fixed order. Integers go out as `i`
//! (int32, big-endian) and floats as `f` (float32, big-endian). Strings are
//! NUL-terminated and padded to a multiple of four bytes.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use trialrig_traits::{TrialInfo, TrialInfoSink};

use crate::error::{HwError, Result};

pub const DEFAULT_RENDERER_PORT: u16 = 7110;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OscArg {
    Int(i32),
    Float(f32),
}

impl OscArg {
    fn tag(self) -> u8 {
        match self {
            OscArg::Int(_) => b'i',
            OscArg::Float(_) => b'f',
        }
    }
}

fn push_padded_str(buf: &mut Vec<u8>, s: &[u8]) {
    buf.extend_from_slice(s);
    let pad = 4 - s.len() % 4;
    buf.extend(std::iter::repeat_n(0u8, pad));
}

/// Encode one OSC message. `address` must start with `/` and hold no NUL.
pub fn encode_message(address: &str, args: &[OscArg]) -> Result<Vec<u8>> {
    if !address.starts_with('/') || address.contains('\0') {
        return Err(HwError::Osc(format!("invalid address pattern '{address}'")));
    }
    let mut buf = Vec::with_capacity(address.len() + 8 + args.len() * 5);
    push_padded_str(&mut buf, address.as_bytes());
    let mut tags = Vec::with_capacity(args.len() + 1);
    tags.push(b',');
    tags.extend(args.iter().map(|a| a.tag()));
    push_padded_str(&mut buf, &tags);
    for arg in args {
        match *arg {
            OscArg::Int(v) => buf.extend_from_slice(&v.to_be_bytes()),
            OscArg::Float(v) => buf.extend_from_slice(&v.to_be_bytes()),
        }
    }
    Ok(buf)
}

/// Address/argument pairs for one trial, in renderer order.
pub fn trial_info_messages(info: &TrialInfo) -> [(&'static str, OscArg); 9] {
    [
        ("/t", OscArg::Int(info.trial_num)),
        ("/p", OscArg::Int(info.position)),
        ("/h", OscArg::Float(info.stim_phase)),
        ("/c", OscArg::Float(info.contrast)),
        ("/f", OscArg::Float(info.stim_freq)),
        ("/a", OscArg::Float(info.stim_angle)),
        ("/g", OscArg::Float(info.stim_gain)),
        ("/s", OscArg::Float(info.stim_sigma)),
        ("/r", OscArg::Int(info.stim_reverse)),
    ]
}

/// UDP sender bound to an ephemeral local port.
#[derive(Debug)]
pub struct OscSink {
    socket: UdpSocket,
    target: SocketAddr,
}

impl OscSink {
    pub fn connect(target: impl ToSocketAddrs) -> Result<Self> {
        let target = target
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| HwError::Osc("renderer address did not resolve".into()))?;
        let bind: SocketAddr = if target.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind)?;
        tracing::debug!(%target, local = ?socket.local_addr().ok(), "osc sink ready");
        Ok(Self { socket, target })
    }

    /// Renderer on localhost at the default port.
    pub fn localhost() -> Result<Self> {
        Self::connect(("127.0.0.1", DEFAULT_RENDERER_PORT))
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn send_info(&self, info: &TrialInfo) -> Result<()> {
        for (address, arg) in trial_info_messages(info) {
            let packet = encode_message(address, &[arg])?;
            self.socket.send_to(&packet, self.target)?;
        }
        tracing::trace!(trial_num = info.trial_num, target = %self.target, "trial info sent");
        Ok(())
    }
}

impl TrialInfoSink for OscSink {
    fn send(&mut self, info: &TrialInfo) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(self.send_info(info)?)
    }
}
