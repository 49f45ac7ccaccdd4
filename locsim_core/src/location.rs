//! Framing for the location simulation service.
//!
//! Stop is a single big-endian `u32` of 1. Start is a `u32` of 0 followed by the
//! latitude and longitude, each as a `u32` length prefix and decimal ASCII text.

use locsim_common::{device::DeviceIdentifier, DiscoveryMode};

use crate::{
    backend::{DeviceBackend, ServiceStream},
    error::{FrameError, SpoofError},
    service::{start_stream, ServiceChannel, LOCATION_SERVICE},
    trust::establish,
};

const START: u32 = 0;
const STOP: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LocationCommand {
    Start { latitude: f64, longitude: f64 },
    Stop,
}

impl LocationCommand {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            LocationCommand::Start {
                latitude,
                longitude,
            } => encode_start(&latitude.to_string(), &longitude.to_string()),
            LocationCommand::Stop => encode_stop(),
        }
    }
}

/// A decoded frame. Coordinates stay as the text that was sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LocationFrame {
    Start { latitude: String, longitude: String },
    Stop,
}

pub fn encode_start(latitude: &str, longitude: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(12 + latitude.len() + longitude.len());
    frame.extend_from_slice(&START.to_be_bytes());
    for text in [latitude, longitude] {
        frame.extend_from_slice(&(text.len() as u32).to_be_bytes());
        frame.extend_from_slice(text.as_bytes());
    }
    frame
}

pub fn encode_stop() -> Vec<u8> {
    STOP.to_be_bytes().to_vec()
}

fn read_u32(bytes: &[u8], pos: &mut usize) -> Result<u32, FrameError> {
    let end = *pos + 4;
    let raw = bytes.get(*pos..end).ok_or(FrameError::Truncated)?;
    *pos = end;
    Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

fn read_text(bytes: &[u8], pos: &mut usize) -> Result<String, FrameError> {
    let len = read_u32(bytes, pos)? as usize;
    let end = pos.checked_add(len).ok_or(FrameError::Truncated)?;
    let raw = bytes.get(*pos..end).ok_or(FrameError::Truncated)?;
    *pos = end;
    std::str::from_utf8(raw)
        .map(str::to_owned)
        .map_err(|_| FrameError::InvalidText)
}

pub fn decode_frame(bytes: &[u8]) -> Result<LocationFrame, FrameError> {
    let mut pos = 0;
    let frame = match read_u32(bytes, &mut pos)? {
        START => {
            let latitude = read_text(bytes, &mut pos)?;
            let longitude = read_text(bytes, &mut pos)?;
            LocationFrame::Start {
                latitude,
                longitude,
            }
        }
        STOP => LocationFrame::Stop,
        other => return Err(FrameError::UnknownCommand(other)),
    };
    match bytes.len() - pos {
        0 => Ok(frame),
        extra => Err(FrameError::TrailingBytes(extra)),
    }
}

fn send_frame(
    channel: &mut ServiceChannel<'_, dyn ServiceStream>,
    frame: &[u8],
) -> Result<(), SpoofError> {
    let sent = channel.send(frame)?;
    if sent != frame.len() {
        return Err(SpoofError::PartialWrite {
            sent,
            expected: frame.len(),
        });
    }
    Ok(())
}

pub fn send_start(
    channel: &mut ServiceChannel<'_, dyn ServiceStream>,
    latitude: f64,
    longitude: f64,
) -> Result<(), SpoofError> {
    send_command(
        channel,
        &LocationCommand::Start {
            latitude,
            longitude,
        },
    )
}

pub fn send_stop(channel: &mut ServiceChannel<'_, dyn ServiceStream>) -> Result<(), SpoofError> {
    send_command(channel, &LocationCommand::Stop)
}

pub fn send_command(
    channel: &mut ServiceChannel<'_, dyn ServiceStream>,
    command: &LocationCommand,
) -> Result<(), SpoofError> {
    send_frame(channel, &command.encode())
}

/// Connects to `udid`, sends one command over a fresh location channel, then
/// releases everything.
pub fn spoof(
    backend: &dyn DeviceBackend,
    udid: &DeviceIdentifier,
    mode: DiscoveryMode,
    command: &LocationCommand,
) -> Result<(), SpoofError> {
    let client = establish(backend, udid, mode, "devicelocation")?;
    let mut channel = start_stream(&client, LOCATION_SERVICE)?;
    let result = send_command(&mut channel, command);
    channel.close();
    match &result {
        Ok(()) => tracing::info!("Sent {:?} to {}", command, udid),
        Err(e) => tracing::error!("Location command for {} failed: {}", udid, e),
    }
    result
}
