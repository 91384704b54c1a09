// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! GT06 frame synchronization and encoding
//!
//! Inbound wire format:
//! `start(2) | length(1 or 2) | protocol(1) | payload | serial(2) | crc(2) | stop(2)`
//! where `length` counts protocol through crc inclusive. `0x7878` frames
//! carry a 1-byte length, `0x7979` a 2-byte length. The CRC covers the
//! length field through the serial number.

use std::sync::atomic::{AtomicU16, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::constant::{
    LANGUAGE_CHINESE, LANGUAGE_ENGLISH, MIN_DECLARED_LENGTH, MIN_FRAME_SIZE, MSG_LOGIN,
    MSG_SERVER_COMMAND, START_STANDARD, STOP_MARKER,
};
use crate::crc;
use crate::error::Error;

/// One validated GT06 frame. CRC has already been checked.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// True for `0x7979` frames (2-byte length field).
    pub extended: bool,
    pub protocol: u8,
    pub payload: Bytes,
    pub serial: u16,
}

/// Monotonic 16-bit serial source for server-originated frames.
/// Wraps to 1 after 0xFFFF; 0 is never produced after the first call.
pub struct SerialCounter(AtomicU16);

impl SerialCounter {
    pub const fn new() -> SerialCounter {
        SerialCounter(AtomicU16::new(0))
    }

    pub fn next(&self) -> u16 {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let next = if current == u16::MAX { 1 } else { current + 1 };
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}

pub static SERIALS: SerialCounter = SerialCounter::new();

/// Next serial number for an outbound command frame.
pub fn next_serial() -> u16 {
    SERIALS.next()
}

/// Per-connection decode counters, logged when the connection closes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodecStats {
    pub frames: u64,
    pub resyncs: u64,
    pub crc_failures: u64,
}

/// Streaming GT06 framer. Each connection owns one.
#[derive(Debug, Default)]
pub struct Gt06Codec {
    stats: CodecStats,
}

impl Gt06Codec {
    pub fn new() -> Gt06Codec {
        Gt06Codec::default()
    }

    pub fn stats(&self) -> CodecStats {
        self.stats
    }

    /// Records a recoverable wire error. The caller resumes scanning;
    /// the connection stays up.
    fn recover(&mut self, error: Error) {
        debug_assert!(error.is_recoverable());
        match error {
            Error::Checksum { .. } => self.stats.crc_failures += 1,
            _ => self.stats.resyncs += 1,
        }
        trace!(error = %error, "frame recovery");
    }
}

fn find_start(src: &[u8]) -> Option<usize> {
    src.windows(2)
        .position(|w| w == [0x78, 0x78] || w == [0x79, 0x79])
}

impl Decoder for Gt06Codec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        loop {
            match find_start(src) {
                Some(0) => {}
                Some(pos) => {
                    src.advance(pos);
                    self.recover(Error::FrameSync("junk before start marker"));
                }
                None => {
                    // Keep a possible first marker byte at the tail so a
                    // marker split across reads still syncs.
                    let keep = match src.last() {
                        Some(&0x78) | Some(&0x79) => 1,
                        _ => 0,
                    };
                    let junk = src.len() - keep;
                    if junk > 0 {
                        src.advance(junk);
                        self.recover(Error::FrameSync("no start marker in buffer"));
                    }
                    return Ok(None);
                }
            }

            if src.len() < MIN_FRAME_SIZE {
                return Ok(None);
            }

            let extended = src[0] == 0x79;
            let len_width = if extended { 2 } else { 1 };
            let declared = if extended {
                u16::from_be_bytes([src[2], src[3]]) as usize
            } else {
                src[2] as usize
            };

            if declared < MIN_DECLARED_LENGTH {
                src.advance(1);
                self.recover(Error::FrameSync("declared length below minimum"));
                continue;
            }

            let total = 2 + len_width + declared + 2;
            if src.len() < total {
                return Ok(None);
            }

            if src[total - 2..total] != [0x0D, 0x0A] {
                src.advance(1);
                self.recover(Error::FrameSync("stop marker missing at frame end"));
                continue;
            }

            // crc covers the length field through the serial number
            let crc_at = 2 + len_width + declared - 2;
            let stored = u16::from_be_bytes([src[crc_at], src[crc_at + 1]]);
            let computed = crc::checksum(&src[2..crc_at]);
            if computed != stored {
                src.advance(1);
                self.recover(Error::Checksum {
                    expected: stored,
                    actual: computed,
                });
                continue;
            }

            let frame = src.split_to(total).freeze();
            let protocol = frame[2 + len_width];
            let payload = frame.slice(2 + len_width + 1..crc_at - 2);
            let serial = u16::from_be_bytes([frame[crc_at - 2], frame[crc_at - 1]]);
            self.stats.frames += 1;
            return Ok(Some(Frame {
                extended,
                protocol,
                payload,
                serial,
            }));
        }
    }
}

/// Outbound frames arrive pre-encoded from the per-connection write queue.
impl Encoder<Bytes> for Gt06Codec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

/// Generic acknowledgment echoing the inbound protocol and serial.
pub fn encode_ack(protocol: u8, serial: u16) -> Bytes {
    let mut body = [0u8; 4];
    body[0] = MIN_DECLARED_LENGTH as u8;
    body[1] = protocol;
    body[2..4].copy_from_slice(&serial.to_be_bytes());
    let crc = crc::checksum(&body);

    let mut buf = BytesMut::with_capacity(10);
    buf.put_u16(START_STANDARD);
    buf.put_slice(&body);
    buf.put_u16(crc);
    buf.put_u16(STOP_MARKER);
    buf.freeze()
}

/// Login acknowledgment, always protocol 0x01.
pub fn encode_login_ack(serial: u16) -> Bytes {
    encode_ack(MSG_LOGIN, serial)
}

// packet_len and cmd_len are single bytes, which bounds the ASCII command.
const MAX_COMMAND_CONTENT: usize = 0xFF - 10;

/// Server command frame (protocol 0x80):
/// `start | packet_len | 0x80 | cmd_len | server_flag(4) | ascii | language(2) | serial(2) | crc(2) | stop`
/// with `cmd_len = 4 + len(ascii) + 2` and `packet_len = cmd_len + 6`.
pub fn encode_command(
    content: &str,
    server_flag: u32,
    english: bool,
    serial: u16,
) -> Result<Bytes, Error> {
    let ascii = content.as_bytes();
    if ascii.len() > MAX_COMMAND_CONTENT {
        return Err(Error::decode(format!(
            "command content {} bytes exceeds frame limit",
            ascii.len()
        )));
    }
    let cmd_len = 4 + ascii.len() + 2;
    let packet_len = 1 + 1 + cmd_len + 2 + 2;

    let mut body = BytesMut::with_capacity(packet_len + 1);
    body.put_u8(packet_len as u8);
    body.put_u8(MSG_SERVER_COMMAND);
    body.put_u8(cmd_len as u8);
    body.put_u32(server_flag);
    body.put_slice(ascii);
    body.put_u16(if english {
        LANGUAGE_ENGLISH
    } else {
        LANGUAGE_CHINESE
    });
    body.put_u16(serial);
    let crc = crc::checksum(&body);

    let mut buf = BytesMut::with_capacity(body.len() + 6);
    buf.put_u16(START_STANDARD);
    buf.put(body);
    buf.put_u16(crc);
    buf.put_u16(STOP_MARKER);
    Ok(buf.freeze())
}

/// Builds a well-formed inbound frame around `payload`. Test scaffolding
/// shared by the protocol modules.
#[cfg(test)]
pub(crate) fn build_frame(protocol: u8, payload: &[u8], serial: u16) -> Vec<u8> {
    let declared = 1 + payload.len() + 2 + 2;
    let mut body = Vec::with_capacity(declared + 1);
    body.push(declared as u8);
    body.push(protocol);
    body.extend_from_slice(payload);
    body.extend_from_slice(&serial.to_be_bytes());
    let crc = crc::checksum(&body);

    let mut frame = Vec::with_capacity(declared + 7);
    frame.extend_from_slice(&START_STANDARD.to_be_bytes());
    frame.extend_from_slice(&body);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame.extend_from_slice(&STOP_MARKER.to_be_bytes());
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut Gt06Codec, bytes: &[u8]) -> Vec<Frame> {
        let mut buf = BytesMut::from(bytes);
        let mut out = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn decodes_login_frame() {
        let imei = [0x03, 0x51, 0x01, 0x11, 0x23, 0x45, 0x67, 0x89];
        let wire = build_frame(0x01, &imei, 0x0001);
        let mut codec = Gt06Codec::new();
        let frames = decode_all(&mut codec, &wire);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].protocol, 0x01);
        assert_eq!(&frames[0].payload[..], &imei);
        assert_eq!(frames[0].serial, 1);
        assert!(!frames[0].extended);
        assert_eq!(codec.stats().frames, 1);
    }

    #[test]
    fn decodes_extended_frame() {
        let payload = vec![0xAB; 300];
        let declared = 1 + payload.len() + 2 + 2;
        let mut body = Vec::new();
        body.extend_from_slice(&(declared as u16).to_be_bytes());
        body.push(0x21);
        body.extend_from_slice(&payload);
        body.extend_from_slice(&7u16.to_be_bytes());
        let crc = crc::checksum(&body);
        let mut wire = vec![0x79, 0x79];
        wire.extend_from_slice(&body);
        wire.extend_from_slice(&crc.to_be_bytes());
        wire.extend_from_slice(&[0x0D, 0x0A]);

        let mut codec = Gt06Codec::new();
        let frames = decode_all(&mut codec, &wire);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].extended);
        assert_eq!(frames[0].payload.len(), 300);
        assert_eq!(frames[0].serial, 7);
    }

    #[test]
    fn byte_at_a_time_trickle() {
        let wire = build_frame(0x13, &[0x45, 0x06, 0x04, 0x00, 0x01], 9);
        let mut codec = Gt06Codec::new();
        let mut buf = BytesMut::new();
        let mut got = None;
        for &b in &wire {
            buf.put_u8(b);
            if let Some(frame) = codec.decode(&mut buf).unwrap() {
                got = Some(frame);
            }
        }
        let frame = got.expect("frame after final byte");
        assert_eq!(frame.protocol, 0x13);
        assert_eq!(frame.serial, 9);
    }

    #[test]
    fn junk_before_frame_is_skipped() {
        let mut wire = vec![0x00, 0x42, 0x78, 0x11, 0x79];
        wire.extend_from_slice(&build_frame(0x12, &[0u8; 18], 3));
        let mut codec = Gt06Codec::new();
        let frames = decode_all(&mut codec, &wire);
        assert_eq!(frames.len(), 1);
        assert!(codec.stats().resyncs >= 1);
    }

    #[test]
    fn bad_stop_resyncs_to_next_frame() {
        let mut first = build_frame(0x13, &[0u8; 5], 1);
        let end = first.len();
        first[end - 1] = 0x00; // corrupt the stop marker
        let mut wire = first;
        wire.extend_from_slice(&build_frame(0x13, &[0u8; 5], 2));
        let mut codec = Gt06Codec::new();
        let frames = decode_all(&mut codec, &wire);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].serial, 2);
    }

    #[test]
    fn crc_off_by_one_bit_drops_frame() {
        let mut bad = build_frame(0x12, &[0u8; 18], 5);
        let crc_at = bad.len() - 4;
        bad[crc_at] ^= 0x01;
        let mut wire = bad;
        wire.extend_from_slice(&build_frame(0x12, &[0u8; 18], 6));
        let mut codec = Gt06Codec::new();
        let frames = decode_all(&mut codec, &wire);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].serial, 6);
        assert_eq!(codec.stats().crc_failures, 1);
    }

    #[test]
    fn declared_length_below_minimum_resyncs() {
        let mut wire = vec![0x78, 0x78, 0x04, 0x01, 0x00, 0x01, 0x00, 0x00, 0x0D, 0x0A];
        wire.extend_from_slice(&build_frame(0x23, &[], 4));
        let mut codec = Gt06Codec::new();
        let frames = decode_all(&mut codec, &wire);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].protocol, 0x23);
    }

    #[test]
    fn login_ack_is_bit_exact() {
        let ack = encode_login_ack(1);
        assert_eq!(
            &ack[..],
            &[0x78, 0x78, 0x05, 0x01, 0x00, 0x01, 0xD9, 0xDC, 0x0D, 0x0A]
        );
    }

    // Every generic ack must itself parse back to the echoed pair.
    #[test]
    fn ack_round_trip() {
        for (protocol, serial) in [(0x12u8, 0x0001u16), (0x13, 0xBEEF), (0xFF, 0xFFFF)] {
            let ack = encode_ack(protocol, serial);
            let mut codec = Gt06Codec::new();
            let frames = decode_all(&mut codec, &ack);
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].protocol, protocol);
            assert_eq!(frames[0].serial, serial);
            assert!(frames[0].payload.is_empty());
        }
    }

    #[test]
    fn command_frame_layout() {
        let wire = encode_command("DYD#", 1, true, 0x0042).unwrap();
        // start | packet_len | 0x80 | cmd_len | flag(4) | "DYD#" | lang | serial | crc | stop
        assert_eq!(&wire[..2], &[0x78, 0x78]);
        assert_eq!(wire[2], 16); // 1 + 1 + (4 + 4 + 2) + 2 + 2
        assert_eq!(wire[3], 0x80);
        assert_eq!(wire[4], 10); // 4 + 4 + 2
        assert_eq!(&wire[5..9], &[0, 0, 0, 1]);
        assert_eq!(&wire[9..13], b"DYD#");
        assert_eq!(&wire[13..15], &[0x00, 0x02]);
        assert_eq!(&wire[15..17], &[0x00, 0x42]);
        assert_eq!(&wire[wire.len() - 2..], &[0x0D, 0x0A]);

        // and it must parse back through the inbound decoder
        let mut codec = Gt06Codec::new();
        let frames = decode_all(&mut codec, &wire);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].protocol, 0x80);
        assert_eq!(frames[0].serial, 0x42);
    }

    #[test]
    fn oversized_command_rejected() {
        let long = "X".repeat(0xFF);
        assert!(encode_command(&long, 0, true, 1).is_err());
    }

    #[test]
    fn serial_counter_wraps_to_one() {
        let counter = SerialCounter::new();
        for _ in 0..0xFFFE {
            counter.next();
        }
        assert_eq!(counter.next(), 0xFFFF);
        assert_eq!(counter.next(), 1);
        assert_eq!(counter.next(), 2);
    }

    #[test]
    fn split_marker_across_reads() {
        let wire = build_frame(0x23, &[], 11);
        let mut codec = Gt06Codec::new();
        let mut buf = BytesMut::new();
        // junk ending with the first half of the start marker
        buf.extend_from_slice(&[0x01, 0x02, 0x78]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&wire[1..]);
        let frame = codec.decode(&mut buf).unwrap().expect("frame");
        assert_eq!(frame.protocol, 0x23);
    }
}
