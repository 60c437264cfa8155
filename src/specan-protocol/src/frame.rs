// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Binary frame encoding for the streaming channel.
//!
//! Wire format (all multi-byte fields big-endian):
//!
//! ```text
//! Offset  Size  Field
//! 0       1     version (0x02)
//! 1       1     message_type
//! 2       2     flags
//! 4       4     payload_length
//! 8       ...   payload
//! ```
//!
//! Message types: `0x01` spectrum, `0x02` JSON (status / error / signal
//! event), `0x03` sweep segment, `0x04` sweep panorama.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use specan_core::{DeviceStatus, DspFrame};

pub const PROTOCOL_VERSION: u8 = 0x02;

pub const MSG_SPECTRUM: u8 = 0x01;
pub const MSG_JSON: u8 = 0x02;
pub const MSG_SWEEP_SEGMENT: u8 = 0x03;
pub const MSG_SWEEP_PANORAMA: u8 = 0x04;

pub const FLAG_PEAK_HOLD: u16 = 0x0001;
pub const FLAG_SWEEP_COMPLETE: u16 = 0x0002;
pub const FLAG_SWEEP_IN_PROGRESS: u16 = 0x0004;

/// Reject frames claiming more than this much payload (64 MB).
const MAX_PAYLOAD_LEN: u32 = 64 * 1024 * 1024;

const SPECTRUM_HEADER_LEN: usize = 56;
const SWEEP_SEGMENT_HEADER_LEN: usize = 44;
const SWEEP_PANORAMA_HEADER_LEN: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub message_type: u8,
    pub flags: u16,
    pub payload_len: u32,
}

impl FrameHeader {
    pub const SIZE: usize = 8;

    pub fn parse(buf: &[u8]) -> Result<Self, String> {
        if buf.len() < Self::SIZE {
            return Err(format!("frame header truncated: {} bytes", buf.len()));
        }
        let mut b = buf;
        let version = b.get_u8();
        let message_type = b.get_u8();
        let flags = b.get_u16();
        let payload_len = b.get_u32();
        if version != PROTOCOL_VERSION {
            return Err(format!("unsupported protocol version: {:#04x}", version));
        }
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(format!("payload too large: {} bytes", payload_len));
        }
        Ok(Self {
            version,
            message_type,
            flags,
            payload_len,
        })
    }
}

fn put_frame_header(buf: &mut BytesMut, message_type: u8, flags: u16, payload_len: usize) {
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(message_type);
    buf.put_u16(flags);
    buf.put_u32(payload_len as u32);
}

/// Encode one spectrum frame. The peak-hold trace is appended after the
/// spectrum and advertised via `FLAG_PEAK_HOLD` when present.
pub fn encode_spectrum_packet(
    status: &DeviceStatus,
    fft_size: u32,
    frame: &DspFrame,
    timestamp: f64,
) -> Bytes {
    let num_bins = frame.spectrum.len();
    let mut flags = 0u16;
    let mut payload_len = SPECTRUM_HEADER_LEN + num_bins * 4;
    if frame.peak_hold.is_some() {
        flags |= FLAG_PEAK_HOLD;
        payload_len += num_bins * 4;
    }

    let mut buf = BytesMut::with_capacity(FrameHeader::SIZE + payload_len);
    put_frame_header(&mut buf, MSG_SPECTRUM, flags, payload_len);

    buf.put_f64(status.center_freq);
    buf.put_f64(status.sample_rate);
    buf.put_f64(status.bandwidth);
    buf.put_f32(status.gain as f32);
    buf.put_u32(fft_size);
    buf.put_u32(num_bins as u32);
    buf.put_f32(frame.noise_floor);
    buf.put_f32(frame.peak_power);
    buf.put_f32(frame.peak_freq_offset);
    buf.put_f64(timestamp);

    for &v in &frame.spectrum {
        buf.put_f32(v);
    }
    if let Some(ph) = &frame.peak_hold {
        for &v in ph {
            buf.put_f32(v);
        }
    }
    buf.freeze()
}

/// Decoded spectrum packet, for clients and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumPacket {
    pub flags: u16,
    pub center_freq: f64,
    pub sample_rate: f64,
    pub bandwidth: f64,
    pub gain: f32,
    pub fft_size: u32,
    pub num_bins: u32,
    pub noise_floor: f32,
    pub peak_power: f32,
    pub peak_freq_offset: f32,
    pub timestamp: f64,
    pub spectrum: Vec<f32>,
    pub peak_hold: Option<Vec<f32>>,
}

impl SpectrumPacket {
    pub fn decode(packet: &[u8]) -> Result<Self, String> {
        let header = FrameHeader::parse(packet)?;
        if header.message_type != MSG_SPECTRUM {
            return Err(format!("not a spectrum frame: {:#04x}", header.message_type));
        }
        let payload = payload_of(packet, &header)?;
        if payload.len() < SPECTRUM_HEADER_LEN {
            return Err("spectrum payload truncated".into());
        }

        let mut b = payload;
        let center_freq = b.get_f64();
        let sample_rate = b.get_f64();
        let bandwidth = b.get_f64();
        let gain = b.get_f32();
        let fft_size = b.get_u32();
        let num_bins = b.get_u32();
        let noise_floor = b.get_f32();
        let peak_power = b.get_f32();
        let peak_freq_offset = b.get_f32();
        let timestamp = b.get_f64();

        let n = num_bins as usize;
        let has_peak_hold = header.flags & FLAG_PEAK_HOLD != 0;
        let expected = n * 4 * if has_peak_hold { 2 } else { 1 };
        if b.remaining() != expected {
            return Err(format!(
                "spectrum payload size mismatch: {} != {}",
                b.remaining(),
                expected
            ));
        }

        let spectrum = read_f32s(&mut b, n);
        let peak_hold = has_peak_hold.then(|| read_f32s(&mut b, n));

        Ok(Self {
            flags: header.flags,
            center_freq,
            sample_rate,
            bandwidth,
            gain,
            fft_size,
            num_bins,
            noise_floor,
            peak_power,
            peak_freq_offset,
            timestamp,
            spectrum,
            peak_hold,
        })
    }
}

/// Encode an incremental sweep segment. The last segment carries
/// `FLAG_SWEEP_COMPLETE`; every other one `FLAG_SWEEP_IN_PROGRESS`.
#[allow(clippy::too_many_arguments)]
pub fn encode_sweep_segment_packet(
    sweep_id: u32,
    segment_idx: u16,
    total_segments: u16,
    freq_start: f64,
    freq_end: f64,
    sweep_start: f64,
    sweep_end: f64,
    spectrum: &[f32],
) -> Bytes {
    let flags = if segment_idx + 1 == total_segments {
        FLAG_SWEEP_COMPLETE
    } else {
        FLAG_SWEEP_IN_PROGRESS
    };
    let payload_len = SWEEP_SEGMENT_HEADER_LEN + spectrum.len() * 4;
    let mut buf = BytesMut::with_capacity(FrameHeader::SIZE + payload_len);
    put_frame_header(&mut buf, MSG_SWEEP_SEGMENT, flags, payload_len);

    buf.put_u32(sweep_id);
    buf.put_u16(segment_idx);
    buf.put_u16(total_segments);
    buf.put_f64(freq_start);
    buf.put_f64(freq_end);
    buf.put_f64(sweep_start);
    buf.put_f64(sweep_end);
    buf.put_u32(spectrum.len() as u32);
    for &v in spectrum {
        buf.put_f32(v);
    }
    buf.freeze()
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepSegmentPacket {
    pub flags: u16,
    pub sweep_id: u32,
    pub segment_idx: u16,
    pub total_segments: u16,
    pub freq_start: f64,
    pub freq_end: f64,
    pub sweep_start: f64,
    pub sweep_end: f64,
    pub spectrum: Vec<f32>,
}

impl SweepSegmentPacket {
    pub fn decode(packet: &[u8]) -> Result<Self, String> {
        let header = FrameHeader::parse(packet)?;
        if header.message_type != MSG_SWEEP_SEGMENT {
            return Err(format!(
                "not a sweep segment frame: {:#04x}",
                header.message_type
            ));
        }
        let payload = payload_of(packet, &header)?;
        if payload.len() < SWEEP_SEGMENT_HEADER_LEN {
            return Err("sweep segment payload truncated".into());
        }

        let mut b = payload;
        let sweep_id = b.get_u32();
        let segment_idx = b.get_u16();
        let total_segments = b.get_u16();
        let freq_start = b.get_f64();
        let freq_end = b.get_f64();
        let sweep_start = b.get_f64();
        let sweep_end = b.get_f64();
        let num_bins = b.get_u32() as usize;
        if b.remaining() != num_bins * 4 {
            return Err("sweep segment size mismatch".into());
        }
        let spectrum = read_f32s(&mut b, num_bins);

        Ok(Self {
            flags: header.flags,
            sweep_id,
            segment_idx,
            total_segments,
            freq_start,
            freq_end,
            sweep_start,
            sweep_end,
            spectrum,
        })
    }
}

/// Encode a complete stitched panorama. `sweep_mode` is 0 for survey,
/// 1 for band monitor; `FLAG_SWEEP_COMPLETE` is always set.
pub fn encode_sweep_panorama_packet(
    sweep_id: u32,
    sweep_mode: u8,
    freq_start: f64,
    freq_end: f64,
    sweep_time_ms: f32,
    timestamp: f64,
    spectrum: &[f32],
) -> Bytes {
    let payload_len = SWEEP_PANORAMA_HEADER_LEN + spectrum.len() * 4;
    let mut buf = BytesMut::with_capacity(FrameHeader::SIZE + payload_len);
    put_frame_header(&mut buf, MSG_SWEEP_PANORAMA, FLAG_SWEEP_COMPLETE, payload_len);

    buf.put_u32(sweep_id);
    buf.put_u8(sweep_mode);
    buf.put_bytes(0, 3); // padding
    buf.put_f64(freq_start);
    buf.put_f64(freq_end);
    buf.put_u32(spectrum.len() as u32);
    buf.put_f32(sweep_time_ms);
    buf.put_f64(timestamp);
    for &v in spectrum {
        buf.put_f32(v);
    }
    buf.freeze()
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepPanoramaPacket {
    pub flags: u16,
    pub sweep_id: u32,
    pub sweep_mode: u8,
    pub freq_start: f64,
    pub freq_end: f64,
    pub sweep_time_ms: f32,
    pub timestamp: f64,
    pub spectrum: Vec<f32>,
}

impl SweepPanoramaPacket {
    pub fn decode(packet: &[u8]) -> Result<Self, String> {
        let header = FrameHeader::parse(packet)?;
        if header.message_type != MSG_SWEEP_PANORAMA {
            return Err(format!(
                "not a sweep panorama frame: {:#04x}",
                header.message_type
            ));
        }
        let payload = payload_of(packet, &header)?;
        if payload.len() < SWEEP_PANORAMA_HEADER_LEN {
            return Err("sweep panorama payload truncated".into());
        }

        let mut b = payload;
        let sweep_id = b.get_u32();
        let sweep_mode = b.get_u8();
        b.advance(3);
        let freq_start = b.get_f64();
        let freq_end = b.get_f64();
        let num_bins = b.get_u32() as usize;
        let sweep_time_ms = b.get_f32();
        let timestamp = b.get_f64();
        if b.remaining() != num_bins * 4 {
            return Err("sweep panorama size mismatch".into());
        }
        let spectrum = read_f32s(&mut b, num_bins);

        Ok(Self {
            flags: header.flags,
            sweep_id,
            sweep_mode,
            freq_start,
            freq_end,
            sweep_time_ms,
            timestamp,
            spectrum,
        })
    }
}

/// Wrap serialized JSON in a `MSG_JSON` frame so text messages share the
/// self-delimiting stream with binary spectrum data.
pub fn encode_json_frame(json: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FrameHeader::SIZE + json.len());
    put_frame_header(&mut buf, MSG_JSON, 0, json.len());
    buf.put_slice(json);
    buf.freeze()
}

fn payload_of<'a>(packet: &'a [u8], header: &FrameHeader) -> Result<&'a [u8], String> {
    let expected = FrameHeader::SIZE + header.payload_len as usize;
    if packet.len() != expected {
        return Err(format!(
            "frame length {} != header-declared {}",
            packet.len(),
            expected
        ));
    }
    Ok(&packet[FrameHeader::SIZE..])
}

fn read_f32s(buf: &mut &[u8], n: usize) -> Vec<f32> {
    (0..n).map(|_| buf.get_f32()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status() -> DeviceStatus {
        DeviceStatus {
            center_freq: 100.25e6,
            sample_rate: 2e6,
            bandwidth: 1.75e6,
            gain: 37.5,
            running: true,
        }
    }

    fn frame(peak_hold: bool) -> DspFrame {
        DspFrame {
            spectrum: vec![-100.5, -42.25, -3.125, -99.0],
            peak_hold: peak_hold.then(|| vec![-90.0, -40.0, -1.0, -95.5]),
            noise_floor: -101.25,
            peak_power: -3.125,
            peak_freq_offset: 0.125,
        }
    }

    #[test]
    fn spectrum_round_trip_exact() {
        let packet = encode_spectrum_packet(&status(), 2048, &frame(false), 1234.5);
        let decoded = SpectrumPacket::decode(&packet).unwrap();

        assert_eq!(decoded.center_freq, 100.25e6);
        assert_eq!(decoded.sample_rate, 2e6);
        assert_eq!(decoded.bandwidth, 1.75e6);
        assert_eq!(decoded.gain, 37.5);
        assert_eq!(decoded.fft_size, 2048);
        assert_eq!(decoded.num_bins, 4);
        assert_eq!(decoded.noise_floor, -101.25);
        assert_eq!(decoded.peak_power, -3.125);
        assert_eq!(decoded.peak_freq_offset, 0.125);
        assert_eq!(decoded.timestamp, 1234.5);
        // Samples must survive bit-identically.
        for (a, b) in decoded.spectrum.iter().zip(frame(false).spectrum.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
        assert!(decoded.peak_hold.is_none());
        assert_eq!(decoded.flags & FLAG_PEAK_HOLD, 0);
    }

    #[test]
    fn spectrum_carries_peak_hold_when_present() {
        let packet = encode_spectrum_packet(&status(), 1024, &frame(true), 0.0);
        let decoded = SpectrumPacket::decode(&packet).unwrap();
        assert_ne!(decoded.flags & FLAG_PEAK_HOLD, 0);
        let ph = decoded.peak_hold.unwrap();
        assert_eq!(ph, frame(true).peak_hold.unwrap());
    }

    #[test]
    fn frame_header_layout() {
        let packet = encode_spectrum_packet(&status(), 2048, &frame(false), 0.0);
        assert_eq!(packet[0], PROTOCOL_VERSION);
        assert_eq!(packet[1], MSG_SPECTRUM);
        let header = FrameHeader::parse(&packet).unwrap();
        assert_eq!(
            header.payload_len as usize,
            packet.len() - FrameHeader::SIZE
        );
        // 56-byte inner header + 4 bins.
        assert_eq!(header.payload_len, 56 + 16);
    }

    #[test]
    fn segment_round_trip_and_flags() {
        let spectrum = vec![-80.0f32; 16];
        let mid = encode_sweep_segment_packet(7, 2, 5, 108e6, 124e6, 100e6, 200e6, &spectrum);
        let decoded = SweepSegmentPacket::decode(&mid).unwrap();
        assert_eq!(decoded.sweep_id, 7);
        assert_eq!(decoded.segment_idx, 2);
        assert_eq!(decoded.total_segments, 5);
        assert_eq!(decoded.freq_start, 108e6);
        assert_eq!(decoded.freq_end, 124e6);
        assert_eq!(decoded.sweep_start, 100e6);
        assert_eq!(decoded.sweep_end, 200e6);
        assert_eq!(decoded.spectrum, spectrum);
        assert_eq!(decoded.flags, FLAG_SWEEP_IN_PROGRESS);

        let last = encode_sweep_segment_packet(7, 4, 5, 0.0, 0.0, 0.0, 0.0, &spectrum);
        let decoded = SweepSegmentPacket::decode(&last).unwrap();
        assert_eq!(decoded.flags, FLAG_SWEEP_COMPLETE);
    }

    #[test]
    fn panorama_round_trip() {
        let spectrum: Vec<f32> = (0..64).map(|i| -(i as f32) / 3.0).collect();
        let packet =
            encode_sweep_panorama_packet(3, 1, 100e6, 200e6, 1523.5, 999.25, &spectrum);
        let decoded = SweepPanoramaPacket::decode(&packet).unwrap();
        assert_eq!(decoded.sweep_id, 3);
        assert_eq!(decoded.sweep_mode, 1);
        assert_eq!(decoded.freq_start, 100e6);
        assert_eq!(decoded.freq_end, 200e6);
        assert_eq!(decoded.sweep_time_ms, 1523.5);
        assert_eq!(decoded.timestamp, 999.25);
        assert_eq!(decoded.spectrum, spectrum);
        assert_ne!(decoded.flags & FLAG_SWEEP_COMPLETE, 0);
    }

    #[test]
    fn json_frame_is_typed_and_sized() {
        let packet = encode_json_frame(br#"{"type":"status"}"#);
        let header = FrameHeader::parse(&packet).unwrap();
        assert_eq!(header.message_type, MSG_JSON);
        assert_eq!(header.payload_len as usize, 17);
        assert_eq!(&packet[8..], br#"{"type":"status"}"#);
    }

    #[test]
    fn rejects_bad_version_and_truncation() {
        let mut packet = encode_spectrum_packet(&status(), 2048, &frame(false), 0.0).to_vec();
        packet[0] = 0x01;
        assert!(FrameHeader::parse(&packet).is_err());

        let good = encode_spectrum_packet(&status(), 2048, &frame(false), 0.0);
        assert!(SpectrumPacket::decode(&good[..good.len() - 1]).is_err());
        assert!(FrameHeader::parse(&good[..4]).is_err());
    }
}
