//! Modbus/TCP application data unit codec.
//!
//! Wire layout, all multi-byte fields big-endian:
//!
//! | offset | field |
//! |--------|-------|
//! | 0-1 | transaction id (echoed) |
//! | 2-3 | protocol id (always 0) |
//! | 4-5 | length of the bytes that follow |
//! | 6 | unit id (echoed) |
//! | 7 | function code |
//! | 8.. | function data |

use bytes::{BufMut, BytesMut};
use thiserror::Error;

use super::protocol::{function_code::EXCEPTION_FLAG, ExceptionCode, MAX_ADU_LEN, MBAP_HEADER_LEN};

/// Minimum ADU: MBAP header plus a function code.
const MIN_ADU_LEN: usize = MBAP_HEADER_LEN + 1;

/// Offset of the length field; everything after it is counted by it.
const LENGTH_FIELD_END: usize = 6;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("packet of {len} bytes is shorter than the 8-byte minimum")]
    TooShort { len: usize },

    #[error("protocol id {0} is not Modbus (expected 0)")]
    InvalidProtocolId(u16),

    #[error("declared length {declared} does not match {actual} bytes present")]
    LengthMismatch { declared: u16, actual: usize },
}

/// One decoded Modbus/TCP ADU.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TcpFrame {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
    pub function: u8,
    pub data: Vec<u8>,
}

impl TcpFrame {
    /// Decode a single ADU. The packet must hold exactly the number of
    /// bytes announced by its length field.
    pub fn decode(packet: &[u8]) -> Result<Self, FrameError> {
        if packet.len() < MIN_ADU_LEN {
            return Err(FrameError::TooShort { len: packet.len() });
        }

        let protocol_id = be_u16(packet, 2);
        if protocol_id != 0 {
            return Err(FrameError::InvalidProtocolId(protocol_id));
        }

        let length = be_u16(packet, 4);
        let actual = packet.len() - LENGTH_FIELD_END;
        if usize::from(length) != actual {
            return Err(FrameError::LengthMismatch {
                declared: length,
                actual,
            });
        }

        Ok(Self {
            transaction_id: be_u16(packet, 0),
            protocol_id,
            length,
            unit_id: packet[6],
            function: packet[7],
            data: packet[MIN_ADU_LEN..].to_vec(),
        })
    }

    /// Encode to wire bytes. The length field is recomputed from the data.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(MIN_ADU_LEN + self.data.len());
        buf.put_u16(self.transaction_id);
        buf.put_u16(self.protocol_id);
        buf.put_u16(pdu_length(self.data.len()));
        buf.put_u8(self.unit_id);
        buf.put_u8(self.function);
        buf.put_slice(&self.data);
        buf.to_vec()
    }

    /// Response skeleton: same header and function code, no data.
    pub fn reply(&self) -> Self {
        Self {
            transaction_id: self.transaction_id,
            protocol_id: self.protocol_id,
            length: pdu_length(0),
            unit_id: self.unit_id,
            function: self.function,
            data: Vec::new(),
        }
    }

    pub fn set_data(&mut self, data: Vec<u8>) {
        self.length = pdu_length(data.len());
        self.data = data;
    }

    /// Turn the frame into an exception response.
    pub fn set_exception(&mut self, exception: ExceptionCode) {
        self.function |= EXCEPTION_FLAG;
        self.set_data(vec![exception.code()]);
    }

    /// The exception carried by this frame, if it is an exception response.
    pub fn exception(&self) -> Option<ExceptionCode> {
        if self.function & EXCEPTION_FLAG == 0 || self.data.len() != 1 {
            return None;
        }
        ExceptionCode::try_from(self.data[0]).ok()
    }

    pub fn set_data_with_register_and_number(&mut self, register: u16, number: u16) {
        let mut data = Vec::with_capacity(4);
        data.extend_from_slice(&register.to_be_bytes());
        data.extend_from_slice(&number.to_be_bytes());
        self.set_data(data);
    }

    /// Address, quantity, byte count and big-endian register values, as
    /// sent in a write multiple registers request.
    pub fn set_data_with_register_and_number_and_values(
        &mut self,
        register: u16,
        number: u16,
        values: &[u16],
    ) {
        self.set_data_with_register_and_number_and_bytes(
            register,
            number,
            &registers_to_bytes(values),
        );
    }

    pub fn set_data_with_register_and_number_and_bytes(
        &mut self,
        register: u16,
        number: u16,
        bytes: &[u8],
    ) {
        let mut data = Vec::with_capacity(5 + bytes.len());
        data.extend_from_slice(&register.to_be_bytes());
        data.extend_from_slice(&number.to_be_bytes());
        data.push(u8::try_from(bytes.len()).unwrap_or(u8::MAX));
        data.extend_from_slice(bytes);
        self.set_data(data);
    }
}

/// Received bytes cut at MBAP boundaries.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SplitPacket<'a> {
    /// Leading bytes that do not start a well-formed ADU.
    pub discarded: &'a [u8],
    /// Complete ADUs in arrival order.
    pub adus: Vec<&'a [u8]>,
    /// Start of an ADU whose remaining bytes have not arrived yet.
    pub partial: &'a [u8],
}

impl SplitPacket<'_> {
    /// Bytes that can be released from the receive buffer.
    pub fn consumed(&self) -> usize {
        self.discarded.len() + self.adus.iter().map(|adu| adu.len()).sum::<usize>()
    }
}

enum Header {
    Length(usize),
    Incomplete,
    Invalid,
}

/// Split received bytes into ADUs using each MBAP length field.
///
/// Pipelined requests come back as separate slices. When the bytes do not
/// line up (a truncated request followed by another one), the split
/// resynchronizes on the earliest offset from which the rest is made of
/// well-formed headers only, and everything before it is discarded.
pub fn split_packet(packet: &[u8]) -> SplitPacket<'_> {
    (0..=packet.len())
        .find_map(|start| {
            cover(&packet[start..]).map(|(adus, partial)| SplitPacket {
                discarded: &packet[..start],
                adus,
                partial,
            })
        })
        .unwrap_or(SplitPacket {
            discarded: packet,
            ..Default::default()
        })
}

// Complete ADUs followed by at most one plausible fragment, or None.
fn cover(mut rest: &[u8]) -> Option<(Vec<&[u8]>, &[u8])> {
    let mut adus = Vec::new();
    while !rest.is_empty() {
        match check_header(rest) {
            Header::Length(total) if total <= rest.len() => {
                let (adu, tail) = rest.split_at(total);
                adus.push(adu);
                rest = tail;
            }
            Header::Length(_) | Header::Incomplete => break,
            Header::Invalid => return None,
        }
    }
    Some((adus, rest))
}

fn check_header(bytes: &[u8]) -> Header {
    // protocol id and the high length byte are always zero
    if [2, 3, 4].iter().any(|&i| bytes.get(i).is_some_and(|b| *b != 0)) {
        return Header::Invalid;
    }
    if bytes.len() < LENGTH_FIELD_END {
        return Header::Incomplete;
    }

    let length = usize::from(be_u16(bytes, 4));
    if !(MIN_ADU_LEN - LENGTH_FIELD_END..=MAX_ADU_LEN - LENGTH_FIELD_END).contains(&length) {
        return Header::Invalid;
    }
    Header::Length(LENGTH_FIELD_END + length)
}

/// Pack booleans LSB-first: bit 0 of the first byte is the first value.
pub fn pack_bits(values: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; values.len().div_ceil(8)];
    for (i, _) in values.iter().enumerate().filter(|(_, on)| **on) {
        bytes[i / 8] |= 1 << (i % 8);
    }
    bytes
}

/// Inverse of [`pack_bits`]; reads `quantity` bits. Missing bytes read as 0.
pub fn unpack_bits(bytes: &[u8], quantity: usize) -> Vec<bool> {
    (0..quantity)
        .map(|i| bytes.get(i / 8).map_or(false, |b| b & (1 << (i % 8)) != 0))
        .collect()
}

pub fn registers_to_bytes(values: &[u16]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_be_bytes()).collect()
}

pub fn bytes_to_registers(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

pub(crate) fn be_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

// unit id + function code + payload
fn pdu_length(payload_len: usize) -> u16 {
    u16::try_from(2 + payload_len).unwrap_or(u16::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_read_holding_request() {
        let packet = [0, 1, 0, 0, 0, 6, 0xFF, 3, 0, 0, 0, 1];
        let frame = TcpFrame::decode(&packet).unwrap();

        assert_eq!(frame.transaction_id, 1);
        assert_eq!(frame.protocol_id, 0);
        assert_eq!(frame.length, 6);
        assert_eq!(frame.unit_id, 0xFF);
        assert_eq!(frame.function, 3);
        assert_eq!(frame.data, vec![0, 0, 0, 1]);
    }

    #[test]
    fn test_encode_decode_keeps_frame() {
        let mut frame = TcpFrame {
            transaction_id: 0x1234,
            unit_id: 7,
            function: 16,
            ..Default::default()
        };
        frame.set_data_with_register_and_number_and_values(1, 2, &[3, 4]);

        let decoded = TcpFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_decode_rejects_short_packet() {
        assert_eq!(
            TcpFrame::decode(&[0, 1, 0, 0]),
            Err(FrameError::TooShort { len: 4 })
        );
    }

    #[test]
    fn test_decode_rejects_protocol_id() {
        let packet = [0, 1, 0, 5, 0, 6, 0, 3, 0, 0, 0, 1];
        assert_eq!(TcpFrame::decode(&packet), Err(FrameError::InvalidProtocolId(5)));
    }

    #[test]
    fn test_decode_rejects_truncated_frame() {
        let packet = [0, 1, 0, 0, 0, 6, 0, 3, 0, 0, 0];
        assert_eq!(
            TcpFrame::decode(&packet),
            Err(FrameError::LengthMismatch { declared: 6, actual: 5 })
        );
    }

    #[test]
    fn test_register_and_number() {
        let mut frame = TcpFrame::default();
        frame.set_data_with_register_and_number(0, 64);
        assert_eq!(frame.data, vec![0, 0, 0, 64]);
        assert_eq!(frame.length, 6);
    }

    #[test]
    fn test_register_and_number_and_values() {
        let mut frame = TcpFrame::default();
        frame.set_data_with_register_and_number_and_values(7, 2, &[3, 4]);
        assert_eq!(frame.data, vec![0, 7, 0, 2, 4, 0, 3, 0, 4]);
    }

    #[test]
    fn test_exception_frame() {
        let request = TcpFrame::decode(&[0, 9, 0, 0, 0, 2, 1, 0x2B]).unwrap();
        let mut response = request.reply();
        response.set_exception(ExceptionCode::IllegalFunction);

        assert_eq!(response.exception(), Some(ExceptionCode::IllegalFunction));
        assert_eq!(response.encode(), vec![0, 9, 0, 0, 0, 3, 1, 0xAB, 1]);
    }

    #[test]
    fn test_split_packet_pipelined() {
        let first = [0, 1, 0, 0, 0, 6, 0, 3, 0, 0, 0, 1];
        let second = [0, 2, 0, 0, 0, 6, 0, 4, 0, 0, 0, 2];
        let tail = [0u8, 3, 0];
        let packet = [&first[..], &second[..], &tail[..]].concat();

        let split = split_packet(&packet);
        assert!(split.discarded.is_empty());
        assert_eq!(split.adus, vec![&first[..], &second[..]]);
        assert_eq!(split.partial, &tail[..]);
        assert_eq!(split.consumed(), 24);
    }

    #[test]
    fn test_split_packet_keeps_incomplete_frame() {
        let truncated = [0, 1, 0, 0, 0, 6, 0, 3, 0, 0, 0];
        let split = split_packet(&truncated);
        assert!(split.adus.is_empty());
        assert_eq!(split.partial, &truncated[..]);
        assert_eq!(split.consumed(), 0);
    }

    #[test]
    fn test_split_packet_skips_truncated_frame() {
        let truncated = [0, 1, 0, 0, 0, 6, 0, 3, 0, 0, 0];
        let valid = [0, 2, 0, 0, 0, 6, 0, 3, 0, 0, 0, 1];
        let packet = [&truncated[..], &valid[..]].concat();

        let split = split_packet(&packet);
        assert_eq!(split.discarded, &truncated[..]);
        assert_eq!(split.adus, vec![&valid[..]]);
        assert!(split.partial.is_empty());
        assert_eq!(split.consumed(), packet.len());
    }

    #[test]
    fn test_split_packet_skips_foreign_protocol() {
        let foreign = [0, 7, 0, 1, 0, 6, 0, 3, 0, 0, 0, 1];
        let split = split_packet(&foreign);
        assert!(split.adus.is_empty());
        assert_eq!(split.discarded.len() + split.partial.len(), foreign.len());
    }

    #[test]
    fn test_pack_bits_lsb_first() {
        let mut values = vec![true; 9];
        values.extend([false; 7]);
        assert_eq!(pack_bits(&values), vec![255, 1]);
        assert_eq!(pack_bits(&[false, true, false, true]), vec![0b1010]);
        assert_eq!(unpack_bits(&[0b1010], 4), vec![false, true, false, true]);
    }
}
