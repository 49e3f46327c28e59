// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Network Abstraction Layer (NAL) unit framing and emulation prevention.
//!
//! Takes a byte-aligned [`BitstreamBuffer`] holding a raw byte sequence
//! payload (RBSP) — NAL header bits included, as the orchestrator writes
//! them directly into the buffer before handing it here — and turns it into
//! an owned, start-code-prefixed NAL unit with emulation-prevention bytes
//! (EPBs) inserted wherever the raw payload would otherwise contain a
//! sequence that could be mistaken for a start code.

use crate::bitstream::BitstreamBuffer;

/// The four-byte Annex B start-code prefix every NAL unit begins with.
pub const START_CODE_PREFIX: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// An owned, immutable NAL unit: start-code prefix followed by the escaped
/// RBSP payload, tagged with the header values it was packed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NalUnit {
    nal_ref_idc: u8,
    nal_unit_type: NalUnitType,
    bytes: Vec<u8>,
}

impl NalUnit {
    /// `nal_ref_idc` this unit was packed with.
    pub fn nal_ref_idc(&self) -> u8 {
        self.nal_ref_idc
    }

    /// `nal_unit_type` this unit was packed with.
    pub fn nal_unit_type(&self) -> NalUnitType {
        self.nal_unit_type
    }

    /// The complete encapsulated byte sequence, start code included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume the unit, returning its backing byte buffer.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Byte-align `bitstream`, then frame and escape it into a fresh [`NalUnit`].
///
/// `bitstream` must already hold the NAL header bits, the RBSP payload, and
/// the trailing `rbsp_stop_one_bit`; this function calls
/// [`BitstreamBuffer::align`] defensively before reading it. `nal_ref_idc`
/// and `nal_unit_type` are not re-encoded here — the caller has already
/// written the matching header bits into `bitstream` — they are carried on
/// the returned unit purely as metadata for the orchestrator and its tests.
pub fn pack(bitstream: &mut BitstreamBuffer, nal_ref_idc: u8, nal_unit_type: NalUnitType) -> NalUnit {
    bitstream.align();
    let rbsp = bitstream.as_bytes();

    let mut bytes = Vec::with_capacity(START_CODE_PREFIX.len() + rbsp.len() + rbsp.len() / 3 + 1);
    bytes.extend_from_slice(&START_CODE_PREFIX);
    escape_rbsp(rbsp, &mut bytes);
    NalUnit {
        nal_ref_idc,
        nal_unit_type,
        bytes,
    }
}

/// Returns true for bytes that would be ambiguous as the third byte of a
/// `00 00 0X` forbidden pattern, i.e. `X` in `{0, 1, 2, 3}`.
#[inline]
fn is_forbidden_third_byte(b: u8) -> bool {
    b & 0xFC == 0x00
}

/// Append the emulation-prevention-escaped form of `rbsp` to `out`.
///
/// Scans `rbsp` left to right. On a `00 00 0X` match, copies the two zero
/// bytes, inserts `0x03`, then copies the third byte and resumes scanning
/// three bytes ahead (matching the reference hardware's windowing exactly,
/// rather than re-testing the consumed bytes). On no match, copies one byte
/// and advances by one, so overlapping windows starting at every position
/// are still considered. Finally, if the RBSP's last byte is `0x00`, a
/// trailing `0x03` is appended, since a NAL unit must never end in `0x00`.
fn escape_rbsp(rbsp: &[u8], out: &mut Vec<u8>) {
    let len = rbsp.len();
    let mut i = 0;
    while i + 3 <= len {
        let (b0, b1, b2) = (rbsp[i], rbsp[i + 1], rbsp[i + 2]);
        if b0 == 0x00 && b1 == 0x00 && is_forbidden_third_byte(b2) {
            out.push(b0);
            out.push(b1);
            out.push(0x03);
            out.push(b2);
            i += 3;
        } else {
            out.push(b0);
            i += 1;
        }
    }
    out.extend_from_slice(&rbsp[i..]);

    if rbsp.last() == Some(&0x00) {
        out.push(0x03);
    }
}

/// Strip the start-code prefix and drop every emulation-prevention byte,
/// recovering the original RBSP. Used only by tests to check the packer's
/// round-trip property; real decoding happens in the hardware/driver.
#[cfg(test)]
fn unescape(nal: &[u8]) -> Vec<u8> {
    assert_eq!(&nal[..4], &START_CODE_PREFIX);
    let payload = &nal[4..];
    let mut out = Vec::with_capacity(payload.len());
    let mut zero_run = 0u32;
    for &b in payload {
        if zero_run >= 2 && b == 0x03 {
            zero_run = 0;
            continue;
        }
        out.push(b);
        zero_run = if b == 0x00 { zero_run + 1 } else { 0 };
    }
    out
}

/// Values for the `nal_unit_type` field, as written into the NAL header
/// bits by the orchestrator when it builds SPS, PPS and slice NAL units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalUnitType {
    CodedSliceOfANonIdrPicture,
    CodedSliceOfAnIdrPicture,
    SequenceParameterSet,
    PictureParameterSet,
}

impl NalUnitType {
    pub fn value(self) -> u32 {
        match self {
            Self::CodedSliceOfANonIdrPicture => 1,
            Self::CodedSliceOfAnIdrPicture => 5,
            Self::SequenceParameterSet => 7,
            Self::PictureParameterSet => 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // S2 — EPB insertion (spec.md S2).
    #[test]
    fn test_epb_insertion_scenario() {
        let mut bv = BitstreamBuffer::new();
        bv.append_bits(0x00, 8).unwrap();
        bv.append_bits(0x00, 8).unwrap();
        bv.append_bits(0x00, 8).unwrap();
        bv.append_bits(0x01, 8).unwrap();
        let nal = pack(&mut bv, 3, NalUnitType::SequenceParameterSet);
        assert_eq!(
            nal.as_bytes(),
            &[0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x03, 0x00, 0x01]
        );
    }

    // S3 — trailing-zero escape (spec.md S3).
    #[test]
    fn test_trailing_zero_escape_scenario() {
        let mut bv = BitstreamBuffer::new();
        bv.append_bits(0xaa, 8).unwrap();
        bv.append_bits(0x00, 8).unwrap();
        let nal = pack(&mut bv, 3, NalUnitType::PictureParameterSet);
        assert_eq!(nal.as_bytes(), &[0x00, 0x00, 0x00, 0x01, 0xaa, 0x00, 0x03]);
    }

    #[test]
    fn test_no_escape_needed() {
        let mut bv = BitstreamBuffer::new();
        bv.append_bits(0x67, 8).unwrap();
        bv.append_bits(0x42, 8).unwrap();
        let nal = pack(&mut bv, 3, NalUnitType::SequenceParameterSet);
        assert_eq!(nal.as_bytes(), &[0x00, 0x00, 0x00, 0x01, 0x67, 0x42]);
    }

    // Invariant 5: output begins with the start code.
    #[test]
    fn test_output_begins_with_start_code() {
        let mut bv = BitstreamBuffer::new();
        bv.append_bits(0x12, 8).unwrap();
        let nal = pack(&mut bv, 1, NalUnitType::CodedSliceOfAnIdrPicture);
        assert_eq!(&nal.as_bytes()[..4], &START_CODE_PREFIX);
    }

    // Invariant 6 & 7: no 00 00 0X after the prefix, never ends in 0x00.
    #[test]
    fn test_no_forbidden_pattern_and_no_trailing_zero() {
        let mut long_zeros = BitstreamBuffer::new();
        for _ in 0..8 {
            long_zeros.append_bits(0x00, 8).unwrap();
        }
        let nal = pack(&mut long_zeros, 0, NalUnitType::CodedSliceOfANonIdrPicture);
        let body = &nal.as_bytes()[4..];
        for w in body.windows(3) {
            // A raw 00 00 03 is the escape itself, not a survivor: only
            // X in {0,1,2} would still be ambiguous with a start code.
            assert!(
                !(w[0] == 0x00 && w[1] == 0x00 && matches!(w[2], 0x00 | 0x01 | 0x02)),
                "forbidden pattern survived escaping: {w:?}"
            );
        }
        assert_ne!(*body.last().unwrap(), 0x00);
    }

    // Invariant 8: strip-prefix/drop-EPB recovers the exact RBSP input.
    #[test]
    fn test_roundtrip_various_inputs() {
        let cases: &[&[u8]] = &[
            &[0x00],
            &[0x01],
            &[0xaa, 0x00],
            &[0x00, 0x00, 0x00, 0x01],
            &[0x00, 0x00, 0x01, 0x00, 0x00, 0x02],
            &[0x00; 12],
            &[0x64, 0x00, 0x0a, 0xac, 0x72, 0x84, 0x44, 0x26, 0x84, 0x00, 0x00, 0x00],
        ];
        for rbsp in cases {
            let mut bv = BitstreamBuffer::new();
            for &byte in rbsp.iter() {
                bv.append_bits(byte as u32, 8).unwrap();
            }
            let nal = pack(&mut bv, 1, NalUnitType::CodedSliceOfANonIdrPicture);
            assert_eq!(&unescape(nal.as_bytes()), rbsp);
        }
    }

    #[test]
    fn test_nal_unit_type_values() {
        assert_eq!(NalUnitType::CodedSliceOfANonIdrPicture.value(), 1);
        assert_eq!(NalUnitType::CodedSliceOfAnIdrPicture.value(), 5);
        assert_eq!(NalUnitType::SequenceParameterSet.value(), 7);
        assert_eq!(NalUnitType::PictureParameterSet.value(), 8);
    }

    #[test]
    fn test_metadata_carried_on_unit() {
        let mut bv = BitstreamBuffer::new();
        bv.append_bits(0x01, 8).unwrap();
        let nal = pack(&mut bv, 2, NalUnitType::PictureParameterSet);
        assert_eq!(nal.nal_ref_idc(), 2);
        assert_eq!(nal.nal_unit_type(), NalUnitType::PictureParameterSet);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_roundtrip(rbsp in proptest::collection::vec(any::<u8>(), 1..64)) {
            let mut bv = BitstreamBuffer::new();
            for byte in &rbsp {
                bv.append_bits(*byte as u32, 8).unwrap();
            }
            let nal = pack(&mut bv, 1, NalUnitType::CodedSliceOfANonIdrPicture);
            prop_assert_eq!(unescape(nal.as_bytes()), rbsp);
        }
    }
}
