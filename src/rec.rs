//! Record-level framing: header byte, variable-length size prefix, and the
//! termination record.
//!
//! A record starts with one type-and-flags byte (high bit always set, bit 4
//! flags an "important" record, low nibble is the type) followed by a
//! UTF-8-style variable-length payload size:
//!
//! | first size byte       | follow bytes | value bits |
//! |-----------------------|--------------|------------|
//! | `0xxxxxxx`            | 0            | 7          |
//! | `110xxxxx`            | 1            | 11         |
//! | `1110xxxx`            | 2            | 16         |
//! | `11110xxx`            | 3            | 21         |
//! | `111110xx`            | 4            | 26         |
//! | `1111110x`            | 5            | 31         |
//!
//! Encoders are free to use a longer-than-minimal form; decoders accept any
//! form but cap the value at 31 bits and insist that every continuation
//! byte carries the `10xxxxxx` tag.
//!
//! The termination record is fixed-size (16 bytes on the wire) and carries
//! the unit byte count plus an optional rolling-CRC checkpoint.

use crate::err::{SsmError, SsmResult};

// ─────────────────────────────────────────────────────────────────────────────
// Type-and-flags byte
// ─────────────────────────────────────────────────────────────────────────────

/// Always-set marker bit of the type-and-flags byte.
pub const REC_HDR_FIXED: u8 = 0x80;
/// Important records must be understood; others may be skipped by a
/// forward-compatible reader.
pub const REC_HDR_IMPORTANT: u8 = 0x10;
/// Reserved bits; must read back as zero.
pub const REC_HDR_RESERVED: u8 = 0x60;
/// Low nibble: record type.
pub const REC_TYPE_MASK: u8 = 0x0f;

/// Record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecType {
    /// Ends the current unit; fixed 16-byte wire size.
    Term = 1,
    /// Raw payload of the declared length.
    Raw = 2,
    /// LZF block: one decompressed-KiB byte followed by compressed data.
    RawLzf = 3,
    /// Run of implicit zero bytes: one-byte payload holding the KiB count.
    RawZero = 4,
    /// Reserved; never emitted.
    Named = 5,
}

impl RecType {
    pub fn from_u8(v: u8) -> Option<RecType> {
        match v {
            1 => Some(RecType::Term),
            2 => Some(RecType::Raw),
            3 => Some(RecType::RawLzf),
            4 => Some(RecType::RawZero),
            5 => Some(RecType::Named),
            _ => None,
        }
    }
}

/// Validate a type-and-flags byte and extract the type.
pub fn parse_type_and_flags(b: u8) -> SsmResult<RecType> {
    if b & REC_HDR_FIXED == 0 || b & REC_HDR_RESERVED != 0 {
        return Err(SsmError::IntegrityRecHdr);
    }
    RecType::from_u8(b & REC_TYPE_MASK).ok_or(SsmError::IntegrityRecHdr)
}

// ─────────────────────────────────────────────────────────────────────────────
// Variable-length size prefix
// ─────────────────────────────────────────────────────────────────────────────

/// Largest encodable payload size (31 bits).
pub const REC_SIZE_MAX: u32 = 0x7fff_ffff;

/// Worst-case encoded record header: type byte plus six size bytes.
pub const REC_HDR_MAX: usize = 1 + 6;

/// Encode `cb` into `out` using the minimal form; returns the byte count.
pub fn encode_size(cb: u32, out: &mut [u8; 6]) -> usize {
    debug_assert!(cb <= REC_SIZE_MAX);
    if cb < 0x80 {
        out[0] = cb as u8;
        1
    } else if cb < 0x800 {
        out[0] = 0xc0 | (cb >> 6) as u8;
        out[1] = 0x80 | (cb & 0x3f) as u8;
        2
    } else if cb < 0x1_0000 {
        out[0] = 0xe0 | (cb >> 12) as u8;
        out[1] = 0x80 | ((cb >> 6) & 0x3f) as u8;
        out[2] = 0x80 | (cb & 0x3f) as u8;
        3
    } else if cb < 0x20_0000 {
        out[0] = 0xf0 | (cb >> 18) as u8;
        out[1] = 0x80 | ((cb >> 12) & 0x3f) as u8;
        out[2] = 0x80 | ((cb >> 6) & 0x3f) as u8;
        out[3] = 0x80 | (cb & 0x3f) as u8;
        4
    } else if cb < 0x400_0000 {
        out[0] = 0xf8 | (cb >> 24) as u8;
        out[1] = 0x80 | ((cb >> 18) & 0x3f) as u8;
        out[2] = 0x80 | ((cb >> 12) & 0x3f) as u8;
        out[3] = 0x80 | ((cb >> 6) & 0x3f) as u8;
        out[4] = 0x80 | (cb & 0x3f) as u8;
        5
    } else {
        out[0] = 0xfc | (cb >> 30) as u8;
        out[1] = 0x80 | ((cb >> 24) & 0x3f) as u8;
        out[2] = 0x80 | ((cb >> 18) & 0x3f) as u8;
        out[3] = 0x80 | ((cb >> 12) & 0x3f) as u8;
        out[4] = 0x80 | ((cb >> 6) & 0x3f) as u8;
        out[5] = 0x80 | (cb & 0x3f) as u8;
        6
    }
}

/// Assemble a complete record header into `out`; returns the byte count.
pub fn encode_rec_hdr(rec_type: RecType, important: bool, cb: u32, out: &mut [u8; REC_HDR_MAX]) -> usize {
    out[0] = REC_HDR_FIXED | if important { REC_HDR_IMPORTANT } else { 0 } | rec_type as u8;
    let mut size = [0u8; 6];
    let n = encode_size(cb, &mut size);
    out[1..1 + n].copy_from_slice(&size[..n]);
    1 + n
}

/// Number of continuation bytes implied by the first size byte, plus the
/// value bits it contributes.
pub fn decode_size_first(b0: u8) -> SsmResult<(u32, usize)> {
    match b0.leading_ones() {
        0 => Ok((u32::from(b0), 0)),
        2 => Ok((u32::from(b0 & 0x1f), 1)),
        3 => Ok((u32::from(b0 & 0x0f), 2)),
        4 => Ok((u32::from(b0 & 0x07), 3)),
        5 => Ok((u32::from(b0 & 0x03), 4)),
        6 => Ok((u32::from(b0 & 0x01), 5)),
        // A lone continuation byte (10xxxxxx) or the 0xFE/0xFF forms.
        _ => Err(SsmError::IntegrityRecHdr),
    }
}

/// Fold continuation bytes into the value started by [`decode_size_first`].
pub fn fold_size(mut value: u32, follow: &[u8]) -> SsmResult<u32> {
    for &b in follow {
        if b & 0xc0 != 0x80 {
            return Err(SsmError::IntegrityRecHdr);
        }
        value = (value << 6) | u32::from(b & 0x3f);
    }
    if value > REC_SIZE_MAX {
        return Err(SsmError::IntegrityRecHdr);
    }
    Ok(value)
}

/// Convenience slice decode (used by tests and the v2 reader's buffered
/// path): returns the value and the number of bytes consumed.
pub fn decode_size(bytes: &[u8]) -> SsmResult<(u32, usize)> {
    let b0 = *bytes.first().ok_or(SsmError::IntegrityRecHdr)?;
    let (initial, n_follow) = decode_size_first(b0)?;
    if bytes.len() < 1 + n_follow {
        return Err(SsmError::IntegrityRecHdr);
    }
    Ok((fold_size(initial, &bytes[1..1 + n_follow])?, 1 + n_follow))
}

// ─────────────────────────────────────────────────────────────────────────────
// Termination record
// ─────────────────────────────────────────────────────────────────────────────

/// Total wire size of a termination record.
pub const REC_TERM_SIZE: usize = 16;
/// Declared payload length in the terminator's own header.
pub const REC_TERM_CB: u8 = (REC_TERM_SIZE - 2) as u8;
/// Terminator flag: the rolling-CRC checkpoint field is valid.
pub const REC_TERM_FLAG_CRC32: u16 = 0x0001;

/// Decoded termination record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecTerm {
    pub flags: u16,
    /// Rolling CRC over every stream byte before this record (when flagged).
    pub stream_crc: u32,
    /// Unit payload byte count, terminator included.
    pub cb_unit: u64,
}

impl RecTerm {
    /// Serialize, header bytes included.
    pub fn to_bytes(&self) -> [u8; REC_TERM_SIZE] {
        let mut out = [0u8; REC_TERM_SIZE];
        out[0] = REC_HDR_FIXED | REC_HDR_IMPORTANT | RecType::Term as u8;
        out[1] = REC_TERM_CB;
        out[2..4].copy_from_slice(&self.flags.to_le_bytes());
        out[4..8].copy_from_slice(&self.stream_crc.to_le_bytes());
        out[8..16].copy_from_slice(&self.cb_unit.to_le_bytes());
        out
    }

    /// Decode the 14 payload bytes following a terminator's two header bytes.
    pub fn from_payload(p: &[u8; REC_TERM_SIZE - 2]) -> SsmResult<RecTerm> {
        let flags = u16::from_le_bytes([p[0], p[1]]);
        if flags & !REC_TERM_FLAG_CRC32 != 0 {
            return Err(SsmError::IntegrityRecTerm);
        }
        Ok(RecTerm {
            flags,
            stream_crc: u32::from_le_bytes([p[2], p[3], p[4], p[5]]),
            cb_unit: u64::from_le_bytes([p[6], p[7], p[8], p[9], p[10], p[11], p[12], p[13]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_roundtrip_boundaries() {
        let boundaries = [
            0u32, 1, 0x7e, 0x7f, 0x80, 0x7fe, 0x7ff, 0x800, 0xffff, 0x1_0000, 0x1f_ffff,
            0x20_0000, 0x3ff_ffff, 0x400_0000, 0x7fff_fffe, 0x7fff_ffff,
        ];
        for &v in &boundaries {
            let mut buf = [0u8; 6];
            let n = encode_size(v, &mut buf);
            let (got, used) = decode_size(&buf[..n]).unwrap();
            assert_eq!(got, v);
            assert_eq!(used, n);
        }
    }

    /// Stride across the whole 31-bit range; every value must survive.
    #[test]
    fn size_roundtrip_strided_sweep() {
        let mut v = 0u64;
        while v <= u64::from(REC_SIZE_MAX) {
            let cb = v as u32;
            let mut buf = [0u8; 6];
            let n = encode_size(cb, &mut buf);
            assert_eq!(decode_size(&buf[..n]).unwrap(), (cb, n));
            v += 65_521; // prime stride so every byte pattern class is hit
        }
    }

    #[test]
    fn non_minimal_encodings_are_accepted() {
        // 5 in the two-byte form.
        assert_eq!(decode_size(&[0xc0, 0x85]).unwrap(), (5, 2));
        // 5 in the three-byte form.
        assert_eq!(decode_size(&[0xe0, 0x80, 0x85]).unwrap(), (5, 3));
    }

    #[test]
    fn bad_continuation_tags_are_rejected() {
        assert_eq!(decode_size(&[0xc0, 0x45]), Err(SsmError::IntegrityRecHdr));
        assert_eq!(decode_size(&[0xe0, 0x80, 0xc5]), Err(SsmError::IntegrityRecHdr));
        // Lone continuation byte cannot start a size.
        assert_eq!(decode_size(&[0x80]), Err(SsmError::IntegrityRecHdr));
        // 0xFE / 0xFF first bytes are outside the table.
        assert_eq!(decode_size(&[0xfe, 0x80]), Err(SsmError::IntegrityRecHdr));
        assert_eq!(decode_size(&[0xff, 0x80]), Err(SsmError::IntegrityRecHdr));
    }

    #[test]
    fn type_and_flags_validation() {
        assert_eq!(
            parse_type_and_flags(REC_HDR_FIXED | RecType::Raw as u8).unwrap(),
            RecType::Raw
        );
        assert_eq!(
            parse_type_and_flags(REC_HDR_FIXED | REC_HDR_IMPORTANT | 1).unwrap(),
            RecType::Term
        );
        // High bit clear.
        assert_eq!(parse_type_and_flags(0x02), Err(SsmError::IntegrityRecHdr));
        // Reserved bits set.
        assert_eq!(parse_type_and_flags(0xe2), Err(SsmError::IntegrityRecHdr));
        // Unknown type.
        assert_eq!(parse_type_and_flags(0x8f), Err(SsmError::IntegrityRecHdr));
        assert_eq!(parse_type_and_flags(0x80), Err(SsmError::IntegrityRecHdr));
    }

    #[test]
    fn term_record_roundtrip() {
        let term = RecTerm {
            flags: REC_TERM_FLAG_CRC32,
            stream_crc: 0xdead_beef,
            cb_unit: 0x0123_4567_89ab,
        };
        let wire = term.to_bytes();
        assert_eq!(wire.len(), REC_TERM_SIZE);
        assert_eq!(wire[0] & REC_TYPE_MASK, RecType::Term as u8);
        assert_eq!(wire[1], REC_TERM_CB);
        let mut payload = [0u8; REC_TERM_SIZE - 2];
        payload.copy_from_slice(&wire[2..]);
        assert_eq!(RecTerm::from_payload(&payload).unwrap(), term);
    }

    #[test]
    fn term_record_unknown_flags_rejected() {
        let mut payload = [0u8; REC_TERM_SIZE - 2];
        payload[0] = 0x02;
        assert_eq!(
            RecTerm::from_payload(&payload),
            Err(SsmError::IntegrityRecTerm)
        );
    }

    #[test]
    fn rec_hdr_assembles_type_and_size() {
        let mut out = [0u8; REC_HDR_MAX];
        let n = encode_rec_hdr(RecType::Raw, true, 4096, &mut out);
        assert_eq!(out[0], REC_HDR_FIXED | REC_HDR_IMPORTANT | 2);
        assert_eq!(decode_size(&out[1..n]).unwrap(), (4096, n - 1));
    }
}
