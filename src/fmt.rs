//! On-disk layouts: file header, unit headers, directory and footer for the
//! current format generation (V2.0), plus the read-only legacy V1.x header.
//!
//! All multi-byte integers are stored little-endian.  Every header carries
//! its own CRC-32 computed with the CRC field zeroed; the rolling stream
//! CRC is layered on top by the stream itself.

use crate::err::{SsmError, SsmResult};

// ─────────────────────────────────────────────────────────────────────────────
// Magics
// ─────────────────────────────────────────────────────────────────────────────

/// 32-byte file magic, current generation.
pub const MAGIC_V2_0: [u8; 32] = *b"\x7fVirtualBox SavedState V2.0\n\0\0\0\0";
/// Legacy read-only generations.
pub const MAGIC_V1_1: [u8; 32] = *b"\x7fVirtualBox SavedState V1.1\n\0\0\0\0";
pub const MAGIC_V1_2: [u8; 32] = *b"\x7fVirtualBox SavedState V1.2\n\0\0\0\0";

/// 8-byte unit-header magics.
pub const UNIT_MAGIC: [u8; 8] = *b"\nUnit\n\0\0";
pub const UNIT_MAGIC_END: [u8; 8] = *b"\nTheEnd\0";

/// Directory and footer magics.
pub const DIR_MAGIC: [u8; 8] = *b"\nDir\n\0\0\0";
pub const FOOTER_MAGIC: [u8; 8] = *b"\nFooter\0";

// ─────────────────────────────────────────────────────────────────────────────
// Sizes and limits
// ─────────────────────────────────────────────────────────────────────────────

pub const FILE_HDR_SIZE: usize = 64;
pub const UNIT_HDR_FIXED_SIZE: usize = 44;
pub const FOOTER_SIZE: usize = 32;
pub const DIR_FIXED_SIZE: usize = 16;
pub const DIR_ENTRY_SIZE: usize = 16;
pub const V1_FILE_HDR_SIZE: usize = 64;
pub const V1_UNIT_HDR_FIXED_SIZE: usize = 28;

/// Unit name limit, terminating NUL included.
pub const UNIT_NAME_MAX: usize = 48;

/// The final, stop-the-world pass.
pub const SSM_PASS_FINAL: u32 = u32::MAX;

/// File-header flag: the rolling stream CRC is maintained.
pub const FILE_FLAGS_STREAM_CRC32: u32 = 0x0000_0001;
/// File-header flag: the file was produced by a live save.
pub const FILE_FLAGS_LIVE_SAVE: u32 = 0x0000_0002;

/// Upper bound for a decompressed record payload.
pub const MAX_DECOMPR_SIZE: u32 = 4096;

/// Directory entries with a zero offset are tolerated for files written by
/// binaries older than this revision (they exist in the wild); newer
/// revisions treat them as corruption.
pub const DIR_ENTRY_OFF_ZERO_REV: u32 = 53_365;

/// Revision word stamped into headers written by this crate.
pub const STREAM_REV: u32 = 60_000;

/// CRC-32 of a unit name, NUL excluded (directory key material).
pub fn name_crc(name: &str) -> u32 {
    crc32fast::hash(name.as_bytes())
}

// ─────────────────────────────────────────────────────────────────────────────
// File header (V2.0)
// ─────────────────────────────────────────────────────────────────────────────

/// Decoded V2 file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHdr {
    pub ver_major: u16,
    pub ver_minor: u16,
    pub ver_build: u32,
    pub svn_rev: u32,
    pub host_bits: u8,
    pub cb_gc_phys: u8,
    pub cb_gc_ptr: u8,
    pub c_units: u32,
    pub flags: u32,
    pub cb_max_decompr: u32,
}

impl FileHdr {
    pub fn to_bytes(&self) -> [u8; FILE_HDR_SIZE] {
        let mut b = [0u8; FILE_HDR_SIZE];
        b[..32].copy_from_slice(&MAGIC_V2_0);
        b[32..34].copy_from_slice(&self.ver_major.to_le_bytes());
        b[34..36].copy_from_slice(&self.ver_minor.to_le_bytes());
        b[36..40].copy_from_slice(&self.ver_build.to_le_bytes());
        b[40..44].copy_from_slice(&self.svn_rev.to_le_bytes());
        b[44] = self.host_bits;
        b[45] = self.cb_gc_phys;
        b[46] = self.cb_gc_ptr;
        b[47] = 0;
        b[48..52].copy_from_slice(&self.c_units.to_le_bytes());
        b[52..56].copy_from_slice(&self.flags.to_le_bytes());
        b[56..60].copy_from_slice(&self.cb_max_decompr.to_le_bytes());
        let crc = crc32fast::hash(&b[..60]);
        b[60..64].copy_from_slice(&crc.to_le_bytes());
        b
    }

    /// Parse and validate a V2 header (the magic must already match).
    pub fn from_bytes(b: &[u8; FILE_HDR_SIZE]) -> SsmResult<FileHdr> {
        if b[..32] != MAGIC_V2_0 {
            return Err(SsmError::IntegrityMagic);
        }
        let stored_crc = u32::from_le_bytes([b[60], b[61], b[62], b[63]]);
        if crc32fast::hash(&b[..60]) != stored_crc {
            return Err(SsmError::IntegrityCrc);
        }
        let hdr = FileHdr {
            ver_major: u16::from_le_bytes([b[32], b[33]]),
            ver_minor: u16::from_le_bytes([b[34], b[35]]),
            ver_build: u32::from_le_bytes([b[36], b[37], b[38], b[39]]),
            svn_rev: u32::from_le_bytes([b[40], b[41], b[42], b[43]]),
            host_bits: b[44],
            cb_gc_phys: b[45],
            cb_gc_ptr: b[46],
            c_units: u32::from_le_bytes([b[48], b[49], b[50], b[51]]),
            flags: u32::from_le_bytes([b[52], b[53], b[54], b[55]]),
            cb_max_decompr: u32::from_le_bytes([b[56], b[57], b[58], b[59]]),
        };
        if b[47] != 0 {
            return Err(SsmError::IntegrityHeader);
        }
        if hdr.host_bits != 32 && hdr.host_bits != 64 {
            return Err(SsmError::IntegrityHeader);
        }
        if hdr.cb_gc_phys != 4 && hdr.cb_gc_phys != 8 {
            return Err(SsmError::IntegrityHeader);
        }
        if hdr.cb_gc_ptr != 4 && hdr.cb_gc_ptr != 8 {
            return Err(SsmError::IntegrityHeader);
        }
        if hdr.flags & !(FILE_FLAGS_STREAM_CRC32 | FILE_FLAGS_LIVE_SAVE) != 0 {
            return Err(SsmError::IntegrityHeader);
        }
        if hdr.cb_max_decompr < 1024
            || hdr.cb_max_decompr > MAX_DECOMPR_SIZE
            || hdr.cb_max_decompr % 256 != 0
        {
            return Err(SsmError::IntegrityHeader);
        }
        if hdr.ver_major == 0 {
            return Err(SsmError::IntegrityBuildVersion);
        }
        Ok(hdr)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Unit header (V2.0)
// ─────────────────────────────────────────────────────────────────────────────

/// Decoded V2 unit header (regular or end marker).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitHdr {
    pub end: bool,
    /// Absolute stream offset of the header's first byte.
    pub off_stream: u64,
    /// Rolling stream CRC just before this header was written.
    pub cur_stream_crc: u32,
    pub version: u32,
    pub instance: u32,
    pub pass: u32,
    pub name: String,
}

impl UnitHdr {
    /// Wire size for a unit with the given name (NUL included on the wire).
    pub fn wire_size(name: &str) -> usize {
        UNIT_HDR_FIXED_SIZE + name.len() + 1
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let cb_name = if self.end { 0 } else { self.name.len() + 1 };
        let mut b = vec![0u8; UNIT_HDR_FIXED_SIZE + cb_name];
        b[..8].copy_from_slice(if self.end { &UNIT_MAGIC_END } else { &UNIT_MAGIC });
        b[8..16].copy_from_slice(&self.off_stream.to_le_bytes());
        b[16..20].copy_from_slice(&self.cur_stream_crc.to_le_bytes());
        // b[20..24] = header CRC, zero while hashing.
        b[24..28].copy_from_slice(&self.version.to_le_bytes());
        b[28..32].copy_from_slice(&self.instance.to_le_bytes());
        b[32..36].copy_from_slice(&self.pass.to_le_bytes());
        b[36..40].copy_from_slice(&0u32.to_le_bytes());
        b[40..44].copy_from_slice(&(cb_name as u32).to_le_bytes());
        if cb_name > 0 {
            b[44..44 + self.name.len()].copy_from_slice(self.name.as_bytes());
        }
        let crc = crc32fast::hash(&b);
        b[20..24].copy_from_slice(&crc.to_le_bytes());
        b
    }

    /// Name length (NUL included) announced by a raw fixed part, so the
    /// reader knows how much more to fetch.  Also validates the magic.
    pub fn peek_cb_name(fixed: &[u8; UNIT_HDR_FIXED_SIZE]) -> SsmResult<(bool, usize)> {
        let end = match &fixed[..8] {
            m if m == UNIT_MAGIC => false,
            m if m == UNIT_MAGIC_END => true,
            _ => return Err(SsmError::IntegrityUnitMagic),
        };
        let cb_name = u32::from_le_bytes([fixed[40], fixed[41], fixed[42], fixed[43]]) as usize;
        if end && cb_name != 0 {
            return Err(SsmError::IntegrityUnit);
        }
        if !end && (cb_name < 2 || cb_name > UNIT_NAME_MAX) {
            return Err(SsmError::IntegrityUnit);
        }
        Ok((end, cb_name))
    }

    /// Parse a complete header (fixed part plus name bytes).
    pub fn from_bytes(b: &[u8]) -> SsmResult<UnitHdr> {
        if b.len() < UNIT_HDR_FIXED_SIZE {
            return Err(SsmError::IntegrityUnit);
        }
        let mut fixed = [0u8; UNIT_HDR_FIXED_SIZE];
        fixed.copy_from_slice(&b[..UNIT_HDR_FIXED_SIZE]);
        let (end, cb_name) = Self::peek_cb_name(&fixed)?;
        if b.len() != UNIT_HDR_FIXED_SIZE + cb_name {
            return Err(SsmError::IntegrityUnit);
        }

        let stored_crc = u32::from_le_bytes([b[20], b[21], b[22], b[23]]);
        let mut hashed = b.to_vec();
        hashed[20..24].copy_from_slice(&[0; 4]);
        if crc32fast::hash(&hashed) != stored_crc {
            return Err(SsmError::IntegrityUnit);
        }

        let flags = u32::from_le_bytes([b[36], b[37], b[38], b[39]]);
        if flags != 0 {
            return Err(SsmError::IntegrityUnit);
        }

        let name = if end {
            String::new()
        } else {
            let raw = &b[UNIT_HDR_FIXED_SIZE..];
            if raw[cb_name - 1] != 0 || raw[..cb_name - 1].contains(&0) {
                return Err(SsmError::IntegrityUnit);
            }
            std::str::from_utf8(&raw[..cb_name - 1])
                .map_err(|_| SsmError::IntegrityUnit)?
                .to_string()
        };

        Ok(UnitHdr {
            end,
            off_stream: u64::from_le_bytes([b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15]]),
            cur_stream_crc: u32::from_le_bytes([b[16], b[17], b[18], b[19]]),
            version: u32::from_le_bytes([b[24], b[25], b[26], b[27]]),
            instance: u32::from_le_bytes([b[28], b[29], b[30], b[31]]),
            pass: u32::from_le_bytes([b[32], b[33], b[34], b[35]]),
            name,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Directory
// ─────────────────────────────────────────────────────────────────────────────

/// One directory entry: where a unit's (final) header lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    pub off: u64,
    pub instance: u32,
    /// CRC-32 of the unit name without the terminating NUL.
    pub name_crc: u32,
}

/// Trailing unit-lookup table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Dir {
    pub entries: Vec<DirEntry>,
}

impl Dir {
    pub fn wire_size(&self) -> usize {
        DIR_FIXED_SIZE + self.entries.len() * DIR_ENTRY_SIZE
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = vec![0u8; self.wire_size()];
        b[..8].copy_from_slice(&DIR_MAGIC);
        // b[8..12] = CRC of everything from the entry count on.
        b[12..16].copy_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for (i, e) in self.entries.iter().enumerate() {
            let off = DIR_FIXED_SIZE + i * DIR_ENTRY_SIZE;
            b[off..off + 8].copy_from_slice(&e.off.to_le_bytes());
            b[off + 8..off + 12].copy_from_slice(&e.instance.to_le_bytes());
            b[off + 12..off + 16].copy_from_slice(&e.name_crc.to_le_bytes());
        }
        let crc = crc32fast::hash(&b[12..]);
        b[8..12].copy_from_slice(&crc.to_le_bytes());
        b
    }

    pub fn from_bytes(b: &[u8]) -> SsmResult<Dir> {
        if b.len() < DIR_FIXED_SIZE {
            return Err(SsmError::IntegrityDir);
        }
        if b[..8] != DIR_MAGIC {
            return Err(SsmError::IntegrityDirMagic);
        }
        let stored_crc = u32::from_le_bytes([b[8], b[9], b[10], b[11]]);
        let count = u32::from_le_bytes([b[12], b[13], b[14], b[15]]) as usize;
        if b.len() != DIR_FIXED_SIZE + count * DIR_ENTRY_SIZE {
            return Err(SsmError::IntegrityDir);
        }
        if crc32fast::hash(&b[12..]) != stored_crc {
            return Err(SsmError::IntegrityDir);
        }
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let off = DIR_FIXED_SIZE + i * DIR_ENTRY_SIZE;
            entries.push(DirEntry {
                off: u64::from_le_bytes([
                    b[off], b[off + 1], b[off + 2], b[off + 3], b[off + 4], b[off + 5],
                    b[off + 6], b[off + 7],
                ]),
                instance: u32::from_le_bytes([b[off + 8], b[off + 9], b[off + 10], b[off + 11]]),
                name_crc: u32::from_le_bytes([b[off + 12], b[off + 13], b[off + 14], b[off + 15]]),
            });
        }
        Ok(Dir { entries })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Footer
// ─────────────────────────────────────────────────────────────────────────────

/// Final 32-byte record of a V2 file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    /// Absolute stream offset of the footer itself.
    pub off_stream: u64,
    /// Final rolling stream CRC (0 when checksumming is off).
    pub stream_crc: u32,
    pub c_dir_entries: u32,
}

impl Footer {
    pub fn to_bytes(&self) -> [u8; FOOTER_SIZE] {
        let mut b = [0u8; FOOTER_SIZE];
        b[..8].copy_from_slice(&FOOTER_MAGIC);
        b[8..16].copy_from_slice(&self.off_stream.to_le_bytes());
        b[16..20].copy_from_slice(&self.stream_crc.to_le_bytes());
        b[20..24].copy_from_slice(&self.c_dir_entries.to_le_bytes());
        b[24..28].copy_from_slice(&0u32.to_le_bytes());
        let crc = crc32fast::hash(&b[..28]);
        b[28..32].copy_from_slice(&crc.to_le_bytes());
        b
    }

    pub fn from_bytes(b: &[u8; FOOTER_SIZE]) -> SsmResult<Footer> {
        if b[..8] != FOOTER_MAGIC {
            return Err(SsmError::IntegrityFooter);
        }
        let stored_crc = u32::from_le_bytes([b[28], b[29], b[30], b[31]]);
        if crc32fast::hash(&b[..28]) != stored_crc {
            return Err(SsmError::IntegrityFooter);
        }
        if u32::from_le_bytes([b[24], b[25], b[26], b[27]]) != 0 {
            return Err(SsmError::IntegrityFooter);
        }
        Ok(Footer {
            off_stream: u64::from_le_bytes([b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15]]),
            stream_crc: u32::from_le_bytes([b[16], b[17], b[18], b[19]]),
            c_dir_entries: u32::from_le_bytes([b[20], b[21], b[22], b[23]]),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Legacy V1.x header (load-only)
// ─────────────────────────────────────────────────────────────────────────────

/// Decoded legacy file header.  The CRC field covers the whole file except
/// itself and is verified by the loader, which has the full byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHdrV1 {
    pub ver_minor: u16,
    pub crc: u32,
    /// Zero in v1.1 files (width unknown; the caller supplies it).
    pub host_bits: u8,
    pub cb_gc_phys: u8,
    pub cb_gc_ptr: u8,
    pub ver_build: u32,
}

impl FileHdrV1 {
    pub fn to_bytes(&self) -> [u8; V1_FILE_HDR_SIZE] {
        let mut b = [0u8; V1_FILE_HDR_SIZE];
        b[..32].copy_from_slice(if self.ver_minor == 1 { &MAGIC_V1_1 } else { &MAGIC_V1_2 });
        b[32..36].copy_from_slice(&self.crc.to_le_bytes());
        // b[36..40] reserved, b[40..56] machine UUID: all zero.
        b[56] = self.host_bits;
        b[57] = self.cb_gc_phys;
        b[58] = self.cb_gc_ptr;
        b[60..64].copy_from_slice(&self.ver_build.to_le_bytes());
        b
    }

    pub fn from_bytes(b: &[u8; V1_FILE_HDR_SIZE]) -> SsmResult<FileHdrV1> {
        let ver_minor = if b[..32] == MAGIC_V1_1 {
            1
        } else if b[..32] == MAGIC_V1_2 {
            2
        } else {
            return Err(SsmError::IntegrityMagic);
        };
        if b[40..56].iter().any(|&x| x != 0) {
            return Err(SsmError::IntegrityHeader);
        }
        if b[59] != 0 {
            return Err(SsmError::IntegrityHeader);
        }
        let hdr = FileHdrV1 {
            ver_minor,
            crc: u32::from_le_bytes([b[32], b[33], b[34], b[35]]),
            host_bits: b[56],
            cb_gc_phys: b[57],
            cb_gc_ptr: b[58],
            ver_build: u32::from_le_bytes([b[60], b[61], b[62], b[63]]),
        };
        if ver_minor >= 2 {
            if hdr.host_bits != 32 && hdr.host_bits != 64 {
                return Err(SsmError::IntegrityHeader);
            }
            if hdr.cb_gc_phys != 4 && hdr.cb_gc_phys != 8 {
                return Err(SsmError::IntegrityHeader);
            }
            if hdr.cb_gc_ptr != 4 && hdr.cb_gc_ptr != 8 {
                return Err(SsmError::IntegrityHeader);
            }
        }
        Ok(hdr)
    }
}

/// Decoded legacy unit header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitHdrV1 {
    pub end: bool,
    /// Payload byte count following the name.
    pub cb_unit: u64,
    pub version: u32,
    pub instance: u32,
    pub name: String,
}

impl UnitHdrV1 {
    pub fn to_bytes(&self) -> Vec<u8> {
        let cb_name = if self.end { 0 } else { self.name.len() + 1 };
        let mut b = vec![0u8; V1_UNIT_HDR_FIXED_SIZE + cb_name];
        b[..8].copy_from_slice(if self.end { &UNIT_MAGIC_END } else { &UNIT_MAGIC });
        b[8..16].copy_from_slice(&self.cb_unit.to_le_bytes());
        b[16..20].copy_from_slice(&self.version.to_le_bytes());
        b[20..24].copy_from_slice(&self.instance.to_le_bytes());
        b[24..28].copy_from_slice(&(cb_name as u32).to_le_bytes());
        if cb_name > 0 {
            b[28..28 + self.name.len()].copy_from_slice(self.name.as_bytes());
        }
        b
    }

    pub fn peek_cb_name(fixed: &[u8; V1_UNIT_HDR_FIXED_SIZE]) -> SsmResult<(bool, usize)> {
        let end = match &fixed[..8] {
            m if m == UNIT_MAGIC => false,
            m if m == UNIT_MAGIC_END => true,
            _ => return Err(SsmError::IntegrityUnitMagic),
        };
        let cb_name = u32::from_le_bytes([fixed[24], fixed[25], fixed[26], fixed[27]]) as usize;
        if end && cb_name != 0 {
            return Err(SsmError::IntegrityUnit);
        }
        if !end && (cb_name < 2 || cb_name > UNIT_NAME_MAX) {
            return Err(SsmError::IntegrityUnit);
        }
        Ok((end, cb_name))
    }

    pub fn from_bytes(b: &[u8]) -> SsmResult<UnitHdrV1> {
        if b.len() < V1_UNIT_HDR_FIXED_SIZE {
            return Err(SsmError::IntegrityUnit);
        }
        let mut fixed = [0u8; V1_UNIT_HDR_FIXED_SIZE];
        fixed.copy_from_slice(&b[..V1_UNIT_HDR_FIXED_SIZE]);
        let (end, cb_name) = Self::peek_cb_name(&fixed)?;
        if b.len() != V1_UNIT_HDR_FIXED_SIZE + cb_name {
            return Err(SsmError::IntegrityUnit);
        }
        let name = if end {
            String::new()
        } else {
            let raw = &b[V1_UNIT_HDR_FIXED_SIZE..];
            if raw[cb_name - 1] != 0 || raw[..cb_name - 1].contains(&0) {
                return Err(SsmError::IntegrityUnit);
            }
            std::str::from_utf8(&raw[..cb_name - 1])
                .map_err(|_| SsmError::IntegrityUnit)?
                .to_string()
        };
        Ok(UnitHdrV1 {
            end,
            cb_unit: u64::from_le_bytes([b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15]]),
            version: u32::from_le_bytes([b[16], b[17], b[18], b[19]]),
            instance: u32::from_le_bytes([b[20], b[21], b[22], b[23]]),
            name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_hdr() -> FileHdr {
        FileHdr {
            ver_major: 2,
            ver_minor: 0,
            ver_build: 17,
            svn_rev: STREAM_REV,
            host_bits: 64,
            cb_gc_phys: 8,
            cb_gc_ptr: 8,
            c_units: 3,
            flags: FILE_FLAGS_STREAM_CRC32,
            cb_max_decompr: MAX_DECOMPR_SIZE,
        }
    }

    #[test]
    fn magics_are_exactly_32_and_8_bytes() {
        assert_eq!(MAGIC_V2_0.len(), 32);
        assert_eq!(&MAGIC_V2_0[..5], b"\x7fVirt");
        assert_eq!(MAGIC_V2_0[27], b'\n');
        assert_eq!(&MAGIC_V2_0[28..], &[0, 0, 0, 0]);
        assert_eq!(&UNIT_MAGIC, b"\nUnit\n\0\0");
        assert_eq!(&UNIT_MAGIC_END, b"\nTheEnd\0");
        assert_eq!(&DIR_MAGIC, b"\nDir\n\0\0\0");
        assert_eq!(&FOOTER_MAGIC, b"\nFooter\0");
    }

    #[test]
    fn file_hdr_roundtrip() {
        let hdr = sample_hdr();
        let wire = hdr.to_bytes();
        assert_eq!(wire.len(), FILE_HDR_SIZE);
        assert_eq!(FileHdr::from_bytes(&wire).unwrap(), hdr);
    }

    #[test]
    fn file_hdr_crc_detects_flips() {
        let mut wire = sample_hdr().to_bytes();
        wire[48] ^= 1;
        assert_eq!(FileHdr::from_bytes(&wire), Err(SsmError::IntegrityCrc));
    }

    #[test]
    fn file_hdr_bad_magic() {
        let mut wire = sample_hdr().to_bytes();
        wire[1] = b'X';
        assert_eq!(FileHdr::from_bytes(&wire), Err(SsmError::IntegrityMagic));
    }

    #[test]
    fn file_hdr_field_ranges() {
        for mutate in [
            |h: &mut FileHdr| h.host_bits = 16,
            |h: &mut FileHdr| h.cb_gc_phys = 2,
            |h: &mut FileHdr| h.cb_gc_ptr = 16,
            |h: &mut FileHdr| h.flags = 0x8000_0000,
            |h: &mut FileHdr| h.cb_max_decompr = 512,
            |h: &mut FileHdr| h.cb_max_decompr = 8192,
            |h: &mut FileHdr| h.cb_max_decompr = 1100,
        ] {
            let mut hdr = sample_hdr();
            mutate(&mut hdr);
            let wire = hdr.to_bytes();
            assert_eq!(FileHdr::from_bytes(&wire), Err(SsmError::IntegrityHeader));
        }

        let mut hdr = sample_hdr();
        hdr.ver_major = 0;
        assert_eq!(
            FileHdr::from_bytes(&hdr.to_bytes()),
            Err(SsmError::IntegrityBuildVersion)
        );
    }

    #[test]
    fn unit_hdr_sizes_match_layout() {
        let hdr = UnitHdr {
            end: false,
            off_stream: 64,
            cur_stream_crc: 0,
            version: 1,
            instance: 0,
            pass: SSM_PASS_FINAL,
            name: "U".into(),
        };
        // 44 fixed + "U\0".
        assert_eq!(hdr.to_bytes().len(), 46);
        assert_eq!(UnitHdr::wire_size("U"), 46);

        let end = UnitHdr {
            end: true,
            off_stream: 1000,
            cur_stream_crc: 7,
            version: 0,
            instance: 0,
            pass: SSM_PASS_FINAL,
            name: String::new(),
        };
        assert_eq!(end.to_bytes().len(), UNIT_HDR_FIXED_SIZE);
    }

    #[test]
    fn unit_hdr_roundtrip_and_crc() {
        let hdr = UnitHdr {
            end: false,
            off_stream: 0x1234,
            cur_stream_crc: 0xfeed_f00d,
            version: 3,
            instance: 2,
            pass: 0,
            name: "pgm".into(),
        };
        let wire = hdr.to_bytes();
        assert_eq!(UnitHdr::from_bytes(&wire).unwrap(), hdr);

        let mut bad = wire.clone();
        bad[24] ^= 0xff;
        assert_eq!(UnitHdr::from_bytes(&bad), Err(SsmError::IntegrityUnit));

        let mut bad_magic = wire;
        bad_magic[0] = b'X';
        assert_eq!(
            UnitHdr::from_bytes(&bad_magic),
            Err(SsmError::IntegrityUnitMagic)
        );
    }

    #[test]
    fn dir_roundtrip() {
        let dir = Dir {
            entries: vec![
                DirEntry { off: 64, instance: 0, name_crc: name_crc("SSM") },
                DirEntry { off: 300, instance: 1, name_crc: name_crc("pgm") },
            ],
        };
        let wire = dir.to_bytes();
        assert_eq!(wire.len(), DIR_FIXED_SIZE + 2 * DIR_ENTRY_SIZE);
        assert_eq!(Dir::from_bytes(&wire).unwrap(), dir);

        let mut bad = wire;
        bad[20] ^= 1;
        assert_eq!(Dir::from_bytes(&bad), Err(SsmError::IntegrityDir));
    }

    #[test]
    fn footer_roundtrip() {
        let footer = Footer {
            off_stream: 4096,
            stream_crc: 0xcafe_babe,
            c_dir_entries: 2,
        };
        let wire = footer.to_bytes();
        assert_eq!(wire.len(), FOOTER_SIZE);
        assert_eq!(Footer::from_bytes(&wire).unwrap(), footer);

        let mut bad = wire;
        bad[9] ^= 1;
        assert_eq!(Footer::from_bytes(&bad), Err(SsmError::IntegrityFooter));
    }

    #[test]
    fn v1_hdr_roundtrip_and_uuid_guard() {
        let hdr = FileHdrV1 {
            ver_minor: 2,
            crc: 0x1111_2222,
            host_bits: 32,
            cb_gc_phys: 4,
            cb_gc_ptr: 4,
            ver_build: 5,
        };
        let wire = hdr.to_bytes();
        assert_eq!(FileHdrV1::from_bytes(&wire).unwrap(), hdr);

        let mut bad = wire;
        bad[44] = 1; // machine UUID must stay all-zero
        assert_eq!(FileHdrV1::from_bytes(&bad), Err(SsmError::IntegrityHeader));
    }

    #[test]
    fn v1_unit_hdr_roundtrip() {
        let hdr = UnitHdrV1 {
            end: false,
            cb_unit: 512,
            version: 7,
            instance: 0,
            name: "mm".into(),
        };
        let wire = hdr.to_bytes();
        assert_eq!(wire.len(), V1_UNIT_HDR_FIXED_SIZE + 3);
        assert_eq!(UnitHdrV1::from_bytes(&wire).unwrap(), hdr);
    }
}
