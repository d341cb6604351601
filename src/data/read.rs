//! Read-side data API: scalar gets, record-buffered reads, width-adaptive
//! integer types, and the legacy v1 unit decompressor.
//!
//! The v2 reader keeps one decoded record at hand: RAW payloads are tracked
//! by a bytes-remaining counter and fetched straight off the stream (large
//! requests) or through the 4 KiB data buffer (small requests); LZF and
//! ZERO records are expanded into the data buffer whole.  Hitting the
//! terminator latches end-of-data; any further read is "loaded too much",
//! and closing a unit with unconsumed bytes is "loaded too little".
//!
//! The v1 reader consumes a per-unit compressed block stream instead and is
//! deliberately lenient about trailing unread bytes (the loader skips and
//! warns, matching the historical behavior).

use crate::err::{SsmError, SsmResult};
use crate::handle::{Mode, ReadState, SsmHandle, SsmOp, DATA_BUF_SIZE};
use crate::lzf::lzf_decompress;
use crate::rec::{
    decode_size_first, fold_size, parse_type_and_flags, RecTerm, RecType, REC_TERM_CB,
    REC_TERM_FLAG_CRC32, REC_TERM_SIZE,
};
use crate::strm::Strm;

// ─────────────────────────────────────────────────────────────────────────────
// v1 block stream
// ─────────────────────────────────────────────────────────────────────────────

/// v1 block kinds.
const V1_BLOCK_RAW: u8 = 0;
const V1_BLOCK_LZF: u8 = 1;
/// v1 block header: kind byte, stored size, decompressed size.
const V1_BLOCK_HDR_SIZE: u64 = 5;

// ─────────────────────────────────────────────────────────────────────────────
// v2 record fetch
// ─────────────────────────────────────────────────────────────────────────────

/// Fetch and decode the next record header (and, for LZF/ZERO records, the
/// whole payload into the data buffer).  On the terminator this verifies
/// the CRC checkpoint and the unit byte count, then latches end-of-data.
fn read_rec_hdr_v2(strm: &mut Strm, rs: &mut ReadState, off_unit: &mut u64) -> SsmResult<()> {
    // CRC checkpoint: everything before this record's first byte.
    let crc_before = if strm.is_checksummed() {
        strm.cur_crc()
    } else {
        0
    };

    let mut hdr2 = [0u8; 2];
    strm.read(&mut hdr2)?;
    *off_unit += 2;
    rs.type_and_flags = hdr2[0];
    let rec_type = parse_type_and_flags(hdr2[0])?;

    if rec_type == RecType::Term {
        if hdr2[1] != REC_TERM_CB {
            return Err(SsmError::IntegrityRecTerm);
        }
        let mut payload = [0u8; REC_TERM_SIZE - 2];
        strm.read(&mut payload)?;
        *off_unit += (REC_TERM_SIZE - 2) as u64;
        let term = RecTerm::from_payload(&payload)?;
        if term.flags & REC_TERM_FLAG_CRC32 != 0 {
            if !strm.is_checksummed() {
                return Err(SsmError::IntegrityRecTerm);
            }
            if term.stream_crc != crc_before {
                return Err(SsmError::IntegrityRecTermCrc);
            }
        } else if strm.is_checksummed() {
            return Err(SsmError::IntegrityRecTerm);
        }
        if term.cb_unit != *off_unit {
            return Err(SsmError::IntegrityRecTerm);
        }
        rs.end_of_data = true;
        return Ok(());
    }

    let (init, n_follow) = decode_size_first(hdr2[1])?;
    let cb = if n_follow == 0 {
        init
    } else {
        let mut follow = [0u8; 5];
        strm.read(&mut follow[..n_follow])?;
        *off_unit += n_follow as u64;
        fold_size(init, &follow[..n_follow])?
    };

    match rec_type {
        RecType::Raw => {
            if cb == 0 {
                return Err(SsmError::IntegrityRecHdr);
            }
            rs.cb_rec_left = u64::from(cb);
        }
        RecType::RawLzf => {
            let cb = cb as usize;
            if cb < 2 || cb - 1 > DATA_BUF_SIZE {
                return Err(SsmError::IntegrityDecompression);
            }
            let mut kib = [0u8; 1];
            strm.read(&mut kib)?;
            let cb_decomp = usize::from(kib[0]) * 1024;
            if kib[0] == 0 || cb_decomp > DATA_BUF_SIZE {
                return Err(SsmError::IntegrityDecompression);
            }
            let cb_comp = cb - 1;
            strm.read(&mut rs.decomp_scratch[..cb_comp])?;
            *off_unit += cb as u64;
            let n = lzf_decompress(&rs.decomp_scratch[..cb_comp], &mut rs.data_buf[..cb_decomp])
                .map_err(|_| SsmError::IntegrityDecompression)?;
            if n != cb_decomp {
                return Err(SsmError::IntegrityDecompression);
            }
            rs.cb_data = cb_decomp;
            rs.off_data = 0;
        }
        RecType::RawZero => {
            if cb != 1 {
                return Err(SsmError::IntegrityRecHdr);
            }
            let mut kib = [0u8; 1];
            strm.read(&mut kib)?;
            *off_unit += 1;
            let n = usize::from(kib[0]) * 1024;
            if kib[0] == 0 || n > DATA_BUF_SIZE {
                return Err(SsmError::IntegrityRecHdr);
            }
            rs.data_buf[..n].fill(0);
            rs.cb_data = n;
            rs.off_data = 0;
        }
        // Reserved type; nothing emits it and there is no forward
        // compatibility to honor.
        RecType::Named | RecType::Term => return Err(SsmError::IntegrityRecHdr),
    }
    Ok(())
}

fn data_read_v2(
    strm: &mut Strm,
    rs: &mut ReadState,
    off_unit: &mut u64,
    out: &mut [u8],
) -> SsmResult<()> {
    let mut done = 0usize;
    while done < out.len() {
        // Buffered decompressed data first.
        if rs.off_data < rs.cb_data {
            let n = (rs.cb_data - rs.off_data).min(out.len() - done);
            out[done..done + n].copy_from_slice(&rs.data_buf[rs.off_data..rs.off_data + n]);
            rs.off_data += n;
            done += n;
            continue;
        }
        if rs.end_of_data {
            return Err(SsmError::LoadedTooMuch);
        }
        if rs.cb_rec_left > 0 {
            let want = out.len() - done;
            if want >= DATA_BUF_SIZE {
                // Big request: bypass the data buffer.
                let n = rs.cb_rec_left.min(want as u64) as usize;
                strm.read(&mut out[done..done + n])?;
                rs.cb_rec_left -= n as u64;
                *off_unit += n as u64;
                done += n;
            } else {
                let n = rs.cb_rec_left.min(DATA_BUF_SIZE as u64) as usize;
                if let Some(src) = strm.read_direct(n) {
                    rs.data_buf[..n].copy_from_slice(src);
                } else {
                    strm.read(&mut rs.data_buf[..n])?;
                }
                rs.cb_data = n;
                rs.off_data = 0;
                rs.cb_rec_left -= n as u64;
                *off_unit += n as u64;
            }
            continue;
        }
        read_rec_hdr_v2(strm, rs, off_unit)?;
    }
    Ok(())
}

fn data_read_v1(strm: &mut Strm, rs: &mut ReadState, off_unit: &mut u64, out: &mut [u8]) -> SsmResult<()> {
    let mut done = 0usize;
    while done < out.len() {
        if rs.off_data < rs.cb_data {
            let n = (rs.cb_data - rs.off_data).min(out.len() - done);
            out[done..done + n].copy_from_slice(&rs.data_buf[rs.off_data..rs.off_data + n]);
            rs.off_data += n;
            done += n;
            continue;
        }
        if rs.cb_unit_left_v1 < V1_BLOCK_HDR_SIZE {
            return Err(SsmError::LoadedTooMuch);
        }
        let mut hdr = [0u8; V1_BLOCK_HDR_SIZE as usize];
        strm.read(&mut hdr)?;
        let kind = hdr[0];
        let cb_stored = usize::from(u16::from_le_bytes([hdr[1], hdr[2]]));
        let cb_decomp = usize::from(u16::from_le_bytes([hdr[3], hdr[4]]));
        if cb_stored == 0
            || cb_decomp == 0
            || cb_decomp > DATA_BUF_SIZE
            || cb_stored > DATA_BUF_SIZE
            || rs.cb_unit_left_v1 < V1_BLOCK_HDR_SIZE + cb_stored as u64
        {
            return Err(SsmError::IntegrityDecompression);
        }
        match kind {
            V1_BLOCK_RAW => {
                if cb_stored != cb_decomp {
                    return Err(SsmError::IntegrityDecompression);
                }
                strm.read(&mut rs.data_buf[..cb_stored])?;
            }
            V1_BLOCK_LZF => {
                strm.read(&mut rs.decomp_scratch[..cb_stored])?;
                let n = lzf_decompress(&rs.decomp_scratch[..cb_stored], &mut rs.data_buf[..cb_decomp])
                    .map_err(|_| SsmError::IntegrityDecompression)?;
                if n != cb_decomp {
                    return Err(SsmError::IntegrityDecompression);
                }
            }
            _ => return Err(SsmError::IntegrityDecompression),
        }
        rs.cb_unit_left_v1 -= V1_BLOCK_HDR_SIZE + cb_stored as u64;
        *off_unit += V1_BLOCK_HDR_SIZE + cb_stored as u64;
        rs.cb_data = cb_decomp;
        rs.off_data = 0;
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// SsmHandle: read-side internals
// ─────────────────────────────────────────────────────────────────────────────

impl SsmHandle {
    fn begin_get(&mut self) -> SsmResult<()> {
        self.check_cancelled()?;
        if !matches!(self.op, SsmOp::LoadExec | SsmOp::OpenRead) {
            return Err(self.latch(SsmError::InvalidParameter));
        }
        if !self.unit_is_open() || !matches!(self.mode, Mode::Read(_)) {
            return Err(self.latch(SsmError::InvalidParameter));
        }
        Ok(())
    }

    /// Reset the record cursor at the start of a unit's data.
    pub(crate) fn data_read_begin(&mut self) -> SsmResult<()> {
        let rs = self.rs()?;
        rs.cb_rec_left = 0;
        rs.cb_data = 0;
        rs.off_data = 0;
        rs.end_of_data = false;
        rs.type_and_flags = 0;
        rs.cb_unit_left_v1 = 0;
        Ok(())
    }

    /// Close a v2 unit's data strictly: everything must be consumed and the
    /// pending record must be the terminator.
    pub(crate) fn data_read_finish_v2(&mut self) -> SsmResult<()> {
        let SsmHandle {
            strm,
            mode,
            off_unit,
            ..
        } = self;
        let Mode::Read(rs) = mode else {
            return Err(SsmError::InvalidParameter);
        };
        if rs.end_of_data {
            return Ok(());
        }
        if rs.off_data < rs.cb_data || rs.cb_rec_left > 0 {
            return Err(SsmError::LoadedTooLittle);
        }
        read_rec_hdr_v2(strm, rs, off_unit)?;
        if !rs.end_of_data {
            return Err(SsmError::LoadedTooLittle);
        }
        Ok(())
    }

    // ── Public get surface ───────────────────────────────────────────────────

    /// Raw bytes, exactly `out.len()` of them.
    pub fn get_mem(&mut self, out: &mut [u8]) -> SsmResult<()> {
        self.begin_get()?;
        let SsmHandle {
            strm,
            mode,
            off_unit,
            ..
        } = self;
        let Mode::Read(rs) = mode else {
            return Err(SsmError::InvalidParameter);
        };
        let res = if rs.fmt_ver.is_v1() {
            data_read_v1(strm, rs, off_unit, out)
        } else {
            data_read_v2(strm, rs, off_unit, out)
        };
        match res {
            Ok(()) => {
                self.off_unit_user += out.len() as u64;
                Ok(())
            }
            Err(e) => Err(self.latch(e)),
        }
    }

    pub fn get_u8(&mut self) -> SsmResult<u8> {
        let mut b = [0u8; 1];
        self.get_mem(&mut b)?;
        Ok(b[0])
    }

    pub fn get_i8(&mut self) -> SsmResult<i8> {
        Ok(self.get_u8()? as i8)
    }

    pub fn get_u16(&mut self) -> SsmResult<u16> {
        let mut b = [0u8; 2];
        self.get_mem(&mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    pub fn get_i16(&mut self) -> SsmResult<i16> {
        Ok(self.get_u16()? as i16)
    }

    pub fn get_u32(&mut self) -> SsmResult<u32> {
        let mut b = [0u8; 4];
        self.get_mem(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn get_i32(&mut self) -> SsmResult<i32> {
        Ok(self.get_u32()? as i32)
    }

    pub fn get_u64(&mut self) -> SsmResult<u64> {
        let mut b = [0u8; 8];
        self.get_mem(&mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    pub fn get_i64(&mut self) -> SsmResult<i64> {
        Ok(self.get_u64()? as i64)
    }

    pub fn get_u128(&mut self) -> SsmResult<u128> {
        let mut b = [0u8; 16];
        self.get_mem(&mut b)?;
        Ok(u128::from_le_bytes(b))
    }

    pub fn get_i128(&mut self) -> SsmResult<i128> {
        Ok(self.get_u128()? as i128)
    }

    /// One byte on the wire; anything but 0 or 1 is rejected.
    pub fn get_bool(&mut self) -> SsmResult<bool> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(self.latch(SsmError::FieldInvalidValue)),
        }
    }

    pub fn get_io_port(&mut self) -> SsmResult<u16> {
        self.get_u16()
    }

    pub fn get_sel(&mut self) -> SsmResult<u16> {
        self.get_u16()
    }

    pub fn get_rc_ptr(&mut self) -> SsmResult<u32> {
        self.get_u32()
    }

    /// Guest-physical address, adapting the saved width to this host's.
    pub fn get_gc_phys(&mut self) -> SsmResult<u64> {
        let file_cb = self.rs_ref()?.cb_gc_phys;
        let host_cb = self.host.cb_gc_phys;
        self.get_width_adaptive(file_cb, host_cb, SsmError::GcPhysOverflow)
    }

    /// Guest pointer, adapting the saved width to this host's.  The first
    /// call locks the width for the rest of the operation.
    pub fn get_gc_ptr(&mut self) -> SsmResult<u64> {
        let host_cb = self.host.cb_gc_ptr;
        let file_cb = {
            let rs = self.rs()?;
            if rs.cb_gc_ptr == 0 {
                // v1.1 and no caller override: assume the host width.
                rs.cb_gc_ptr = host_cb;
            }
            rs.gc_ptr_fixed = true;
            rs.cb_gc_ptr
        };
        self.get_width_adaptive(file_cb, host_cb, SsmError::GcPtrOverflow)
    }

    fn get_width_adaptive(&mut self, file_cb: u8, host_cb: u8, overflow: SsmError) -> SsmResult<u64> {
        match (file_cb, host_cb) {
            (4, _) => Ok(u64::from(self.get_u32()?)),
            (8, 8) => self.get_u64(),
            (8, 4) => {
                let v = self.get_u64()?;
                if v > u64::from(u32::MAX) {
                    return Err(self.latch(overflow));
                }
                Ok(v)
            }
            _ => Err(self.latch(SsmError::InvalidParameter)),
        }
    }

    /// Override the guest-pointer width for v1.1 files that never recorded
    /// it.  Refused once the width has been used or came from a header.
    pub fn set_gc_ptr_size(&mut self, cb: u8) -> SsmResult<()> {
        if cb != 4 && cb != 8 {
            return Err(SsmError::InvalidParameter);
        }
        let rs = self.rs()?;
        if rs.gc_ptr_fixed {
            return Err(SsmError::InvalidParameter);
        }
        rs.cb_gc_ptr = cb;
        rs.gc_ptr_fixed = true;
        Ok(())
    }

    /// Length-prefixed string; rejects anything longer than `cb_max - 1`
    /// bytes so fixed-size consumers can bound their buffers.
    pub fn get_strz(&mut self, cb_max: usize) -> SsmResult<String> {
        let len = self.get_u32()? as usize;
        if len + 1 > cb_max {
            return Err(self.latch(SsmError::IntegritySize));
        }
        let mut buf = vec![0u8; len];
        self.get_mem(&mut buf)?;
        String::from_utf8(buf).map_err(|_| self.latch(SsmError::FieldInvalidValue))
    }

    /// Skip `cb` bytes of unit data.
    pub fn skip(&mut self, mut cb: u64) -> SsmResult<()> {
        let mut scratch = [0u8; 512];
        while cb > 0 {
            let n = cb.min(scratch.len() as u64) as usize;
            self.get_mem(&mut scratch[..n])?;
            cb -= n as u64;
        }
        Ok(())
    }

    /// Consume everything up to (and including) the unit terminator.
    pub fn skip_to_end_of_unit(&mut self) -> SsmResult<()> {
        self.begin_get()?;
        let SsmHandle {
            strm,
            mode,
            off_unit,
            ..
        } = self;
        let Mode::Read(rs) = mode else {
            return Err(SsmError::InvalidParameter);
        };
        if rs.fmt_ver.is_v1() {
            // The v1 loader resynchronizes on the unit byte count instead.
            return Ok(());
        }
        loop {
            rs.off_data = rs.cb_data;
            if rs.end_of_data {
                return Ok(());
            }
            if rs.cb_rec_left > 0 {
                let n = rs.cb_rec_left.min(DATA_BUF_SIZE as u64) as usize;
                strm.read(&mut rs.data_buf[..n])?;
                rs.cb_rec_left -= n as u64;
                *off_unit += n as u64;
                rs.cb_data = 0;
                rs.off_data = 0;
                continue;
            }
            read_rec_hdr_v2(strm, rs, off_unit)?;
        }
    }

    /// Begin a v1 unit's payload of `cb_unit` compressed bytes.
    pub(crate) fn data_read_begin_v1(&mut self, cb_unit: u64) -> SsmResult<()> {
        self.data_read_begin()?;
        self.rs()?.cb_unit_left_v1 = cb_unit;
        Ok(())
    }

    /// Compressed bytes left in the current v1 unit (skip bookkeeping).
    pub(crate) fn v1_unit_left(&self) -> u64 {
        match &self.mode {
            Mode::Read(rs) => rs.cb_unit_left_v1,
            Mode::Write(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fmt::SSM_PASS_FINAL;
    use crate::handle::{FmtVer, HostCfg, SsmAfter};
    use crate::strm::MemBackend;

    /// Write records with the real writer, then read them back.
    fn written_unit(f: impl FnOnce(&mut SsmHandle)) -> Vec<u8> {
        let be = MemBackend::new();
        let strm = Strm::new_write(Box::new(be.clone()), 2, true);
        let mut h =
            SsmHandle::new_write(strm, SsmAfter::Destroy, false, 0, None, HostCfg::default());
        h.op = SsmOp::SaveExec;
        h.unit_open(1, SSM_PASS_FINAL);
        f(&mut h);
        h.write_unit_term().unwrap();
        h.strm.set_end().unwrap();
        h.strm.close(false).unwrap();
        be.to_vec()
    }

    fn reader(bytes: Vec<u8>) -> SsmHandle {
        let strm = Strm::new_read(Box::new(MemBackend::from_bytes(bytes)), 2, true);
        let mut h = SsmHandle::new_read(
            strm,
            SsmAfter::Destroy,
            FmtVer::V2_0,
            None,
            HostCfg::default(),
        );
        h.op = SsmOp::LoadExec;
        h.unit_open(1, SSM_PASS_FINAL);
        h.data_read_begin().unwrap();
        h
    }

    #[test]
    fn scalar_roundtrip_through_records() {
        let bytes = written_unit(|h| {
            h.put_u8(0x12).unwrap();
            h.put_u16(0x3456).unwrap();
            h.put_u32(0x789a_bcde).unwrap();
            h.put_u64(0x1122_3344_5566_7788).unwrap();
            h.put_u128(0x0102_0304_0506_0708_090a_0b0c_0d0e_0f10).unwrap();
            h.put_bool(true).unwrap();
            h.put_bool(false).unwrap();
            h.put_i32(-7).unwrap();
            h.put_strz("saved-state").unwrap();
        });
        let mut r = reader(bytes);
        assert_eq!(r.get_u8().unwrap(), 0x12);
        assert_eq!(r.get_u16().unwrap(), 0x3456);
        assert_eq!(r.get_u32().unwrap(), 0x789a_bcde);
        assert_eq!(r.get_u64().unwrap(), 0x1122_3344_5566_7788);
        assert_eq!(r.get_u128().unwrap(), 0x0102_0304_0506_0708_090a_0b0c_0d0e_0f10);
        assert!(r.get_bool().unwrap());
        assert!(!r.get_bool().unwrap());
        assert_eq!(r.get_i32().unwrap(), -7);
        assert_eq!(r.get_strz(64).unwrap(), "saved-state");
        r.data_read_finish_v2().unwrap();
    }

    #[test]
    fn mixed_lzf_zero_raw_records_reassemble() {
        let mut payload = vec![0u8; 12 * 1024];
        for (i, b) in payload[..4096].iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        // Middle 4 KiB stays zero; tail is a short raw run.
        for (i, b) in payload[8192..].iter_mut().enumerate() {
            *b = (i % 7) as u8 + 1;
        }
        let expect = payload.clone();
        let bytes = written_unit(move |h| h.put_mem(&payload).unwrap());

        let mut r = reader(bytes);
        let mut out = vec![0u8; expect.len()];
        r.get_mem(&mut out).unwrap();
        assert_eq!(out, expect);
        r.data_read_finish_v2().unwrap();
    }

    #[test]
    fn reading_past_terminator_is_too_much_and_sticky() {
        let bytes = written_unit(|h| h.put_u32(1).unwrap());
        let mut r = reader(bytes);
        assert_eq!(r.get_u32().unwrap(), 1);
        assert_eq!(r.get_u8(), Err(SsmError::LoadedTooMuch));
        // Latched: even a zero-byte wouldn't help now.
        assert_eq!(r.get_u8(), Err(SsmError::LoadedTooMuch));
    }

    #[test]
    fn finishing_with_unread_data_is_too_little() {
        let bytes = written_unit(|h| {
            h.put_u32(1).unwrap();
            h.put_u32(2).unwrap();
        });
        let mut r = reader(bytes);
        assert_eq!(r.get_u32().unwrap(), 1);
        assert_eq!(r.data_read_finish_v2(), Err(SsmError::LoadedTooLittle));
    }

    #[test]
    fn skip_to_end_consumes_everything() {
        let bytes = written_unit(|h| {
            h.put_mem(&vec![0u8; 8192]).unwrap();
            h.put_u32(42).unwrap();
        });
        let mut r = reader(bytes);
        assert_eq!(r.get_u8().unwrap(), 0);
        r.skip_to_end_of_unit().unwrap();
        r.data_read_finish_v2().unwrap();
    }

    #[test]
    fn skip_advances_over_records() {
        let bytes = written_unit(|h| {
            h.put_u32(0xaaaa_aaaa).unwrap();
            h.put_mem(&vec![0u8; 4096]).unwrap();
            h.put_u32(0xbbbb_bbbb).unwrap();
        });
        let mut r = reader(bytes);
        r.skip(4 + 4096).unwrap();
        assert_eq!(r.get_u32().unwrap(), 0xbbbb_bbbb);
        r.data_read_finish_v2().unwrap();
    }

    #[test]
    fn corrupted_record_crc_is_detected_at_terminator() {
        let mut bytes = written_unit(|h| h.put_mem(&[0x55u8; 64]).unwrap());
        // Flip a payload byte; the terminator checkpoint must notice.
        bytes[10] ^= 0x01;
        let mut r = reader(bytes);
        let mut out = [0u8; 64];
        r.get_mem(&mut out).unwrap();
        assert_eq!(r.data_read_finish_v2(), Err(SsmError::IntegrityRecTermCrc));
    }

    #[test]
    fn width_adaptive_gc_phys_narrow_host() {
        // The file says 8-byte GC-phys; the "host" is 4.
        let bytes = written_unit(|h| {
            h.put_gc_phys(0xdead_beef).unwrap();
            h.put_gc_phys(0x1_0000_0000_0000).unwrap();
        });
        let strm = Strm::new_read(Box::new(MemBackend::from_bytes(bytes)), 2, true);
        let host = HostCfg {
            bits: 32,
            cb_gc_phys: 4,
            cb_gc_ptr: 4,
            ..HostCfg::default()
        };
        let mut r = SsmHandle::new_read(strm, SsmAfter::Destroy, FmtVer::V2_0, None, host);
        r.op = SsmOp::LoadExec;
        r.unit_open(1, SSM_PASS_FINAL);
        r.data_read_begin().unwrap();
        {
            let rs = r.rs().unwrap();
            rs.cb_gc_phys = 8;
            rs.cb_gc_ptr = 8;
            rs.gc_ptr_fixed = true;
        }
        assert_eq!(r.get_gc_phys().unwrap(), 0xdead_beef);
        assert_eq!(r.get_gc_phys(), Err(SsmError::GcPhysOverflow));
    }

    #[test]
    fn gc_ptr_size_override_locks() {
        let bytes = written_unit(|h| h.put_u32(0).unwrap());
        let mut r = reader(bytes);
        {
            let rs = r.rs().unwrap();
            rs.fmt_ver = FmtVer::V1_1;
            rs.cb_gc_ptr = 0;
            rs.gc_ptr_fixed = false;
        }
        r.set_gc_ptr_size(8).unwrap();
        assert_eq!(r.set_gc_ptr_size(4), Err(SsmError::InvalidParameter));
    }
}
