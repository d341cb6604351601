//! Write-side data API: scalar puts, the 4 KiB coalescing buffer, and the
//! big-put streaming path with per-block zero/LZF substitution.
//!
//! Small puts land in the coalescing buffer; a full or explicitly flushed
//! buffer goes out as one RAW record.  Puts of half a buffer or more skip
//! the buffer entirely: each 4 KiB block is emitted as RAW_ZERO when it is
//! all zero bytes, as RAW_LZF when it compresses below the worst-case cap,
//! and as RAW otherwise.  The sub-block tail rejoins the coalescing path.

use crate::err::{SsmError, SsmResult};
use crate::handle::{Mode, SsmHandle, SsmOp, DATA_BUF_SIZE, DATA_COMPR_SLACK};
use crate::lzf::lzf_compress;
use crate::rec::{encode_rec_hdr, RecTerm, RecType, REC_HDR_MAX, REC_TERM_FLAG_CRC32, REC_TERM_SIZE};
use crate::strm::Strm;

// ─────────────────────────────────────────────────────────────────────────────
// Record emission helpers
// ─────────────────────────────────────────────────────────────────────────────

fn write_raw_rec(strm: &mut Strm, off_unit: &mut u64, payload: &[u8]) -> SsmResult<()> {
    let mut hdr = [0u8; REC_HDR_MAX];
    let n = encode_rec_hdr(RecType::Raw, true, payload.len() as u32, &mut hdr);
    strm.write(&hdr[..n])?;
    strm.write(payload)?;
    *off_unit += (n + payload.len()) as u64;
    Ok(())
}

/// Emit one full-size block, picking RAW_ZERO / RAW_LZF / RAW.
fn write_big_block(
    strm: &mut Strm,
    off_unit: &mut u64,
    scratch: &mut [u8],
    block: &[u8],
) -> SsmResult<()> {
    debug_assert_eq!(block.len(), DATA_BUF_SIZE);
    let kib = (block.len() / 1024) as u8;
    let mut hdr = [0u8; REC_HDR_MAX];

    if block.iter().all(|&b| b == 0) {
        let n = encode_rec_hdr(RecType::RawZero, true, 1, &mut hdr);
        strm.write(&hdr[..n])?;
        strm.write(&[kib])?;
        *off_unit += (n + 1) as u64;
        return Ok(());
    }

    let cap = DATA_BUF_SIZE - DATA_COMPR_SLACK;
    match lzf_compress(block, &mut scratch[..cap]) {
        Ok(cb) => {
            let n = encode_rec_hdr(RecType::RawLzf, true, (1 + cb) as u32, &mut hdr);
            strm.write(&hdr[..n])?;
            strm.write(&[kib])?;
            strm.write(&scratch[..cb])?;
            *off_unit += (n + 1 + cb) as u64;
            Ok(())
        }
        Err(_) => write_raw_rec(strm, off_unit, block),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SsmHandle: write-side internals
// ─────────────────────────────────────────────────────────────────────────────

impl SsmHandle {
    fn begin_put(&mut self) -> SsmResult<()> {
        self.check_cancelled()?;
        if !matches!(self.op, SsmOp::SaveExec | SsmOp::LiveExec) {
            return Err(self.latch(SsmError::InvalidParameter));
        }
        if !self.unit_is_open() || !matches!(self.mode, Mode::Write(_)) {
            return Err(self.latch(SsmError::InvalidParameter));
        }
        Ok(())
    }

    /// Flush the coalescing buffer as a single RAW record.
    pub(crate) fn data_flush_buffer(&mut self) -> SsmResult<()> {
        let SsmHandle {
            strm,
            mode,
            off_unit,
            ..
        } = self;
        let Mode::Write(ws) = mode else {
            return Err(SsmError::InvalidParameter);
        };
        if ws.off_data > 0 {
            write_raw_rec(strm, off_unit, &ws.data_buf[..ws.off_data])?;
            ws.off_data = 0;
        }
        Ok(())
    }

    fn data_write(&mut self, data: &[u8]) -> SsmResult<()> {
        if data.len() >= DATA_BUF_SIZE / 2 {
            self.data_flush_buffer()?;
            self.data_write_big(data)
        } else {
            self.data_write_small(data)
        }
    }

    fn data_write_small(&mut self, mut data: &[u8]) -> SsmResult<()> {
        let SsmHandle {
            strm,
            mode,
            off_unit,
            ..
        } = self;
        let Mode::Write(ws) = mode else {
            return Err(SsmError::InvalidParameter);
        };
        while !data.is_empty() {
            let n = (DATA_BUF_SIZE - ws.off_data).min(data.len());
            ws.data_buf[ws.off_data..ws.off_data + n].copy_from_slice(&data[..n]);
            ws.off_data += n;
            data = &data[n..];
            if ws.off_data == DATA_BUF_SIZE {
                write_raw_rec(strm, off_unit, &ws.data_buf[..])?;
                ws.off_data = 0;
            }
        }
        Ok(())
    }

    fn data_write_big(&mut self, data: &[u8]) -> SsmResult<()> {
        let mut rest = data;
        {
            let SsmHandle {
                strm,
                mode,
                off_unit,
                ..
            } = &mut *self;
            let Mode::Write(ws) = mode else {
                return Err(SsmError::InvalidParameter);
            };
            while rest.len() >= DATA_BUF_SIZE {
                write_big_block(strm, off_unit, &mut ws.compr_scratch, &rest[..DATA_BUF_SIZE])?;
                rest = &rest[DATA_BUF_SIZE..];
            }
        }
        if !rest.is_empty() {
            self.data_write_small(rest)?;
        }
        Ok(())
    }

    /// Close the open unit's data: flush, then emit the terminator with the
    /// rolling-CRC checkpoint and the full unit byte count.
    pub(crate) fn write_unit_term(&mut self) -> SsmResult<()> {
        self.data_flush_buffer()?;
        let checksummed = self.strm.is_checksummed();
        let term = RecTerm {
            flags: if checksummed { REC_TERM_FLAG_CRC32 } else { 0 },
            stream_crc: if checksummed { self.strm.cur_crc() } else { 0 },
            cb_unit: self.off_unit + REC_TERM_SIZE as u64,
        };
        self.strm.write(&term.to_bytes())?;
        self.off_unit += REC_TERM_SIZE as u64;
        Ok(())
    }

    // ── Public put surface ───────────────────────────────────────────────────

    /// Raw bytes.
    pub fn put_mem(&mut self, data: &[u8]) -> SsmResult<()> {
        self.begin_put()?;
        match self.data_write(data) {
            Ok(()) => {
                self.off_unit_user += data.len() as u64;
                Ok(())
            }
            Err(e) => Err(self.latch(e)),
        }
    }

    pub fn put_u8(&mut self, v: u8) -> SsmResult<()> {
        self.put_mem(&[v])
    }

    pub fn put_i8(&mut self, v: i8) -> SsmResult<()> {
        self.put_mem(&v.to_le_bytes())
    }

    pub fn put_u16(&mut self, v: u16) -> SsmResult<()> {
        self.put_mem(&v.to_le_bytes())
    }

    pub fn put_i16(&mut self, v: i16) -> SsmResult<()> {
        self.put_mem(&v.to_le_bytes())
    }

    pub fn put_u32(&mut self, v: u32) -> SsmResult<()> {
        self.put_mem(&v.to_le_bytes())
    }

    pub fn put_i32(&mut self, v: i32) -> SsmResult<()> {
        self.put_mem(&v.to_le_bytes())
    }

    pub fn put_u64(&mut self, v: u64) -> SsmResult<()> {
        self.put_mem(&v.to_le_bytes())
    }

    pub fn put_i64(&mut self, v: i64) -> SsmResult<()> {
        self.put_mem(&v.to_le_bytes())
    }

    pub fn put_u128(&mut self, v: u128) -> SsmResult<()> {
        self.put_mem(&v.to_le_bytes())
    }

    pub fn put_i128(&mut self, v: i128) -> SsmResult<()> {
        self.put_mem(&v.to_le_bytes())
    }

    /// One byte on the wire: 0 or 1.
    pub fn put_bool(&mut self, v: bool) -> SsmResult<()> {
        self.put_u8(u8::from(v))
    }

    /// 16-bit I/O port number.
    pub fn put_io_port(&mut self, v: u16) -> SsmResult<()> {
        self.put_u16(v)
    }

    /// 16-bit selector.
    pub fn put_sel(&mut self, v: u16) -> SsmResult<()> {
        self.put_u16(v)
    }

    /// 32-bit raw-context pointer.
    pub fn put_rc_ptr(&mut self, v: u32) -> SsmResult<()> {
        self.put_u32(v)
    }

    /// Guest-physical address at this host's configured width.
    pub fn put_gc_phys(&mut self, v: u64) -> SsmResult<()> {
        match self.host.cb_gc_phys {
            8 => self.put_mem(&v.to_le_bytes()),
            4 => {
                if v > u64::from(u32::MAX) {
                    return Err(self.latch(SsmError::GcPhysOverflow));
                }
                self.put_mem(&(v as u32).to_le_bytes())
            }
            _ => Err(self.latch(SsmError::InvalidParameter)),
        }
    }

    /// Guest pointer at this host's configured width.
    pub fn put_gc_ptr(&mut self, v: u64) -> SsmResult<()> {
        match self.host.cb_gc_ptr {
            8 => self.put_mem(&v.to_le_bytes()),
            4 => {
                if v > u64::from(u32::MAX) {
                    return Err(self.latch(SsmError::GcPtrOverflow));
                }
                self.put_mem(&(v as u32).to_le_bytes())
            }
            _ => Err(self.latch(SsmError::InvalidParameter)),
        }
    }

    /// Length-prefixed string; no terminator goes on the wire.
    pub fn put_strz(&mut self, s: &str) -> SsmResult<()> {
        self.put_u32(s.len() as u32)?;
        self.put_mem(s.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fmt::SSM_PASS_FINAL;
    use crate::handle::{HostCfg, SsmAfter};
    use crate::rec::{decode_size, REC_HDR_FIXED, REC_HDR_IMPORTANT, REC_TYPE_MASK};
    use crate::strm::MemBackend;

    fn open_handle(be: &MemBackend) -> SsmHandle {
        let strm = Strm::new_write(Box::new(be.clone()), 2, true);
        let mut h =
            SsmHandle::new_write(strm, SsmAfter::Destroy, false, 0, None, HostCfg::default());
        h.op = SsmOp::SaveExec;
        h.unit_open(1, SSM_PASS_FINAL);
        h
    }

    fn finish(mut h: SsmHandle) {
        h.data_flush_buffer().unwrap();
        h.strm.set_end().unwrap();
        h.strm.close(false).unwrap();
    }

    /// Walk the records in a raw byte stream: (type, payload) pairs.
    fn parse_records(mut b: &[u8]) -> Vec<(u8, Vec<u8>)> {
        let mut out = Vec::new();
        while !b.is_empty() {
            let taf = b[0];
            let ty = taf & REC_TYPE_MASK;
            assert_ne!(taf & REC_HDR_FIXED, 0);
            if ty == RecType::Term as u8 {
                out.push((ty, b[2..16].to_vec()));
                b = &b[16..];
                continue;
            }
            let (cb, used) = decode_size(&b[1..]).unwrap();
            let start = 1 + used;
            out.push((ty, b[start..start + cb as usize].to_vec()));
            b = &b[start + cb as usize..];
        }
        out
    }

    #[test]
    fn small_puts_coalesce_into_one_raw_record() {
        let be = MemBackend::new();
        let mut h = open_handle(&be);
        for i in 0..100u32 {
            h.put_u32(i).unwrap();
        }
        assert_eq!(h.off_unit, 0, "nothing flushed yet");
        assert_eq!(h.off_unit_user, 400);
        h.data_flush_buffer().unwrap();
        assert!(h.off_unit > 400);
        finish(h);

        let recs = parse_records(&be.to_vec());
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].0, RecType::Raw as u8);
        assert_eq!(recs[0].1.len(), 400);
    }

    #[test]
    fn big_put_selects_lzf_and_zero_blocks() {
        let be = MemBackend::new();
        let mut h = open_handle(&be);
        // First block: a repeating pattern; second block: zeros.
        let mut data = vec![0u8; 8192];
        for (i, b) in data[..4096].iter_mut().enumerate() {
            *b = (i % 256) as u8;
        }
        h.put_mem(&data).unwrap();
        finish(h);

        let recs = parse_records(&be.to_vec());
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].0, RecType::RawLzf as u8);
        assert_eq!(recs[0].1[0], 4, "decompressed size in KiB");
        assert_eq!(recs[1].0, RecType::RawZero as u8);
        assert_eq!(recs[1].1, vec![4]);
    }

    #[test]
    fn incompressible_big_put_falls_back_to_raw() {
        let be = MemBackend::new();
        let mut h = open_handle(&be);
        let mut data = vec![0u8; 4096];
        let mut x: u32 = 12345;
        for b in data.iter_mut() {
            x = x.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            *b = (x >> 24) as u8;
        }
        h.put_mem(&data).unwrap();
        finish(h);

        let recs = parse_records(&be.to_vec());
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].0, RecType::Raw as u8);
        assert_eq!(recs[0].1, data);
    }

    #[test]
    fn big_put_tail_rejoins_the_buffer() {
        let be = MemBackend::new();
        let mut h = open_handle(&be);
        let data = vec![7u8; 4096 + 100];
        h.put_mem(&data).unwrap();
        // The 100-byte tail sits buffered until flushed.
        let ws_off = match &h.mode {
            Mode::Write(ws) => ws.off_data,
            _ => unreachable!(),
        };
        assert_eq!(ws_off, 100);
        h.write_unit_term().unwrap();
        finish(h);

        let recs = parse_records(&be.to_vec());
        assert_eq!(recs.len(), 3);
        assert_eq!(recs[0].0, RecType::RawLzf as u8);
        assert_eq!(recs[1].0, RecType::Raw as u8);
        assert_eq!(recs[1].1.len(), 100);
        assert_eq!(recs[2].0, RecType::Term as u8);
    }

    #[test]
    fn term_record_counts_itself() {
        let be = MemBackend::new();
        let mut h = open_handle(&be);
        h.put_u64(0x1122_3344_5566_7788).unwrap();
        h.write_unit_term().unwrap();
        // RAW record: 2 hdr + 8 payload; TERM: 16.
        assert_eq!(h.off_unit, 2 + 8 + 16);
        finish(h);

        let wire = be.to_vec();
        let recs = parse_records(&wire);
        assert_eq!(recs.len(), 2);
        let term = &recs[1].1;
        assert_eq!(u16::from_le_bytes([term[0], term[1]]), REC_TERM_FLAG_CRC32);
        let cb_unit = u64::from_le_bytes(term[6..14].try_into().unwrap());
        assert_eq!(cb_unit, 2 + 8 + 16);
        // Stream CRC checkpoint covers everything before the terminator.
        let crc = u32::from_le_bytes(term[2..6].try_into().unwrap());
        assert_eq!(crc, crc32fast::hash(&wire[..10]));
    }

    #[test]
    fn puts_refused_outside_exec_and_after_errors() {
        let be = MemBackend::new();
        let mut h = open_handle(&be);
        h.op = SsmOp::SavePrep;
        assert_eq!(h.put_u8(1), Err(SsmError::InvalidParameter));

        let mut h = open_handle(&be);
        h.set_status(SsmError::GcPhysOverflow);
        assert_eq!(h.put_u8(1), Err(SsmError::GcPhysOverflow));
    }

    #[test]
    fn gc_width_overflow_on_narrow_host() {
        let be = MemBackend::new();
        let strm = Strm::new_write(Box::new(be.clone()), 1, true);
        let host = HostCfg {
            bits: 32,
            cb_gc_phys: 4,
            cb_gc_ptr: 4,
            ..HostCfg::default()
        };
        let mut h = SsmHandle::new_write(strm, SsmAfter::Destroy, false, 0, None, host);
        h.op = SsmOp::SaveExec;
        h.unit_open(1, SSM_PASS_FINAL);
        assert_eq!(h.put_gc_phys(0x1_0000_0000), Err(SsmError::GcPhysOverflow));
    }

    #[test]
    fn marker_and_flags_byte_shape() {
        let be = MemBackend::new();
        let mut h = open_handle(&be);
        h.put_u8(0xaa).unwrap();
        h.data_flush_buffer().unwrap();
        finish(h);
        let wire = be.to_vec();
        assert_eq!(
            wire[0],
            REC_HDR_FIXED | REC_HDR_IMPORTANT | RecType::Raw as u8
        );
    }
}
