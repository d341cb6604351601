//! Structured-record transform engine.
//!
//! A struct goes on the wire as a flat sequence of field emissions
//! bracketed by begin/end marker words, driven by a descriptor table.
//! Descriptors either copy bytes verbatim, apply one of a closed set of
//! intrinsic transformations (width-adaptive integers, pointer scrubbing,
//! padding), or hand the field to a caller-supplied function.
//!
//! The engine operates on the struct's raw bytes (`&[u8]` on save,
//! `&mut [u8]` on load) with descriptor-supplied offsets, so callers stay
//! in safe code by deriving the slices from `#[repr(C)]` storage or plain
//! byte arrays.

use crate::err::{SsmError, SsmResult};
use crate::handle::SsmHandle;

// ─────────────────────────────────────────────────────────────────────────────
// Flags and markers
// ─────────────────────────────────────────────────────────────────────────────

/// Suppress the leading marker word.
pub const STRUCT_NO_LEAD_MARKER: u32 = 1 << 0;
/// Suppress the trailing marker word.
pub const STRUCT_NO_TAIL_MARKER: u32 = 1 << 1;
/// Suppress both marker words.
pub const STRUCT_NO_MARKERS: u32 = STRUCT_NO_LEAD_MARKER | STRUCT_NO_TAIL_MARKER;
/// Give "ignored" fields a wire presence (zero bytes) instead of skipping
/// them, and store ignored host pointers at full width.
pub const STRUCT_DONT_IGNORE: u32 = 1 << 2;
/// Assert that the descriptor table covers every byte of the struct.
pub const STRUCT_FULL_STRUCT: u32 = 1 << 3;

const STRUCT_VALID_FLAGS: u32 =
    STRUCT_NO_MARKERS | STRUCT_DONT_IGNORE | STRUCT_FULL_STRUCT;

/// Marker word preceding the first field.
pub const STRUCT_MARKER_BEGIN: u32 = 0x1920_0102;
/// Marker word following the last field.
pub const STRUCT_MARKER_END: u32 = 0x1992_0406;

// ─────────────────────────────────────────────────────────────────────────────
// Descriptors
// ─────────────────────────────────────────────────────────────────────────────

/// How a field callback sees the struct bytes.
pub enum FieldAccess<'a> {
    /// Save direction: the struct is read-only.
    Put(&'a [u8]),
    /// Load direction: the struct may be written.
    Get(&'a mut [u8]),
}

/// Caller-supplied field transformation.
pub type FieldXferFn =
    fn(&mut SsmHandle, &SsmField, FieldAccess<'_>, u32) -> SsmResult<()>;

/// The closed set of field transformations.
#[derive(Clone, Copy)]
pub enum FieldXfer {
    /// Verbatim byte copy; the common fast path.
    Copy,
    /// 8 bytes in the struct, host GC-phys width on the wire.
    GCPhys,
    /// 8 bytes in the struct, host GC-ptr width on the wire.
    GCPtr,
    /// 32-bit raw-context pointer.
    RCPtr,
    /// Array of 32-bit raw-context pointers.
    RCPtrArray,
    /// Host pointer stored as a one-byte nil indicator (full width with
    /// `STRUCT_DONT_IGNORE`); always scrubbed to zero on load.
    HCPtrNi,
    /// Array variant of [`FieldXfer::HCPtrNi`].
    HCPtrNiArray,
    /// Host pointer truncated to 32 bits on the wire, padded back to the
    /// host width on 64-bit hosts; a non-zero high half is an error.
    HCPtrHackU32,
    /// 4 bytes on the wire zero-extended into 8 in the struct; load only.
    U32ZxU64,
    /// No wire presence (zero bytes with `STRUCT_DONT_IGNORE`).
    Ignore,
    /// Field that only exists in older saves: skip `cb` bytes on load.
    Old,
    /// Like [`FieldXfer::Old`] at the saved file's GC-phys width.
    OldGCPhys,
    /// Like [`FieldXfer::Old`] at the saved file's GC-ptr width.
    OldGCPtr,
    /// Like [`FieldXfer::Old`] at the 32-bit raw-context width.
    OldRCPtr,
    /// Like [`FieldXfer::Old`] at the saved file's host-pointer width.
    OldHCPtr,
    /// Alignment hole: emits/skips `cb32` or `cb64` zero bytes depending on
    /// the relevant side's host bit width.
    Pad { cb32: u16, cb64: u16 },
    /// Alignment hole that only exists under 32-bit MSC-style layout.
    PadMsc32 { cb: u16 },
    /// Custom processing.
    Callback(FieldXferFn),
}

/// One field descriptor.
#[derive(Clone, Copy)]
pub struct SsmField {
    pub xfer: FieldXfer,
    /// Byte offset within the struct (`usize::MAX` for `Old*` entries,
    /// which have no in-struct presence).
    pub off: usize,
    /// In-struct byte size; for `Old*` entries the wire size to skip.
    pub cb: usize,
    /// Skipped when the unit version in play is older than this.
    pub first_version: u32,
    /// Diagnostics only.
    pub name: &'static str,
}

impl SsmField {
    pub const fn new(xfer: FieldXfer, off: usize, cb: usize, name: &'static str) -> SsmField {
        SsmField {
            xfer,
            off,
            cb,
            first_version: 0,
            name,
        }
    }

    /// Field added in `first_version` of the unit format.
    pub const fn since(
        xfer: FieldXfer,
        off: usize,
        cb: usize,
        first_version: u32,
        name: &'static str,
    ) -> SsmField {
        SsmField {
            xfer,
            off,
            cb,
            first_version,
            name,
        }
    }

    /// Descriptor for a field that only old saves contain.
    pub const fn old(cb: usize, name: &'static str) -> SsmField {
        SsmField {
            xfer: FieldXfer::Old,
            off: usize::MAX,
            cb,
            first_version: 0,
            name,
        }
    }

    /// In-struct extent, if the field has one.
    fn extent(&self) -> Option<(usize, usize)> {
        match self.xfer {
            FieldXfer::Old
            | FieldXfer::OldGCPhys
            | FieldXfer::OldGCPtr
            | FieldXfer::OldRCPtr
            | FieldXfer::OldHCPtr => None,
            _ => Some((self.off, self.cb)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

impl SsmHandle {
    fn host_ptr_cb(&self) -> usize {
        usize::from(self.host.bits / 8)
    }

    /// Host-pointer width of the *saved* file (load direction).
    fn saved_ptr_cb(&self) -> SsmResult<usize> {
        Ok(usize::from(self.rs_ref()?.host_bits / 8))
    }

    /// Validate a field's extent against the struct and, with
    /// `STRUCT_FULL_STRUCT`, against the running coverage cursor.
    fn check_extent(
        field: &SsmField,
        cb_struct: usize,
        flags: u32,
        cursor: &mut usize,
    ) -> SsmResult<()> {
        let Some((off, cb)) = field.extent() else {
            return Ok(());
        };
        if off.checked_add(cb).map_or(true, |end| end > cb_struct) {
            return Err(SsmError::FieldOutOfBounds);
        }
        if flags & STRUCT_FULL_STRUCT != 0 {
            if off != *cursor {
                return Err(SsmError::FieldNotConsecutive);
            }
            *cursor = off + cb;
        }
        Ok(())
    }

    // ── Simple API: raw-copy fields, markers always ──────────────────────────

    /// Write a struct whose descriptors are all plain copies.
    pub fn put_struct(&mut self, data: &[u8], fields: &[SsmField]) -> SsmResult<()> {
        for f in fields {
            if !matches!(f.xfer, FieldXfer::Copy) {
                return Err(self.latch(SsmError::FieldComplex));
            }
        }
        self.put_struct_ext(data, fields, 0)
    }

    /// Read a struct whose descriptors are all plain copies.
    pub fn get_struct(&mut self, data: &mut [u8], fields: &[SsmField]) -> SsmResult<()> {
        for f in fields {
            if !matches!(f.xfer, FieldXfer::Copy) {
                return Err(self.latch(SsmError::FieldComplex));
            }
        }
        self.get_struct_ext(data, fields, 0)
    }

    // ── Extended API ─────────────────────────────────────────────────────────

    /// Write a struct with the full transform set.
    pub fn put_struct_ext(&mut self, data: &[u8], fields: &[SsmField], flags: u32) -> SsmResult<()> {
        if flags & !STRUCT_VALID_FLAGS != 0 {
            return Err(self.latch(SsmError::InvalidParameter));
        }
        if flags & STRUCT_NO_LEAD_MARKER == 0 {
            self.put_u32(STRUCT_MARKER_BEGIN)?;
        }

        let mut cursor = 0usize;
        for field in fields {
            // Fields younger than the unit version stay off the wire, but
            // coverage accounting still sees their in-struct extent.
            let skip = self.cur_unit_ver < field.first_version;
            Self::check_extent(field, data.len(), flags, &mut cursor)
                .map_err(|e| self.latch(e))?;
            if skip {
                continue;
            }
            self.put_field(data, field, flags)?;
        }

        if flags & STRUCT_FULL_STRUCT != 0 && cursor != data.len() {
            return Err(self.latch(SsmError::FieldNotConsecutive));
        }
        if flags & STRUCT_NO_TAIL_MARKER == 0 {
            self.put_u32(STRUCT_MARKER_END)?;
        }
        Ok(())
    }

    fn put_field(&mut self, data: &[u8], field: &SsmField, flags: u32) -> SsmResult<()> {
        let bytes = |off: usize, cb: usize| &data[off..off + cb];
        match field.xfer {
            FieldXfer::Copy => self.put_mem(bytes(field.off, field.cb)),
            FieldXfer::GCPhys => {
                if field.cb != 8 {
                    return Err(self.latch(SsmError::FieldInvalidSize));
                }
                let v = u64::from_le_bytes(bytes(field.off, 8).try_into().unwrap_or_default());
                self.put_gc_phys(v)
            }
            FieldXfer::GCPtr => {
                if field.cb != 8 {
                    return Err(self.latch(SsmError::FieldInvalidSize));
                }
                let v = u64::from_le_bytes(bytes(field.off, 8).try_into().unwrap_or_default());
                self.put_gc_ptr(v)
            }
            FieldXfer::RCPtr => {
                if field.cb != 4 {
                    return Err(self.latch(SsmError::FieldInvalidSize));
                }
                self.put_mem(bytes(field.off, 4))
            }
            FieldXfer::RCPtrArray => {
                if field.cb == 0 || field.cb % 4 != 0 {
                    return Err(self.latch(SsmError::FieldInvalidSize));
                }
                self.put_mem(bytes(field.off, field.cb))
            }
            FieldXfer::HCPtrNi => self.put_hc_ptr_ni(bytes(field.off, field.cb), flags),
            FieldXfer::HCPtrNiArray => {
                let ptr_cb = self.host_ptr_cb();
                if field.cb == 0 || field.cb % ptr_cb != 0 {
                    return Err(self.latch(SsmError::FieldInvalidSize));
                }
                for i in 0..field.cb / ptr_cb {
                    self.put_hc_ptr_ni(bytes(field.off + i * ptr_cb, ptr_cb), flags)?;
                }
                Ok(())
            }
            FieldXfer::HCPtrHackU32 => {
                let ptr_cb = self.host_ptr_cb();
                if field.cb != ptr_cb {
                    return Err(self.latch(SsmError::FieldInvalidSize));
                }
                let mut raw = [0u8; 8];
                raw[..ptr_cb].copy_from_slice(bytes(field.off, ptr_cb));
                let v = u64::from_le_bytes(raw);
                if v > u64::from(u32::MAX) {
                    return Err(self.latch(SsmError::FieldInvalidValue));
                }
                self.put_u32(v as u32)?;
                if ptr_cb == 8 {
                    self.put_u32(0)?;
                }
                Ok(())
            }
            FieldXfer::U32ZxU64 => Err(self.latch(SsmError::FieldLoadOnlyTransformation)),
            FieldXfer::Ignore => {
                if flags & STRUCT_DONT_IGNORE != 0 {
                    self.put_zeros(field.cb)?;
                }
                Ok(())
            }
            FieldXfer::Old
            | FieldXfer::OldGCPhys
            | FieldXfer::OldGCPtr
            | FieldXfer::OldRCPtr
            | FieldXfer::OldHCPtr => Err(self.latch(SsmError::FieldLoadOnlyTransformation)),
            FieldXfer::Pad { cb32, cb64 } => {
                let wire = if self.host.bits == 64 { cb64 } else { cb32 } as usize;
                if field.cb != wire {
                    return Err(self.latch(SsmError::FieldInvalidPaddingSize));
                }
                self.put_zeros(wire)
            }
            FieldXfer::PadMsc32 { cb } => {
                let present = self.host.is_msc32;
                if field.cb != if present { cb as usize } else { 0 } {
                    return Err(self.latch(SsmError::FieldInvalidPaddingSize));
                }
                if present {
                    self.put_zeros(cb as usize)?;
                }
                Ok(())
            }
            FieldXfer::Callback(f) => f(self, field, FieldAccess::Put(data), flags),
        }
    }

    fn put_hc_ptr_ni(&mut self, raw: &[u8], flags: u32) -> SsmResult<()> {
        if raw.len() != self.host_ptr_cb() {
            return Err(self.latch(SsmError::FieldInvalidSize));
        }
        if flags & STRUCT_DONT_IGNORE != 0 {
            self.put_mem(raw)
        } else {
            self.put_bool(raw.iter().any(|&b| b != 0))
        }
    }

    fn put_zeros(&mut self, mut cb: usize) -> SsmResult<()> {
        const ZEROS: [u8; 64] = [0u8; 64];
        while cb > 0 {
            let n = cb.min(ZEROS.len());
            self.put_mem(&ZEROS[..n])?;
            cb -= n;
        }
        Ok(())
    }

    /// Read a struct with the full transform set, gated on the unit version
    /// delivered by the file.
    pub fn get_struct_ext(
        &mut self,
        data: &mut [u8],
        fields: &[SsmField],
        flags: u32,
    ) -> SsmResult<()> {
        if flags & !STRUCT_VALID_FLAGS != 0 {
            return Err(self.latch(SsmError::InvalidParameter));
        }
        if flags & STRUCT_NO_LEAD_MARKER == 0 {
            let marker = self.get_u32()?;
            if marker != STRUCT_MARKER_BEGIN {
                return Err(self.latch(SsmError::IntegrityUnit));
            }
        }

        let mut cursor = 0usize;
        for field in fields {
            // Skip fields younger than the saved unit; their memory is left
            // untouched, but coverage accounting still sees them.
            let skip = self.cur_unit_ver < field.first_version;
            Self::check_extent(field, data.len(), flags, &mut cursor)
                .map_err(|e| self.latch(e))?;
            if skip {
                continue;
            }
            self.get_field(data, field, flags)?;
        }

        if flags & STRUCT_FULL_STRUCT != 0 && cursor != data.len() {
            return Err(self.latch(SsmError::FieldNotConsecutive));
        }
        if flags & STRUCT_NO_TAIL_MARKER == 0 {
            let marker = self.get_u32()?;
            if marker != STRUCT_MARKER_END {
                return Err(self.latch(SsmError::IntegrityUnit));
            }
        }
        Ok(())
    }

    fn get_field(&mut self, data: &mut [u8], field: &SsmField, flags: u32) -> SsmResult<()> {
        match field.xfer {
            FieldXfer::Copy => self.get_mem(&mut data[field.off..field.off + field.cb]),
            FieldXfer::GCPhys => {
                if field.cb != 8 {
                    return Err(self.latch(SsmError::FieldInvalidSize));
                }
                let v = self.get_gc_phys()?;
                data[field.off..field.off + 8].copy_from_slice(&v.to_le_bytes());
                Ok(())
            }
            FieldXfer::GCPtr => {
                if field.cb != 8 {
                    return Err(self.latch(SsmError::FieldInvalidSize));
                }
                let v = self.get_gc_ptr()?;
                data[field.off..field.off + 8].copy_from_slice(&v.to_le_bytes());
                Ok(())
            }
            FieldXfer::RCPtr => {
                if field.cb != 4 {
                    return Err(self.latch(SsmError::FieldInvalidSize));
                }
                self.get_mem(&mut data[field.off..field.off + 4])
            }
            FieldXfer::RCPtrArray => {
                if field.cb == 0 || field.cb % 4 != 0 {
                    return Err(self.latch(SsmError::FieldInvalidSize));
                }
                self.get_mem(&mut data[field.off..field.off + field.cb])
            }
            FieldXfer::HCPtrNi => self.get_hc_ptr_ni(data, field.off, field.cb, flags),
            FieldXfer::HCPtrNiArray => {
                let ptr_cb = self.host_ptr_cb();
                if field.cb == 0 || field.cb % ptr_cb != 0 {
                    return Err(self.latch(SsmError::FieldInvalidSize));
                }
                for i in 0..field.cb / ptr_cb {
                    self.get_hc_ptr_ni(data, field.off + i * ptr_cb, ptr_cb, flags)?;
                }
                Ok(())
            }
            FieldXfer::HCPtrHackU32 => {
                let ptr_cb = self.host_ptr_cb();
                if field.cb != ptr_cb {
                    return Err(self.latch(SsmError::FieldInvalidSize));
                }
                let v = self.get_u32()?;
                if self.saved_ptr_cb()? == 8 {
                    let _ = self.get_u32()?;
                }
                let mut raw = [0u8; 8];
                raw[..4].copy_from_slice(&v.to_le_bytes());
                data[field.off..field.off + ptr_cb].copy_from_slice(&raw[..ptr_cb]);
                Ok(())
            }
            FieldXfer::U32ZxU64 => {
                if field.cb != 8 {
                    return Err(self.latch(SsmError::FieldInvalidSize));
                }
                let v = u64::from(self.get_u32()?);
                data[field.off..field.off + 8].copy_from_slice(&v.to_le_bytes());
                Ok(())
            }
            FieldXfer::Ignore => {
                if flags & STRUCT_DONT_IGNORE != 0 {
                    self.skip(field.cb as u64)?;
                }
                Ok(())
            }
            FieldXfer::Old => self.skip(field.cb as u64),
            FieldXfer::OldGCPhys => {
                let cb = u64::from(self.rs_ref()?.cb_gc_phys);
                self.skip(cb)
            }
            FieldXfer::OldGCPtr => {
                // Resolve the width the same way a real get would.
                let host_cb = self.host.cb_gc_ptr;
                let cb = {
                    let rs = self.rs()?;
                    if rs.cb_gc_ptr == 0 {
                        rs.cb_gc_ptr = host_cb;
                    }
                    rs.gc_ptr_fixed = true;
                    u64::from(rs.cb_gc_ptr)
                };
                self.skip(cb)
            }
            FieldXfer::OldRCPtr => self.skip(4),
            FieldXfer::OldHCPtr => {
                let cb = self.saved_ptr_cb()? as u64;
                self.skip(cb)
            }
            FieldXfer::Pad { cb32, cb64 } => {
                let host_wire = if self.host.bits == 64 { cb64 } else { cb32 } as usize;
                if field.cb != host_wire {
                    return Err(self.latch(SsmError::FieldInvalidPaddingSize));
                }
                let saved_wire = if self.rs_ref()?.host_bits == 64 { cb64 } else { cb32 };
                self.skip(u64::from(saved_wire))
            }
            FieldXfer::PadMsc32 { cb } => {
                let present_here = self.host.is_msc32;
                if field.cb != if present_here { cb as usize } else { 0 } {
                    return Err(self.latch(SsmError::FieldInvalidPaddingSize));
                }
                if self.rs_ref()?.is_host_msc32 {
                    self.skip(u64::from(cb))?;
                }
                Ok(())
            }
            FieldXfer::Callback(f) => f(self, field, FieldAccess::Get(data), flags),
        }
    }

    fn get_hc_ptr_ni(
        &mut self,
        data: &mut [u8],
        off: usize,
        cb: usize,
        flags: u32,
    ) -> SsmResult<()> {
        if cb != self.host_ptr_cb() {
            return Err(self.latch(SsmError::FieldInvalidSize));
        }
        if flags & STRUCT_DONT_IGNORE != 0 {
            let saved = self.saved_ptr_cb()? as u64;
            self.skip(saved)?;
        } else {
            let _ = self.get_bool()?;
        }
        // Host pointers never survive a load.
        data[off..off + cb].fill(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fmt::SSM_PASS_FINAL;
    use crate::handle::{FmtVer, HostCfg, SsmAfter, SsmOp};
    use crate::strm::{MemBackend, Strm};

    fn writer(version: u32) -> (MemBackend, SsmHandle) {
        let be = MemBackend::new();
        let strm = Strm::new_write(Box::new(be.clone()), 2, true);
        let mut h =
            SsmHandle::new_write(strm, SsmAfter::Destroy, false, 0, None, HostCfg::default());
        h.op = SsmOp::SaveExec;
        h.unit_open(version, SSM_PASS_FINAL);
        (be, h)
    }

    fn finish_writer(mut h: SsmHandle) {
        h.write_unit_term().unwrap();
        h.strm.set_end().unwrap();
        h.strm.close(false).unwrap();
    }

    fn reader(bytes: Vec<u8>, version: u32) -> SsmHandle {
        let strm = Strm::new_read(Box::new(MemBackend::from_bytes(bytes)), 2, true);
        let mut h = SsmHandle::new_read(
            strm,
            SsmAfter::Destroy,
            FmtVer::V2_0,
            None,
            HostCfg::default(),
        );
        h.op = SsmOp::LoadExec;
        h.unit_open(version, SSM_PASS_FINAL);
        h.data_read_begin().unwrap();
        {
            let rs = h.rs().unwrap();
            rs.host_bits = HostCfg::default().bits;
            rs.cb_gc_phys = 8;
            rs.cb_gc_ptr = HostCfg::default().cb_gc_ptr;
            rs.gc_ptr_fixed = true;
        }
        h
    }

    // A test struct laid out by hand as raw bytes:
    //   0..8   u64 counter        (Copy)
    //   8..16  u64 gc_phys        (GCPhys)
    //   16..24 usize-wide pointer (HCPtrNi)
    //   24..28 u32 mode           (Copy)
    //   28..32 pad                (Pad 4/4)
    const CB_STRUCT: usize = 32;

    fn fields() -> Vec<SsmField> {
        vec![
            SsmField::new(FieldXfer::Copy, 0, 8, "counter"),
            SsmField::new(FieldXfer::GCPhys, 8, 8, "gc_phys"),
            SsmField::new(FieldXfer::HCPtrNi, 16, 8, "owner_ptr"),
            SsmField::new(FieldXfer::Copy, 24, 4, "mode"),
            SsmField::new(FieldXfer::Pad { cb32: 4, cb64: 4 }, 28, 4, "pad"),
        ]
    }

    #[test]
    fn struct_ext_roundtrip_scrubs_pointers() {
        let mut src = [0u8; CB_STRUCT];
        src[0..8].copy_from_slice(&0x1111_2222_3333_4444u64.to_le_bytes());
        src[8..16].copy_from_slice(&0x0000_0000_dead_0000u64.to_le_bytes());
        src[16..24].copy_from_slice(&0x7fff_0000_1234_5678u64.to_le_bytes());
        src[24..28].copy_from_slice(&7u32.to_le_bytes());

        let (be, mut w) = writer(1);
        w.put_struct_ext(&src, &fields(), STRUCT_FULL_STRUCT).unwrap();
        finish_writer(w);

        let mut dst = [0xffu8; CB_STRUCT];
        let mut r = reader(be.to_vec(), 1);
        r.get_struct_ext(&mut dst, &fields(), STRUCT_FULL_STRUCT).unwrap();
        r.data_read_finish_v2().unwrap();

        assert_eq!(dst[0..8], src[0..8]);
        assert_eq!(dst[8..16], src[8..16]);
        assert_eq!(dst[16..24], [0u8; 8], "host pointer must be scrubbed");
        assert_eq!(dst[24..28], src[24..28]);
        // Padding bytes in memory are left as they were.
        assert_eq!(dst[28..32], [0xff; 4]);
    }

    #[test]
    fn version_gated_fields_are_skipped_consistently() {
        let gated = vec![
            SsmField::since(FieldXfer::Copy, 0, 4, 2, "foo"),
            SsmField::since(FieldXfer::Copy, 4, 4, 4, "bar"),
        ];
        let mut src = [0u8; 8];
        src[0..4].copy_from_slice(&0xaaaa_aaaau32.to_le_bytes());
        src[4..8].copy_from_slice(&0xbbbb_bbbbu32.to_le_bytes());

        // Saved by a version-3 unit: only foo goes on the wire.
        let (be, mut w) = writer(3);
        w.put_struct_ext(&src, &gated, 0).unwrap();
        finish_writer(w);
        let wire_v3 = be.to_vec();

        let mut dst = [0u8; 8];
        let mut r = reader(wire_v3, 3);
        r.get_struct_ext(&mut dst, &gated, 0).unwrap();
        r.data_read_finish_v2().unwrap();
        assert_eq!(dst[0..4], src[0..4], "foo read");
        assert_eq!(dst[4..8], [0u8; 4], "bar untouched");

        // Saved by a version-4 unit: both fields travel.
        let (be, mut w) = writer(4);
        w.put_struct_ext(&src, &gated, 0).unwrap();
        finish_writer(w);

        let mut dst = [0u8; 8];
        let mut r = reader(be.to_vec(), 4);
        r.get_struct_ext(&mut dst, &gated, 0).unwrap();
        r.data_read_finish_v2().unwrap();
        assert_eq!(dst, src);
    }

    #[test]
    fn markers_are_checked() {
        let f = vec![SsmField::new(FieldXfer::Copy, 0, 4, "x")];
        let (be, mut w) = writer(1);
        w.put_struct_ext(&[1, 2, 3, 4], &f, STRUCT_NO_MARKERS).unwrap();
        finish_writer(w);

        // Reader expects markers that were never written.
        let mut dst = [0u8; 4];
        let mut r = reader(be.to_vec(), 1);
        assert_eq!(
            r.get_struct_ext(&mut dst, &f, 0),
            Err(SsmError::IntegrityUnit)
        );
    }

    #[test]
    fn old_fields_skip_on_load_and_refuse_to_save() {
        let with_old = vec![
            SsmField::old(4, "legacy_word"),
            SsmField::new(FieldXfer::Copy, 0, 4, "current"),
        ];
        // A save must reject the load-only descriptor.
        let (_be, mut w) = writer(1);
        assert_eq!(
            w.put_struct_ext(&[0u8; 4], &with_old, 0),
            Err(SsmError::FieldLoadOnlyTransformation)
        );

        // Hand-write what an old binary produced: marker, the legacy word,
        // the current field, marker.
        let (be, mut w) = writer(1);
        w.put_u32(STRUCT_MARKER_BEGIN).unwrap();
        w.put_u32(0xdddd_dddd).unwrap(); // the legacy word an old binary wrote
        w.put_u32(0x1234_5678).unwrap();
        w.put_u32(STRUCT_MARKER_END).unwrap();
        finish_writer(w);

        let mut dst = [0u8; 4];
        let mut r = reader(be.to_vec(), 1);
        r.get_struct_ext(&mut dst, &with_old, 0).unwrap();
        assert_eq!(u32::from_le_bytes(dst), 0x1234_5678);
    }

    #[test]
    fn full_struct_gap_is_rejected() {
        let gappy = vec![
            SsmField::new(FieldXfer::Copy, 0, 4, "a"),
            SsmField::new(FieldXfer::Copy, 8, 4, "b"),
        ];
        let (_be, mut w) = writer(1);
        assert_eq!(
            w.put_struct_ext(&[0u8; 12], &gappy, STRUCT_FULL_STRUCT),
            Err(SsmError::FieldNotConsecutive)
        );
    }

    #[test]
    fn out_of_bounds_field_is_rejected() {
        let oob = vec![SsmField::new(FieldXfer::Copy, 8, 8, "beyond")];
        let (_be, mut w) = writer(1);
        assert_eq!(
            w.put_struct_ext(&[0u8; 12], &oob, 0),
            Err(SsmError::FieldOutOfBounds)
        );
    }

    #[test]
    fn simple_api_rejects_complex_descriptors() {
        let complex = vec![SsmField::new(FieldXfer::GCPhys, 0, 8, "addr")];
        let (_be, mut w) = writer(1);
        assert_eq!(
            w.put_struct(&[0u8; 8], &complex),
            Err(SsmError::FieldComplex)
        );
    }

    #[test]
    fn hcptr_hack_u32_rejects_high_half() {
        let f = vec![SsmField::new(FieldXfer::HCPtrHackU32, 0, 8, "ptr32")];
        let mut src = [0u8; 8];
        src.copy_from_slice(&0x1_0000_0000u64.to_le_bytes());
        let (_be, mut w) = writer(1);
        assert_eq!(
            w.put_struct_ext(&src, &f, STRUCT_NO_MARKERS),
            Err(SsmError::FieldInvalidValue)
        );
    }

    #[test]
    fn u32_zx_u64_loads_zero_extended() {
        let f = vec![SsmField::new(FieldXfer::U32ZxU64, 0, 8, "wide")];
        let (be, mut w) = writer(1);
        w.put_u32(0x9abc_def0).unwrap();
        finish_writer(w);

        let mut dst = [0u8; 8];
        let mut r = reader(be.to_vec(), 1);
        r.get_struct_ext(&mut dst, &f, STRUCT_NO_MARKERS).unwrap();
        assert_eq!(u64::from_le_bytes(dst), 0x9abc_def0);
    }

    #[test]
    fn callback_fields_run_in_both_directions() {
        fn double_cb(
            ssm: &mut SsmHandle,
            field: &SsmField,
            access: FieldAccess<'_>,
            _flags: u32,
        ) -> crate::err::SsmResult<()> {
            match access {
                FieldAccess::Put(data) => {
                    let v = u32::from_le_bytes(data[field.off..field.off + 4].try_into().unwrap());
                    ssm.put_u32(v * 2)
                }
                FieldAccess::Get(data) => {
                    let v = ssm.get_u32()?;
                    data[field.off..field.off + 4].copy_from_slice(&(v / 2).to_le_bytes());
                    Ok(())
                }
            }
        }

        let f = vec![SsmField::new(FieldXfer::Callback(double_cb), 0, 4, "doubled")];
        let src = 21u32.to_le_bytes();
        let (be, mut w) = writer(1);
        w.put_struct_ext(&src, &f, STRUCT_NO_MARKERS).unwrap();
        finish_writer(w);

        let mut dst = [0u8; 4];
        let mut r = reader(be.to_vec(), 1);
        r.get_struct_ext(&mut dst, &f, STRUCT_NO_MARKERS).unwrap();
        assert_eq!(dst, src);
    }
}
