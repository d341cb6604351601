//! Load orchestration: open/validate, the prep → exec → done state
//! machine for both format generations, and the random-access open-read
//! surface backed by the directory.
//!
//! V2 files are validated up front (header CRC, and for seekable backends
//! the footer as well), then consumed strictly: every unit's records must
//! be read exactly and end on the terminator.  V1 files get a whole-file
//! CRC check at open and a lenient skip-with-warning when a unit leaves
//! bytes unread, matching the historical loader they came from.

use std::path::Path;

use log::{debug, error, warn};

use crate::err::{SsmError, SsmResult};
use crate::fmt::{
    Dir, FileHdr, FileHdrV1, Footer, UnitHdr, UnitHdrV1, name_crc, DIR_ENTRY_OFF_ZERO_REV,
    DIR_ENTRY_SIZE, DIR_FIXED_SIZE, FILE_FLAGS_STREAM_CRC32, FILE_HDR_SIZE, FOOTER_SIZE,
    MAGIC_V1_1, MAGIC_V1_2, MAGIC_V2_0, SSM_PASS_FINAL, UNIT_HDR_FIXED_SIZE,
    V1_UNIT_HDR_FIXED_SIZE,
};
use crate::handle::{FmtVer, HostCfg, ProgressFn, SsmAfter, SsmHandle, SsmOp};
use crate::mgr::Ssm;
use crate::strm::{FileBackend, SeekMethod, Strm, StrmBackend, STRM_BUFFERS_READ, STRM_BUFFERS_VALIDATE};
use crate::unit::{enter_guard, Unit};

/// Cap on the forensic dump taken when a unit's load-exec fails.
const FORENSIC_DUMP_MAX: u64 = 256 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Open & validate
// ─────────────────────────────────────────────────────────────────────────────

/// Open a stream, read and validate the file header, and prime a read
/// handle.  The I/O worker is left stopped so callers that need to seek
/// (open-read) can; the loader starts it explicitly.
fn open_and_validate(
    backend: Box<dyn StrmBackend>,
    after: SsmAfter,
    n_bufs: usize,
    progress: Option<ProgressFn>,
    host: HostCfg,
) -> SsmResult<SsmHandle> {
    let mut strm = Strm::new_read(backend, n_bufs, true);

    let mut raw = [0u8; FILE_HDR_SIZE];
    strm.read(&mut raw)?;

    let fmt_ver = if raw[..32] == MAGIC_V2_0 {
        FmtVer::V2_0
    } else if raw[..32] == MAGIC_V1_1 {
        FmtVer::V1_1
    } else if raw[..32] == MAGIC_V1_2 {
        FmtVer::V1_2
    } else {
        let _ = strm.close(false);
        return Err(SsmError::IntegrityMagic);
    };

    let res = if fmt_ver == FmtVer::V2_0 {
        validate_v2(&mut strm, &raw)
    } else {
        validate_v1(&mut strm, &raw)
    };
    let info = match res {
        Ok(info) => info,
        Err(e) => {
            let _ = strm.close(false);
            return Err(e);
        }
    };

    let mut handle = SsmHandle::new_read(strm, after, fmt_ver, progress, host);
    {
        let rs = handle.rs()?;
        rs.host_bits = info.host_bits;
        rs.cb_gc_phys = info.cb_gc_phys;
        rs.cb_gc_ptr = info.cb_gc_ptr;
        rs.gc_ptr_fixed = info.cb_gc_ptr != 0;
        rs.ver_major = info.ver_major;
        rs.ver_minor = info.ver_minor;
        rs.ver_build = info.ver_build;
        rs.svn_rev = info.svn_rev;
        rs.cb_load_file = info.cb_file;
    }
    Ok(handle)
}

struct OpenInfo {
    host_bits: u8,
    cb_gc_phys: u8,
    cb_gc_ptr: u8,
    ver_major: u16,
    ver_minor: u16,
    ver_build: u32,
    svn_rev: u32,
    cb_file: u64,
}

fn validate_v2(strm: &mut Strm, raw: &[u8; FILE_HDR_SIZE]) -> SsmResult<OpenInfo> {
    let hdr = FileHdr::from_bytes(raw)?;
    if hdr.flags & FILE_FLAGS_STREAM_CRC32 == 0 {
        strm.disable_checksumming();
    }

    // Probe the footer up front when the backend can tell us its size
    // (local files always can; short or unseekable custom streams get the
    // strict sequential checks instead).
    let cb_file = strm.size().unwrap_or(0);
    if strm.is_file_backed() {
        if cb_file < (FILE_HDR_SIZE + FOOTER_SIZE) as u64 {
            return Err(SsmError::IntegritySize);
        }
        let mut tail = [0u8; FOOTER_SIZE];
        if strm.peek_at(cb_file - FOOTER_SIZE as u64, &mut tail)? != FOOTER_SIZE {
            return Err(SsmError::IntegrityFooter);
        }
        let footer = Footer::from_bytes(&tail)?;
        if footer.off_stream != cb_file - FOOTER_SIZE as u64 {
            return Err(SsmError::IntegrityFooter);
        }
    }

    Ok(OpenInfo {
        host_bits: hdr.host_bits,
        cb_gc_phys: hdr.cb_gc_phys,
        cb_gc_ptr: hdr.cb_gc_ptr,
        ver_major: hdr.ver_major,
        ver_minor: hdr.ver_minor,
        ver_build: hdr.ver_build,
        svn_rev: hdr.svn_rev,
        cb_file,
    })
}

fn validate_v1(strm: &mut Strm, raw: &[u8; FILE_HDR_SIZE]) -> SsmResult<OpenInfo> {
    let hdr = FileHdrV1::from_bytes(raw)?;
    // No rolling CRC in this generation; integrity is one CRC over the
    // whole file with the CRC field zeroed.
    strm.disable_checksumming();

    let cb_file = strm.size()?;
    let mut hasher = crc32fast::Hasher::new();
    let mut first = *raw;
    first[32..36].copy_from_slice(&[0; 4]);
    hasher.update(&first);
    let mut off = FILE_HDR_SIZE as u64;
    let mut chunk = vec![0u8; 64 * 1024];
    while off < cb_file {
        let n = strm.peek_at(off, &mut chunk)?;
        if n == 0 {
            return Err(SsmError::IntegritySize);
        }
        hasher.update(&chunk[..n]);
        off += n as u64;
    }
    if hasher.finalize() != hdr.crc {
        return Err(SsmError::IntegrityCrc);
    }

    Ok(OpenInfo {
        host_bits: hdr.host_bits,
        cb_gc_phys: if hdr.cb_gc_phys != 0 { hdr.cb_gc_phys } else { 8 },
        cb_gc_ptr: hdr.cb_gc_ptr,
        ver_major: 1,
        ver_minor: hdr.ver_minor,
        ver_build: hdr.ver_build,
        svn_rev: 0,
        cb_file,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Load entry points
// ─────────────────────────────────────────────────────────────────────────────

impl Ssm {
    /// Load a saved state from a local file.
    pub fn load_path(
        &self,
        path: &Path,
        after: SsmAfter,
        progress: Option<ProgressFn>,
    ) -> SsmResult<()> {
        let backend = FileBackend::open(path)?;
        self.load(Box::new(backend), after, progress)
    }

    /// Load a saved state from a caller-supplied backend.
    pub fn load(
        &self,
        backend: Box<dyn StrmBackend>,
        after: SsmAfter,
        progress: Option<ProgressFn>,
    ) -> SsmResult<()> {
        let mut handle = open_and_validate(
            backend,
            after,
            STRM_BUFFERS_READ,
            progress,
            self.host.clone(),
        )?;
        if let Err(e) = self.op_register(&handle) {
            let _ = handle.strm.close(false);
            return Err(e);
        }
        if let Err(e) = handle.strm.start_io_thread() {
            self.op_deregister();
            let _ = handle.strm.close(false);
            return Err(e);
        }

        let fmt_v1 = handle.rs()?.fmt_ver.is_v1();
        let mut rc;
        {
            let mut units = self.units_lock();
            for u in units.iter_mut() {
                u.reset_op_state();
            }
            rc = load_prep_phase(&mut units, &mut handle).err();
            if rc.is_none() {
                rc = if fmt_v1 {
                    load_exec_v1(&mut units, &mut handle).err()
                } else {
                    load_exec_v2(&mut units, &mut handle).err()
                };
            }
            let done_err = load_done_phase(&mut units, &mut handle);
            if rc.is_none() {
                rc = done_err;
            }
        }
        rc = rc.or(handle.rc);

        self.op_deregister();
        if let Some(msg) = handle.load_error_msg() {
            error!("load failed: {msg}");
        }
        let close_res = handle.strm.close(rc.is_some());
        match rc {
            Some(e) => Err(e),
            None => {
                close_res?;
                Ok(())
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Phases
// ─────────────────────────────────────────────────────────────────────────────

fn load_prep_phase(units: &mut [Unit], handle: &mut SsmHandle) -> SsmResult<()> {
    handle.op = SsmOp::LoadPrep;
    handle.cb_est_total = 0;
    for unit in units.iter_mut() {
        handle.check_cancelled()?;
        handle.cb_est_total += unit.cb_guess;
        let cs = unit.scope_guard();
        let rc = {
            let _g = enter_guard(&cs);
            match unit.ops.load_prep.as_mut() {
                Some(f) => f(handle),
                None => Ok(()),
            }
        };
        if let Err(e) = rc {
            error!("load prep failed for unit '{}' #{}: {e}", unit.name, unit.instance);
            return Err(handle.latch(e));
        }
    }
    let pct = handle.percent_prepare;
    handle.progress(pct);
    Ok(())
}

/// Read one v2 unit header (fixed part + name), validating position and
/// CRC checkpoint.
fn read_unit_hdr_v2(handle: &mut SsmHandle) -> SsmResult<UnitHdr> {
    let off_hdr = handle.strm.tell();
    let crc_before = if handle.strm.is_checksummed() {
        handle.strm.cur_crc()
    } else {
        0
    };
    let mut fixed = [0u8; UNIT_HDR_FIXED_SIZE];
    handle.strm.read(&mut fixed)?;
    let (_end, cb_name) = UnitHdr::peek_cb_name(&fixed)?;
    let mut full = fixed.to_vec();
    if cb_name > 0 {
        let mut name = vec![0u8; cb_name];
        handle.strm.read(&mut name)?;
        full.extend_from_slice(&name);
    }
    let hdr = UnitHdr::from_bytes(&full)?;
    if hdr.off_stream != off_hdr {
        return Err(SsmError::IntegrityUnit);
    }
    if handle.strm.is_checksummed() && hdr.cur_stream_crc != crc_before {
        return Err(SsmError::IntegrityUnit);
    }
    Ok(hdr)
}

fn load_exec_v2(units: &mut [Unit], handle: &mut SsmHandle) -> SsmResult<()> {
    handle.op = SsmOp::LoadExec;
    let est = handle.cb_est_total.max(1);
    let base = handle.percent_prepare;
    let span = 100u32.saturating_sub(base + handle.percent_done);
    let mut cum = 0u64;

    loop {
        handle.check_cancelled()?;
        let hdr = match read_unit_hdr_v2(handle) {
            Ok(hdr) => hdr,
            Err(e) => return Err(handle.latch(e)),
        };
        if hdr.end {
            break;
        }

        let idx = units
            .iter()
            .position(|u| u.name == hdr.name && u.instance == hdr.instance);
        let Some(idx) = idx else {
            if handle.after == SsmAfter::Debug {
                warn!(
                    "skipping unknown unit '{}' #{} (debug mode)",
                    hdr.name, hdr.instance
                );
                handle.unit_open(hdr.version, hdr.pass);
                handle.data_read_begin()?;
                let res = handle.skip_to_end_of_unit();
                handle.unit_close();
                res?;
                continue;
            }
            return Err(handle.set_load_error(
                SsmError::UnitNotFound,
                format!("no such unit: '{}' instance #{}", hdr.name, hdr.instance),
            ));
        };

        if units[idx].ops.load_exec.is_none() {
            return Err(handle.set_load_error(
                SsmError::NoLoadExec,
                format!("unit '{}' #{} has no load-exec", hdr.name, hdr.instance),
            ));
        }
        units[idx].called = true;

        {
            let rs = handle.rs()?;
            rs.cur_unit_name = hdr.name.clone();
            rs.cur_unit_instance = hdr.instance;
        }
        handle.unit_open(hdr.version, hdr.pass);
        handle.data_read_begin()?;
        let data_start = handle.strm.tell();

        let cs = units[idx].scope_guard();
        let rc = {
            let _g = enter_guard(&cs);
            match units[idx].ops.load_exec.as_mut() {
                Some(f) => f(handle, hdr.version, hdr.pass),
                None => Ok(()),
            }
        };
        let rc = rc.and_then(|()| handle.data_read_finish_v2());
        handle.unit_close();
        if let Err(e) = rc {
            debug!(
                "unit '{}' failed; last record type/flags {:#04x}",
                hdr.name,
                handle.rs()?.type_and_flags
            );
            forensic_dump(handle, data_start);
            if !handle.rs()?.have_set_error {
                let _ = handle.set_load_error(
                    e,
                    format!("unit '{}' #{} failed to load", hdr.name, hdr.instance),
                );
            }
            return Err(handle.latch(e));
        }

        if hdr.pass == SSM_PASS_FINAL {
            cum += units[idx].cb_guess;
            let pct = base + (span as u64 * cum / est) as u32;
            handle.progress(pct.min(base + span));
        }
    }

    // Directory: read forward and cross-check against the footer.
    let mut dir_fixed = [0u8; DIR_FIXED_SIZE];
    handle.strm.read(&mut dir_fixed)?;
    if dir_fixed[..8] != crate::fmt::DIR_MAGIC {
        return Err(handle.latch(SsmError::IntegrityDirMagic));
    }
    let count = u32::from_le_bytes([dir_fixed[12], dir_fixed[13], dir_fixed[14], dir_fixed[15]]);
    let cb_file = handle.rs_ref()?.cb_load_file;
    if cb_file > 0 && u64::from(count) * DIR_ENTRY_SIZE as u64 > cb_file {
        return Err(handle.latch(SsmError::IntegrityDir));
    }
    let mut dir_all = dir_fixed.to_vec();
    let cb_entries = count as usize * DIR_ENTRY_SIZE;
    let mut entries = vec![0u8; cb_entries];
    handle.strm.read(&mut entries)?;
    dir_all.extend_from_slice(&entries);
    let dir = Dir::from_bytes(&dir_all).map_err(|e| handle.latch(e))?;

    let stream_crc = if handle.strm.is_checksummed() {
        handle.strm.final_crc()
    } else {
        0
    };
    handle.strm.disable_checksumming();
    let mut tail = [0u8; FOOTER_SIZE];
    handle.strm.read(&mut tail)?;
    let footer = Footer::from_bytes(&tail).map_err(|e| handle.latch(e))?;
    if footer.c_dir_entries as usize != dir.entries.len() {
        return Err(handle.latch(SsmError::IntegrityFooter));
    }
    if footer.stream_crc != stream_crc {
        return Err(handle.latch(SsmError::IntegrityCrc));
    }

    let pct = 100 - handle.percent_done;
    handle.progress(pct);
    Ok(())
}

fn load_exec_v1(units: &mut [Unit], handle: &mut SsmHandle) -> SsmResult<()> {
    handle.op = SsmOp::LoadExec;
    loop {
        handle.check_cancelled()?;

        let mut fixed = [0u8; V1_UNIT_HDR_FIXED_SIZE];
        match handle.strm.read(&mut fixed) {
            Ok(()) => {}
            // Historical files may simply stop after the last unit.
            Err(SsmError::Io(std::io::ErrorKind::UnexpectedEof)) => break,
            Err(e) => return Err(handle.latch(e)),
        }
        let (_end, cb_name) = UnitHdrV1::peek_cb_name(&fixed).map_err(|e| handle.latch(e))?;
        let mut full = fixed.to_vec();
        if cb_name > 0 {
            let mut name = vec![0u8; cb_name];
            handle.strm.read(&mut name)?;
            full.extend_from_slice(&name);
        }
        let hdr = UnitHdrV1::from_bytes(&full).map_err(|e| handle.latch(e))?;
        if hdr.end {
            break;
        }
        let data_end = handle.strm.tell() + hdr.cb_unit;

        let idx = units
            .iter()
            .position(|u| u.name == hdr.name && u.instance == hdr.instance);
        let Some(idx) = idx else {
            if handle.after == SsmAfter::Debug {
                warn!(
                    "skipping unknown unit '{}' #{} (debug mode)",
                    hdr.name, hdr.instance
                );
                skip_stream_to(handle, data_end)?;
                continue;
            }
            return Err(handle.set_load_error(
                SsmError::UnitNotFound,
                format!("no such unit: '{}' instance #{}", hdr.name, hdr.instance),
            ));
        };
        if units[idx].ops.load_exec.is_none() {
            return Err(handle.set_load_error(
                SsmError::NoLoadExec,
                format!("unit '{}' #{} has no load-exec", hdr.name, hdr.instance),
            ));
        }
        units[idx].called = true;

        {
            let rs = handle.rs()?;
            rs.cur_unit_name = hdr.name.clone();
            rs.cur_unit_instance = hdr.instance;
        }
        handle.unit_open(hdr.version, SSM_PASS_FINAL);
        handle.data_read_begin_v1(hdr.cb_unit)?;

        let cs = units[idx].scope_guard();
        let rc = {
            let _g = enter_guard(&cs);
            match units[idx].ops.load_exec.as_mut() {
                Some(f) => f(handle, hdr.version, SSM_PASS_FINAL),
                None => Ok(()),
            }
        };
        let left = handle.v1_unit_left();
        handle.unit_close();
        match rc {
            Ok(()) => {
                if left > 0 {
                    // Old loaders tolerated this; keep it a warning.
                    warn!(
                        "unit '{}' #{} left {left} compressed bytes unread; skipping",
                        hdr.name, hdr.instance
                    );
                    skip_stream_to(handle, data_end)?;
                }
            }
            Err(e) => {
                if !handle.rs()?.have_set_error {
                    let _ = handle.set_load_error(
                        e,
                        format!("unit '{}' #{} failed to load", hdr.name, hdr.instance),
                    );
                }
                return Err(handle.latch(e));
            }
        }
    }
    let pct = 100 - handle.percent_done;
    handle.progress(pct);
    Ok(())
}

/// Advance the raw stream to `target` (v1 resync and debug-mode skips).
/// The stream only moves forward.
fn skip_stream_to(handle: &mut SsmHandle, target: u64) -> SsmResult<()> {
    let cur = handle.strm.tell();
    if cur > target {
        return Err(handle.latch(SsmError::SkipBackwards));
    }
    let mut cb = target - cur;
    let mut scratch = [0u8; 4096];
    while cb > 0 {
        let n = cb.min(scratch.len() as u64) as usize;
        handle.strm.read(&mut scratch[..n])?;
        cb -= n as u64;
    }
    Ok(())
}

fn load_done_phase(units: &mut [Unit], handle: &mut SsmHandle) -> Option<SsmError> {
    handle.op = SsmOp::LoadDone;
    let mut first: Option<SsmError> = None;
    for unit in units.iter_mut() {
        if unit.ops.load_done.is_none() {
            continue;
        }
        let cs = unit.scope_guard();
        let rc = {
            let _g = enter_guard(&cs);
            match unit.ops.load_done.as_mut() {
                Some(f) => f(handle),
                None => Ok(()),
            }
        };
        if let Err(e) = rc {
            error!("load done failed for unit '{}' #{}: {e}", unit.name, unit.instance);
            first.get_or_insert(e);
        }
    }
    if first.is_none() && handle.rc.is_none() {
        handle.progress(100);
    }
    first
}

/// Dump (at debug level) up to 256 KiB of the failing unit's raw bytes so
/// the corruption can be analyzed offline.
fn forensic_dump(handle: &mut SsmHandle, data_start: u64) {
    let end = handle.strm.tell();
    let cb = end.saturating_sub(data_start).min(FORENSIC_DUMP_MAX);
    if cb == 0 {
        return;
    }
    handle.strm.stop_io_thread();
    if handle.strm.seek(data_start as i64, SeekMethod::Begin, 0).is_err() {
        return;
    }
    error!(
        "dumping {cb} bytes of failing unit data at stream offset {data_start} (debug level)"
    );
    let mut buf = [0u8; 64];
    let mut off = data_start;
    let mut left = cb;
    while left > 0 {
        let n = left.min(buf.len() as u64) as usize;
        if handle.strm.read(&mut buf[..n]).is_err() {
            break;
        }
        let hex: String = buf[..n].iter().map(|b| format!("{b:02x}")).collect();
        debug!("  {off:#010x}: {hex}");
        off += n as u64;
        left -= n as u64;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Open-read: random access through the directory
// ─────────────────────────────────────────────────────────────────────────────

/// A saved-state file opened for inspection.  Units are located through
/// the trailing directory and their data read with the ordinary get APIs.
pub struct SavedState {
    handle: SsmHandle,
    dir: Dir,
    svn_rev: u32,
}

impl SavedState {
    /// Open a local file for inspection.
    pub fn open_path(path: &Path) -> SsmResult<SavedState> {
        let backend = FileBackend::open(path)?;
        SavedState::open(Box::new(backend))
    }

    /// Open a caller-supplied backend for inspection.  Only the current
    /// format generation carries a directory, so only it is supported.
    pub fn open(backend: Box<dyn StrmBackend>) -> SsmResult<SavedState> {
        let mut handle = open_and_validate(
            backend,
            SsmAfter::Opened,
            STRM_BUFFERS_VALIDATE,
            None,
            HostCfg::default(),
        )?;
        let (fmt_ver, cb_file) = {
            let rs = handle.rs_ref()?;
            (rs.fmt_ver, rs.cb_load_file)
        };
        if fmt_ver != FmtVer::V2_0 {
            let _ = handle.strm.close(false);
            return Err(SsmError::IntegrityVersion);
        }
        handle.op = SsmOp::OpenRead;

        // The footer names the directory size; both sit at the tail.
        let res = (|| -> SsmResult<Dir> {
            let mut tail = [0u8; FOOTER_SIZE];
            if handle.strm.peek_at(cb_file - FOOTER_SIZE as u64, &mut tail)? != FOOTER_SIZE {
                return Err(SsmError::IntegrityFooter);
            }
            let footer = Footer::from_bytes(&tail)?;
            let cb_dir = DIR_FIXED_SIZE + footer.c_dir_entries as usize * DIR_ENTRY_SIZE;
            let dir_off = cb_file
                .checked_sub((FOOTER_SIZE + cb_dir) as u64)
                .ok_or(SsmError::IntegrityDir)?;
            let mut dir_bytes = vec![0u8; cb_dir];
            if handle.strm.peek_at(dir_off, &mut dir_bytes)? != cb_dir {
                return Err(SsmError::IntegrityDir);
            }
            Dir::from_bytes(&dir_bytes)
        })();
        let dir = match res {
            Ok(dir) => dir,
            Err(e) => {
                let _ = handle.strm.close(false);
                return Err(e);
            }
        };

        let svn_rev = handle.rs_ref()?.svn_rev;
        Ok(SavedState {
            handle,
            dir,
            svn_rev,
        })
    }

    /// Directory entry count.
    pub fn unit_count(&self) -> usize {
        self.dir.entries.len()
    }

    /// Position the read cursor on a unit's data; returns its stored
    /// version and pass.
    pub fn seek_unit(&mut self, name: &str, instance: u32) -> SsmResult<(u32, u32)> {
        let crc = name_crc(name);
        for entry in self.dir.entries.iter().filter(|e| e.name_crc == crc) {
            if entry.instance != instance {
                continue;
            }
            if entry.off == 0 {
                // Some historical files wrote zero offsets; tolerate them
                // for saves made before the fix, reject them after.
                if self.svn_rev < DIR_ENTRY_OFF_ZERO_REV {
                    debug!("ignoring zero directory offset for '{name}' (rev {})", self.svn_rev);
                    continue;
                }
                return Err(SsmError::IntegrityDir);
            }

            // First pass: learn the header's CRC checkpoint, then re-seek
            // with it as the seed so the terminator checks line up.
            self.handle.strm.seek(entry.off as i64, SeekMethod::Begin, 0)?;
            let hdr = read_unit_hdr_seeked(&mut self.handle, entry.off)?;
            if hdr.name != name || hdr.instance != instance || hdr.end {
                continue;
            }
            self.handle
                .strm
                .seek(entry.off as i64, SeekMethod::Begin, hdr.cur_stream_crc)?;
            let hdr = read_unit_hdr_seeked(&mut self.handle, entry.off)?;

            self.handle.unit_open(hdr.version, hdr.pass);
            {
                let rs = self.handle.rs()?;
                rs.cur_unit_name = hdr.name.clone();
                rs.cur_unit_instance = hdr.instance;
            }
            self.handle.data_read_begin()?;
            return Ok((hdr.version, hdr.pass));
        }
        Err(SsmError::UnitNotFound)
    }

    /// Access the data-field get APIs for the currently seeked unit.
    pub fn handle(&mut self) -> &mut SsmHandle {
        &mut self.handle
    }

    /// Saved-binary version triple recorded in the header.
    pub fn saved_version(&self) -> (u16, u16, u32) {
        self.handle.saved_version()
    }

    pub fn close(self) -> SsmResult<()> {
        self.handle.strm.close(false)
    }
}

/// Read a unit header at a known offset without positional cross-checks
/// against the sequential cursor (the caller just seeked).
fn read_unit_hdr_seeked(handle: &mut SsmHandle, off: u64) -> SsmResult<UnitHdr> {
    let mut fixed = [0u8; UNIT_HDR_FIXED_SIZE];
    handle.strm.read(&mut fixed)?;
    let (_end, cb_name) = UnitHdr::peek_cb_name(&fixed)?;
    let mut full = fixed.to_vec();
    if cb_name > 0 {
        let mut name = vec![0u8; cb_name];
        handle.strm.read(&mut name)?;
        full.extend_from_slice(&name);
    }
    let hdr = UnitHdr::from_bytes(&full)?;
    if hdr.off_stream != off {
        return Err(SsmError::IntegrityUnit);
    }
    Ok(hdr)
}
