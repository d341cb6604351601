//! The saved-state operation context.
//!
//! One [`SsmHandle`] exists per running save, load or live-save operation.
//! It owns the stream, the sticky first-error status, the cancellation
//! word, the per-unit byte counters, and one of two mode-specific
//! sub-states (write coalescing or read buffering).  Unit callbacks
//! receive `&mut SsmHandle` and talk to the data-field layer through it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::error;

use crate::err::{SsmError, SsmResult};
use crate::fmt::STREAM_REV;
use crate::strm::Strm;

/// Cancellation word: operation in progress.
pub const CANCEL_OK: u32 = 0x7777_7777;
/// Cancellation word: cancel requested.
pub const CANCEL_CANCELLED: u32 = 0xdead_beef;

/// Coalescing/data buffer size shared by the write and read paths.
pub(crate) const DATA_BUF_SIZE: usize = 4096;

/// Worst-case slack reserved when trying to compress a data block; a block
/// that does not shrink below `DATA_BUF_SIZE - DATA_COMPR_SLACK` is stored
/// raw instead.
pub(crate) const DATA_COMPR_SLACK: usize = 256;

// ─────────────────────────────────────────────────────────────────────────────
// Operation enums
// ─────────────────────────────────────────────────────────────────────────────

/// What the handle is currently doing; checked by every data-field call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SsmOp {
    #[default]
    Invalid,
    LivePrep,
    LiveStep1,
    LiveExec,
    LiveVote,
    LiveStep2,
    SavePrep,
    SaveExec,
    SaveDone,
    LoadPrep,
    LoadExec,
    LoadDone,
    OpenRead,
}

/// What the caller intends to do with the VM once the operation finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SsmAfter {
    #[default]
    Destroy,
    Continue,
    Teleport,
    Resume,
    /// Debug-it mode: unknown units in the file are skipped, not fatal.
    Debug,
    Opened,
}

/// Progress callback: percent, monotonically non-decreasing, 0..=100.
pub type ProgressFn = Box<dyn FnMut(u32) + Send>;

// ─────────────────────────────────────────────────────────────────────────────
// Host configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Widths and identity of the host running this engine.  The defaults
/// describe the actual build target; tests override them to exercise the
/// cross-width load paths.
#[derive(Debug, Clone)]
pub struct HostCfg {
    /// 32 or 64.
    pub bits: u8,
    /// Wire width of guest-physical addresses (4 or 8).
    pub cb_gc_phys: u8,
    /// Wire width of guest pointers (4 or 8).
    pub cb_gc_ptr: u8,
    /// 32-bit MSC-style struct padding quirks apply.
    pub is_msc32: bool,
    /// "os.arch" identity written by the built-in self unit.
    pub os_and_arch: String,
}

impl Default for HostCfg {
    fn default() -> Self {
        let ptr = std::mem::size_of::<usize>() as u8;
        HostCfg {
            bits: ptr * 8,
            cb_gc_phys: 8,
            cb_gc_ptr: ptr,
            is_msc32: false,
            os_and_arch: format!("{}.{}", std::env::consts::OS, std::env::consts::ARCH),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Mode-specific sub-states
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) struct WriteState {
    /// Coalescing buffer for small puts.
    pub data_buf: Box<[u8]>,
    pub off_data: usize,
    /// Compression scratch for the big-put streaming path.
    pub compr_scratch: Box<[u8]>,
    /// Stored for live-vote callbacks; the engine itself never acts on it.
    pub max_downtime_ms: u32,
}

impl WriteState {
    pub fn new(max_downtime_ms: u32) -> Self {
        WriteState {
            data_buf: vec![0u8; DATA_BUF_SIZE].into_boxed_slice(),
            off_data: 0,
            compr_scratch: vec![0u8; DATA_BUF_SIZE].into_boxed_slice(),
            max_downtime_ms,
        }
    }
}

/// Which format generation the open file uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FmtVer {
    V1_1,
    V1_2,
    V2_0,
}

impl FmtVer {
    pub fn is_v1(self) -> bool {
        !matches!(self, FmtVer::V2_0)
    }
}

pub(crate) struct ReadState {
    pub fmt_ver: FmtVer,

    // v2 record cursor.
    /// Raw payload bytes remaining in the current record.
    pub cb_rec_left: u64,
    /// Decompressed-data buffer plus its fill level and read cursor.
    pub data_buf: Box<[u8]>,
    pub cb_data: usize,
    pub off_data: usize,
    /// The terminator has been reached; further reads are "too much".
    pub end_of_data: bool,
    /// Latched type-and-flags byte of the current record.
    pub type_and_flags: u8,
    /// Decompression scratch (compressed input side).
    pub decomp_scratch: Box<[u8]>,

    // v1 unit cursor: compressed payload bytes left in the current unit.
    pub cb_unit_left_v1: u64,

    // Saved-file identity.
    pub host_bits: u8,
    pub cb_gc_phys: u8,
    /// Zero means "not yet known" (v1.1 before `set_gc_ptr_size`).
    pub cb_gc_ptr: u8,
    /// Latched once the width has been used or came from a header.
    pub gc_ptr_fixed: bool,
    pub host_os_and_arch: String,
    pub is_host_msc32: bool,
    pub ver_major: u16,
    pub ver_minor: u16,
    pub ver_build: u32,
    pub svn_rev: u32,
    pub cb_load_file: u64,

    // Current unit context for error reporting.
    pub cur_unit_name: String,
    pub cur_unit_instance: u32,
    /// A callback already reported a detailed load error; keep it.
    pub have_set_error: bool,
    pub load_error: Option<String>,
}

impl ReadState {
    pub fn new(fmt_ver: FmtVer) -> Self {
        ReadState {
            fmt_ver,
            cb_rec_left: 0,
            data_buf: vec![0u8; DATA_BUF_SIZE].into_boxed_slice(),
            cb_data: 0,
            off_data: 0,
            end_of_data: false,
            type_and_flags: 0,
            decomp_scratch: vec![0u8; DATA_BUF_SIZE].into_boxed_slice(),
            cb_unit_left_v1: 0,
            host_bits: 0,
            cb_gc_phys: 0,
            cb_gc_ptr: 0,
            gc_ptr_fixed: false,
            host_os_and_arch: String::new(),
            is_host_msc32: false,
            ver_major: 0,
            ver_minor: 0,
            ver_build: 0,
            svn_rev: 0,
            cb_load_file: 0,
            cur_unit_name: String::new(),
            cur_unit_instance: 0,
            have_set_error: false,
            load_error: None,
        }
    }
}

pub(crate) enum Mode {
    Write(WriteState),
    Read(ReadState),
}

// ─────────────────────────────────────────────────────────────────────────────
// The handle
// ─────────────────────────────────────────────────────────────────────────────

/// Context of one save/load/live-save operation.  Passed to every unit
/// callback; all data-field APIs live on this type.
pub struct SsmHandle {
    pub(crate) strm: Strm,
    pub(crate) op: SsmOp,
    pub(crate) after: SsmAfter,
    pub(crate) cancelled: Arc<AtomicU32>,
    /// Sticky first error; all later data calls short-circuit to it.
    pub(crate) rc: Option<SsmError>,
    /// Bytes in the current unit, record framing included.
    /// `u64::MAX` while no unit is open.
    pub(crate) off_unit: u64,
    /// User-visible payload bytes read/written in the current unit.
    pub(crate) off_unit_user: u64,
    pub(crate) live_save: bool,
    /// Version and pass of the unit currently being processed.
    pub(crate) cur_unit_ver: u32,
    pub(crate) cur_unit_pass: u32,

    // Progress.
    pub(crate) progress_fn: Option<ProgressFn>,
    pub(crate) percent: u32,
    pub(crate) percent_prepare: u32,
    pub(crate) percent_done: u32,
    pub(crate) percent_live: u32,
    pub(crate) cb_est_total: u64,
    pub(crate) percent_live_reported: u32,

    pub(crate) host: HostCfg,
    pub(crate) mode: Mode,
}

impl SsmHandle {
    pub(crate) fn new_write(
        strm: Strm,
        after: SsmAfter,
        live_save: bool,
        max_downtime_ms: u32,
        progress_fn: Option<ProgressFn>,
        host: HostCfg,
    ) -> SsmHandle {
        SsmHandle {
            strm,
            op: SsmOp::Invalid,
            after,
            cancelled: Arc::new(AtomicU32::new(CANCEL_OK)),
            rc: None,
            off_unit: u64::MAX,
            off_unit_user: u64::MAX,
            live_save,
            cur_unit_ver: 0,
            cur_unit_pass: 0,
            progress_fn,
            percent: 0,
            percent_prepare: 2,
            percent_done: 2,
            percent_live: if live_save { 75 } else { 0 },
            cb_est_total: 0,
            percent_live_reported: 0,
            host,
            mode: Mode::Write(WriteState::new(max_downtime_ms)),
        }
    }

    pub(crate) fn new_read(
        strm: Strm,
        after: SsmAfter,
        fmt_ver: FmtVer,
        progress_fn: Option<ProgressFn>,
        host: HostCfg,
    ) -> SsmHandle {
        SsmHandle {
            strm,
            op: SsmOp::Invalid,
            after,
            cancelled: Arc::new(AtomicU32::new(CANCEL_OK)),
            rc: None,
            off_unit: u64::MAX,
            off_unit_user: u64::MAX,
            live_save: false,
            cur_unit_ver: 0,
            cur_unit_pass: 0,
            progress_fn,
            percent: 0,
            percent_prepare: 2,
            percent_done: 2,
            percent_live: 0,
            cb_est_total: 0,
            percent_live_reported: 0,
            host,
            mode: Mode::Read(ReadState::new(fmt_ver)),
        }
    }

    // ── Mode accessors ───────────────────────────────────────────────────────

    pub(crate) fn rs(&mut self) -> SsmResult<&mut ReadState> {
        match &mut self.mode {
            Mode::Read(rs) => Ok(rs),
            Mode::Write(_) => Err(SsmError::InvalidParameter),
        }
    }

    pub(crate) fn rs_ref(&self) -> SsmResult<&ReadState> {
        match &self.mode {
            Mode::Read(rs) => Ok(rs),
            Mode::Write(_) => Err(SsmError::InvalidParameter),
        }
    }

    // ── Status / cancellation ────────────────────────────────────────────────

    /// Latch the first error; returns it for `Err(...)` convenience.
    pub(crate) fn latch(&mut self, e: SsmError) -> SsmError {
        if self.rc.is_none() {
            self.rc = Some(e);
        }
        e
    }

    /// Cancellation + sticky-error poll; the hot-path check.
    pub(crate) fn check_cancelled(&mut self) -> SsmResult<()> {
        if self.cancelled.load(Ordering::Relaxed) == CANCEL_CANCELLED {
            self.strm.set_error(SsmError::Cancelled);
            return Err(self.latch(SsmError::Cancelled));
        }
        match self.rc {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// The operation's sticky status: `Ok` while nothing has failed.
    pub fn status(&self) -> SsmResult<()> {
        match self.rc {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Latch a failure from a callback without returning through the data
    /// API (rarely needed; most callbacks just propagate with `?`).
    pub fn set_status(&mut self, e: SsmError) {
        let _ = self.latch(e);
    }

    // ── Callback introspection surface ───────────────────────────────────────

    /// What the caller will do with the VM after this operation.
    pub fn after(&self) -> SsmAfter {
        self.after
    }

    /// True while inside a live-save operation.
    pub fn is_live_save(&self) -> bool {
        self.live_save
    }

    /// Max acceptable downtime hint for live-save vote logic.  Stored and
    /// exposed only; the engine takes no decisions from it.
    pub fn max_downtime_ms(&self) -> u32 {
        match &self.mode {
            Mode::Write(ws) => ws.max_downtime_ms,
            Mode::Read(_) => 0,
        }
    }

    /// Host bit width: the saved file's on load, this host's on save.
    pub fn host_bits(&self) -> u8 {
        match &self.mode {
            Mode::Read(rs) => rs.host_bits,
            Mode::Write(_) => self.host.bits,
        }
    }

    /// Revision word of the saving binary.
    pub fn revision(&self) -> u32 {
        match &self.mode {
            Mode::Read(rs) => rs.svn_rev,
            Mode::Write(_) => STREAM_REV,
        }
    }

    /// Version triple of the saving binary.
    pub fn saved_version(&self) -> (u16, u16, u32) {
        match &self.mode {
            Mode::Read(rs) => (rs.ver_major, rs.ver_minor, rs.ver_build),
            Mode::Write(_) => crate::build_version(),
        }
    }

    /// "os.arch" identity: the saved file's on load, this host's on save.
    pub fn host_os_and_arch(&self) -> &str {
        match &self.mode {
            Mode::Read(rs) if !rs.host_os_and_arch.is_empty() => &rs.host_os_and_arch,
            _ => &self.host.os_and_arch,
        }
    }

    /// Version of the unit currently being loaded/saved.
    pub fn unit_version(&self) -> u32 {
        self.cur_unit_ver
    }

    /// Pass of the unit currently being loaded/saved.
    pub fn unit_pass(&self) -> u32 {
        self.cur_unit_pass
    }

    /// Live callbacks report their completion here (percent, 0..=100);
    /// the orchestrator turns it into live-control records.
    pub fn report_live_percent(&mut self, percent: u32) {
        let percent = percent.min(100);
        self.percent_live_reported = self.percent_live_reported.max(percent);
    }

    // ── Load-error reporting ─────────────────────────────────────────────────

    /// Attach a descriptive message to a load failure.  The unit context
    /// (name, instance, pass, version) is recorded with it and the error is
    /// latched.  Repeat calls refresh the message; they never replace the
    /// first error code.
    pub fn set_load_error(&mut self, e: SsmError, msg: impl Into<String>) -> SsmError {
        let msg = msg.into();
        if let Mode::Read(rs) = &mut self.mode {
            rs.have_set_error = true;
            rs.load_error = Some(format!(
                "{msg} [unit '{}' instance #{} pass {} version {}]",
                rs.cur_unit_name, rs.cur_unit_instance, self.cur_unit_pass, self.cur_unit_ver,
            ));
        }
        error!("saved-state load error: {msg} ({e})");
        self.latch(e)
    }

    /// Configuration-mismatch flavor of [`set_load_error`].
    pub fn set_config_error(&mut self, msg: impl Into<String>) -> SsmError {
        self.set_load_error(SsmError::LoadConfigMismatch, msg)
    }

    /// The detailed message from the failing unit, if any was reported.
    pub fn load_error_msg(&self) -> Option<&str> {
        match &self.mode {
            Mode::Read(rs) => rs.load_error.as_deref(),
            Mode::Write(_) => None,
        }
    }

    // ── Progress ─────────────────────────────────────────────────────────────

    /// Push the progress percent forward (never backwards).
    pub(crate) fn progress(&mut self, percent: u32) {
        let percent = percent.min(100);
        if percent > self.percent {
            self.percent = percent;
            if let Some(f) = &mut self.progress_fn {
                f(percent);
            }
        }
    }

    // ── Unit bracketing ──────────────────────────────────────────────────────

    pub(crate) fn unit_open(&mut self, version: u32, pass: u32) {
        self.off_unit = 0;
        self.off_unit_user = 0;
        self.cur_unit_ver = version;
        self.cur_unit_pass = pass;
    }

    pub(crate) fn unit_close(&mut self) {
        self.off_unit = u64::MAX;
        self.off_unit_user = u64::MAX;
    }

    pub(crate) fn unit_is_open(&self) -> bool {
        self.off_unit != u64::MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strm::MemBackend;

    fn write_handle() -> SsmHandle {
        let strm = Strm::new_write(Box::new(MemBackend::new()), 1, true);
        SsmHandle::new_write(strm, SsmAfter::Destroy, false, 0, None, HostCfg::default())
    }

    #[test]
    fn cancellation_flag_latches_error() {
        let mut h = write_handle();
        assert!(h.check_cancelled().is_ok());
        h.cancelled.store(CANCEL_CANCELLED, Ordering::Relaxed);
        assert_eq!(h.check_cancelled(), Err(SsmError::Cancelled));
        // Sticky thereafter.
        assert_eq!(h.status(), Err(SsmError::Cancelled));
    }

    #[test]
    fn first_error_wins() {
        let mut h = write_handle();
        assert_eq!(h.latch(SsmError::GcPhysOverflow), SsmError::GcPhysOverflow);
        assert_eq!(h.latch(SsmError::UnitNotFound), SsmError::UnitNotFound);
        assert_eq!(h.status(), Err(SsmError::GcPhysOverflow));
    }

    #[test]
    fn progress_is_monotonic() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let strm = Strm::new_write(Box::new(MemBackend::new()), 1, true);
        let mut h = SsmHandle::new_write(
            strm,
            SsmAfter::Continue,
            false,
            0,
            Some(Box::new(move |p| seen2.lock().unwrap().push(p))),
            HostCfg::default(),
        );
        h.progress(10);
        h.progress(5);
        h.progress(10);
        h.progress(55);
        h.progress(200);
        assert_eq!(*seen.lock().unwrap(), vec![10, 55, 100]);
    }

    #[test]
    fn live_percent_reports_accumulate_upwards() {
        let mut h = write_handle();
        h.report_live_percent(40);
        h.report_live_percent(20);
        assert_eq!(h.percent_live_reported, 40);
        h.report_live_percent(90);
        assert_eq!(h.percent_live_reported, 90);
    }
}
