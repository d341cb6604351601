//! Save and live-save orchestration.
//!
//! A plain save walks the registry through prep → exec → finalization →
//! done on the calling thread.  A live save splits in two: step 1 repeats
//! exec/vote pre-copy passes (typically on a worker thread while the VM
//! keeps running) until every voter is satisfied, then step 2 runs the
//! ordinary final pass plus finalization and done.
//!
//! Any callback failure latches the sticky error and aborts the current
//! phase; the done phase still runs so owners can release resources.  A
//! failed or cancelled save closes the stream with `cancelled = true`,
//! which deletes the partial file on the local-file backend.

use std::path::Path;

use log::{error, warn};

use crate::err::{LiveExecFlow, SsmError, SsmResult, Vote};
use crate::fmt::{
    Dir, DirEntry, FileHdr, Footer, UnitHdr, name_crc, FILE_FLAGS_LIVE_SAVE,
    FILE_FLAGS_STREAM_CRC32, MAX_DECOMPR_SIZE, SSM_PASS_FINAL, STREAM_REV,
};
use crate::handle::{ProgressFn, SsmAfter, SsmHandle, SsmOp};
use crate::mgr::{Ssm, LIVE_CONTROL_UNIT_NAME};
use crate::strm::{FileBackend, Strm, StrmBackend, STRM_BUFFERS_WRITE};
use crate::unit::{enter_guard, Unit};

/// Hard cap on live pre-copy passes.
pub const LIVE_MAX_PASSES: u32 = 1_000_000;

/// Live-stream growth guard floor.
const LIVE_GROW_FLOOR: u64 = 1 << 30;
/// Growth factors applied to the guessed total, local file vs. remote.
const LIVE_GROW_FACTOR_FILE: u64 = 10_000;
const LIVE_GROW_FACTOR_REMOTE: u64 = 100_000;

// ─────────────────────────────────────────────────────────────────────────────
// Public entry points
// ─────────────────────────────────────────────────────────────────────────────

impl Ssm {
    /// Save the complete state to a local file.
    pub fn save_path(
        &self,
        path: &Path,
        after: SsmAfter,
        progress: Option<ProgressFn>,
    ) -> SsmResult<()> {
        let backend = FileBackend::create(path)?;
        self.save(Box::new(backend), after, progress)
    }

    /// Save the complete state to a caller-supplied backend.
    pub fn save(
        &self,
        backend: Box<dyn StrmBackend>,
        after: SsmAfter,
        progress: Option<ProgressFn>,
    ) -> SsmResult<()> {
        let mut handle = self.save_open(backend, after, false, 0, progress)?;
        let mut rc;
        {
            let mut units = self.units_lock();
            for u in units.iter_mut() {
                u.reset_op_state();
            }
            rc = save_prep_phase(&mut units, &mut handle).err();
            if rc.is_none() {
                rc = save_exec_phase(&mut units, &mut handle).err();
            }
            if rc.is_none() {
                rc = save_finalize(&units, &mut handle).err();
            }
            let done_err = save_done_phase(&mut units, &mut handle);
            if rc.is_none() {
                rc = done_err;
            }
        }
        rc = rc.or(handle.rc);
        self.save_conclude(handle, rc)
    }

    /// Begin a live save to a local file; see [`LiveSave`].
    pub fn live_save_path(
        &self,
        path: &Path,
        after: SsmAfter,
        max_downtime_ms: u32,
        progress: Option<ProgressFn>,
    ) -> SsmResult<LiveSave<'_>> {
        let backend = FileBackend::create(path)?;
        self.live_save(Box::new(backend), after, max_downtime_ms, progress)
    }

    /// Begin a live save: opens the stream, writes the header and runs the
    /// live-prep phase.  The caller then drives [`LiveSave::step1`]
    /// (worker thread) and [`LiveSave::step2`] (VM thread).
    pub fn live_save(
        &self,
        backend: Box<dyn StrmBackend>,
        after: SsmAfter,
        max_downtime_ms: u32,
        progress: Option<ProgressFn>,
    ) -> SsmResult<LiveSave<'_>> {
        let mut handle = self.save_open(backend, after, true, max_downtime_ms, progress)?;
        let rc = {
            let mut units = self.units_lock();
            for u in units.iter_mut() {
                u.reset_op_state();
            }
            live_prep_phase(&mut units, &mut handle).err()
        };
        if let Some(e) = rc {
            let _ = self.save_conclude(handle, Some(e));
            return Err(e);
        }
        Ok(LiveSave {
            ssm: self,
            handle: Some(handle),
        })
    }

    // ── Shared open/close ────────────────────────────────────────────────────

    fn save_open(
        &self,
        backend: Box<dyn StrmBackend>,
        after: SsmAfter,
        live: bool,
        max_downtime_ms: u32,
        progress: Option<ProgressFn>,
    ) -> SsmResult<SsmHandle> {
        let mut strm = Strm::new_write(backend, STRM_BUFFERS_WRITE, true);
        strm.start_io_thread()?;
        let mut handle = SsmHandle::new_write(
            strm,
            after,
            live,
            max_downtime_ms,
            progress,
            self.host.clone(),
        );
        if let Err(e) = self.op_register(&handle) {
            let _ = handle.strm.close(true);
            return Err(e);
        }

        let (ver_major, ver_minor, ver_build) = crate::build_version();
        let hdr = FileHdr {
            ver_major,
            ver_minor,
            ver_build,
            svn_rev: STREAM_REV,
            host_bits: self.host.bits,
            cb_gc_phys: self.host.cb_gc_phys,
            cb_gc_ptr: self.host.cb_gc_ptr,
            c_units: self.unit_count() as u32,
            flags: FILE_FLAGS_STREAM_CRC32 | if live { FILE_FLAGS_LIVE_SAVE } else { 0 },
            cb_max_decompr: MAX_DECOMPR_SIZE,
        };
        if let Err(e) = handle.strm.write(&hdr.to_bytes()) {
            self.op_deregister();
            let _ = handle.strm.close(true);
            return Err(e);
        }
        Ok(handle)
    }

    fn save_conclude(&self, handle: SsmHandle, rc: Option<SsmError>) -> SsmResult<()> {
        self.op_deregister();
        let failed = rc.is_some();
        let close_res = handle.strm.close(failed);
        match rc {
            Some(e) => Err(e),
            None => close_res,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Live-save two-step driver
// ─────────────────────────────────────────────────────────────────────────────

/// A live save in flight.  Dropping it without completing step 2 aborts
/// the operation and cleans up the partial output.
pub struct LiveSave<'a> {
    ssm: &'a Ssm,
    handle: Option<SsmHandle>,
}

impl LiveSave<'_> {
    /// Run the pre-copy passes until every voter is satisfied, the pass
    /// limit trips, or the stream grows past its guard.
    pub fn step1(&mut self) -> SsmResult<()> {
        let handle = self.handle.as_mut().ok_or(SsmError::InvalidParameter)?;
        let mut units = self.ssm.units_lock();
        live_step1(&mut units, handle)
    }

    /// Run the final stop-the-world pass, finalization and the done phase,
    /// then close the stream.
    pub fn step2(mut self) -> SsmResult<()> {
        let mut handle = self.handle.take().ok_or(SsmError::InvalidParameter)?;
        let mut rc;
        {
            let mut units = self.ssm.units_lock();
            handle.op = SsmOp::LiveStep2;
            rc = emit_live_control(&mut units, &mut handle, SSM_PASS_FINAL, 10_000).err();
            if rc.is_none() {
                rc = save_exec_phase(&mut units, &mut handle).err();
            }
            if rc.is_none() {
                rc = save_finalize(&units, &mut handle).err();
            }
            let done_err = save_done_phase(&mut units, &mut handle);
            if rc.is_none() {
                rc = done_err;
            }
        }
        rc = rc.or(handle.rc);
        self.ssm.save_conclude(handle, rc)
    }

    /// Abandon the live save, deleting partial local-file output.
    pub fn abort(mut self) -> SsmResult<()> {
        match self.handle.take() {
            Some(handle) => {
                let _ = self.ssm.save_conclude(handle, Some(SsmError::Cancelled));
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for LiveSave<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.ssm.op_deregister();
            let _ = handle.strm.close(true);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Phases
// ─────────────────────────────────────────────────────────────────────────────

fn save_prep_phase(units: &mut [Unit], handle: &mut SsmHandle) -> SsmResult<()> {
    handle.op = SsmOp::SavePrep;
    handle.cb_est_total = 0;
    for unit in units.iter_mut() {
        handle.check_cancelled()?;
        handle.cb_est_total += unit.cb_guess;
        let cs = unit.scope_guard();
        let rc = {
            let _g = enter_guard(&cs);
            match unit.ops.save_prep.as_mut() {
                Some(f) => f(handle),
                None => Ok(()),
            }
        };
        if let Err(e) = rc {
            error!("save prep failed for unit '{}' #{}: {e}", unit.name, unit.instance);
            return Err(handle.latch(e));
        }
    }
    let pct = handle.percent_prepare;
    handle.progress(pct);
    Ok(())
}

fn live_prep_phase(units: &mut [Unit], handle: &mut SsmHandle) -> SsmResult<()> {
    handle.op = SsmOp::LivePrep;
    handle.cb_est_total = 0;
    for unit in units.iter_mut() {
        handle.check_cancelled()?;
        handle.cb_est_total += unit.cb_guess;
        let cs = unit.scope_guard();
        let rc = {
            let _g = enter_guard(&cs);
            match unit.ops.live_prep.as_mut() {
                Some(f) => f(handle),
                None => Ok(()),
            }
        };
        if let Err(e) = rc {
            error!("live prep failed for unit '{}' #{}: {e}", unit.name, unit.instance);
            return Err(handle.latch(e));
        }
    }
    let pct = handle.percent_prepare;
    handle.progress(pct);
    Ok(())
}

/// Write one unit header at the current stream position and update the
/// unit's directory offset.
fn write_unit_hdr(handle: &mut SsmHandle, unit: &mut Unit, pass: u32) -> SsmResult<()> {
    let off = handle.strm.tell();
    let cur_stream_crc = if handle.strm.is_checksummed() {
        handle.strm.cur_crc()
    } else {
        0
    };
    let hdr = UnitHdr {
        end: false,
        off_stream: off,
        cur_stream_crc,
        version: unit.version,
        instance: unit.instance,
        pass,
        name: unit.name.clone(),
    };
    handle.strm.write(&hdr.to_bytes())?;
    unit.off_stream = off;
    Ok(())
}

/// The final (stop-the-world) exec pass over every unit with a save-exec
/// callback.
fn save_exec_phase(units: &mut [Unit], handle: &mut SsmHandle) -> SsmResult<()> {
    handle.op = SsmOp::SaveExec;
    let est = handle.cb_est_total.max(1);
    let base = handle.percent_prepare + handle.percent_live;
    let span = 100u32.saturating_sub(base + handle.percent_done);
    let mut cum = 0u64;

    for unit in units.iter_mut() {
        handle.check_cancelled()?;
        if unit.ops.save_exec.is_none() {
            continue;
        }
        unit.called = true;

        write_unit_hdr(handle, unit, SSM_PASS_FINAL)?;
        handle.unit_open(unit.version, SSM_PASS_FINAL);
        let cs = unit.scope_guard();
        let rc = {
            let _g = enter_guard(&cs);
            match unit.ops.save_exec.as_mut() {
                Some(f) => f(handle),
                None => Ok(()),
            }
        };
        if let Err(e) = rc {
            error!("save exec failed for unit '{}' #{}: {e}", unit.name, unit.instance);
            handle.unit_close();
            return Err(handle.latch(e));
        }
        handle.write_unit_term()?;
        handle.unit_close();

        cum += unit.cb_guess;
        let pct = base + (span as u64 * cum / est) as u32;
        handle.progress(pct.min(base + span));
    }
    Ok(())
}

/// END unit, directory and footer.
fn save_finalize(units: &[Unit], handle: &mut SsmHandle) -> SsmResult<()> {
    let off = handle.strm.tell();
    let cur_stream_crc = if handle.strm.is_checksummed() {
        handle.strm.cur_crc()
    } else {
        0
    };
    let end = UnitHdr {
        end: true,
        off_stream: off,
        cur_stream_crc,
        version: 0,
        instance: 0,
        pass: SSM_PASS_FINAL,
        name: String::new(),
    };
    handle.strm.write(&end.to_bytes())?;

    // Directory: registration order, skipping units that never emitted a
    // header.
    let dir = Dir {
        entries: units
            .iter()
            .filter(|u| u.off_stream != 0)
            .map(|u| DirEntry {
                off: u.off_stream,
                instance: u.instance,
                name_crc: name_crc(&u.name),
            })
            .collect(),
    };
    handle.strm.write(&dir.to_bytes())?;

    let off_footer = handle.strm.tell();
    let stream_crc = if handle.strm.is_checksummed() {
        handle.strm.final_crc()
    } else {
        0
    };
    handle.strm.disable_checksumming();
    let footer = Footer {
        off_stream: off_footer,
        stream_crc,
        c_dir_entries: dir.entries.len() as u32,
    };
    handle.strm.write(&footer.to_bytes())?;

    let pct = 100 - handle.percent_done;
    handle.progress(pct);
    Ok(())
}

/// Done phase: every unit that took part (or only has a done callback)
/// gets to release its resources, failures notwithstanding.
fn save_done_phase(units: &mut [Unit], handle: &mut SsmHandle) -> Option<SsmError> {
    handle.op = SsmOp::SaveDone;
    let mut first: Option<SsmError> = None;
    for unit in units.iter_mut() {
        let run = unit.called
            || (unit.ops.save_done.is_some()
                && unit.ops.save_prep.is_none()
                && unit.ops.save_exec.is_none());
        if !run || unit.ops.save_done.is_none() {
            continue;
        }
        let cs = unit.scope_guard();
        let rc = {
            let _g = enter_guard(&cs);
            match unit.ops.save_done.as_mut() {
                Some(f) => f(handle),
                None => Ok(()),
            }
        };
        if let Err(e) = rc {
            error!("save done failed for unit '{}' #{}: {e}", unit.name, unit.instance);
            first.get_or_insert(e);
        }
    }
    if first.is_none() && handle.rc.is_none() {
        handle.progress(100);
    }
    first
}

// ─────────────────────────────────────────────────────────────────────────────
// Live step 1: pre-copy passes
// ─────────────────────────────────────────────────────────────────────────────

/// Emit one "SSMLiveControl" pseudo-unit record carrying the remaining
/// live completion in parts per ten thousand.
fn emit_live_control(
    units: &mut [Unit],
    handle: &mut SsmHandle,
    pass: u32,
    parts_per_10k: u16,
) -> SsmResult<()> {
    let Some(unit) = units.iter_mut().find(|u| u.name == LIVE_CONTROL_UNIT_NAME) else {
        return Err(SsmError::UnitNotFound);
    };
    write_unit_hdr(handle, unit, pass)?;
    let saved_op = handle.op;
    handle.op = SsmOp::LiveExec;
    handle.unit_open(unit.version, pass);
    let res = handle
        .put_u16(parts_per_10k)
        .and_then(|()| handle.write_unit_term());
    handle.unit_close();
    handle.op = saved_op;
    res
}

fn live_step1(units: &mut [Unit], handle: &mut SsmHandle) -> SsmResult<()> {
    handle.op = SsmOp::LiveStep1;
    let file_backed = handle.strm.is_file_backed();
    let grow_limit = LIVE_GROW_FLOOR.max(
        handle.cb_est_total.saturating_mul(if file_backed {
            LIVE_GROW_FACTOR_FILE
        } else {
            LIVE_GROW_FACTOR_REMOTE
        }),
    );

    let mut converged = false;
    for pass in 0..LIVE_MAX_PASSES {
        handle.check_cancelled()?;

        // Exec round.
        handle.op = SsmOp::LiveExec;
        for unit in units.iter_mut() {
            handle.check_cancelled()?;
            if unit.done_live || unit.ops.live_exec.is_none() {
                continue;
            }
            unit.called = true;
            write_unit_hdr(handle, unit, pass)?;
            handle.unit_open(unit.version, pass);
            let cs = unit.scope_guard();
            let rc = {
                let _g = enter_guard(&cs);
                match unit.ops.live_exec.as_mut() {
                    Some(f) => f(handle, pass),
                    None => Ok(LiveExecFlow::CallAgain),
                }
            };
            let flow = match rc {
                Ok(flow) => flow,
                Err(e) => {
                    error!(
                        "live exec failed for unit '{}' #{} pass {pass}: {e}",
                        unit.name, unit.instance
                    );
                    handle.unit_close();
                    return Err(handle.latch(e));
                }
            };
            handle.write_unit_term()?;
            handle.unit_close();
            if flow == LiveExecFlow::DontCallAgain {
                unit.done_live = true;
            }
        }

        // Vote round.
        handle.op = SsmOp::LiveVote;
        let mut again = false;
        for unit in units.iter_mut() {
            handle.check_cancelled()?;
            if unit.done_live || unit.ops.live_vote.is_none() {
                continue;
            }
            let cs = unit.scope_guard();
            let rc = {
                let _g = enter_guard(&cs);
                match unit.ops.live_vote.as_mut() {
                    Some(f) => f(handle, pass),
                    None => Ok(Vote::Ready),
                }
            };
            match rc {
                Ok(Vote::Ready) => {}
                Ok(Vote::AnotherPass) => again = true,
                Ok(Vote::DoneDontCallAgain) => unit.done_live = true,
                Err(e) => {
                    error!(
                        "live vote failed for unit '{}' #{} pass {pass}: {e}",
                        unit.name, unit.instance
                    );
                    return Err(handle.latch(e));
                }
            }
        }

        // Progress checkpoint for this pass (monotonic: the reported
        // percentage only grows).
        let parts = (handle.percent_live_reported * 100).min(9_999) as u16;
        emit_live_control(units, handle, pass, parts)?;
        let prepare = handle.percent_prepare;
        let live_span = handle.percent_live;
        let reported = handle.percent_live_reported;
        handle.progress(prepare + live_span * reported / 100);

        if !again {
            converged = true;
            break;
        }

        let size = handle.strm.tell();
        if size > grow_limit {
            warn!("live saved state grew to {size} bytes (limit {grow_limit}); giving up");
            return Err(handle.latch(SsmError::StateGrewTooBig));
        }
    }
    if !converged {
        return Err(handle.latch(SsmError::TooManyPasses));
    }
    handle.op = SsmOp::LiveStep1;
    Ok(())
}
