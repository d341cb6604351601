//! E2E: live-save convergence.
//!
//! A single unit transfers data across pre-copy passes and votes for two
//! extra rounds before declaring itself ready; the orchestrator must run
//! exactly those passes, finish with the stop-the-world step, and emit a
//! monotonically non-decreasing live-progress trail.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use ssm::{
    LiveExecFlow, MemBackend, Ssm, SsmAfter, UnitConfig, UnitKind, UnitOps, Vote, SSM_PASS_FINAL,
};

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: three vote rounds, then the final pass
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn live_save_converges_after_votes() {
    let ssm = Ssm::new();

    let live_execs = Arc::new(AtomicU32::new(0));
    let votes = Arc::new(AtomicU32::new(0));
    let final_execs = Arc::new(AtomicU32::new(0));
    let passes_seen = Arc::new(Mutex::new(Vec::new()));

    let mut cfg = UnitConfig::new("ram", 0, 2, UnitKind::Internal);
    cfg.guessed_size = 1024 * 1024;
    let mut ops = UnitOps::default();

    let le = Arc::clone(&live_execs);
    let ps = Arc::clone(&passes_seen);
    ops.live_exec = Some(Box::new(move |h, pass| {
        le.fetch_add(1, Ordering::SeqCst);
        ps.lock().unwrap().push(pass);
        // A dirty-page batch per pass.
        let chunk = vec![(pass as u8).wrapping_add(1); 64 * 1024];
        h.put_u32(pass)?;
        h.put_mem(&chunk)?;
        h.report_live_percent((pass + 1) * 30);
        Ok(LiveExecFlow::CallAgain)
    }));

    let vo = Arc::clone(&votes);
    ops.live_vote = Some(Box::new(move |_h, _pass| {
        let n = vo.fetch_add(1, Ordering::SeqCst);
        if n < 2 {
            Ok(Vote::AnotherPass)
        } else {
            Ok(Vote::Ready)
        }
    }));

    let fe = Arc::clone(&final_execs);
    ops.save_exec = Some(Box::new(move |h| {
        fe.fetch_add(1, Ordering::SeqCst);
        h.put_u32(0xf1a0)
    }));
    cfg.ops = ops;
    ssm.register(cfg).unwrap();

    let be = MemBackend::new();
    let mut live = ssm
        .live_save(Box::new(be.clone()), SsmAfter::Continue, 250, None)
        .unwrap();

    // Step 1 may run on a worker thread while the VM keeps going.
    std::thread::scope(|s| {
        s.spawn(|| live.step1().unwrap());
    });
    live.step2().unwrap();

    // Two "another pass" votes → passes 0, 1, 2 of live exec, then final.
    assert_eq!(live_execs.load(Ordering::SeqCst), 3);
    assert_eq!(votes.load(Ordering::SeqCst), 3);
    assert_eq!(final_execs.load(Ordering::SeqCst), 1);
    assert_eq!(*passes_seen.lock().unwrap(), vec![0, 1, 2]);

    // Header flags: stream CRC + live save.
    let wire = be.to_vec();
    let flags = u32::from_le_bytes(wire[52..56].try_into().unwrap());
    assert_eq!(flags & 0x2, 0x2, "live-save flag");

    // The live-control trail is monotonically non-decreasing and the file
    // loads back with the pass structure intact.
    let ram_loads = Arc::new(Mutex::new(Vec::<u32>::new()));

    let ssm2 = Ssm::new();
    let mut cfg = UnitConfig::new("ram", 0, 2, UnitKind::Internal);
    let mut ops = UnitOps::default();
    let rl = Arc::clone(&ram_loads);
    ops.load_exec = Some(Box::new(move |h, version, pass| {
        assert_eq!(version, 2);
        rl.lock().unwrap().push(pass);
        if pass == SSM_PASS_FINAL {
            assert_eq!(h.get_u32()?, 0xf1a0);
        } else {
            assert_eq!(h.get_u32()?, pass);
            let mut chunk = vec![0u8; 64 * 1024];
            h.get_mem(&mut chunk)?;
            assert!(chunk.iter().all(|&b| b == (pass as u8).wrapping_add(1)));
        }
        Ok(())
    }));
    cfg.ops = ops;
    ssm2.register(cfg).unwrap();

    let percents = Arc::new(Mutex::new(Vec::new()));
    let percents2 = Arc::clone(&percents);
    ssm2.load(
        Box::new(MemBackend::from_bytes(wire)),
        SsmAfter::Resume,
        Some(Box::new(move |p| percents2.lock().unwrap().push(p))),
    )
    .unwrap();

    // Live passes 0..=2 then the final pass.
    assert_eq!(*ram_loads.lock().unwrap(), vec![0, 1, 2, SSM_PASS_FINAL]);

    // Progress never decreased (the callback contract enforces this, but
    // the live-control records must not fight it either).
    let ps = percents.lock().unwrap().clone();
    assert!(ps.windows(2).all(|w| w[0] < w[1]), "progress strictly grows: {ps:?}");
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: a unit can retire itself from the live rounds
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn dont_call_again_retires_unit_from_live_rounds() {
    let ssm = Ssm::new();
    let live_execs = Arc::new(AtomicU32::new(0));

    // "early" bows out after pass 0; "late" keeps the loop going twice.
    let mut cfg = UnitConfig::new("early", 0, 1, UnitKind::Internal);
    let mut ops = UnitOps::default();
    let le = Arc::clone(&live_execs);
    ops.live_exec = Some(Box::new(move |h, _pass| {
        le.fetch_add(1, Ordering::SeqCst);
        h.put_u8(1)?;
        Ok(LiveExecFlow::DontCallAgain)
    }));
    ops.save_exec = Some(Box::new(|h| h.put_u8(2)));
    ops.load_exec = Some(Box::new(|h, _v, _p| {
        let _ = h.get_u8()?;
        Ok(())
    }));
    cfg.ops = ops;
    ssm.register(cfg).unwrap();

    let votes = Arc::new(AtomicU32::new(0));
    let mut cfg = UnitConfig::new("late", 0, 1, UnitKind::Internal);
    let mut ops = UnitOps::default();
    ops.live_exec = Some(Box::new(|h, pass| {
        h.put_u32(pass)?;
        Ok(LiveExecFlow::CallAgain)
    }));
    let vo = Arc::clone(&votes);
    ops.live_vote = Some(Box::new(move |_h, _pass| {
        if vo.fetch_add(1, Ordering::SeqCst) < 2 {
            Ok(Vote::AnotherPass)
        } else {
            Ok(Vote::DoneDontCallAgain)
        }
    }));
    ops.save_exec = Some(Box::new(|h| h.put_u32(9)));
    ops.load_exec = Some(Box::new(|h, _v, _p| {
        let _ = h.get_u32()?;
        Ok(())
    }));
    cfg.ops = ops;
    ssm.register(cfg).unwrap();

    let be = MemBackend::new();
    let mut live = ssm
        .live_save(Box::new(be.clone()), SsmAfter::Continue, 0, None)
        .unwrap();
    live.step1().unwrap();
    live.step2().unwrap();

    // "early" ran exactly once even though three passes happened.
    assert_eq!(live_execs.load(Ordering::SeqCst), 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: a vote for giving up aborts the whole save
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn vote_for_giving_up_aborts() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("live.sav");

    let ssm = Ssm::new();
    let mut cfg = UnitConfig::new("flaky", 0, 1, UnitKind::Internal);
    let mut ops = UnitOps::default();
    ops.live_exec = Some(Box::new(|h, _pass| {
        h.put_u8(0)?;
        Ok(LiveExecFlow::CallAgain)
    }));
    ops.live_vote = Some(Box::new(|_h, _pass| Err(ssm::SsmError::VoteForGivingUp)));
    ops.save_exec = Some(Box::new(|h| h.put_u8(0)));
    cfg.ops = ops;
    ssm.register(cfg).unwrap();

    let mut live = ssm
        .live_save_path(&path, SsmAfter::Continue, 0, None)
        .unwrap();
    assert_eq!(live.step1(), Err(ssm::SsmError::VoteForGivingUp));
    live.abort().unwrap();
    assert!(!path.exists(), "aborted live save deletes the partial file");
}
