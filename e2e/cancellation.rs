//! E2E: cancelling a save from another thread.
//!
//! The producer keeps pushing 1 KiB puts; once enough data is out, a
//! second thread fires the cancel.  The next put must fail with the
//! cancellation code, the done callback still runs, the local file is
//! deleted, and the save call reports the cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use ssm::{Ssm, SsmAfter, SsmError, UnitConfig, UnitKind, UnitOps};

#[test]
fn cancel_mid_save() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("cancelled.sav");

    let ssm = Ssm::new();
    let done_ran = Arc::new(AtomicBool::new(false));
    let (ready_tx, ready_rx) = mpsc::channel::<()>();

    let mut cfg = UnitConfig::new("bulk", 0, 1, UnitKind::Internal);
    let mut ops = UnitOps::default();
    ops.save_exec = Some(Box::new(move |h| {
        let chunk = [0x5au8; 1024];
        let mut sent = false;
        // Push until the cancel lands; bail out if it never does.
        for i in 0..4_000_000u32 {
            match h.put_mem(&chunk) {
                Ok(()) => {
                    if i == 500 && !sent {
                        sent = true;
                        let _ = ready_tx.send(());
                    }
                }
                Err(e) => {
                    assert_eq!(e, SsmError::Cancelled, "puts fail with the cancel code");
                    return Err(e);
                }
            }
        }
        panic!("cancellation never reached the producer");
    }));
    let done2 = Arc::clone(&done_ran);
    ops.save_done = Some(Box::new(move |_h| {
        done2.fetch_or(true, Ordering::SeqCst);
        Ok(())
    }));
    cfg.ops = ops;
    ssm.register(cfg).unwrap();

    let ssm_ref = &ssm;
    let res = std::thread::scope(|s| {
        s.spawn(move || {
            ready_rx.recv().expect("producer reaches 500 KiB");
            ssm_ref.cancel().expect("cancel finds a pending operation");
            // A second cancel is a distinct error (or the operation has
            // already wound down; both are refusals).
            assert!(matches!(
                ssm_ref.cancel(),
                Err(SsmError::AlreadyCancelled) | Err(SsmError::NoPendingOperation)
            ));
        });
        ssm.save_path(&path, SsmAfter::Continue, None)
    });

    assert_eq!(res, Err(SsmError::Cancelled));
    assert!(done_ran.load(Ordering::SeqCst), "done phase still runs");
    assert!(!path.exists(), "partial file is deleted");

    // The operation slot is clear again.
    assert_eq!(ssm.cancel(), Err(SsmError::NoPendingOperation));
}

#[test]
fn cancel_mid_load_is_not_destructive() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("victim.sav");

    // Produce a file with a fat unit so the load has work to chew on.
    let ssm = Ssm::new();
    let mut cfg = UnitConfig::new("bulk", 0, 1, UnitKind::Internal);
    let mut ops = UnitOps::default();
    ops.save_exec = Some(Box::new(|h| {
        for i in 0..2_000u32 {
            h.put_u32(i)?;
            h.put_mem(&[0u8; 1020])?;
        }
        Ok(())
    }));
    cfg.ops = ops;
    ssm.register(cfg).unwrap();
    ssm.save_path(&path, SsmAfter::Continue, None).unwrap();
    let cb_file = std::fs::metadata(&path).unwrap().len();

    // Load it, cancelling from the callback's vantage point.
    let ssm2 = Ssm::new();
    let (ready_tx, ready_rx) = mpsc::channel::<()>();
    let mut cfg = UnitConfig::new("bulk", 0, 1, UnitKind::Internal);
    let mut ops = UnitOps::default();
    ops.load_exec = Some(Box::new(move |h, _v, _p| {
        let mut chunk = [0u8; 1024];
        let mut sent = false;
        for i in 0..4_000_000u32 {
            match h.get_mem(&mut chunk) {
                Ok(()) => {
                    if i == 100 && !sent {
                        sent = true;
                        let _ = ready_tx.send(());
                    }
                }
                Err(e) => {
                    assert_eq!(e, SsmError::Cancelled);
                    return Err(e);
                }
            }
        }
        panic!("cancellation never reached the consumer");
    }));
    cfg.ops = ops;
    ssm2.register(cfg).unwrap();

    let ssm2_ref = &ssm2;
    let res = std::thread::scope(|s| {
        s.spawn(move || {
            ready_rx.recv().expect("consumer reaches 100 KiB");
            ssm2_ref.cancel().expect("cancel finds a pending operation");
        });
        ssm2.load_path(&path, SsmAfter::Resume, None)
    });
    assert_eq!(res, Err(SsmError::Cancelled));

    // The source file is untouched.
    assert!(path.exists());
    assert_eq!(std::fs::metadata(&path).unwrap().len(), cb_file);
}
