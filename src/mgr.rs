//! The saved-state manager: unit registry, cancellation slot, and the
//! built-in units every instance carries.
//!
//! The manager is the long-lived object: units register once and survive
//! across any number of save/load operations.  At most one operation runs
//! at a time; while it does, its cancellation word is parked in a slot
//! that [`Ssm::cancel`] can flip from any thread.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::debug;

use crate::err::{LiveExecFlow, SsmError, SsmResult};
use crate::handle::{SsmHandle, CANCEL_CANCELLED, CANCEL_OK, HostCfg};
use crate::unit::{Unit, UnitConfig, UnitKind, UnitOps};

/// Name of the built-in self-description unit.
pub const SELF_UNIT_NAME: &str = "SSM";
/// Name of the live-progress pseudo unit.
pub const LIVE_CONTROL_UNIT_NAME: &str = "SSMLiveControl";

/// Longest allowed unit name (terminating NUL excluded).
pub const UNIT_NAME_MAX_CHARS: usize = 47;

/// The saved-state manager.
pub struct Ssm {
    pub(crate) units: Mutex<Vec<Unit>>,
    /// The cancellation word of the operation in progress, if any.
    cancel_slot: Mutex<Option<Arc<AtomicU32>>>,
    pub(crate) host: HostCfg,
}

impl Ssm {
    /// New manager describing the actual build target.
    pub fn new() -> Ssm {
        Ssm::with_host(HostCfg::default())
    }

    /// New manager with an explicit host description (width-compatibility
    /// testing mostly).
    pub fn with_host(host: HostCfg) -> Ssm {
        let ssm = Ssm {
            units: Mutex::new(Vec::new()),
            cancel_slot: Mutex::new(None),
            host,
        };
        ssm.register_builtin_units();
        ssm
    }

    pub(crate) fn units_lock(&self) -> MutexGuard<'_, Vec<Unit>> {
        self.units.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Registration ─────────────────────────────────────────────────────────

    /// Register a data unit.  Duplicate `(name, instance)` pairs are
    /// rejected; `before` requests insertion ahead of a named unit.
    pub fn register(&self, cfg: UnitConfig) -> SsmResult<()> {
        if cfg.name.is_empty()
            || cfg.name.len() > UNIT_NAME_MAX_CHARS
            || cfg.name.as_bytes().contains(&0)
        {
            return Err(SsmError::InvalidParameter);
        }
        let mut units = self.units_lock();
        if units
            .iter()
            .any(|u| u.name == cfg.name && u.instance == cfg.instance)
        {
            return Err(SsmError::UnitExists);
        }
        let at = match &cfg.before {
            Some(before) => units
                .iter()
                .position(|u| &u.name == before)
                .unwrap_or(units.len()),
            None => units.len(),
        };
        debug!(
            "registering saved-state unit '{}' #{} v{}",
            cfg.name, cfg.instance, cfg.version
        );
        units.insert(at, Unit::from_config(cfg));
        Ok(())
    }

    /// Remove a previously registered unit.
    pub fn deregister(&self, name: &str, instance: u32) -> SsmResult<()> {
        let mut units = self.units_lock();
        match units
            .iter()
            .position(|u| u.name == name && u.instance == instance)
        {
            Some(i) => {
                units.remove(i);
                Ok(())
            }
            None => Err(SsmError::UnitNotFound),
        }
    }

    /// Number of registered units (built-ins included).
    pub fn unit_count(&self) -> usize {
        self.units_lock().len()
    }

    // ── Cancellation ─────────────────────────────────────────────────────────

    /// Cancel the operation in progress, from any thread.  Returns
    /// [`SsmError::NoPendingOperation`] when nothing is running and
    /// [`SsmError::AlreadyCancelled`] on a repeat.
    pub fn cancel(&self) -> SsmResult<()> {
        let slot = self
            .cancel_slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(flag) = slot.as_ref() else {
            return Err(SsmError::NoPendingOperation);
        };
        match flag.compare_exchange(
            CANCEL_OK,
            CANCEL_CANCELLED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => Ok(()),
            Err(_) => Err(SsmError::AlreadyCancelled),
        }
    }

    /// Park the running operation's cancellation word.  At most one save or
    /// load runs at a time.
    pub(crate) fn op_register(&self, handle: &SsmHandle) -> SsmResult<()> {
        let mut slot = self
            .cancel_slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(SsmError::InvalidParameter);
        }
        *slot = Some(Arc::clone(&handle.cancelled));
        Ok(())
    }

    /// Clear the slot when the operation finishes.
    pub(crate) fn op_deregister(&self) {
        let mut slot = self
            .cancel_slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = None;
    }

    // ── Built-in units ───────────────────────────────────────────────────────

    fn register_builtin_units(&self) {
        // Self-description unit: a small key/value string table saved in
        // live pass 0 (or the final pass of a plain save).  Only consumer
        // so far: the host identity used by padding-compat decisions.
        let mut self_ops = UnitOps::default();
        self_ops.save_exec = Some(Box::new(self_unit_write));
        self_ops.live_exec = Some(Box::new(|ssm, pass| {
            if pass == 0 {
                self_unit_write(ssm)?;
            }
            Ok(LiveExecFlow::DontCallAgain)
        }));
        self_ops.load_exec = Some(Box::new(|ssm, version, _pass| {
            if version != 1 {
                return Err(ssm.set_load_error(
                    SsmError::UnsupportedDataUnitVersion,
                    format!("unsupported self-unit version {version}"),
                ));
            }
            let n = ssm.get_u32()?;
            for _ in 0..n {
                let key = ssm.get_strz(64)?;
                let value = ssm.get_strz(128)?;
                if key == "HostOSAndArch" {
                    ssm.set_host_os_and_arch(&value)?;
                }
            }
            Ok(())
        }));
        let mut cfg = UnitConfig::new(SELF_UNIT_NAME, 0, 1, UnitKind::Internal);
        cfg.guessed_size = 64;
        cfg.ops = self_ops;
        // A fresh registry cannot already hold these names.
        let _ = self.register(cfg);

        // Live-progress pseudo unit: written directly by the live-save
        // orchestrator; on load it feeds the progress bar.
        let mut lc_ops = UnitOps::default();
        lc_ops.load_exec = Some(Box::new(|ssm, _version, _pass| {
            let parts = ssm.get_u16()?;
            ssm.update_live_progress(parts);
            Ok(())
        }));
        let mut cfg = UnitConfig::new(LIVE_CONTROL_UNIT_NAME, 0, 1, UnitKind::Internal);
        cfg.ops = lc_ops;
        let _ = self.register(cfg);
    }
}

impl Default for Ssm {
    fn default() -> Self {
        Ssm::new()
    }
}

/// Write the self-description string table.
fn self_unit_write(ssm: &mut SsmHandle) -> SsmResult<()> {
    let os = ssm.host_os_and_arch().to_string();
    ssm.put_u32(1)?;
    ssm.put_strz("HostOSAndArch")?;
    ssm.put_strz(&os)
}

impl SsmHandle {
    /// Record the saving host's identity (self-unit load path).
    pub(crate) fn set_host_os_and_arch(&mut self, value: &str) -> SsmResult<()> {
        let rs = self.rs()?;
        rs.host_os_and_arch = value.to_string();
        rs.is_host_msc32 = rs.host_bits == 32 && value.starts_with("win.");
        Ok(())
    }

    /// Feed a live-control record into the progress bar (load path).
    pub(crate) fn update_live_progress(&mut self, parts_per_10k: u16) {
        let prepare = self.percent_prepare;
        let done = self.percent_done;
        let span = 100u32.saturating_sub(prepare + done);
        let pct = prepare + span * u32::from(parts_per_10k.min(10_000)) / 10_000;
        self.progress(pct);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_cfg(name: &str, instance: u32) -> UnitConfig {
        UnitConfig::new(name, instance, 1, UnitKind::Device)
    }

    #[test]
    fn builtin_units_are_present() {
        let ssm = Ssm::new();
        assert_eq!(ssm.unit_count(), 2);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let ssm = Ssm::new();
        ssm.register(plain_cfg("pgm", 0)).unwrap();
        assert_eq!(ssm.register(plain_cfg("pgm", 0)), Err(SsmError::UnitExists));
        // Same name, different instance is fine.
        ssm.register(plain_cfg("pgm", 1)).unwrap();
    }

    #[test]
    fn name_validation() {
        let ssm = Ssm::new();
        assert_eq!(ssm.register(plain_cfg("", 0)), Err(SsmError::InvalidParameter));
        let long = "x".repeat(UNIT_NAME_MAX_CHARS + 1);
        assert_eq!(ssm.register(plain_cfg(&long, 0)), Err(SsmError::InvalidParameter));
        let ok = "x".repeat(UNIT_NAME_MAX_CHARS);
        ssm.register(plain_cfg(&ok, 0)).unwrap();
    }

    #[test]
    fn before_insertion_orders_units() {
        let ssm = Ssm::new();
        ssm.register(plain_cfg("b", 0)).unwrap();
        let mut cfg = plain_cfg("a", 0);
        cfg.before = Some("b".into());
        ssm.register(cfg).unwrap();
        let units = ssm.units_lock();
        let names: Vec<&str> = units.iter().map(|u| u.name.as_str()).collect();
        // Built-ins first, then "a" squeezed in front of "b".
        assert_eq!(names, vec!["SSM", "SSMLiveControl", "a", "b"]);
    }

    #[test]
    fn deregister_removes_exact_instance() {
        let ssm = Ssm::new();
        ssm.register(plain_cfg("u", 0)).unwrap();
        ssm.register(plain_cfg("u", 1)).unwrap();
        ssm.deregister("u", 0).unwrap();
        assert_eq!(ssm.deregister("u", 0), Err(SsmError::UnitNotFound));
        ssm.deregister("u", 1).unwrap();
    }

    #[test]
    fn cancel_without_operation_is_refused() {
        let ssm = Ssm::new();
        assert_eq!(ssm.cancel(), Err(SsmError::NoPendingOperation));
    }
}
