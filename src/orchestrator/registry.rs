use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::state::{RunControl, RunStatus};
use crate::errors::OrchestratorError;

/// Process-wide index of active runs, at most one per target.
#[derive(Clone, Default)]
pub struct RunRegistry {
    runs: Arc<DashMap<i64, Arc<RunControl>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `control` unless its target already has an active run.
    ///
    /// The entry is removed when the returned [`Registration`] drops.
    pub fn register(&self, control: Arc<RunControl>) -> Result<Registration, OrchestratorError> {
        let target_id = control.target_id();
        match self.runs.entry(target_id) {
            Entry::Occupied(_) => Err(OrchestratorError::AlreadyRunning { target_id }),
            Entry::Vacant(slot) => {
                slot.insert(control.clone());
                Ok(Registration {
                    runs: self.runs.clone(),
                    control,
                })
            }
        }
    }

    pub fn get(&self, target_id: i64) -> Option<Arc<RunControl>> {
        self.runs.get(&target_id).map(|entry| entry.value().clone())
    }

    pub fn status(&self, target_id: i64) -> Option<RunStatus> {
        self.get(target_id).map(|control| control.status())
    }

    /// `None` when no run is active; otherwise whether the approval released a wait.
    pub fn approve(&self, target_id: i64) -> Option<bool> {
        self.get(target_id).map(|control| control.approve())
    }

    /// Returns false when no run is active for the target.
    pub fn cancel(&self, target_id: i64) -> bool {
        match self.get(target_id) {
            Some(control) => {
                control.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active(&self) -> Vec<Arc<RunControl>> {
        self.runs.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn cancel_all(&self) -> usize {
        let active = self.active();
        for control in &active {
            control.cancel();
        }
        active.len()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

/// Guard that deregisters a run on drop, whichever way the run ends.
pub struct Registration {
    runs: Arc<DashMap<i64, Arc<RunControl>>>,
    control: Arc<RunControl>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let run_id = self.control.run_id();
        self.runs
            .remove_if(&self.control.target_id(), |_, active| active.run_id() == run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_rejects_second_run_for_target() {
        let registry = RunRegistry::new();
        let _first = registry.register(Arc::new(RunControl::new(1))).unwrap();
        let second = registry.register(Arc::new(RunControl::new(1)));
        assert!(matches!(
            second,
            Err(OrchestratorError::AlreadyRunning { target_id: 1 })
        ));
        let _other = registry.register(Arc::new(RunControl::new(2))).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_drop_deregisters() {
        let registry = RunRegistry::new();
        let registration = registry.register(Arc::new(RunControl::new(1))).unwrap();
        assert!(registry.get(1).is_some());
        drop(registration);
        assert!(registry.get(1).is_none());
        assert!(registry.is_empty());
        assert!(registry.register(Arc::new(RunControl::new(1))).is_ok());
    }

    #[test]
    fn test_approve_and_cancel_reach_registered_run() {
        let registry = RunRegistry::new();
        assert_eq!(registry.approve(9), None);
        assert!(!registry.cancel(9));

        let control = Arc::new(RunControl::new(9));
        let _registration = registry.register(control.clone()).unwrap();
        assert_eq!(registry.approve(9), Some(false));
        assert!(registry.cancel(9));
        assert!(control.is_cancelled());
        assert!(registry.status(9).unwrap().cancelled);
    }

    #[test]
    fn test_cancel_all() {
        let registry = RunRegistry::new();
        let a = Arc::new(RunControl::new(1));
        let b = Arc::new(RunControl::new(2));
        let _ra = registry.register(a.clone()).unwrap();
        let _rb = registry.register(b.clone()).unwrap();
        assert_eq!(registry.cancel_all(), 2);
        assert!(a.is_cancelled() && b.is_cancelled());
    }

    #[test]
    fn test_concurrent_registration_admits_one() {
        let registry = RunRegistry::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry
                        .register(Arc::new(RunControl::new(5)))
                        .map(std::mem::forget)
                        .is_ok()
                })
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 1);
        assert_eq!(registry.len(), 1);
    }
}
