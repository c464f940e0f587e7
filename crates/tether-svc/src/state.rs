use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceRunState {
    Stopped,
    Starting,
    Running,
    Restarting,
}

/// Atomic run-state flag for one supervisor instance. The supervisor is the
/// only writer; external callers read it to decide whether a start request
/// is needed.
#[derive(Debug)]
pub struct RunStateCell(AtomicU8);

impl RunStateCell {
    pub fn new(state: ServiceRunState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> ServiceRunState {
        match self.0.load(Ordering::Acquire) {
            0 => ServiceRunState::Stopped,
            1 => ServiceRunState::Starting,
            2 => ServiceRunState::Running,
            _ => ServiceRunState::Restarting,
        }
    }

    pub fn store(&self, state: ServiceRunState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Claims the transition into `Starting`. Fails while a start is already
    /// underway or the service is running, making start idempotent.
    pub fn try_begin_start(&self) -> bool {
        for from in [ServiceRunState::Stopped, ServiceRunState::Restarting] {
            if self
                .0
                .compare_exchange(
                    from as u8,
                    ServiceRunState::Starting as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_start_claims_only_idle_states() {
        let cell = RunStateCell::new(ServiceRunState::Stopped);
        assert!(cell.try_begin_start());
        assert_eq!(cell.load(), ServiceRunState::Starting);
        assert!(!cell.try_begin_start());

        cell.store(ServiceRunState::Running);
        assert!(!cell.try_begin_start());

        cell.store(ServiceRunState::Restarting);
        assert!(cell.try_begin_start());
    }
}
