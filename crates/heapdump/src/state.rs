use std::sync::atomic::{AtomicU8, Ordering};

use facet::Facet;

/// Lifecycle of one capture.
///
/// `Idle → Requested → Walking → Writing → Completed | Failed`. Failures
/// before the walk (open, pause, fork) go straight from `Requested` to
/// `Failed`, and a forked capture completes from `Walking` because the parent
/// never sees the child's write phase.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum CaptureState {
    Idle,
    Requested,
    Walking,
    Writing,
    Completed,
    Failed,
}

impl CaptureState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Requested,
            2 => Self::Walking,
            3 => Self::Writing,
            4 => Self::Completed,
            5 => Self::Failed,
            _ => Self::Idle,
        }
    }

    /// A capture in one of these states owns the walker.
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Requested | Self::Walking | Self::Writing)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_advance_to(self, next: CaptureState) -> bool {
        use CaptureState::*;
        matches!(
            (self, next),
            (Idle | Completed | Failed, Requested)
                | (Requested, Walking | Failed)
                | (Walking, Writing | Completed | Failed)
                | (Writing, Completed | Failed)
        )
    }
}

/// The one piece of shared mutable state: the current capture's state, which
/// doubles as the in-flight flag.
#[derive(Debug)]
pub(crate) struct CaptureCell(AtomicU8);

impl CaptureCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(CaptureState::Idle as u8))
    }

    pub(crate) fn get(&self) -> CaptureState {
        CaptureState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Claims the walker. Fails with the current state while another capture
    /// is in flight.
    pub(crate) fn try_begin(&self) -> Result<(), CaptureState> {
        let mut current = self.get();
        loop {
            if current.is_busy() {
                return Err(current);
            }
            match self.0.compare_exchange(
                current as u8,
                CaptureState::Requested as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = CaptureState::from_u8(actual),
            }
        }
    }

    pub(crate) fn advance(&self, next: CaptureState) {
        let previous = CaptureState::from_u8(self.0.swap(next as u8, Ordering::AcqRel));
        debug_assert!(
            previous.can_advance_to(next),
            "invalid capture transition {previous:?} -> {next:?}"
        );
        tracing::trace!(?previous, ?next, "capture state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_is_refused_while_in_flight() {
        let cell = CaptureCell::new();
        cell.try_begin().expect("idle cell can be claimed");
        assert_eq!(cell.try_begin(), Err(CaptureState::Requested));
        cell.advance(CaptureState::Walking);
        assert_eq!(cell.try_begin(), Err(CaptureState::Walking));
        cell.advance(CaptureState::Writing);
        assert_eq!(cell.try_begin(), Err(CaptureState::Writing));
        cell.advance(CaptureState::Completed);
        cell.try_begin().expect("terminal cell can be claimed again");
    }

    #[test]
    fn writing_requires_walking_first() {
        assert!(!CaptureState::Requested.can_advance_to(CaptureState::Writing));
        assert!(!CaptureState::Idle.can_advance_to(CaptureState::Walking));
        assert!(CaptureState::Walking.can_advance_to(CaptureState::Writing));
        assert!(CaptureState::Requested.can_advance_to(CaptureState::Failed));
        assert!(!CaptureState::Completed.can_advance_to(CaptureState::Walking));
    }

    #[test]
    fn busy_and_terminal_states_are_disjoint() {
        for state in [
            CaptureState::Idle,
            CaptureState::Requested,
            CaptureState::Walking,
            CaptureState::Writing,
            CaptureState::Completed,
            CaptureState::Failed,
        ] {
            assert!(!(state.is_busy() && state.is_terminal()), "{state:?}");
        }
    }
}
