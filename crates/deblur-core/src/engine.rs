use crate::TaskStatus;

/// Pure transition table for `TaskStatus`.
///
/// Staying in the same non-terminal status is allowed so progress refreshes
/// can go through the same path. Reaching a terminal status from PENDING
/// without RUNNING is only possible through FAILED (pre-flight validation)
/// or CANCELED.
pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;

    if from == to {
        return !from.is_terminal();
    }

    match (from, to) {
        (Pending, Submitted) => true,
        (Submitted, Running) => true,
        (Running, Succeeded) | (Running, Failed) => true,
        (Running, Orphaned) | (Submitted, Orphaned) => true,
        // pre-flight failures (e.g. empty input folder)
        (Pending, Failed) | (Submitted, Failed) => true,
        // resume
        (Orphaned, Pending) | (Failed, Pending) => true,
        (from, Canceled) => !from.is_terminal(),
        _ => false,
    }
}

/// Percentage of processed files, 0 when nothing was enumerated yet.
pub fn progress_percent(processed: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (u64::from(processed.min(total)) * 100) / u64::from(total);
    pct as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskStatus::*;

    const ALL: [TaskStatus; 7] = [Pending, Submitted, Running, Succeeded, Failed, Orphaned, Canceled];

    #[test]
    fn happy_path_is_allowed() {
        assert!(can_transition(Pending, Submitted));
        assert!(can_transition(Submitted, Running));
        assert!(can_transition(Running, Succeeded));
    }

    #[test]
    fn pending_cannot_skip_running_to_success() {
        assert!(!can_transition(Pending, Succeeded));
        assert!(!can_transition(Submitted, Succeeded));
        assert!(can_transition(Pending, Failed));
    }

    #[test]
    fn terminal_states_only_leave_through_resume() {
        for to in ALL {
            assert!(!can_transition(Succeeded, to), "SUCCEEDED -> {to}");
            assert!(!can_transition(Canceled, to), "CANCELED -> {to}");
        }
        for to in ALL {
            assert_eq!(can_transition(Failed, to), to == Pending, "FAILED -> {to}");
        }
    }

    #[test]
    fn every_non_terminal_status_can_be_canceled() {
        for from in ALL {
            assert_eq!(can_transition(from, Canceled), !from.is_terminal());
        }
    }

    #[test]
    fn progress_is_clamped() {
        assert_eq!(progress_percent(0, 0), 0);
        assert_eq!(progress_percent(1, 3), 33);
        assert_eq!(progress_percent(5, 3), 100);
    }
}
