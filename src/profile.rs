//! Per-phase wall-clock timing for solver invocations.

use std::time::{Duration, Instant};

/// Phases of a solve that are timed separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Preamble,
    Compute,
    Epilogue,
    Free,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Init,
        Phase::Preamble,
        Phase::Compute,
        Phase::Epilogue,
        Phase::Free,
    ];

    fn index(self) -> usize {
        match self {
            Phase::Init => 0,
            Phase::Preamble => 1,
            Phase::Compute => 2,
            Phase::Epilogue => 3,
            Phase::Free => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Preamble => "preamble",
            Phase::Compute => "compute",
            Phase::Epilogue => "epilogue",
            Phase::Free => "free",
        }
    }
}

/// Collects phase timings.
///
/// Each phase keeps the duration of its most recent start/stop interval and
/// a running total across intervals. Stopping a phase that is not running
/// is ignored.
#[derive(Debug, Clone, Default)]
pub struct TimeProfile {
    running: [Option<Instant>; 5],
    last: [Duration; 5],
    total: [Duration; 5],
}

impl TimeProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, phase: Phase) {
        self.running[phase.index()] = Some(Instant::now());
    }

    pub fn stop(&mut self, phase: Phase) {
        let i = phase.index();
        if let Some(started) = self.running[i].take() {
            let elapsed = started.elapsed();
            self.last[i] = elapsed;
            self.total[i] += elapsed;
        }
    }

    pub fn is_running(&self, phase: Phase) -> bool {
        self.running[phase.index()].is_some()
    }

    /// Duration of the most recent completed interval of `phase`.
    pub fn last(&self, phase: Phase) -> Duration {
        self.last[phase.index()]
    }

    /// Accumulated duration of `phase` over all intervals.
    pub fn total(&self, phase: Phase) -> Duration {
        self.total[phase.index()]
    }

    /// Log the accumulated phase table at debug level.
    pub fn log_summary(&self, solver: &'static str) {
        for phase in Phase::ALL {
            tracing::debug!(
                solver,
                phase = phase.name(),
                secs = self.total(phase).as_secs_f64(),
                "phase time"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_without_start_is_ignored() {
        let mut p = TimeProfile::new();
        p.stop(Phase::Compute);
        assert_eq!(p.total(Phase::Compute), Duration::ZERO);
    }

    #[test]
    fn totals_accumulate_across_intervals() {
        let mut p = TimeProfile::new();
        p.start(Phase::Compute);
        std::thread::sleep(Duration::from_millis(2));
        p.stop(Phase::Compute);
        let first = p.last(Phase::Compute);
        p.start(Phase::Compute);
        assert!(p.is_running(Phase::Compute));
        std::thread::sleep(Duration::from_millis(2));
        p.stop(Phase::Compute);
        assert!(!p.is_running(Phase::Compute));
        assert!(first >= Duration::from_millis(2));
        assert_eq!(p.total(Phase::Compute), first + p.last(Phase::Compute));
        assert_eq!(p.total(Phase::Epilogue), Duration::ZERO);
    }
}
