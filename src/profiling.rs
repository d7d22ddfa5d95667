//! Injectable stage timing
//!
//! Pipeline entry points take a `&dyn StageRecorder`; pass [`NoopRecorder`]
//! to disable measurement or a [`TimingLog`] to collect per-stage times.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Receives the duration of each completed pipeline stage
pub trait StageRecorder: Sync {
    fn record(&self, stage: &str, elapsed: Duration);
}

/// Discards all measurements
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

impl StageRecorder for NoopRecorder {
    fn record(&self, _stage: &str, _elapsed: Duration) {}
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageTiming {
    pub stage: String,
    pub elapsed: Duration,
}

/// Thread-safe collector of stage timings
#[derive(Debug, Default)]
pub struct TimingLog {
    entries: Mutex<Vec<StageTiming>>,
}

impl TimingLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<StageTiming> {
        match self.entries.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Total time per stage name, in first-seen order
    pub fn summary(&self) -> Vec<(String, Duration)> {
        let mut totals: Vec<(String, Duration)> = Vec::new();
        for entry in self.entries() {
            match totals.iter_mut().find(|(name, _)| *name == entry.stage) {
                Some((_, total)) => *total += entry.elapsed,
                None => totals.push((entry.stage, entry.elapsed)),
            }
        }
        totals
    }
}

impl StageRecorder for TimingLog {
    fn record(&self, stage: &str, elapsed: Duration) {
        log::debug!("[PROFILE] {} - {:.3}ms", stage, elapsed.as_secs_f64() * 1000.0);
        let entry = StageTiming { stage: stage.to_string(), elapsed };
        match self.entries.lock() {
            Ok(mut guard) => guard.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
    }
}

/// Records the time between its creation and drop
pub struct StageTimer<'a> {
    recorder: &'a dyn StageRecorder,
    stage: &'static str,
    start: Instant,
}

impl<'a> StageTimer<'a> {
    pub fn new(recorder: &'a dyn StageRecorder, stage: &'static str) -> Self {
        Self { recorder, stage, start: Instant::now() }
    }
}

impl Drop for StageTimer<'_> {
    fn drop(&mut self) {
        self.recorder.record(self.stage, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_records_on_drop() {
        let log = TimingLog::new();
        {
            let _t = StageTimer::new(&log, "fft");
        }
        {
            let _t = StageTimer::new(&log, "sense");
        }
        {
            let _t = StageTimer::new(&log, "fft");
        }
        let entries = log.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].stage, "fft");

        let summary = log.summary();
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].0, "fft");
        assert_eq!(summary[1].0, "sense");
    }

    #[test]
    fn test_noop_recorder() {
        let noop = NoopRecorder;
        let _t = StageTimer::new(&noop, "anything");
    }
}
