use std::collections::HashMap;
use std::time::Duration;

use log::info;

use crate::backend::Pass;

/// Wall-clock timings of every pass a network runs.
#[derive(Debug, Default)]
pub struct PassProfiler {
    pass_times: HashMap<Pass, Vec<f64>>,
}

impl PassProfiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, pass: Pass, duration: Duration) {
        self.pass_times
            .entry(pass)
            .or_default()
            .push(duration.as_secs_f64() * 1000.0);
    }

    pub fn stats(&self, pass: Pass) -> Option<PassStats> {
        let times = self.pass_times.get(&pass).filter(|t| !t.is_empty())?;
        let sum: f64 = times.iter().sum();
        let count = times.len();
        let mean = sum / count as f64;

        let variance = times.iter()
            .map(|time| (time - mean).powi(2))
            .sum::<f64>() / count as f64;
        let std_dev = variance.sqrt();

        let min = times.iter().copied().fold(f64::INFINITY, f64::min);
        let max = times.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        Some(PassStats {
            pass,
            call_count: count,
            total_time: sum,
            avg_time: mean,
            min_time: min,
            max_time: max,
            std_dev,
        })
    }

    pub fn log_summary(&self) {
        for pass in Pass::ALL {
            if let Some(stats) = self.stats(pass) {
                info!(
                    "{}: {} runs, {:.3}ms avg ({:.3}..{:.3}, sd {:.3}), {:.2}ms total",
                    pass.name(),
                    stats.call_count,
                    stats.avg_time,
                    stats.min_time,
                    stats.max_time,
                    stats.std_dev,
                    stats.total_time
                );
            }
        }
    }

    pub fn reset(&mut self) {
        self.pass_times.clear();
    }
}

#[derive(Debug, Clone)]
pub struct PassStats {
    pub pass: Pass,
    pub call_count: usize,
    pub total_time: f64,    // milliseconds
    pub avg_time: f64,      // milliseconds
    pub min_time: f64,      // milliseconds
    pub max_time: f64,      // milliseconds
    pub std_dev: f64,       // milliseconds
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_summarise_recorded_runs() {
        let mut profiler = PassProfiler::new();
        assert!(profiler.stats(Pass::Forward).is_none());
        profiler.record(Pass::Forward, Duration::from_millis(2));
        profiler.record(Pass::Forward, Duration::from_millis(4));
        profiler.record(Pass::Backward, Duration::from_millis(1));

        let stats = profiler.stats(Pass::Forward).unwrap();
        assert_eq!(stats.call_count, 2);
        assert!((stats.avg_time - 3.0).abs() < 1e-9);
        assert!((stats.min_time - 2.0).abs() < 1e-9);
        assert!((stats.max_time - 4.0).abs() < 1e-9);
        assert!((stats.std_dev - 1.0).abs() < 1e-9);
        assert_eq!(profiler.stats(Pass::Backward).unwrap().call_count, 1);

        profiler.reset();
        assert!(profiler.stats(Pass::Forward).is_none());
    }
}
