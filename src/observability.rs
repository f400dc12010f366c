use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    /// Timings keyed by phase ("fetch", "build", "test") or step label
    /// ("build:3:run").
    pub phases: BTreeMap<String, PhaseMetrics>,
    pub total_duration_ms: f64,
    pub resources_staged: u64,
    pub steps_run: u64,
    pub test_passes: u64,
    pub test_failures: u64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct PhaseMetrics {
    pub calls: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsSnapshot::default())),
        }
    }

    pub fn start_phase(&self, label: &str) -> PhaseTimer {
        PhaseTimer {
            label: label.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            recorded: false,
        }
    }

    pub fn record_total_duration(&self, duration: Duration) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.total_duration_ms = duration.as_secs_f64() * 1_000.0;
        }
    }

    pub fn record_resource_staged(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.resources_staged += 1;
        }
    }

    pub fn record_step_run(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.steps_run += 1;
        }
    }

    pub fn record_test_pass(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.test_passes += 1;
        }
    }

    pub fn record_test_failure(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.test_failures += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn reset(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = MetricsSnapshot::default();
        }
    }
}

pub struct PhaseTimer {
    label: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    recorded: bool,
}

impl PhaseTimer {
    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration = self.started_at.elapsed();
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.phases.entry(self.label.clone()).or_default();
            metrics.calls += 1;
            let duration_ms = duration.as_secs_f64() * 1_000.0;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(
            phase = self.label.as_str(),
            duration_ms = duration.as_secs_f64() * 1_000.0,
            "phase duration recorded"
        );
        self.recorded = true;
    }
}

impl Drop for PhaseTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        resources_staged = snapshot.resources_staged,
        steps_run = snapshot.steps_run,
        test_passes = snapshot.test_passes,
        test_failures = snapshot.test_failures,
        "build metrics summary"
    );
    for (phase, metrics) in &snapshot.phases {
        info!(
            phase = phase.as_str(),
            calls = metrics.calls,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "phase metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        output.push_str("# HELP cauldron_resources_staged_total Resources fetched and staged\n");
        output.push_str("# TYPE cauldron_resources_staged_total counter\n");
        output.push_str(&format!(
            "cauldron_resources_staged_total {}\n",
            self.resources_staged
        ));
        output.push_str("# HELP cauldron_steps_run_total Build steps executed\n");
        output.push_str("# TYPE cauldron_steps_run_total counter\n");
        output.push_str(&format!("cauldron_steps_run_total {}\n", self.steps_run));
        output.push_str("# HELP cauldron_test_passes_total Test steps passed\n");
        output.push_str("# TYPE cauldron_test_passes_total counter\n");
        output.push_str(&format!("cauldron_test_passes_total {}\n", self.test_passes));
        output.push_str("# HELP cauldron_test_failures_total Test steps failed\n");
        output.push_str("# TYPE cauldron_test_failures_total counter\n");
        output.push_str(&format!(
            "cauldron_test_failures_total {}\n",
            self.test_failures
        ));
        output.push_str("# HELP cauldron_phase_calls_total Phase invocation count\n");
        output.push_str("# TYPE cauldron_phase_calls_total counter\n");
        output.push_str(
            "# HELP cauldron_phase_duration_seconds_total Accumulated phase duration in seconds\n",
        );
        output.push_str("# TYPE cauldron_phase_duration_seconds_total counter\n");
        output
            .push_str("# HELP cauldron_phase_duration_seconds_max Maximum phase duration in seconds\n");
        output.push_str("# TYPE cauldron_phase_duration_seconds_max gauge\n");
        for (phase, metrics) in &self.phases {
            output.push_str(&format!(
                "cauldron_phase_calls_total{{phase=\"{}\"}} {}\n",
                phase, metrics.calls
            ));
            output.push_str(&format!(
                "cauldron_phase_duration_seconds_total{{phase=\"{}\"}} {:.6}\n",
                phase,
                metrics.total_duration_ms / 1_000.0
            ));
            output.push_str(&format!(
                "cauldron_phase_duration_seconds_max{{phase=\"{}\"}} {:.6}\n",
                phase,
                metrics.max_duration_ms / 1_000.0
            ));
        }
        output.push_str("# HELP cauldron_build_duration_seconds Total build duration\n");
        output.push_str("# TYPE cauldron_build_duration_seconds gauge\n");
        output.push_str(&format!(
            "cauldron_build_duration_seconds {:.6}\n",
            self.total_duration_ms / 1_000.0
        ));
        output
    }
}
