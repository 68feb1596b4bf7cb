//! Metric report sinks.
//!
//! Reporters are append-only and react only to driver-emitted events; they
//! hold no schedule of their own. I/O here must stay fast enough not to
//! stall the step loop.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use tracing::info;

use crate::error::Result;
use crate::metrics::MetricReport;

/// Side-effecting sink for metric reports and progress lines.
pub trait Reporter: Send {
    fn report(&mut self, report: &MetricReport) -> Result<()>;

    /// Training-loss progress at report boundaries.
    fn progress(&mut self, _step: u64, _loss: f64) -> Result<()> {
        Ok(())
    }
}

/// Emits reports through `tracing`.
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&mut self, report: &MetricReport) -> Result<()> {
        let values = report
            .values
            .iter()
            .map(|(name, value)| format!("{name}={value:.6}"))
            .collect::<Vec<_>>()
            .join(" ");
        info!(
            step = report.step,
            partition = %report.partition,
            %values,
            "evaluation"
        );
        Ok(())
    }

    fn progress(&mut self, step: u64, loss: f64) -> Result<()> {
        info!(step, loss = format!("{loss:.6}"), "training");
        Ok(())
    }
}

/// Appends one JSON line per report to `metrics.log` in the run directory.
pub struct JsonlReporter {
    file: File,
}

impl JsonlReporter {
    pub fn create(run_dir: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(run_dir.join("metrics.log"))?;
        Ok(Self { file })
    }
}

impl Reporter for JsonlReporter {
    fn report(&mut self, report: &MetricReport) -> Result<()> {
        let line = serde_json::to_string(report)?;
        writeln!(self.file, "{line}")?;
        self.file.flush()?;
        Ok(())
    }
}
