use crate::commands::{CommandError, CommandPath};
use crate::model::KpiSample;
use crate::stats::ProcessorStats;
use std::sync::Arc;

/// Efficiency (good parts, percent) below which the line is slowed down.
pub const EFFICIENCY_THRESHOLD: f64 = 90.0;
pub const RATE_STEP: i64 = 10;

pub fn next_production_rate(current: i64) -> i64 {
    current.saturating_sub(RATE_STEP).max(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KpiAction {
    None,
    RateDecreased { from: i64, to: i64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KpiBatchSummary {
    pub samples: usize,
    pub skipped: usize,
    pub decreased: usize,
    pub failed: usize,
}

pub struct KpiEvaluator {
    commands: CommandPath,
    stats: Arc<ProcessorStats>,
}

impl KpiEvaluator {
    pub fn new(commands: CommandPath, stats: Arc<ProcessorStats>) -> Self {
        Self { commands, stats }
    }

    pub async fn on_kpi_sample(&self, sample: &KpiSample) -> Result<KpiAction, CommandError> {
        tracing::info!(
            device_id = sample.device_id,
            efficiency = sample.good_production_percentage,
            good = sample.total_good_count,
            bad = sample.total_bad_count,
            "device KPI"
        );
        if sample.good_production_percentage >= EFFICIENCY_THRESHOLD {
            return Ok(KpiAction::None);
        }

        tracing::warn!(
            device_id = sample.device_id,
            efficiency = sample.good_production_percentage,
            "efficiency below threshold; decreasing production rate"
        );
        let current = self.commands.reported_production_rate(sample.device_id).await;
        let next = next_production_rate(current);
        self.commands
            .set_desired_production_rate(sample.device_id, next)
            .await?;
        self.stats.record_rate_decrease();
        tracing::info!(device_id = sample.device_id, from = current, to = next, "production rate updated");
        Ok(KpiAction::RateDecreased {
            from: current,
            to: next,
        })
    }

    /// Evaluates a newline-delimited batch of KPI summaries. Lines are independent: bad lines
    /// and failed commands are logged and the rest of the batch continues.
    pub async fn process_batch(&self, batch: &[u8]) -> KpiBatchSummary {
        let mut summary = KpiBatchSummary::default();
        for line in batch.split(|byte| *byte == b'\n' || *byte == b'\r') {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let mut buf = line.to_vec();
            let sample: KpiSample = match simd_json::serde::from_slice(&mut buf) {
                Ok(sample) => sample,
                Err(err) => {
                    summary.skipped += 1;
                    tracing::warn!(error = %err, "skipping malformed KPI line");
                    continue;
                }
            };
            if sample.window_start >= sample.window_end {
                summary.skipped += 1;
                tracing::warn!(
                    device_id = sample.device_id,
                    window_start = %sample.window_start,
                    window_end = %sample.window_end,
                    "skipping KPI sample with empty window"
                );
                continue;
            }

            summary.samples += 1;
            match self.on_kpi_sample(&sample).await {
                Ok(KpiAction::RateDecreased { .. }) => summary.decreased += 1,
                Ok(KpiAction::None) => {}
                Err(err) => {
                    summary.failed += 1;
                    tracing::error!(device_id = sample.device_id, error = %err, "KPI action failed");
                }
            }
        }
        tracing::info!(
            samples = summary.samples,
            skipped = summary.skipped,
            decreased = summary.decreased,
            failed = summary.failed,
            "KPI batch processed"
        );
        summary
    }
}
