use polars::prelude::*;
use tracing::info;

use crate::error::RateioError;
use crate::stage::{column_sum, StageDefinition, StageOutput, StageReport};

/// Conservation tolerance, scaled by the magnitude of the stage input.
pub const CONSERVATION_TOLERANCE: f64 = 1e-6;

/// Runs an ordered list of allocation stages over a prepared entry table,
/// threading each stage's output into the next and validating that no value
/// is created or lost along the way.
pub struct RateioEngine {
    entries: DataFrame,
    metrics: DataFrame,
}

impl RateioEngine {
    /// `entries` is the prepared value table; `metrics` the driver table
    /// consulted by driver stages.
    pub fn new(entries: DataFrame, metrics: DataFrame) -> Self {
        Self { entries, metrics }
    }

    /// Run the stage plan in declared order and return the final table.
    ///
    /// Fail-fast: the first stage error aborts the run; no partial result
    /// is ever returned.
    pub fn run(&self, stages: &[StageDefinition]) -> Result<DataFrame, RateioError> {
        let mut current = self.entries.clone();
        for def in stages {
            let StageOutput { table, report } = def.apply(&current, &self.metrics)?;

            let actual = if table.schema().contains(&def.output_column) {
                column_sum(&table, &def.output_column)?
            } else {
                0.0
            };
            check_conservation(def.stage, &report, actual)?;

            info!(
                stage = def.stage,
                rows = table.height(),
                total = actual,
                "stage complete"
            );
            current = table;
        }
        Ok(current)
    }
}

/// Post-stage global check: the output total must match the input total net
/// of explicitly dropped, displaced, and injected value.
fn check_conservation(
    stage: u32,
    report: &StageReport,
    actual: f64,
) -> Result<(), RateioError> {
    let expected = report.input_total - report.dropped - report.displaced + report.injected;
    let tolerance = CONSERVATION_TOLERANCE * expected.abs().max(1.0);
    if (actual - expected).abs() > tolerance {
        return Err(RateioError::Conservation {
            stage,
            expected,
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criterion::{AllocationCriterion, UnmatchedKeyPolicy, ZeroMetricPolicy};
    use crate::filter::{ColumnCriteria, FilterValue, RowFilter};
    use crate::schema::{allocation, entry};
    use crate::stage::{MetricSource, PoolSource};

    fn stage(
        number: u32,
        scope: RowFilter,
        group_by: Vec<String>,
        metric_column: &str,
        pool_column: &str,
    ) -> StageDefinition {
        StageDefinition {
            stage: number,
            scope,
            group_by,
            criterion: AllocationCriterion::ProportionalByMetric,
            metric: MetricSource::InputColumn(metric_column.into()),
            pool: PoolSource::Column(pool_column.into()),
            output_column: allocation::ALLOCATED_VALUE.into(),
            round_decimals: Some(2),
            zero_metric: ZeroMetricPolicy::default(),
            unmatched_key: UnmatchedKeyPolicy::default(),
        }
    }

    /// Scenario C: a center total of 1000 split across segments, then
    /// segment A's share split across its centers by metric [3, 1].
    fn cascade_entries() -> DataFrame {
        DataFrame::new(vec![
            Column::new(entry::SEGMENT_ID.into(), &["a", "a", "b"]),
            Column::new(entry::CENTER_ID.into(), &[1i64, 2, 3]),
            Column::new(entry::VALUE.into(), &[1000.0f64, 0.0, 0.0]),
            Column::new("segment_weight".into(), &[600.0f64, 0.0, 400.0]),
            Column::new("center_weight".into(), &[3.0f64, 1.0, 1.0]),
        ])
        .unwrap()
    }

    fn cascade_stages() -> Vec<StageDefinition> {
        // Stage 1 splits the company total across segments.
        let first = stage(
            1,
            RowFilter::default(),
            vec![],
            "segment_weight",
            entry::VALUE,
        );
        // Stage 2 splits segment A's total across its centers; the merged
        // stage-1 output of each segment is regrouped per segment first.
        let second = stage(
            2,
            RowFilter {
                criteria: vec![ColumnCriteria {
                    column: entry::SEGMENT_ID.into(),
                    values: vec![FilterValue::Str("a".into())],
                }],
                ..Default::default()
            },
            vec![entry::SEGMENT_ID.into()],
            "center_weight",
            allocation::ALLOCATED_VALUE,
        );
        vec![first, second]
    }

    #[test]
    fn scenario_c_cascade_conserves_global_total() {
        let engine = RateioEngine::new(cascade_entries(), DataFrame::empty());
        let out = engine.run(&cascade_stages()).unwrap();

        let allocated = out
            .column(allocation::ALLOCATED_VALUE)
            .unwrap()
            .f64()
            .unwrap();
        let total: f64 = allocated.into_iter().map(|v| v.unwrap_or(0.0)).sum();
        assert!((total - 1000.0).abs() < 1e-6);

        // Segment A's 600 lands 450/150 by the [3, 1] center metric.
        let mut by_center: Vec<(i64, f64)> = Vec::new();
        let centers = out.column(entry::CENTER_ID).unwrap().i64().unwrap();
        for i in 0..out.height() {
            by_center.push((
                centers.get(i).unwrap(),
                allocated.get(i).unwrap_or(0.0),
            ));
        }
        by_center.sort_by_key(|(c, _)| *c);
        assert_eq!(by_center[0], (1, 450.0));
        assert_eq!(by_center[1], (2, 150.0));
        assert_eq!(by_center[2], (3, 400.0));
    }

    #[test]
    fn replay_is_bit_identical() {
        let engine = RateioEngine::new(cascade_entries(), DataFrame::empty());
        let stages = cascade_stages();
        let first = engine.run(&stages).unwrap();
        let second = engine.run(&stages).unwrap();
        assert!(first.equals_missing(&second));
    }

    #[test]
    fn first_failing_stage_aborts_the_run() {
        let engine = RateioEngine::new(cascade_entries(), DataFrame::empty());
        let mut stages = cascade_stages();
        stages[0].metric = MetricSource::InputColumn("no_such_column".into());
        let result = engine.run(&stages);
        assert!(matches!(result, Err(RateioError::Schema(c)) if c == "no_such_column"));
    }

    #[test]
    fn conservation_check_accepts_accounted_movement() {
        let report = StageReport {
            input_total: 100.0,
            allocated_total: 70.0,
            dropped: 30.0,
            displaced: 0.0,
            injected: 0.0,
        };
        assert!(check_conservation(1, &report, 70.0).is_ok());
    }

    #[test]
    fn conservation_check_rejects_leaks() {
        let report = StageReport {
            input_total: 100.0,
            allocated_total: 99.9,
            dropped: 0.0,
            displaced: 0.0,
            injected: 0.0,
        };
        let result = check_conservation(3, &report, 99.9);
        assert!(matches!(
            result,
            Err(RateioError::Conservation { stage: 3, .. })
        ));
    }
}
