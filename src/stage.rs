use std::collections::HashMap;

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::criterion::{distribute, AllocationCriterion, UnmatchedKeyPolicy, ZeroMetricPolicy};
use crate::error::RateioError;
use crate::filter::RowFilter;
use crate::schema::allocation;

/// Where a stage's pool amounts come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolSource {
    /// Per-row amounts from a column of the working table.
    Column(String),
    /// A fixed amount redistributed per group; prior output values of the
    /// affected rows are displaced.
    External(f64),
}

/// Where member weights come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricSource {
    /// A numeric column of the working table. Members are the rows of each
    /// group; no rows are added or removed.
    InputColumn(String),
    /// The engine's metric table. Each scoped row expands into one output
    /// row per member.
    Driver(DriverSpec),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSpec {
    /// Columns of the metric table that identify a member.
    pub member_keys: Vec<String>,
    /// Weight column, summed per member.
    pub weight_column: String,
    /// Columns joining value-side groups to metric rows. Empty means one
    /// global member table for the whole scope.
    #[serde(default)]
    pub link_keys: Vec<String>,
    /// Selects the metric rows feeding this stage.
    #[serde(default)]
    pub filter: RowFilter,
}

/// One allocation step: which rows participate, how they group, where the
/// weights and pools come from, and where the result lands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Stage number stamped on allocated rows.
    pub stage: u32,
    /// Value rows participating in this stage; the rest pass through.
    #[serde(default)]
    pub scope: RowFilter,
    /// Grouping key for input-column metrics; empty treats the whole scope
    /// as one group. Driver stages group by the driver's link keys instead.
    #[serde(default)]
    pub group_by: Vec<String>,
    pub criterion: AllocationCriterion,
    pub metric: MetricSource,
    pub pool: PoolSource,
    /// Column receiving allocated amounts.
    #[serde(default = "default_output_column")]
    pub output_column: String,
    /// Minor-unit rounding of allocated amounts; `None` keeps raw products.
    #[serde(default = "default_decimals")]
    pub round_decimals: Option<u32>,
    #[serde(default)]
    pub zero_metric: ZeroMetricPolicy,
    #[serde(default)]
    pub unmatched_key: UnmatchedKeyPolicy,
}

fn default_output_column() -> String {
    allocation::ALLOCATED_VALUE.to_string()
}

fn default_decimals() -> Option<u32> {
    Some(2)
}

/// Value movement of one stage, used by the engine's conservation check.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageReport {
    /// Pool-column total over the whole input table.
    pub input_total: f64,
    /// Output-column total over the whole output table.
    pub allocated_total: f64,
    /// Value removed by `UnmatchedKeyPolicy::Drop`.
    pub dropped: f64,
    /// Prior value replaced by `ZeroFill` or by an external pool.
    pub displaced: f64,
    /// Externally supplied pool amounts distributed by this stage.
    pub injected: f64,
}

#[derive(Debug)]
pub struct StageOutput {
    pub table: DataFrame,
    pub report: StageReport,
}

/// Parse an ordered stage plan from its JSON representation.
pub fn parse_stage_plan(json: &str) -> Result<Vec<StageDefinition>, RateioError> {
    serde_json::from_str(json).map_err(|e| RateioError::InvalidDefinition(e.to_string()))
}

impl StageDefinition {
    /// Run this stage over `input`, producing a fresh table.
    ///
    /// `metrics` is only consulted by driver stages.
    pub fn apply(
        &self,
        input: &DataFrame,
        metrics: &DataFrame,
    ) -> Result<StageOutput, RateioError> {
        self.validate(input, metrics)?;

        let mut report = StageReport {
            input_total: self.baseline_total(input)?,
            ..Default::default()
        };

        let (scope, passthrough) = self.scope.split(input)?;
        debug!(
            stage = self.stage,
            scoped = scope.height(),
            passthrough = passthrough.height(),
            "stage scope resolved"
        );

        let allocated = match &self.metric {
            MetricSource::InputColumn(metric_column) => {
                self.allocate_within_groups(scope, metric_column, &mut report)?
            }
            MetricSource::Driver(spec) => {
                self.allocate_from_driver(scope, metrics, spec, &mut report)?
            }
        };

        let passthrough = self.finish_passthrough(passthrough)?;

        let mut frames: Vec<DataFrame> = Vec::new();
        if let Some(df) = allocated {
            frames.push(df);
        }
        frames.push(passthrough);
        let table = merge_frames(frames)?;

        report.allocated_total = if table.schema().contains(&self.output_column) {
            column_sum(&table, &self.output_column)?
        } else {
            0.0
        };

        Ok(StageOutput { table, report })
    }

    // ── Input-column metric: reweight rows within each group ────────────────

    fn allocate_within_groups(
        &self,
        scope: DataFrame,
        metric_column: &str,
        report: &mut StageReport,
    ) -> Result<Option<DataFrame>, RateioError> {
        if scope.height() == 0 {
            return Ok(None);
        }
        let partitions = if self.group_by.is_empty() {
            vec![scope]
        } else {
            scope.partition_by_stable(self.group_by.as_slice(), true)?
        };

        let mut out: Option<DataFrame> = None;
        for mut partition in partitions {
            let weights = numeric_values(&partition, metric_column)?;
            let shares = self.criterion.shares(&weights, self.zero_metric)?;
            let pool = self.group_pool(&partition, report)?;
            let amounts = distribute(pool, &shares, self.round_decimals)?;

            let n = partition.height();
            partition.with_column(Column::new(
                allocation::ALLOCATION_RATIO.into(),
                shares,
            ))?;
            partition.with_column(Column::new(
                self.output_column.as_str().into(),
                amounts,
            ))?;
            partition.with_column(Column::new(
                allocation::STAGE.into(),
                vec![self.stage as i64; n],
            ))?;

            out = Some(match out {
                Some(acc) => acc.vstack(&partition)?,
                None => partition,
            });
        }
        Ok(out)
    }

    /// Pool of one group: the group's value sum, or the external amount
    /// (displacing whatever the output column previously held).
    fn group_pool(
        &self,
        partition: &DataFrame,
        report: &mut StageReport,
    ) -> Result<f64, RateioError> {
        match &self.pool {
            PoolSource::Column(column) => column_sum(partition, column),
            PoolSource::External(amount) => {
                if partition.schema().contains(&self.output_column) {
                    report.displaced += column_sum(partition, &self.output_column)?;
                }
                report.injected += amount;
                Ok(*amount)
            }
        }
    }

    // ── Driver metric: expand rows against the metric table ─────────────────

    fn allocate_from_driver(
        &self,
        scope: DataFrame,
        metrics: &DataFrame,
        spec: &DriverSpec,
        report: &mut StageReport,
    ) -> Result<Option<DataFrame>, RateioError> {
        if scope.height() == 0 {
            return Ok(None);
        }
        let members = build_members(metrics, spec)?;
        debug!(stage = self.stage, members = members.len(), "driver members resolved");

        let partitions = if spec.link_keys.is_empty() {
            vec![scope]
        } else {
            scope.partition_by_stable(spec.link_keys.as_slice(), true)?
        };

        let mut builder = ExpandedBuilder::new(&partitions[0], spec, self);
        for partition in &partitions {
            let group_link = if spec.link_keys.is_empty() {
                String::new()
            } else {
                let mut vals = Vec::with_capacity(spec.link_keys.len());
                for key in &spec.link_keys {
                    vals.push(partition.column(key)?.get(0)?.into_static());
                }
                composite(&vals)
            };

            let group: Vec<&Member> =
                members.iter().filter(|m| m.link == group_link).collect();

            if group.is_empty() {
                match self.unmatched_key {
                    UnmatchedKeyPolicy::Fail => {
                        return Err(RateioError::UnmatchedKey(display_key(
                            &spec.link_keys,
                            &group_link,
                        )));
                    }
                    UnmatchedKeyPolicy::Drop => {
                        if let PoolSource::Column(column) = &self.pool {
                            report.dropped += column_sum(partition, column)?;
                        }
                        continue;
                    }
                    UnmatchedKeyPolicy::ZeroFill => {
                        if let PoolSource::Column(column) = &self.pool {
                            report.displaced += column_sum(partition, column)?;
                        }
                        builder.emit_zero_filled(partition)?;
                        continue;
                    }
                }
            }

            let weights: Vec<f64> = group.iter().map(|m| m.weight).collect();
            let shares = self.criterion.shares(&weights, self.zero_metric)?;

            match &self.pool {
                PoolSource::Column(column) => {
                    let pools = numeric_values(partition, column)?;
                    for (row, &pool) in pools.iter().enumerate() {
                        let amounts = distribute(pool, &shares, self.round_decimals)?;
                        for ((&member, &share), amount) in
                            group.iter().zip(&shares).zip(amounts)
                        {
                            builder.emit(partition, row, Some(member), share, amount)?;
                        }
                    }
                }
                PoolSource::External(amount) => {
                    // The group collapses into one member row set; its own
                    // rows are consumed and their prior output displaced.
                    if partition.schema().contains(&self.output_column) {
                        report.displaced += column_sum(partition, &self.output_column)?;
                    }
                    report.injected += amount;
                    let amounts = distribute(*amount, &shares, self.round_decimals)?;
                    for ((&member, &share), allocated) in
                        group.iter().zip(&shares).zip(amounts)
                    {
                        builder.emit(partition, 0, Some(member), share, allocated)?;
                    }
                }
            }
        }

        builder.finish()
    }

    // ── Passthrough rows ────────────────────────────────────────────────────

    /// Rows outside the stage scope keep their columns; the output column is
    /// seeded from the pool column when it does not exist yet, and rows never
    /// touched by any stage are stamped 0.
    fn finish_passthrough(&self, mut passthrough: DataFrame) -> Result<DataFrame, RateioError> {
        if let PoolSource::Column(column) = &self.pool {
            if *column != self.output_column && !passthrough.schema().contains(&self.output_column)
            {
                let seeded = passthrough
                    .column(column)?
                    .as_materialized_series()
                    .cast(&DataType::Float64)?
                    .with_name(self.output_column.as_str().into());
                passthrough.with_column(seeded)?;
            }
        }
        if !passthrough.schema().contains(allocation::STAGE) {
            let n = passthrough.height();
            passthrough.with_column(Column::new(allocation::STAGE.into(), vec![0i64; n]))?;
        }
        Ok(passthrough)
    }

    // ── Validation ──────────────────────────────────────────────────────────

    fn validate(&self, input: &DataFrame, metrics: &DataFrame) -> Result<(), RateioError> {
        let mut required: Vec<&str> = self.scope.required_columns();
        required.extend(self.group_by.iter().map(String::as_str));
        if let PoolSource::Column(column) = &self.pool {
            required.push(column.as_str());
        }
        match &self.metric {
            MetricSource::InputColumn(column) => required.push(column.as_str()),
            MetricSource::Driver(spec) => {
                required.extend(spec.link_keys.iter().map(String::as_str));

                let mut metric_required: Vec<&str> = spec.filter.required_columns();
                metric_required.extend(spec.member_keys.iter().map(String::as_str));
                metric_required.extend(spec.link_keys.iter().map(String::as_str));
                metric_required.push(spec.weight_column.as_str());
                require_columns(metrics, &metric_required)?;
            }
        }
        require_columns(input, &required)
    }

    /// Total the conservation check is measured against, over the whole input.
    fn baseline_total(&self, input: &DataFrame) -> Result<f64, RateioError> {
        match &self.pool {
            PoolSource::Column(column) => column_sum(input, column),
            PoolSource::External(_) => {
                if input.schema().contains(&self.output_column) {
                    column_sum(input, &self.output_column)
                } else {
                    Ok(0.0)
                }
            }
        }
    }
}

// ── Driver members ──────────────────────────────────────────────────────────

struct Member {
    key: Vec<AnyValue<'static>>,
    link: String,
    weight: f64,
}

/// Reduce the filtered metric table to one member per distinct key
/// combination, in first-appearance order, weights summed.
fn build_members(metrics: &DataFrame, spec: &DriverSpec) -> Result<Vec<Member>, RateioError> {
    let filtered = spec.filter.apply(metrics)?;
    let weights = filtered
        .column(&spec.weight_column)?
        .as_materialized_series()
        .cast(&DataType::Float64)?;
    let weights = weights.f64()?;

    let mut members: Vec<Member> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for i in 0..filtered.height() {
        let mut key = Vec::with_capacity(spec.member_keys.len());
        for column in &spec.member_keys {
            key.push(filtered.column(column)?.get(i)?.into_static());
        }
        let mut link_vals = Vec::with_capacity(spec.link_keys.len());
        for column in &spec.link_keys {
            link_vals.push(filtered.column(column)?.get(i)?.into_static());
        }
        let link = composite(&link_vals);
        let id = format!("{}\u{001E}{}", link, composite(&key));
        let weight = weights.get(i).unwrap_or(0.0);

        match index.get(&id) {
            Some(&pos) => members[pos].weight += weight,
            None => {
                index.insert(id, members.len());
                members.push(Member { key, link, weight });
            }
        }
    }
    Ok(members)
}

fn composite(values: &[AnyValue]) -> String {
    values
        .iter()
        .map(|v| format!("{v}"))
        .collect::<Vec<_>>()
        .join("\u{001F}")
}

fn display_key(columns: &[String], link: &str) -> String {
    if columns.is_empty() {
        "<global>".to_string()
    } else {
        format!("{}={}", columns.join(","), link.replace('\u{001F}', ","))
    }
}

// ── Expanded output assembly ────────────────────────────────────────────────

/// Column role in the expanded output of a driver stage.
enum ColumnSource {
    Input(String),
    MemberKey(usize),
    Ratio,
    Output,
    Stage,
}

/// Column-wise accumulator: `AnyValue` vectors turned into
/// `Series::from_any_values` once every group has been emitted.
struct ExpandedBuilder {
    names: Vec<String>,
    sources: Vec<ColumnSource>,
    values: Vec<Vec<AnyValue<'static>>>,
    stage: i64,
}

impl ExpandedBuilder {
    fn new(template: &DataFrame, spec: &DriverSpec, def: &StageDefinition) -> Self {
        let mut names: Vec<String> = template
            .get_column_names_str()
            .iter()
            .map(|s| s.to_string())
            .collect();
        for key in &spec.member_keys {
            if !names.contains(key) {
                names.push(key.clone());
            }
        }
        for extra in [
            allocation::ALLOCATION_RATIO,
            def.output_column.as_str(),
            allocation::STAGE,
        ] {
            if !names.iter().any(|n| n == extra) {
                names.push(extra.to_string());
            }
        }

        let sources = names
            .iter()
            .map(|name| {
                if name == allocation::ALLOCATION_RATIO {
                    ColumnSource::Ratio
                } else if *name == def.output_column {
                    ColumnSource::Output
                } else if name == allocation::STAGE {
                    ColumnSource::Stage
                } else if let Some(pos) = spec.member_keys.iter().position(|k| k == name) {
                    ColumnSource::MemberKey(pos)
                } else {
                    ColumnSource::Input(name.clone())
                }
            })
            .collect();

        let values = names.iter().map(|_| Vec::new()).collect();
        Self {
            names,
            sources,
            values,
            stage: def.stage as i64,
        }
    }

    fn emit(
        &mut self,
        partition: &DataFrame,
        row: usize,
        member: Option<&Member>,
        share: f64,
        amount: f64,
    ) -> Result<(), RateioError> {
        for i in 0..self.names.len() {
            let value = match &self.sources[i] {
                ColumnSource::Ratio => match member {
                    Some(_) => AnyValue::Float64(share),
                    None => AnyValue::Null,
                },
                ColumnSource::Output => AnyValue::Float64(amount),
                ColumnSource::Stage => AnyValue::Int64(self.stage),
                ColumnSource::MemberKey(pos) => match member {
                    Some(m) => m.key[*pos].clone(),
                    // Zero-filled rows keep whatever the input carried.
                    None => match partition.column(&self.names[i]) {
                        Ok(column) => column.get(row)?.into_static(),
                        Err(_) => AnyValue::Null,
                    },
                },
                ColumnSource::Input(name) => partition.column(name)?.get(row)?.into_static(),
            };
            self.values[i].push(value);
        }
        Ok(())
    }

    /// One output row per group row, allocated zero (unmatched key policy).
    fn emit_zero_filled(&mut self, partition: &DataFrame) -> Result<(), RateioError> {
        for row in 0..partition.height() {
            self.emit(partition, row, None, 0.0, 0.0)?;
        }
        Ok(())
    }

    fn finish(self) -> Result<Option<DataFrame>, RateioError> {
        if self.values.iter().all(|v| v.is_empty()) {
            return Ok(None);
        }
        let mut columns: Vec<Column> = Vec::with_capacity(self.names.len());
        for (name, values) in self.names.iter().zip(&self.values) {
            let series = Series::from_any_values(name.as_str().into(), values, true)?;
            columns.push(series.into());
        }
        Ok(Some(DataFrame::new(columns)?))
    }
}

// ── Table helpers ───────────────────────────────────────────────────────────

fn require_columns(df: &DataFrame, required: &[&str]) -> Result<(), RateioError> {
    for &column in required {
        if df.column(column).is_err() {
            return Err(RateioError::Schema(column.to_string()));
        }
    }
    Ok(())
}

/// Column total as f64; nulls count as zero, non-finite totals are fatal.
pub(crate) fn column_sum(df: &DataFrame, column: &str) -> Result<f64, RateioError> {
    let series = df
        .column(column)?
        .as_materialized_series()
        .cast(&DataType::Float64)?;
    let total = series.f64()?.sum().unwrap_or(0.0);
    if !total.is_finite() {
        return Err(RateioError::Computation(format!(
            "sum of column '{column}' is {total}"
        )));
    }
    Ok(total)
}

fn numeric_values(df: &DataFrame, column: &str) -> Result<Vec<f64>, RateioError> {
    let series = df
        .column(column)?
        .as_materialized_series()
        .cast(&DataType::Float64)?;
    Ok(series
        .f64()?
        .into_iter()
        .map(|v| v.unwrap_or(0.0))
        .collect())
}

/// Stack frames with possibly different column sets: missing columns are
/// null-filled, order follows first appearance. A column that is all-null in
/// one frame takes its dtype from whichever frame carries real values.
pub(crate) fn merge_frames(frames: Vec<DataFrame>) -> Result<DataFrame, RateioError> {
    let mut names: Vec<String> = Vec::new();
    let mut dtypes: Vec<DataType> = Vec::new();
    for frame in &frames {
        for (name, dtype) in frame.schema().iter() {
            match names.iter().position(|n| n == name.as_str()) {
                Some(pos) => {
                    if dtypes[pos] == DataType::Null && *dtype != DataType::Null {
                        dtypes[pos] = dtype.clone();
                    }
                }
                None => {
                    names.push(name.to_string());
                    dtypes.push(dtype.clone());
                }
            }
        }
    }

    let mut out: Option<DataFrame> = None;
    for frame in frames {
        let schema = frame.schema().clone();
        let mut lazy = frame.lazy();
        let fill: Vec<Expr> = names
            .iter()
            .zip(&dtypes)
            .filter(|(name, _)| !schema.contains(name.as_str()))
            .map(|(name, dtype)| match dtype {
                DataType::Null => lit(NULL).alias(name.as_str()),
                _ => lit(NULL).cast(dtype.clone()).alias(name.as_str()),
            })
            .collect();
        if !fill.is_empty() {
            lazy = lazy.with_columns(fill);
        }
        let selected: Vec<Expr> = names
            .iter()
            .zip(&dtypes)
            .map(|(name, dtype)| match dtype {
                DataType::Null => col(name.as_str()),
                _ => col(name.as_str()).cast(dtype.clone()),
            })
            .collect();
        let aligned = lazy.select(selected).collect()?;

        out = Some(match out {
            Some(acc) => acc.vstack(&aligned)?,
            None => aligned,
        });
    }
    out.ok_or_else(|| RateioError::InvalidDefinition("no frames to merge".to_string()))
}
