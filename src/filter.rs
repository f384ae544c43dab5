use chrono::{NaiveDate, NaiveTime};
use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::RateioError;

/// A criteria value: integers for id columns, strings for everything else.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Int(i64),
    Str(String),
}

/// A single `column IN (values)` criterion. A list mixing integers and
/// strings is rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnCriteria {
    pub column: String,
    pub values: Vec<FilterValue>,
}

/// Row selection over a working table: an optional period constraint on a
/// datetime column plus any number of membership criteria.
///
/// An empty filter keeps every row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RowFilter {
    /// Datetime column the period constraints apply to.
    #[serde(default)]
    pub date_column: Option<String>,
    /// Calendar months (1-12) kept by the filter.
    #[serde(default)]
    pub months: Vec<u32>,
    /// Inclusive date range kept by the filter.
    #[serde(default)]
    pub between: Option<(NaiveDate, NaiveDate)>,
    /// Membership criteria, all of which must hold.
    #[serde(default)]
    pub criteria: Vec<ColumnCriteria>,
}

impl RowFilter {
    /// Columns the filter reads; used for schema validation.
    pub fn required_columns(&self) -> Vec<&str> {
        let mut cols: Vec<&str> = Vec::new();
        if let Some(date_col) = &self.date_column {
            if !self.months.is_empty() || self.between.is_some() {
                cols.push(date_col.as_str());
            }
        }
        for c in &self.criteria {
            cols.push(c.column.as_str());
        }
        cols
    }

    /// Keep only matching rows.
    pub fn apply(&self, df: &DataFrame) -> Result<DataFrame, RateioError> {
        let (kept, _) = self.split(df)?;
        Ok(kept)
    }

    /// Partition into (matching, non-matching) rows.
    ///
    /// Null comparison results count as non-matching, so the two halves
    /// always cover the whole input.
    pub fn split(&self, df: &DataFrame) -> Result<(DataFrame, DataFrame), RateioError> {
        let expr = match self.to_expr()? {
            Some(expr) => expr,
            None => return Ok((df.clone(), DataFrame::empty_with_schema(df.schema().as_ref()))),
        };

        let mask_df = df
            .clone()
            .lazy()
            .select([expr.alias("__match")])
            .collect()?;
        let mask = mask_df.column("__match")?.bool()?;

        let kept_values: Vec<bool> = mask.into_iter().map(|v| v.unwrap_or(false)).collect();
        let kept = BooleanChunked::from_slice("__match".into(), &kept_values);
        let dropped = !&kept;

        Ok((df.filter(&kept)?, df.filter(&dropped)?))
    }

    fn to_expr(&self) -> Result<Option<Expr>, RateioError> {
        let mut expr: Option<Expr> = None;
        let and = |e: Expr, acc: &mut Option<Expr>| {
            *acc = Some(match acc.take() {
                Some(prev) => prev.and(e),
                None => e,
            });
        };

        if let Some(date_col) = &self.date_column {
            if !self.months.is_empty() {
                let months: Vec<i32> = self.months.iter().map(|m| *m as i32).collect();
                let months = Series::new("months".into(), months);
                and(
                    col(date_col.as_str())
                        .dt()
                        .month()
                        .cast(DataType::Int32)
                        .is_in(lit(months), false),
                    &mut expr,
                );
            }
            if let Some((from, to)) = &self.between {
                let start = from.and_time(NaiveTime::MIN).and_utc().timestamp_micros();
                let end = to
                    .succ_opt()
                    .ok_or_else(|| {
                        RateioError::InvalidDefinition(format!("date out of range: {to}"))
                    })?
                    .and_time(NaiveTime::MIN)
                    .and_utc()
                    .timestamp_micros();
                and(
                    col(date_col.as_str())
                        .gt_eq(lit(start))
                        .and(col(date_col.as_str()).lt(lit(end))),
                    &mut expr,
                );
            }
        }

        for criteria in &self.criteria {
            let series = criteria_series(criteria)?;
            and(
                col(criteria.column.as_str()).is_in(lit(series), false),
                &mut expr,
            );
        }

        Ok(expr)
    }
}

fn criteria_series(criteria: &ColumnCriteria) -> Result<Series, RateioError> {
    if criteria.values.is_empty() {
        return Err(RateioError::InvalidDefinition(format!(
            "empty criteria for column '{}'",
            criteria.column
        )));
    }
    let all_int = criteria
        .values
        .iter()
        .all(|v| matches!(v, FilterValue::Int(_)));
    let all_str = criteria
        .values
        .iter()
        .all(|v| matches!(v, FilterValue::Str(_)));

    if all_int {
        let values: Vec<i64> = criteria
            .values
            .iter()
            .map(|v| match v {
                FilterValue::Int(i) => *i,
                FilterValue::Str(_) => unreachable!(),
            })
            .collect();
        Ok(Series::new(criteria.column.as_str().into(), values))
    } else if all_str {
        let values: Vec<String> = criteria
            .values
            .iter()
            .map(|v| match v {
                FilterValue::Str(s) => s.clone(),
                FilterValue::Int(_) => unreachable!(),
            })
            .collect();
        Ok(Series::new(criteria.column.as_str().into(), values))
    } else {
        Err(RateioError::InvalidDefinition(format!(
            "mixed integer and string criteria for column '{}'",
            criteria.column
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DataFrame {
        DataFrame::new(vec![
            Column::new("center_id".into(), &[100i64, 204, 268, 300]),
            Column::new("channel".into(), &["a", "b", "a", "c"]),
            Column::new("value".into(), &[10.0f64, 20.0, 30.0, 40.0]),
        ])
        .unwrap()
    }

    #[test]
    fn empty_filter_keeps_everything() {
        let df = sample();
        let (kept, dropped) = RowFilter::default().split(&df).unwrap();
        assert_eq!(kept.height(), 4);
        assert_eq!(dropped.height(), 0);
    }

    #[test]
    fn int_criteria_partitions_rows() {
        let df = sample();
        let filter = RowFilter {
            criteria: vec![ColumnCriteria {
                column: "center_id".into(),
                values: vec![FilterValue::Int(100), FilterValue::Int(204)],
            }],
            ..Default::default()
        };
        let (kept, dropped) = filter.split(&df).unwrap();
        assert_eq!(kept.height(), 2);
        assert_eq!(dropped.height(), 2);
    }

    #[test]
    fn combined_criteria_are_conjunctive() {
        let df = sample();
        let filter = RowFilter {
            criteria: vec![
                ColumnCriteria {
                    column: "center_id".into(),
                    values: vec![FilterValue::Int(100), FilterValue::Int(268)],
                },
                ColumnCriteria {
                    column: "channel".into(),
                    values: vec![FilterValue::Str("a".into())],
                },
            ],
            ..Default::default()
        };
        let kept = filter.apply(&df).unwrap();
        assert_eq!(kept.height(), 2);
    }

    #[test]
    fn month_filter_selects_period() {
        use crate::io::parse_datetime_columns;

        let df = DataFrame::new(vec![
            Column::new(
                "booking_date".into(),
                &["2024-10-05 00:00:00", "2024-11-20 00:00:00", "2024-12-01 00:00:00"],
            ),
            Column::new("value".into(), &[1.0f64, 2.0, 3.0]),
        ])
        .unwrap();
        let df = parse_datetime_columns(df, &["booking_date"], "%Y-%m-%d %H:%M:%S").unwrap();

        let filter = RowFilter {
            date_column: Some("booking_date".into()),
            months: vec![10, 11],
            ..Default::default()
        };
        let kept = filter.apply(&df).unwrap();
        assert_eq!(kept.height(), 2);
    }

    #[test]
    fn date_range_is_inclusive() {
        use crate::io::parse_datetime_columns;

        let df = DataFrame::new(vec![
            Column::new(
                "booking_date".into(),
                &["2024-10-05 00:00:00", "2024-10-31 23:59:59", "2024-11-01 00:00:00"],
            ),
            Column::new("value".into(), &[1.0f64, 2.0, 3.0]),
        ])
        .unwrap();
        let df = parse_datetime_columns(df, &["booking_date"], "%Y-%m-%d %H:%M:%S").unwrap();

        let filter = RowFilter {
            date_column: Some("booking_date".into()),
            between: Some((
                NaiveDate::from_ymd_opt(2024, 10, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 10, 31).unwrap(),
            )),
            ..Default::default()
        };
        let kept = filter.apply(&df).unwrap();
        assert_eq!(kept.height(), 2);
    }

    #[test]
    fn mixed_criteria_values_are_rejected() {
        let df = sample();
        let filter = RowFilter {
            criteria: vec![ColumnCriteria {
                column: "center_id".into(),
                values: vec![FilterValue::Int(100), FilterValue::Str("x".into())],
            }],
            ..Default::default()
        };
        assert!(matches!(
            filter.apply(&df),
            Err(RateioError::InvalidDefinition(_))
        ));
    }
}
