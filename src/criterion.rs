use serde::{Deserialize, Serialize};

use crate::error::RateioError;

/// How a pool is distributed across the members of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationCriterion {
    /// Each member receives `weight / sum(weights)` of the pool.
    ProportionalByMetric,
    /// Each member receives `1 / member_count` of the pool.
    EqualSplit,
}

/// Fallback when every weight in a group is zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZeroMetricPolicy {
    #[default]
    EqualSplit,
    Fail,
}

/// What to do with value rows whose grouping key has no metric entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedKeyPolicy {
    #[default]
    Fail,
    Drop,
    ZeroFill,
}

impl AllocationCriterion {
    /// Normalized shares for one group. Shares sum to 1.0 for any non-empty
    /// member list; non-finite weights are fatal.
    pub fn shares(
        &self,
        weights: &[f64],
        zero_metric: ZeroMetricPolicy,
    ) -> Result<Vec<f64>, RateioError> {
        if weights.is_empty() {
            return Ok(Vec::new());
        }
        match self {
            Self::EqualSplit => Ok(equal_shares(weights.len())),
            Self::ProportionalByMetric => {
                for (i, w) in weights.iter().enumerate() {
                    if !w.is_finite() {
                        return Err(RateioError::Computation(format!(
                            "metric weight at member {i} is {w}"
                        )));
                    }
                }
                let total: f64 = weights.iter().sum();
                if !total.is_finite() {
                    return Err(RateioError::Computation(format!(
                        "metric total overflowed: {total}"
                    )));
                }
                if total == 0.0 {
                    return match zero_metric {
                        ZeroMetricPolicy::EqualSplit => Ok(equal_shares(weights.len())),
                        ZeroMetricPolicy::Fail => Err(RateioError::Computation(
                            "all-zero metric in group with zero_metric=fail".to_string(),
                        )),
                    };
                }
                Ok(weights.iter().map(|w| w / total).collect())
            }
        }
    }
}

fn equal_shares(n: usize) -> Vec<f64> {
    vec![1.0 / n as f64; n]
}

/// Member that absorbs the rounding residual: the largest share, ties broken
/// by the first member in stable order.
pub fn residual_member(shares: &[f64]) -> Option<usize> {
    let mut designated: Option<(usize, f64)> = None;
    for (i, &s) in shares.iter().enumerate() {
        match designated {
            Some((_, best)) if s <= best => {}
            _ => designated = Some((i, s)),
        }
    }
    designated.map(|(i, _)| i)
}

/// Distribute `pool` across `shares`, rounding each amount to `decimals`
/// when given. The rounding residual is added to the designated member so
/// the amounts sum back to `pool`.
pub fn distribute(
    pool: f64,
    shares: &[f64],
    decimals: Option<u32>,
) -> Result<Vec<f64>, RateioError> {
    if !pool.is_finite() {
        return Err(RateioError::Computation(format!("pool amount is {pool}")));
    }
    if shares.is_empty() {
        return Ok(Vec::new());
    }

    let mut amounts: Vec<f64> = Vec::with_capacity(shares.len());
    for &share in shares {
        let provisional = match decimals {
            Some(d) => round_to(pool * share, d),
            None => pool * share,
        };
        if !provisional.is_finite() {
            return Err(RateioError::Computation(format!(
                "allocated amount is {provisional} (pool {pool}, share {share})"
            )));
        }
        amounts.push(provisional);
    }

    let assigned: f64 = amounts.iter().sum();
    let residual = pool - assigned;
    if let Some(designated) = residual_member(shares) {
        amounts[designated] += residual;
    }

    Ok(amounts)
}

fn round_to(x: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (x * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proportional_shares_follow_weights() {
        let shares = AllocationCriterion::ProportionalByMetric
            .shares(&[1.0, 1.0, 2.0], ZeroMetricPolicy::default())
            .unwrap();
        assert_eq!(shares, vec![0.25, 0.25, 0.5]);
    }

    #[test]
    fn equal_split_ignores_weights() {
        let shares = AllocationCriterion::EqualSplit
            .shares(&[5.0, 0.0, 95.0], ZeroMetricPolicy::default())
            .unwrap();
        assert_eq!(shares, vec![1.0 / 3.0; 3]);
    }

    #[test]
    fn zero_metric_falls_back_to_equal_split() {
        let shares = AllocationCriterion::ProportionalByMetric
            .shares(&[0.0, 0.0, 0.0], ZeroMetricPolicy::EqualSplit)
            .unwrap();
        assert_eq!(shares, vec![1.0 / 3.0; 3]);
    }

    #[test]
    fn zero_metric_can_be_fatal() {
        let result = AllocationCriterion::ProportionalByMetric
            .shares(&[0.0, 0.0], ZeroMetricPolicy::Fail);
        assert!(matches!(result, Err(RateioError::Computation(_))));
    }

    #[test]
    fn non_finite_weight_is_fatal() {
        let result = AllocationCriterion::ProportionalByMetric
            .shares(&[1.0, f64::NAN], ZeroMetricPolicy::default());
        assert!(matches!(result, Err(RateioError::Computation(_))));
    }

    #[test]
    fn scenario_a_allocation() {
        let shares = AllocationCriterion::ProportionalByMetric
            .shares(&[1.0, 1.0, 2.0], ZeroMetricPolicy::default())
            .unwrap();
        let amounts = distribute(100.0, &shares, Some(2)).unwrap();
        assert_eq!(amounts, vec![25.0, 25.0, 50.0]);
    }

    #[test]
    fn scenario_b_equal_split_residual_to_first() {
        let shares = AllocationCriterion::ProportionalByMetric
            .shares(&[0.0, 0.0, 0.0], ZeroMetricPolicy::EqualSplit)
            .unwrap();
        let amounts = distribute(100.0, &shares, Some(2)).unwrap();
        assert!((amounts[0] - 33.34).abs() < 1e-9);
        assert!((amounts[1] - 33.33).abs() < 1e-9);
        assert!((amounts[2] - 33.33).abs() < 1e-9);
        let total: f64 = amounts.iter().sum();
        assert!((total - 100.0).abs() < 1e-9);
    }

    #[test]
    fn residual_goes_to_largest_share() {
        assert_eq!(residual_member(&[0.25, 0.5, 0.25]), Some(1));
        // Tie: first member in stable order wins.
        assert_eq!(residual_member(&[0.5, 0.5]), Some(0));
        assert_eq!(residual_member(&[]), None);
    }

    #[test]
    fn residual_assignment_is_deterministic() {
        let shares = vec![0.3, 0.4, 0.3];
        let first = distribute(10.01, &shares, Some(2)).unwrap();
        for _ in 0..100 {
            assert_eq!(distribute(10.01, &shares, Some(2)).unwrap(), first);
        }
    }

    #[test]
    fn unrounded_distribution_conserves_pool() {
        let shares = AllocationCriterion::ProportionalByMetric
            .shares(&[1.0, 2.0, 4.0], ZeroMetricPolicy::default())
            .unwrap();
        let amounts = distribute(99.97, &shares, None).unwrap();
        let total: f64 = amounts.iter().sum();
        assert!((total - 99.97).abs() < 1e-9);
    }

    #[test]
    fn non_finite_pool_is_fatal() {
        let result = distribute(f64::INFINITY, &[1.0], Some(2));
        assert!(matches!(result, Err(RateioError::Computation(_))));
    }
}
