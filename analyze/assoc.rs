//! # Headcount-Burden Association
//!
//! Answers a narrower, fixed question than the model dispatcher: how
//! strongly is the poverty headcount associated with burden, and does
//! the association survive adjusting for year? Both statistics always
//! use the cross-sectional form regardless of which model the
//! dispatcher selected, so they stay comparable across datasets.

use crate::merge::MergedRow;
use crate::model::{ols, two_sided_t_pvalue, EstimationError};
use ndarray::{Array1, Array2};
use serde::Serialize;

/// Pairwise-complete Pearson correlation between headcount and burden.
#[derive(Debug, Clone, Serialize)]
pub struct PearsonCorrelation {
    pub r: f64,
    /// Complete pairs that entered the computation.
    pub n: usize,
    pub p_value: f64,
}

/// The headcount coefficient from the year-adjusted regression of
/// burden on poverty_headcount and year.
#[derive(Debug, Clone, Serialize)]
pub struct AdjustedEffect {
    pub estimate: f64,
    pub std_err: f64,
    pub p_value: f64,
    pub observations: usize,
}

/// Pearson correlation between poverty_headcount and burden under
/// pairwise-complete semantics: a row with a non-finite value in either
/// field is excluded from this computation only, without affecting any
/// other statistic. Returns `None` with fewer than three complete pairs
/// or when either field has zero variance.
pub fn pearson_headcount_burden(rows: &[MergedRow]) -> Option<PearsonCorrelation> {
    let pairs: Vec<(f64, f64)> = rows
        .iter()
        .filter(|r| r.poverty_headcount.is_finite() && r.burden.is_finite())
        .map(|r| (r.poverty_headcount, r.burden))
        .collect();
    let n = pairs.len();
    if n < 3 {
        return None;
    }

    let n_f = n as f64;
    let mean_x = pairs.iter().map(|(x, _)| x).sum::<f64>() / n_f;
    let mean_y = pairs.iter().map(|(_, y)| y).sum::<f64>() / n_f;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (x, y) in &pairs {
        let dx = x - mean_x;
        let dy = y - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x == 0.0 || var_y == 0.0 {
        return None;
    }

    let r = cov / (var_x.sqrt() * var_y.sqrt());
    // t test of r on n - 2 degrees of freedom.
    let statistic = r * ((n_f - 2.0) / (1.0 - r * r)).sqrt();
    let p_value = two_sided_t_pvalue(statistic, n - 2).ok()?;

    Some(PearsonCorrelation { r, n, p_value })
}

/// Linear effect of the poverty headcount on burden after adjusting for
/// year: OLS of burden on [intercept, poverty_headcount, year], with
/// the headcount coefficient's estimate, standard error, and p-value.
pub fn adjusted_effect(rows: &[MergedRow]) -> Result<AdjustedEffect, EstimationError> {
    let complete: Vec<&MergedRow> = rows
        .iter()
        .filter(|r| r.poverty_headcount.is_finite() && r.burden.is_finite())
        .collect();
    let n = complete.len();

    let y = Array1::from_iter(complete.iter().map(|r| r.burden));
    let mut x = Array2::zeros((n, 3));
    for (i, row) in complete.iter().enumerate() {
        x[[i, 0]] = 1.0;
        x[[i, 1]] = row.poverty_headcount;
        x[[i, 2]] = f64::from(row.year);
    }

    let fit = ols(&y, &x)?;
    let estimate = fit.beta[1];
    let std_err = (fit.sigma2 * fit.xtx_inv[[1, 1]]).sqrt();
    let statistic = estimate / std_err;

    Ok(AdjustedEffect {
        estimate,
        std_err,
        p_value: two_sided_t_pvalue(statistic, fit.df_resid)?,
        observations: n,
    })
}
