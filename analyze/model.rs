//! # Adaptive Burden-Poverty Modeling
//!
//! Fits a regression of burden on the socioeconomic covariates, choosing
//! the model form from the shape of the merged data: when every country
//! contributes exactly one merged row the data are a cross-section and an
//! OLS fit with year as a numeric covariate applies; as soon as any
//! country repeats, observations within a survey year are correlated and
//! a random intercept grouped by year is fit instead, by maximum
//! likelihood (not REML) so candidate models remain comparable. Year
//! enters the cross-sectional form as a numeric covariate precisely
//! because a one-row-per-country cross-section cannot support it as a
//! grouping factor; in the mixed form year is the grouping factor and is
//! therefore not duplicated among the fixed effects.
//!
//! The mixed fit is a nested optimization: an outer BFGS loop over the
//! log variance ratio
//! `rho = ln(sigma2_year / sigma2_resid)` around an inner closed-form GLS
//! solve. For a random intercept the marginal precision factors per year
//! group through the Sherman-Morrison identity,
//! `(I + lambda * J)^-1 = I - lambda / (1 + lambda * n_g) * J`,
//! so no general matrix inversion beyond the p x p normal equations is
//! ever needed.
//!
//! `education_attainment` is carried through normalization but is never a
//! covariate in either form; the exclusion is inherited from the original
//! analysis and preserved deliberately.

use crate::merge::MergedRow;
use ndarray::{s, Array1, Array2};
use ndarray_linalg::Inverse;
use serde::Serialize;
use statrs::distribution::{ContinuousCDF, Normal, StudentsT};
use std::collections::HashMap;
use thiserror::Error;
use wolfe_bfgs::{Bfgs, BfgsSolution};

/// Covariate terms shared by both model forms, in design-matrix order
/// after the intercept.
const COVARIATE_TERMS: [&str; 5] = [
    "poverty_headcount",
    "education_enrollment",
    "electricity_access",
    "sanitation_access",
    "water_access",
];

/// The year term, a fixed numeric covariate in the cross-sectional form
/// only; the mixed form consumes year as its grouping factor instead.
const YEAR_TERM: &str = "year";

/// Safe range for the log variance ratio during optimization; outside it
/// the likelihood is flat and line searches stall.
const RHO_BOUND: f64 = 12.0;

/// A comprehensive error type for the model fitting process. Every
/// variant is fatal: a failed fit is never retried with a reduced
/// covariate set, since silently changing the model specification would
/// misrepresent the analysis.
#[derive(Error, Debug)]
pub enum EstimationError {
    #[error(
        "Only {observations} complete observations for {parameters} parameters; the model is \
         not estimable"
    )]
    InsufficientObservations {
        observations: usize,
        parameters: usize,
    },
    #[error(
        "The normal equations are singular (perfectly collinear covariates?). Error: {0}"
    )]
    SingularDesign(ndarray_linalg::error::LinalgError),
    #[error("Model fit produced a non-finite {0}")]
    NonFiniteFit(&'static str),
    #[error("Maximum-likelihood optimization failed: {0}")]
    MlOptimizationFailed(String),
    #[error("Reference distribution could not be constructed: {0}")]
    InvalidDistribution(String),
}

/// One reported coefficient: point estimate plus uncertainty.
#[derive(Debug, Clone, Serialize)]
pub struct CoefficientEstimate {
    pub term: String,
    pub estimate: f64,
    pub std_err: f64,
    /// t statistic for the cross-sectional fit, Wald z for the mixed fit.
    pub statistic: f64,
    pub p_value: f64,
}

/// Fitted-model report. The intercept is estimated but excluded here.
#[derive(Debug, Clone, Serialize)]
pub struct ModelSummary {
    /// Complete observations actually used by the fit.
    pub observations: usize,
    /// Merged rows removed by listwise deletion of missing covariates.
    pub dropped_rows: usize,
    pub coefficients: Vec<CoefficientEstimate>,
}

/// Estimated variance components of the mixed fit.
#[derive(Debug, Clone, Serialize)]
pub struct VarianceComponents {
    pub year_intercept: f64,
    pub residual: f64,
    pub log_likelihood: f64,
}

/// The two model forms the dispatcher can produce.
#[derive(Debug, Clone, Serialize)]
pub enum FittedModel {
    CrossSectional(ModelSummary),
    MixedEffects {
        summary: ModelSummary,
        variance: VarianceComponents,
    },
}

impl FittedModel {
    pub fn label(&self) -> &'static str {
        match self {
            FittedModel::CrossSectional(_) => "cross-sectional OLS",
            FittedModel::MixedEffects { .. } => "linear mixed (random intercept by year, ML)",
        }
    }

    pub fn summary(&self) -> &ModelSummary {
        match self {
            FittedModel::CrossSectional(summary) => summary,
            FittedModel::MixedEffects { summary, .. } => summary,
        }
    }
}

/// Dispatches on the merged data's shape and fits the matching model.
///
/// The branch is decided from per-country merged-row counts every run,
/// never configured: exactly one row per country means cross-sectional,
/// anything else means repeated measures.
pub fn fit(rows: &[MergedRow]) -> Result<FittedModel, EstimationError> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for row in rows {
        *counts.entry(row.country.as_str()).or_insert(0) += 1;
    }
    let repeated = counts.values().any(|&c| c > 1);

    let design = internal::build_design(rows);
    log::info!(
        "Model dispatch: {} complete observations ({} dropped), repeated measures: {}",
        design.y.len(),
        design.dropped,
        repeated
    );

    if repeated {
        internal::fit_mixed(&design).map(|(summary, variance)| FittedModel::MixedEffects {
            summary,
            variance,
        })
    } else {
        internal::fit_cross_sectional(&design).map(FittedModel::CrossSectional)
    }
}

/// Result of an ordinary least squares solve, shared with the
/// association analyzer.
pub(crate) struct OlsFit {
    pub(crate) beta: Array1<f64>,
    pub(crate) xtx_inv: Array2<f64>,
    pub(crate) sigma2: f64,
    pub(crate) df_resid: usize,
}

/// Solves y = X b by least squares with the classical variance estimate
/// `sigma2 * (X'X)^-1` on `n - p` residual degrees of freedom.
pub(crate) fn ols(y: &Array1<f64>, x: &Array2<f64>) -> Result<OlsFit, EstimationError> {
    let n = x.nrows();
    let p = x.ncols();
    if n <= p {
        return Err(EstimationError::InsufficientObservations {
            observations: n,
            parameters: p,
        });
    }

    let xtx = x.t().dot(x);
    let xty = x.t().dot(y);
    let xtx_inv = xtx.inv().map_err(EstimationError::SingularDesign)?;
    let beta = xtx_inv.dot(&xty);
    if beta.iter().any(|b| !b.is_finite()) {
        return Err(EstimationError::NonFiniteFit("coefficient vector"));
    }

    let resid = y - &x.dot(&beta);
    let rss = resid.dot(&resid);
    let sigma2 = rss / (n - p) as f64;

    Ok(OlsFit {
        beta,
        xtx_inv,
        sigma2,
        df_resid: n - p,
    })
}

/// Two-sided p-value for a t statistic on `df` degrees of freedom.
pub(crate) fn two_sided_t_pvalue(statistic: f64, df: usize) -> Result<f64, EstimationError> {
    let dist = StudentsT::new(0.0, 1.0, df as f64)
        .map_err(|e| EstimationError::InvalidDistribution(e.to_string()))?;
    Ok(2.0 * dist.cdf(-statistic.abs()))
}

/// Two-sided p-value for a Wald z statistic.
fn two_sided_z_pvalue(statistic: f64) -> Result<f64, EstimationError> {
    let dist = Normal::new(0.0, 1.0)
        .map_err(|e| EstimationError::InvalidDistribution(e.to_string()))?;
    Ok(2.0 * dist.cdf(-statistic.abs()))
}

/// Internal module for design construction and the two fitting paths.
mod internal {
    use super::*;

    /// Number of columns in the full design matrix (intercept, the
    /// shared covariates, and year in the trailing column so the mixed
    /// path can slice it off).
    const DESIGN_COLUMNS: usize = 1 + COVARIATE_TERMS.len() + 1;

    /// The complete-case design: response, fixed-effect matrix with a
    /// leading intercept column, and the year of each kept row.
    pub(super) struct Design {
        pub(super) y: Array1<f64>,
        pub(super) x: Array2<f64>,
        pub(super) years: Vec<i32>,
        pub(super) dropped: usize,
    }

    /// Builds the design matrix with listwise deletion: a row missing
    /// any covariate is removed entirely rather than imputed, so both
    /// model forms see identical input.
    pub(super) fn build_design(rows: &[MergedRow]) -> Design {
        let mut y = Vec::new();
        let mut x_rows: Vec<[f64; DESIGN_COLUMNS]> = Vec::new();
        let mut years = Vec::new();
        let mut dropped = 0usize;

        for row in rows {
            let complete = (|| {
                let enrollment = row.education_enrollment?;
                let electricity = row.electricity_access?;
                let sanitation = row.sanitation_access?;
                let water = row.water_access?;
                let cells = [
                    1.0,
                    row.poverty_headcount,
                    enrollment,
                    electricity,
                    sanitation,
                    water,
                    f64::from(row.year),
                ];
                if row.burden.is_finite() && cells.iter().all(|v| v.is_finite()) {
                    Some(cells)
                } else {
                    None
                }
            })();

            match complete {
                Some(cells) => {
                    y.push(row.burden);
                    x_rows.push(cells);
                    years.push(row.year);
                }
                None => dropped += 1,
            }
        }
        if dropped > 0 {
            log::debug!("Listwise deletion removed {dropped} incomplete rows before fitting");
        }

        let n = y.len();
        let mut x = Array2::zeros((n, DESIGN_COLUMNS));
        for (i, cells) in x_rows.iter().enumerate() {
            for (j, &v) in cells.iter().enumerate() {
                x[[i, j]] = v;
            }
        }

        Design {
            y: Array1::from_vec(y),
            x,
            years,
            dropped,
        }
    }

    /// Cross-sectional path: OLS with year as a numeric covariate and
    /// exact t statistics on the residual degrees of freedom.
    pub(super) fn fit_cross_sectional(design: &Design) -> Result<ModelSummary, EstimationError> {
        let fit = ols(&design.y, &design.x)?;

        let terms = COVARIATE_TERMS.iter().copied().chain([YEAR_TERM]);
        let mut coefficients = Vec::with_capacity(DESIGN_COLUMNS - 1);
        for (offset, term) in terms.enumerate() {
            let j = offset + 1; // intercept at column 0 is not reported
            let estimate = fit.beta[j];
            let std_err = (fit.sigma2 * fit.xtx_inv[[j, j]]).sqrt();
            let statistic = estimate / std_err;
            coefficients.push(CoefficientEstimate {
                term: term.to_string(),
                estimate,
                std_err,
                statistic,
                p_value: two_sided_t_pvalue(statistic, fit.df_resid)?,
            });
        }

        Ok(ModelSummary {
            observations: design.y.len(),
            dropped_rows: design.dropped,
            coefficients,
        })
    }

    /// Index sets of the rows belonging to each year group.
    fn year_groups(years: &[i32]) -> Vec<Vec<usize>> {
        let mut by_year: HashMap<i32, Vec<usize>> = HashMap::new();
        for (i, &year) in years.iter().enumerate() {
            by_year.entry(year).or_default().push(i);
        }
        let mut groups: Vec<(i32, Vec<usize>)> = by_year.into_iter().collect();
        groups.sort_by_key(|(year, _)| *year);
        groups.into_iter().map(|(_, idx)| idx).collect()
    }

    /// Applies `W = (I + lambda * Z Z')^-1` to a matrix, block by year
    /// group via Sherman-Morrison: within a group of size `n_g`,
    /// `W_g a = a - lambda / (1 + lambda * n_g) * J a`.
    fn whiten(matrix: &Array2<f64>, lambda: f64, groups: &[Vec<usize>]) -> Array2<f64> {
        let cols = matrix.ncols();
        let mut out = matrix.clone();
        for group in groups {
            let shrink = lambda / (1.0 + lambda * group.len() as f64);
            let mut sums = vec![0.0; cols];
            for &i in group {
                for (j, sum) in sums.iter_mut().enumerate() {
                    *sum += matrix[[i, j]];
                }
            }
            for &i in group {
                for (j, sum) in sums.iter().enumerate() {
                    out[[i, j]] -= shrink * sum;
                }
            }
        }
        out
    }

    fn whiten_vec(vector: &Array1<f64>, lambda: f64, groups: &[Vec<usize>]) -> Array1<f64> {
        let mut out = vector.clone();
        for group in groups {
            let shrink = lambda / (1.0 + lambda * group.len() as f64);
            let sum: f64 = group.iter().map(|&i| vector[i]).sum();
            for &i in group {
                out[i] -= shrink * sum;
            }
        }
        out
    }

    /// The profile fit at a fixed variance ratio: GLS coefficients, the
    /// ML residual variance, and the profiled negative log-likelihood
    /// (up to an additive constant) used as the BFGS cost.
    struct ProfileFit {
        cost: f64,
        beta: Array1<f64>,
        xtwx_inv: Array2<f64>,
        sigma2: f64,
        log_likelihood: f64,
    }

    fn profile_at(
        y: &Array1<f64>,
        x: &Array2<f64>,
        groups: &[Vec<usize>],
        lambda: f64,
    ) -> Result<ProfileFit, EstimationError> {
        let n = y.len();
        let wx = whiten(x, lambda, groups);
        let wy = whiten_vec(y, lambda, groups);

        let xtwx = x.t().dot(&wx);
        let xtwy = x.t().dot(&wy);
        let xtwx_inv = xtwx.inv().map_err(EstimationError::SingularDesign)?;
        let beta = xtwx_inv.dot(&xtwy);

        let resid = y - &x.dot(&beta);
        let wresid = whiten_vec(&resid, lambda, groups);
        let quadratic = resid.dot(&wresid);
        let sigma2 = quadratic / n as f64;
        if !sigma2.is_finite() || sigma2 <= 0.0 {
            return Err(EstimationError::NonFiniteFit("residual variance"));
        }

        let log_det: f64 = groups
            .iter()
            .map(|g| (1.0 + lambda * g.len() as f64).ln())
            .sum();
        let n_f = n as f64;
        let cost = n_f * sigma2.ln() + log_det;
        let log_likelihood =
            -0.5 * (n_f * ((2.0 * std::f64::consts::PI * sigma2).ln() + 1.0) + log_det);

        Ok(ProfileFit {
            cost,
            beta,
            xtwx_inv,
            sigma2,
            log_likelihood,
        })
    }

    /// Mixed path: maximum-likelihood fit of the random-intercept model,
    /// profiling the likelihood over `rho = ln(lambda)` with BFGS and a
    /// central-difference gradient.
    ///
    /// Year serves as the grouping factor here, so the trailing year
    /// column of the full design is dropped from the fixed effects
    /// rather than competing with the random intercepts for the same
    /// between-year variation.
    pub(super) fn fit_mixed(
        design: &Design,
    ) -> Result<(ModelSummary, VarianceComponents), EstimationError> {
        let x = design.x.slice(s![.., ..DESIGN_COLUMNS - 1]).to_owned();
        let n = design.y.len();
        let p = x.ncols();
        if n <= p {
            return Err(EstimationError::InsufficientObservations {
                observations: n,
                parameters: p,
            });
        }
        let groups = year_groups(&design.years);
        log::info!(
            "Fitting random-intercept model: {} observations in {} year groups",
            n,
            groups.len()
        );

        let cost_at = |rho: f64| -> Result<f64, EstimationError> {
            profile_at(&design.y, &x, &groups, rho.exp()).map(|fit| fit.cost)
        };

        // Finite starting cost before handing control to the optimizer.
        let initial_rho = Array1::from_elem(1, 0.0);
        let initial_cost = cost_at(initial_rho[0])?;
        if !initial_cost.is_finite() {
            return Err(EstimationError::MlOptimizationFailed(format!(
                "initial profile cost is not finite: {initial_cost}"
            )));
        }

        let cost_and_grad = |rho_bfgs: &Array1<f64>| -> (f64, Array1<f64>) {
            let rho = rho_bfgs[0].clamp(-RHO_BOUND, RHO_BOUND);
            let value = match cost_at(rho) {
                Ok(cost) if cost.is_finite() => cost,
                _ => 1e10, // large finite value keeps the line search alive
            };
            let h = 1e-5;
            let upper = cost_at(rho + h).unwrap_or(1e10);
            let lower = cost_at(rho - h).unwrap_or(1e10);
            let gradient = Array1::from_elem(1, (upper - lower) / (2.0 * h));
            (value, gradient)
        };

        let BfgsSolution {
            final_point: final_rho,
            iterations,
            ..
        } = Bfgs::new(initial_rho, cost_and_grad)
            .with_tolerance(1e-8)
            .with_max_iterations(100)
            .run()
            .map_err(|e| EstimationError::MlOptimizationFailed(format!("BFGS failed: {e:?}")))?;

        let lambda = final_rho[0].clamp(-RHO_BOUND, RHO_BOUND).exp();
        log::debug!("ML profile converged in {iterations} iterations, lambda = {lambda:.6e}");

        // Refit once at the optimum for the reported quantities.
        let fit = profile_at(&design.y, &x, &groups, lambda)?;

        let mut coefficients = Vec::with_capacity(COVARIATE_TERMS.len());
        for (offset, term) in COVARIATE_TERMS.iter().enumerate() {
            let j = offset + 1;
            let estimate = fit.beta[j];
            let std_err = (fit.sigma2 * fit.xtwx_inv[[j, j]]).sqrt();
            let statistic = estimate / std_err;
            coefficients.push(CoefficientEstimate {
                term: (*term).to_string(),
                estimate,
                std_err,
                statistic,
                p_value: two_sided_z_pvalue(statistic)?,
            });
        }

        let summary = ModelSummary {
            observations: n,
            dropped_rows: design.dropped,
            coefficients,
        };
        let variance = VarianceComponents {
            year_intercept: lambda * fit.sigma2,
            residual: fit.sigma2,
            log_likelihood: fit.log_likelihood,
        };
        Ok((summary, variance))
    }
}
