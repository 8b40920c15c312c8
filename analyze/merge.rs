//! # Series Restriction and Merging
//!
//! Restricts the multi-year burden series to the selected countries and
//! inner-joins it with the poverty series on (country, year). Rows with
//! no match on either side are dropped individually, but an empty join
//! is fatal: every downstream computation depends on non-empty input,
//! and continuing would produce misleading output.

use crate::data::{BurdenRecord, PovertyRecord};
use crate::select::TopCountrySet;
use itertools::Itertools;
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

/// The natural join of a burden observation with the poverty covariates
/// for the same (country, year), restricted to the selected countries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedRow {
    pub country: String,
    pub year: i32,
    pub burden: f64,
    pub poverty_headcount: f64,
    pub education_attainment: Option<f64>,
    pub education_enrollment: Option<f64>,
    pub electricity_access: Option<f64>,
    pub sanitation_access: Option<f64>,
    pub water_access: Option<f64>,
}

#[derive(Error, Debug)]
pub enum MergeError {
    #[error(
        "The burden/poverty join produced zero rows ({burden_rows} burden rows vs {poverty_rows} \
         poverty rows share no (country, year) pair); modeling cannot proceed on no data"
    )]
    EmptyJoin {
        burden_rows: usize,
        poverty_rows: usize,
    },
}

/// Restricts the full burden series to countries in the selected set.
/// Pure filter: all years kept, source order preserved, no aggregation.
pub fn subset_series(records: &[BurdenRecord], set: &TopCountrySet) -> Vec<BurdenRecord> {
    records
        .iter()
        .filter(|r| set.contains(&r.country))
        .cloned()
        .collect()
}

/// Inner join of the subsetted burden series with the poverty series on
/// (country, year).
///
/// Every burden row joins against at most one poverty row; if the
/// poverty source carries duplicate (country, year) keys the first
/// occurrence wins. The join cardinality is data-dependent: survey years
/// are irregular, so the overlap may be sparse.
pub fn merge_series(
    burden: &[BurdenRecord],
    poverty: &[PovertyRecord],
) -> Result<Vec<MergedRow>, MergeError> {
    let mut keyed: HashMap<(&str, i32), &PovertyRecord> = HashMap::with_capacity(poverty.len());
    for row in poverty {
        keyed.entry((row.country.as_str(), row.year)).or_insert(row);
    }

    let merged: Vec<MergedRow> = burden
        .iter()
        .filter_map(|b| {
            keyed
                .get(&(b.country.as_str(), b.year))
                .map(|p| MergedRow {
                    country: b.country.clone(),
                    year: b.year,
                    burden: b.value,
                    poverty_headcount: p.poverty_headcount,
                    education_attainment: p.education_attainment,
                    education_enrollment: p.education_enrollment,
                    electricity_access: p.electricity_access,
                    sanitation_access: p.sanitation_access,
                    water_access: p.water_access,
                })
        })
        .collect();

    if merged.is_empty() {
        return Err(MergeError::EmptyJoin {
            burden_rows: burden.len(),
            poverty_rows: poverty.len(),
        });
    }

    let distinct_countries = merged.iter().map(|r| r.country.as_str()).unique().count();
    log::info!(
        "Merged {} rows across {} countries",
        merged.len(),
        distinct_countries
    );
    Ok(merged)
}
