//! # Burden Threshold Selection
//!
//! Computes the minimal ordered set of countries whose cumulative share
//! of global burden in the reference year meets a configurable
//! threshold. The reference year defaults to the most recent year in
//! the data; both policies are explicit configuration rather than
//! constants baked into the pipeline.

use crate::data::BurdenRecord;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

/// Tolerance for the cumulative-share cutoff comparison. The cutoff is
/// deliberately `cum_share + SHARE_EPSILON >= threshold` rather than a
/// strict comparison: cumulative shares come out of a division and a
/// running sum, so a country holding exactly the threshold fraction can
/// land a few ulps below it. Within 1e-12 counts as reaching it.
const SHARE_EPSILON: f64 = 1e-12;

/// Policy knobs for country selection.
#[derive(Debug, Clone)]
pub struct SelectionConfig {
    /// Cumulative share of global burden the selected countries must
    /// jointly reach, in (0, 1].
    pub threshold: f64,
    /// Reference year override. `None` means the most recent year
    /// present in the burden data.
    pub reference_year: Option<i32>,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            threshold: 0.75,
            reference_year: None,
        }
    }
}

/// One country's aggregated burden in the reference year, with its
/// running cumulative share of the grand total.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CountryBurdenSummary {
    pub country: String,
    pub plhiv_latest: f64,
    pub cum_share: f64,
}

/// The ordered country set gating every downstream step. Immutable once
/// built; records the policy that produced it for reporting.
#[derive(Debug, Clone)]
pub struct TopCountrySet {
    summaries: Vec<CountryBurdenSummary>,
    members: HashSet<String>,
    reference_year: i32,
    threshold: f64,
}

impl TopCountrySet {
    /// Selected countries in descending burden order, with shares.
    pub fn summaries(&self) -> &[CountryBurdenSummary] {
        &self.summaries
    }

    /// Selected country names in descending burden order.
    pub fn countries(&self) -> impl Iterator<Item = &str> {
        self.summaries.iter().map(|s| s.country.as_str())
    }

    pub fn contains(&self, country: &str) -> bool {
        self.members.contains(country)
    }

    pub fn len(&self) -> usize {
        self.summaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.summaries.is_empty()
    }

    pub fn reference_year(&self) -> i32 {
        self.reference_year
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

#[derive(Error, Debug)]
pub enum SelectionError {
    #[error("Selection threshold must lie in (0, 1], got {0}")]
    InvalidThreshold(f64),
    #[error("No burden records were provided for country selection")]
    NoRecords,
    #[error("No burden records exist for the configured reference year {0}")]
    NoRecordsForYear(i32),
}

/// Selects the minimal set of countries jointly holding `threshold` of
/// global burden in the reference year.
///
/// Countries are aggregated over the reference year (a country may have
/// several contributing records), sorted descending by total with ties
/// broken ascending lexicographically by country name, and cut at the
/// first position whose cumulative share reaches the threshold. If the
/// grand total is zero the cutoff cannot be reached and every country is
/// included, favoring completeness over strictness.
pub fn select_top_countries(
    records: &[BurdenRecord],
    config: &SelectionConfig,
) -> Result<TopCountrySet, SelectionError> {
    if !(config.threshold > 0.0 && config.threshold <= 1.0) {
        return Err(SelectionError::InvalidThreshold(config.threshold));
    }
    if records.is_empty() {
        return Err(SelectionError::NoRecords);
    }

    let reference_year = match config.reference_year {
        Some(year) => year,
        None => records
            .iter()
            .map(|r| r.year)
            .max()
            .ok_or(SelectionError::NoRecords)?,
    };

    // BTreeMap keeps accumulation order-independent of input order.
    let mut totals: BTreeMap<&str, f64> = BTreeMap::new();
    for record in records.iter().filter(|r| r.year == reference_year) {
        *totals.entry(record.country.as_str()).or_insert(0.0) += record.value;
    }
    if totals.is_empty() {
        return Err(SelectionError::NoRecordsForYear(reference_year));
    }

    let mut ranked: Vec<(&str, f64)> = totals.into_iter().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    let grand_total: f64 = ranked.iter().map(|(_, total)| total).sum();

    let mut summaries = Vec::with_capacity(ranked.len());
    let mut running = 0.0;
    let mut cutoff = None;
    for (position, (country, total)) in ranked.iter().enumerate() {
        running += total;
        let cum_share = if grand_total > 0.0 {
            running / grand_total
        } else {
            0.0
        };
        summaries.push(CountryBurdenSummary {
            country: (*country).to_string(),
            plhiv_latest: *total,
            cum_share,
        });
        if cutoff.is_none() && cum_share + SHARE_EPSILON >= config.threshold {
            cutoff = Some(position);
        }
    }

    // No position reached the threshold (grand total of zero): keep all
    // countries rather than failing.
    let cutoff = match cutoff {
        Some(position) => position,
        None => {
            log::warn!(
                "Cumulative share never reached threshold {}; including all {} countries",
                config.threshold,
                summaries.len()
            );
            summaries.len() - 1
        }
    };
    summaries.truncate(cutoff + 1);

    let members = summaries.iter().map(|s| s.country.clone()).collect();
    log::info!(
        "Selected {} countries covering {:.1}% of burden in {}",
        summaries.len(),
        summaries.last().map_or(0.0, |s| s.cum_share * 100.0),
        reference_year
    );

    Ok(TopCountrySet {
        summaries,
        members,
        reference_year,
        threshold: config.threshold,
    })
}
