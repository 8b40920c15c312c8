use clap::Parser;
use std::process;

use epiburden::assoc::{adjusted_effect, pearson_headcount_burden};
use epiburden::data::{load_burden_data, load_poverty_data};
use epiburden::merge::{merge_series, subset_series};
use epiburden::model::{fit, FittedModel};
use epiburden::select::{select_top_countries, SelectionConfig};

#[derive(Parser)]
#[command(
    name = "epiburden",
    about = "Select high-burden countries and model burden against poverty covariates",
    long_about = "Identifies the minimal set of countries jointly accounting for a configurable \
                  share of global burden in the most recent reporting year, merges their burden \
                  series with a multidimensional poverty dataset, and fits a cross-sectional or \
                  repeated-measures regression depending on the merged data's shape."
)]
struct Cli {
    /// Path to the burden CSV (location, period, value columns)
    burden_data: String,

    /// Path to the poverty CSV (fixed-position table, two caption rows)
    poverty_data: String,

    /// Cumulative share of global burden the selected countries must reach
    #[arg(long, default_value = "0.75")]
    threshold: f64,

    /// Reference year for country selection (default: latest year in the burden data)
    #[arg(long, value_name = "YEAR")]
    reference_year: Option<i32>,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(&cli) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    println!("Loading burden data from: {}", cli.burden_data);
    let burden = load_burden_data(&cli.burden_data)?;
    println!("Loaded {} burden records", burden.len());

    println!("Loading poverty data from: {}", cli.poverty_data);
    let poverty = load_poverty_data(&cli.poverty_data)?;
    println!("Loaded {} poverty records", poverty.len());

    let config = SelectionConfig {
        threshold: cli.threshold,
        reference_year: cli.reference_year,
    };
    let selected = select_top_countries(&burden, &config)?;

    println!();
    println!(
        "Country selection (reference year {}, threshold {:.0}%):",
        selected.reference_year(),
        selected.threshold() * 100.0
    );
    println!(
        "  {:<4} {:<32} {:>14} {:>10}",
        "rank", "country", "burden", "cum share"
    );
    for (rank, summary) in selected.summaries().iter().enumerate() {
        println!(
            "  {:<4} {:<32} {:>14.0} {:>9.1}%",
            rank + 1,
            summary.country,
            summary.plhiv_latest,
            summary.cum_share * 100.0
        );
    }

    let subset = subset_series(&burden, &selected);
    let merged = merge_series(&subset, &poverty)?;
    println!();
    println!("Merged rows: {}", merged.len());

    let fitted = fit(&merged)?;
    let summary = fitted.summary();
    println!();
    println!(
        "Model: {} ({} observations, {} incomplete rows dropped)",
        fitted.label(),
        summary.observations,
        summary.dropped_rows
    );
    println!(
        "  {:<24} {:>14} {:>12} {:>9} {:>9}",
        "term", "estimate", "std err", "stat", "p"
    );
    for coef in &summary.coefficients {
        println!(
            "  {:<24} {:>14.4} {:>12.4} {:>9.3} {:>9.4}",
            coef.term, coef.estimate, coef.std_err, coef.statistic, coef.p_value
        );
    }
    if let FittedModel::MixedEffects { variance, .. } = &fitted {
        println!(
            "  variance components: year intercept {:.4e}, residual {:.4e} (logLik {:.3})",
            variance.year_intercept, variance.residual, variance.log_likelihood
        );
    }

    println!();
    match pearson_headcount_burden(&merged) {
        Some(corr) => println!(
            "Pearson r (headcount vs burden): {:.3} (n = {}, p = {:.4})",
            corr.r, corr.n, corr.p_value
        ),
        None => println!("Pearson r (headcount vs burden): not computable for this data"),
    }

    let effect = adjusted_effect(&merged)?;
    println!(
        "Year-adjusted headcount effect: {:.4} (SE {:.4}, p = {:.4}, n = {})",
        effect.estimate, effect.std_err, effect.p_value, effect.observations
    );

    Ok(())
}
