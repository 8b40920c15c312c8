//! End-to-end pipeline tests over generated CSV fixtures: load both
//! sources, select the high-burden countries, subset, merge, and fit,
//! checking that the dispatcher lands on the branch the data shape
//! dictates.

use std::io::Write;
use tempfile::NamedTempFile;

use epiburden::assoc::{adjusted_effect, pearson_headcount_burden};
use epiburden::data::{load_burden_data, load_poverty_data};
use epiburden::merge::{merge_series, subset_series};
use epiburden::model::{fit, FittedModel};
use epiburden::select::{select_top_countries, SelectionConfig};

const POVERTY_COLUMNS: usize = 16;

fn write_csv(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "{}", content).unwrap();
    file.flush().unwrap();
    file
}

/// A 16-column poverty row with the mandatory fields at their fixed
/// positions (country 0, year 3, headcount 5) and the five covariates
/// at theirs.
fn poverty_row(country: &str, year: i32, headcount: f64, seed: usize) -> String {
    let mut cells = vec!["-".to_string(); POVERTY_COLUMNS];
    cells[0] = country.to_string();
    cells[3] = year.to_string();
    cells[5] = format!("{headcount:.1}");
    cells[9] = format!("{:.1}", 10.0 + (seed * 3 % 7) as f64); // attainment
    cells[10] = format!("{:.1}", 5.0 + (seed * 5 % 11) as f64); // enrollment
    cells[11] = format!("{:.1}", 20.0 + (seed * 7 % 13) as f64); // electricity
    cells[13] = format!("{:.1}", 30.0 + (seed * 11 % 17) as f64); // sanitation
    cells[15] = format!("{:.1}", 40.0 + (seed * 13 % 19) as f64); // water
    cells.join(",")
}

fn poverty_caption() -> String {
    let caption: Vec<String> = (0..POVERTY_COLUMNS).map(|i| format!("col {i}")).collect();
    format!("{}\n{}", caption.join(","), caption.join(","))
}

#[test]
fn repeated_measures_pipeline_fits_mixed_model() {
    // 2023 burden shares: Kenya 0.5, Malawi 0.8 cumulative; the rest
    // stay below the 0.75 cutoff.
    let mut burden_lines = vec!["location,period,value".to_string()];
    burden_lines.push("Kenya,2023,500 000 [450 000 - 550 000]".to_string());
    burden_lines.push("Malawi,2023,300 000 [280 000 - 320 000]".to_string());
    burden_lines.push("Lesotho,2023,120 000".to_string());
    burden_lines.push("Eswatini,2023,50 000".to_string());
    burden_lines.push("Namibia,2023,30 000".to_string());
    // Multi-year series for the two leaders.
    for (i, year) in [2013, 2015, 2017, 2019, 2021].iter().enumerate() {
        burden_lines.push(format!("Kenya,{},{}", year, 400_000 + 9_000 * i));
        burden_lines.push(format!("Malawi,{},{}", year, 250_000 + 7_000 * i));
    }
    let burden_file = write_csv(&burden_lines.join("\n"));

    let mut poverty_lines = vec![poverty_caption()];
    for (i, year) in [2013, 2015, 2017, 2019, 2021].iter().enumerate() {
        poverty_lines.push(poverty_row("Kenya", *year, 35.0 + i as f64, i));
        poverty_lines.push(poverty_row("Malawi", *year, 50.0 - 2.0 * i as f64, i + 5));
    }
    // A country outside the selection; must not survive the subset.
    poverty_lines.push(poverty_row("Namibia", 2021, 20.0, 11));
    let poverty_file = write_csv(&poverty_lines.join("\n"));

    let burden = load_burden_data(burden_file.path().to_str().unwrap()).unwrap();
    let poverty = load_poverty_data(poverty_file.path().to_str().unwrap()).unwrap();

    let selected = select_top_countries(&burden, &SelectionConfig::default()).unwrap();
    assert_eq!(selected.reference_year(), 2023);
    assert_eq!(
        selected.countries().collect::<Vec<_>>(),
        vec!["Kenya", "Malawi"]
    );

    let subset = subset_series(&burden, &selected);
    assert!(subset.iter().all(|r| selected.contains(&r.country)));

    let merged = merge_series(&subset, &poverty).unwrap();
    // Five survey years per selected country overlap the burden series.
    assert_eq!(merged.len(), 10);
    assert!(merged.iter().all(|r| r.country != "Namibia"));

    // Repeated rows per country must select the mixed branch.
    let fitted = fit(&merged).unwrap();
    let FittedModel::MixedEffects { summary, variance } = &fitted else {
        panic!("Expected the mixed branch, got {}", fitted.label());
    };
    assert_eq!(summary.observations, 10);
    // Year is the grouping factor here, not a fixed covariate.
    assert_eq!(summary.coefficients.len(), 5);
    assert!(summary
        .coefficients
        .iter()
        .all(|c| c.term != "year" && c.term != "education_attainment" && c.term != "intercept"));
    assert!(variance.residual > 0.0);

    // Association statistics are independent of the dispatched branch.
    let corr = pearson_headcount_burden(&merged).unwrap();
    assert_eq!(corr.n, 10);
    assert!((-1.0..=1.0).contains(&corr.r));
    let effect = adjusted_effect(&merged).unwrap();
    assert!(effect.std_err > 0.0);
}

#[test]
fn one_survey_per_country_fits_cross_sectional_model() {
    // Each country reports in 2023 (which drives selection) and was
    // surveyed exactly once, in an irregular earlier year, so the merge
    // yields one row per country with a varying year column.
    let mut burden_lines = vec!["location,period,value".to_string()];
    let mut poverty_lines = vec![poverty_caption()];
    for i in 0..10 {
        let country = format!("country-{i}");
        let survey_year = 2015 + (i % 6) as i32;
        burden_lines.push(format!("{},2023,{}", country, 100_000 + 17_000 * i));
        burden_lines.push(format!("{},{},{}", country, survey_year, 90_000 + 13_000 * i));
        poverty_lines.push(poverty_row(
            &country,
            survey_year,
            15.0 + (i * 7 % 23) as f64,
            i,
        ));
    }
    let burden_file = write_csv(&burden_lines.join("\n"));
    let poverty_file = write_csv(&poverty_lines.join("\n"));

    let burden = load_burden_data(burden_file.path().to_str().unwrap()).unwrap();
    let poverty = load_poverty_data(poverty_file.path().to_str().unwrap()).unwrap();

    // Threshold 1.0 keeps every country, one merged row each.
    let config = SelectionConfig {
        threshold: 1.0,
        reference_year: None,
    };
    let selected = select_top_countries(&burden, &config).unwrap();
    assert_eq!(selected.reference_year(), 2023);
    assert_eq!(selected.len(), 10);

    let subset = subset_series(&burden, &selected);
    let merged = merge_series(&subset, &poverty).unwrap();
    assert_eq!(merged.len(), 10);

    let fitted = fit(&merged).unwrap();
    assert!(matches!(fitted, FittedModel::CrossSectional(_)));
    let summary = fitted.summary();
    assert_eq!(summary.observations, 10);
    assert_eq!(summary.coefficients.last().unwrap().term, "year");
}

#[test]
fn disjoint_sources_fail_at_the_merge() {
    let burden_file = write_csv(
        "location,period,value\nKenya,2023,500 000\nMalawi,2023,300 000",
    );
    let poverty_file = write_csv(&format!(
        "{}\n{}",
        poverty_caption(),
        poverty_row("Kenya", 2010, 35.0, 1)
    ));

    let burden = load_burden_data(burden_file.path().to_str().unwrap()).unwrap();
    let poverty = load_poverty_data(poverty_file.path().to_str().unwrap()).unwrap();
    let selected = select_top_countries(&burden, &SelectionConfig::default()).unwrap();
    let subset = subset_series(&burden, &selected);

    assert!(merge_series(&subset, &poverty).is_err());
}
