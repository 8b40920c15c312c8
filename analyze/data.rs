//! # Data Loading and Normalization
//!
//! This module is the exclusive entry point for the two raw tabular
//! sources. Its responsibility is to read each CSV, validate its shape,
//! and convert it into plain typed records for the rest of the pipeline.
//! No DataFrame type escapes this module.
//!
//! - Burden source: a header-keyed table with at least `location`,
//!   `period`, and `value` columns. The `value` field is a composite
//!   string that may carry a bracketed uncertainty range after the point
//!   estimate (e.g. `"1 200 000 [900 000 - 1 500 000]"`); only the
//!   leading numeric portion is kept.
//! - Poverty source: a fixed-position table whose first two rows are a
//!   human-readable caption. Columns are mapped by position, never by
//!   label, because the caption row is not a machine key.
//!
//! Malformed rows are excluded silently: sparse, irregular survey data
//! make missing estimates routine, so a bad row is skipped rather than
//! surfaced as an error. Only structural problems (missing column, too
//! few columns, nothing usable at all) are fatal.

use polars::prelude::*;
use serde::Serialize;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// One burden observation: estimated count of affected individuals for a
/// country in a reporting year. `value` is always finite and non-negative.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BurdenRecord {
    pub country: String,
    pub year: i32,
    pub value: f64,
}

/// One multidimensional-poverty survey row. The join keys and the
/// headcount ratio are mandatory; the remaining covariates may be absent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PovertyRecord {
    pub country: String,
    pub year: i32,
    /// Share of the population counted as multidimensionally poor, in percent.
    pub poverty_headcount: f64,
    pub education_attainment: Option<f64>,
    pub education_enrollment: Option<f64>,
    pub electricity_access: Option<f64>,
    pub sanitation_access: Option<f64>,
    pub water_access: Option<f64>,
}

/// A comprehensive error type for all data loading failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The poverty table has {found} columns, but {required} positional columns are required."
    )]
    TooFewColumns { found: usize, required: usize },
    #[error("No usable rows remained in '{0}' after normalization.")]
    NoUsableRows(String),
}

/// Extracts the point estimate from a composite value field.
///
/// Keeps the leading run of digits and interior spaces (thousands
/// separators), strips the spaces, and parses the remainder. Anything
/// after that run, such as a bracketed uncertainty range, is ignored.
/// Returns `None` when no leading digits exist, which covers empty
/// cells, placeholders like "No data", and negative values.
pub fn parse_point_estimate(raw: &str) -> Option<f64> {
    let digits: String = raw
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == ' ')
        .filter(char::is_ascii_digit)
        .collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse::<f64>().ok()
}

/// Positional layout of the poverty table. The raw header is a two-row
/// caption, so fields are addressed by column index, not by name.
mod poverty_layout {
    pub const TOTAL_COLUMNS: usize = 16;
    pub const COUNTRY: usize = 0;
    pub const YEAR: usize = 3;
    pub const HEADCOUNT: usize = 5;
    pub const EDUCATION_ATTAINMENT: usize = 9;
    pub const EDUCATION_ENROLLMENT: usize = 10;
    pub const ELECTRICITY: usize = 11;
    pub const SANITATION: usize = 13;
    pub const WATER: usize = 15;
    pub const CAPTION_ROWS: usize = 2;
}

/// Loads and normalizes the burden source.
///
/// Rows whose year or value fail to parse are dropped without error;
/// identical input always yields the same records in source order.
pub fn load_burden_data(path: &str) -> Result<Vec<BurdenRecord>, DataError> {
    let df = read_csv(path, true, 0)?;

    for required in ["location", "period", "value"] {
        if !df.get_column_names().iter().any(|c| c == &required) {
            return Err(DataError::ColumnNotFound(required.to_string()));
        }
    }

    let countries = string_cells(df.column("location")?)?;
    let years = year_cells(df.column("period")?)?;
    let values = burden_cells(df.column("value")?)?;

    let total = df.height();
    let mut records = Vec::with_capacity(total);
    for i in 0..total {
        let (Some(country), Some(year), Some(value)) = (&countries[i], years[i], values[i]) else {
            continue;
        };
        if country.is_empty() || !value.is_finite() || value < 0.0 {
            continue;
        }
        records.push(BurdenRecord {
            country: country.clone(),
            year,
            value,
        });
    }

    log::debug!(
        "Burden source: kept {} of {} rows ({} dropped by parse-level omission)",
        records.len(),
        total,
        total - records.len()
    );
    if records.is_empty() {
        return Err(DataError::NoUsableRows(path.to_string()));
    }
    Ok(records)
}

/// Loads and normalizes the poverty source.
///
/// The first two caption rows are discarded and columns are read by
/// fixed position. Rows missing country, year, or the headcount ratio
/// are dropped; the optional covariates fall back to `None` per cell.
pub fn load_poverty_data(path: &str) -> Result<Vec<PovertyRecord>, DataError> {
    use poverty_layout as layout;

    let df = read_csv(path, false, layout::CAPTION_ROWS)?;
    if df.width() < layout::TOTAL_COLUMNS {
        return Err(DataError::TooFewColumns {
            found: df.width(),
            required: layout::TOTAL_COLUMNS,
        });
    }

    let columns = df.get_columns();
    let countries = string_cells(&columns[layout::COUNTRY])?;
    let years = year_cells(&columns[layout::YEAR])?;
    let headcounts = numeric_cells(&columns[layout::HEADCOUNT])?;
    let attainment = numeric_cells(&columns[layout::EDUCATION_ATTAINMENT])?;
    let enrollment = numeric_cells(&columns[layout::EDUCATION_ENROLLMENT])?;
    let electricity = numeric_cells(&columns[layout::ELECTRICITY])?;
    let sanitation = numeric_cells(&columns[layout::SANITATION])?;
    let water = numeric_cells(&columns[layout::WATER])?;

    let total = df.height();
    let mut records = Vec::with_capacity(total);
    for i in 0..total {
        let (Some(country), Some(year), Some(headcount)) = (&countries[i], years[i], headcounts[i])
        else {
            continue;
        };
        if country.is_empty() || !headcount.is_finite() {
            continue;
        }
        records.push(PovertyRecord {
            country: country.clone(),
            year,
            poverty_headcount: headcount,
            education_attainment: attainment[i],
            education_enrollment: enrollment[i],
            electricity_access: electricity[i],
            sanitation_access: sanitation[i],
            water_access: water[i],
        });
    }

    log::debug!(
        "Poverty source: kept {} of {} rows ({} dropped by parse-level omission)",
        records.len(),
        total,
        total - records.len()
    );
    if records.is_empty() {
        return Err(DataError::NoUsableRows(path.to_string()));
    }
    Ok(records)
}

fn read_csv(path: &str, has_header: bool, skip_rows: usize) -> Result<DataFrame, DataError> {
    let df = CsvReader::new(File::open(Path::new(path))?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(has_header)
                .with_skip_rows(skip_rows)
                .with_parse_options(CsvParseOptions::default().with_separator(b',')),
        )
        .finish()?;
    Ok(df)
}

/// Reads a column as owned strings, `None` for null cells.
fn string_cells(column: &Column) -> Result<Vec<Option<String>>, DataError> {
    let casted = column.cast(&DataType::String)?;
    let chunked = casted.str()?;
    Ok(chunked
        .into_iter()
        .map(|cell| cell.map(|s| s.trim().to_string()))
        .collect())
}

/// Reads a column as integer years. Accepts integer-typed cells as well
/// as string cells like `"2021"` or `"2021.0"`; anything else is `None`.
fn year_cells(column: &Column) -> Result<Vec<Option<i32>>, DataError> {
    let cells = string_cells(column)?;
    Ok(cells
        .into_iter()
        .map(|cell| cell.as_deref().and_then(parse_year))
        .collect())
}

fn parse_year(text: &str) -> Option<i32> {
    if let Ok(year) = text.parse::<i32>() {
        return Some(year);
    }
    // Numeric coercion may have produced a float rendering of the year.
    match text.parse::<f64>() {
        Ok(v) if v.is_finite() && v.fract() == 0.0 => Some(v as i32),
        _ => None,
    }
}

/// Coerces a column to f64, `None` for cells that do not parse.
fn numeric_cells(column: &Column) -> Result<Vec<Option<f64>>, DataError> {
    let casted = column.cast(&DataType::Float64)?;
    let chunked = casted.f64()?;
    Ok(chunked
        .into_iter()
        .map(|cell| cell.filter(|v| v.is_finite()))
        .collect())
}

/// Reads the burden value column, going through the composite-field
/// parser whenever the source stored it as text.
fn burden_cells(column: &Column) -> Result<Vec<Option<f64>>, DataError> {
    if matches!(
        column.dtype(),
        DataType::Int32 | DataType::Int64 | DataType::UInt32 | DataType::UInt64 | DataType::Float32 | DataType::Float64
    ) {
        return numeric_cells(column);
    }
    let cells = string_cells(column)?;
    Ok(cells
        .into_iter()
        .map(|cell| cell.as_deref().and_then(parse_point_estimate))
        .collect())
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::{self, Write};
    use tempfile::NamedTempFile;

    /// Writes CSV content to a temporary file for loader tests.
    fn create_test_csv(content: &str) -> io::Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "{}", content)?;
        file.flush()?;
        Ok(file)
    }

    #[test]
    fn point_estimate_strips_bracketed_range() {
        assert_abs_diff_eq!(
            parse_point_estimate("1 200 000 [900 000 - 1 500 000]").unwrap(),
            1_200_000.0
        );
        assert_abs_diff_eq!(parse_point_estimate("4500 [3100-6100]").unwrap(), 4500.0);
        assert_abs_diff_eq!(parse_point_estimate("  870000").unwrap(), 870_000.0);
    }

    #[test]
    fn point_estimate_rejects_non_numeric() {
        assert_eq!(parse_point_estimate("No data"), None);
        assert_eq!(parse_point_estimate(""), None);
        assert_eq!(parse_point_estimate("[1000-2000]"), None);
        assert_eq!(parse_point_estimate("-500"), None);
    }

    #[test]
    fn burden_loader_keeps_parsable_rows_only() {
        let content = "location,period,value\n\
                       Kenya,2023,1 400 000 [1 200 000 - 1 600 000]\n\
                       Kenya,2022,No data\n\
                       Lesotho,2023,260 000 [240 000 - 280 000]\n\
                       Eswatini,abc,210 000";
        let file = create_test_csv(content).unwrap();
        let records = load_burden_data(file.path().to_str().unwrap()).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].country, "Kenya");
        assert_eq!(records[0].year, 2023);
        assert_abs_diff_eq!(records[0].value, 1_400_000.0);
        assert_eq!(records[1].country, "Lesotho");
        assert_abs_diff_eq!(records[1].value, 260_000.0);
    }

    #[test]
    fn burden_loader_reads_plain_numeric_values() {
        let content = "location,period,value\n\
                       Kenya,2023,1400000\n\
                       Lesotho,2023,260000";
        let file = create_test_csv(content).unwrap();
        let records = load_burden_data(file.path().to_str().unwrap()).unwrap();
        assert_eq!(records.len(), 2);
        assert_abs_diff_eq!(records[0].value, 1_400_000.0);
    }

    #[test]
    fn burden_loader_requires_columns() {
        let content = "location,year,value\nKenya,2023,100";
        let file = create_test_csv(content).unwrap();
        let err = load_burden_data(file.path().to_str().unwrap()).unwrap_err();
        match err {
            DataError::ColumnNotFound(col) => assert_eq!(col, "period"),
            other => panic!("Expected ColumnNotFound(period), got {:?}", other),
        }
    }

    #[test]
    fn burden_loader_fails_when_nothing_parses() {
        let content = "location,period,value\nKenya,2023,No data";
        let file = create_test_csv(content).unwrap();
        let err = load_burden_data(file.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, DataError::NoUsableRows(_)));
    }

    /// Builds a 16-column poverty row with the mandatory fields placed at
    /// their fixed positions and a recognizable pattern elsewhere.
    fn poverty_row(country: &str, year: &str, headcount: &str, water: &str) -> String {
        let mut cells = vec!["x".to_string(); poverty_layout::TOTAL_COLUMNS];
        cells[poverty_layout::COUNTRY] = country.to_string();
        cells[poverty_layout::YEAR] = year.to_string();
        cells[poverty_layout::HEADCOUNT] = headcount.to_string();
        cells[poverty_layout::EDUCATION_ATTAINMENT] = "12.5".to_string();
        cells[poverty_layout::EDUCATION_ENROLLMENT] = "8.1".to_string();
        cells[poverty_layout::ELECTRICITY] = "44.0".to_string();
        cells[poverty_layout::SANITATION] = "61.3".to_string();
        cells[poverty_layout::WATER] = water.to_string();
        cells.join(",")
    }

    fn poverty_caption() -> String {
        let caption: Vec<String> = (0..poverty_layout::TOTAL_COLUMNS)
            .map(|i| format!("c{i}"))
            .collect();
        format!("{}\n{}", caption.join(","), caption.join(","))
    }

    #[test]
    fn poverty_loader_maps_positional_columns() {
        let content = format!(
            "{}\n{}\n{}",
            poverty_caption(),
            poverty_row("Kenya", "2021", "37.5", "42.0"),
            poverty_row("Lesotho", "2018", "19.6", ""),
        );
        let file = create_test_csv(&content).unwrap();
        let records = load_poverty_data(file.path().to_str().unwrap()).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].country, "Kenya");
        assert_eq!(records[0].year, 2021);
        assert_abs_diff_eq!(records[0].poverty_headcount, 37.5);
        assert_eq!(records[0].education_attainment, Some(12.5));
        assert_eq!(records[0].water_access, Some(42.0));
        assert_eq!(records[1].water_access, None);
    }

    #[test]
    fn poverty_loader_drops_rows_missing_mandatory_fields() {
        let content = format!(
            "{}\n{}\n{}\n{}",
            poverty_caption(),
            poverty_row("Kenya", "2021", "37.5", "42.0"),
            poverty_row("Lesotho", "2017-2018", "19.6", "50.0"),
            poverty_row("Eswatini", "2014", "not reported", "50.0"),
        );
        let file = create_test_csv(&content).unwrap();
        let records = load_poverty_data(file.path().to_str().unwrap()).unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].country, "Kenya");
    }

    #[test]
    fn poverty_loader_rejects_narrow_tables() {
        let content = "a,b\nc,d\n1,2\n3,4";
        let file = create_test_csv(content).unwrap();
        let err = load_poverty_data(file.path().to_str().unwrap()).unwrap_err();
        match err {
            DataError::TooFewColumns { found, required } => {
                assert_eq!(found, 2);
                assert_eq!(required, poverty_layout::TOTAL_COLUMNS);
            }
            other => panic!("Expected TooFewColumns, got {:?}", other),
        }
    }
}
