//! Series corpus
//!
//! A corpus is the immutable set of series the builder indexes. All series
//! share one date axis, so index positions mean the same day in every series.

use chrono::{Days, NaiveDate, NaiveDateTime};
use std::io::Read;
use std::path::Path;

use crate::types::Series;
use crate::{Error, Result};

/// CSV loading options
#[derive(Debug, Clone, Default)]
pub struct CsvOptions {
    /// Name of the date column; defaults to the first column
    pub date_column: Option<String>,
    /// Drop every series that has at least one missing value
    pub drop_incomplete: bool,
    /// Keep at most this many series (in column order)
    pub max_series: Option<usize>,
}

/// Immutable collection of equally long series
#[derive(Debug, Clone)]
pub struct Corpus {
    timestamps: Vec<NaiveDate>,
    series: Vec<Series>,
}

impl Corpus {
    /// Validate and wrap a set of series
    pub fn new(series: Vec<Series>) -> Result<Self> {
        let first = series
            .first()
            .ok_or_else(|| Error::EmptyCorpus("no series loaded".into()))?;
        let timestamps = first.timestamps.clone();

        for s in &series {
            if s.values.len() != s.timestamps.len() {
                return Err(Error::InvalidRequest(format!(
                    "series {} has {} values but {} timestamps",
                    s.name,
                    s.values.len(),
                    s.timestamps.len()
                )));
            }
            if s.timestamps != timestamps {
                return Err(Error::InvalidRequest(format!(
                    "series {} does not share the corpus date axis",
                    s.name
                )));
            }
        }

        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = series.iter().find(|s| !seen.insert(s.name.as_str())) {
            return Err(Error::InvalidRequest(format!(
                "duplicate series name {}",
                dup.name
            )));
        }

        Ok(Self { timestamps, series })
    }

    /// Load a table with one date column and one column per series
    pub fn from_csv_path(path: impl AsRef<Path>, options: &CsvOptions) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        Self::from_csv_reader(file, options)
    }

    pub fn from_csv_reader<R: Read>(reader: R, options: &CsvOptions) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let headers = reader.headers()?.clone();

        let date_idx = match &options.date_column {
            Some(col) => headers.iter().position(|h| h == col).ok_or_else(|| {
                Error::InvalidRequest(format!("date column {} not found", col))
            })?,
            None => 0,
        };

        let names: Vec<String> = headers
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != date_idx)
            .map(|(_, h)| h.to_string())
            .collect();
        if names.is_empty() {
            return Err(Error::EmptyCorpus("CSV has no series columns".into()));
        }

        let mut timestamps = Vec::new();
        let mut columns: Vec<Vec<f64>> = vec![Vec::new(); names.len()];

        for (row, record) in reader.records().enumerate() {
            let record = record?;
            let raw_date = record.get(date_idx).unwrap_or_default();
            timestamps.push(parse_date(raw_date).ok_or_else(|| {
                Error::InvalidRequest(format!("row {}: unparseable date {:?}", row + 1, raw_date))
            })?);

            let values = record
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != date_idx)
                .map(|(_, cell)| parse_cell(cell));
            for (column, value) in columns.iter_mut().zip(values) {
                column.push(value);
            }
        }

        let mut series: Vec<Series> = names
            .into_iter()
            .zip(columns)
            .map(|(name, values)| Series {
                name,
                values,
                timestamps: timestamps.clone(),
            })
            .collect();

        if options.drop_incomplete {
            let before = series.len();
            series.retain(|s| s.values.iter().all(|v| v.is_finite()));
            if series.len() < before {
                tracing::info!(
                    dropped = before - series.len(),
                    kept = series.len(),
                    "Dropped series with missing values"
                );
            }
        }
        if let Some(max) = options.max_series {
            series.truncate(max);
        }

        Self::new(series)
    }

    /// Seeded random walks (cumulative sums of standard-normal steps)
    pub fn random_walk(n_series: usize, length: usize, seed: u64) -> Result<Self> {
        let mut rng = fastrand::Rng::with_seed(seed);
        let start = NaiveDate::from_ymd_opt(2020, 1, 1)
            .ok_or_else(|| Error::internal("invalid start date"))?;
        let timestamps: Vec<NaiveDate> = (0..length)
            .map(|i| start.checked_add_days(Days::new(i as u64)))
            .collect::<Option<_>>()
            .ok_or_else(|| Error::internal("date overflow"))?;

        let series = (0..n_series)
            .map(|i| {
                let mut level = 0.0;
                let values = (0..length)
                    .map(|_| {
                        level += standard_normal(&mut rng);
                        level
                    })
                    .collect();
                Series {
                    name: format!("Series {}", i),
                    values,
                    timestamps: timestamps.clone(),
                }
            })
            .collect();

        Self::new(series)
    }

    pub fn series(&self) -> &[Series] {
        &self.series
    }

    pub fn get(&self, name: &str) -> Option<&Series> {
        self.series.iter().find(|s| s.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.series.iter().map(|s| s.name.clone()).collect()
    }

    pub fn timestamps(&self) -> &[NaiveDate] {
        &self.timestamps
    }

    /// Shared length of every series
    pub fn series_length(&self) -> usize {
        self.timestamps.len()
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

/// Empty, non-numeric and non-finite cells ("inf", "NaN") are all missing
fn parse_cell(cell: &str) -> f64 {
    cell.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .unwrap_or(f64::NAN)
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"];
    const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

    DATE_FORMATS
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(raw, f).ok())
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|f| NaiveDateTime::parse_from_str(raw, f).ok())
                .map(|dt| dt.date())
        })
}

/// Box-Muller transform
fn standard_normal(rng: &mut fastrand::Rng) -> f64 {
    let u1 = rng.f64().max(f64::MIN_POSITIVE);
    let u2 = rng.f64();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}
