use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use polars::datatypes::TimeUnit;
use polars::prelude::StrptimeOptions;
use polars::prelude::*;
use tracing::info;

use crate::error::RateioError;

// ── Loading ─────────────────────────────────────────────────────────────────

/// Read one JSON file (array of records) into a DataFrame.
pub fn read_json(path: impl AsRef<Path>) -> Result<DataFrame, RateioError> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let df = JsonReader::new(file)
        .with_json_format(JsonFormat::Json)
        .finish()?;
    info!(path = %path.display(), rows = df.height(), "loaded json batch");
    Ok(df)
}

/// Load every `*.json` file of a directory, keyed by file stem.
pub fn read_json_dir(dir: impl AsRef<Path>) -> Result<HashMap<String, DataFrame>, RateioError> {
    let mut paths: Vec<_> = std::fs::read_dir(dir.as_ref())?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|entry| entry.path())
        .filter(|path| path.extension().map(|ext| ext == "json").unwrap_or(false))
        .collect();
    paths.sort();

    let mut frames = HashMap::new();
    for path in paths {
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            frames.insert(stem.to_string(), read_json(&path)?);
        }
    }
    Ok(frames)
}

// ── Preparation ─────────────────────────────────────────────────────────────

/// Parse string columns to Datetime using the given format string.
/// Columns absent from the frame are skipped.
///
/// Example formats: "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%d/%m/%Y"
pub fn parse_datetime_columns(
    df: DataFrame,
    columns: &[&str],
    format: &str,
) -> Result<DataFrame, RateioError> {
    let schema = df.schema().clone();
    let exprs: Vec<Expr> = columns
        .iter()
        .filter(|column| schema.contains(column))
        .map(|&column| {
            col(column)
                .str()
                .strip_chars(lit(" \t\r\n"))
                .str()
                .to_datetime(
                    Some(TimeUnit::Microseconds),
                    None,
                    StrptimeOptions {
                        format: Some(format.into()),
                        strict: true,
                        ..Default::default()
                    },
                    lit("raise"),
                )
        })
        .collect();
    if exprs.is_empty() {
        return Ok(df);
    }
    Ok(df.lazy().with_columns(exprs).collect()?)
}

/// Coerce columns to Float64; string columns are whitespace-stripped first.
/// Columns absent from the frame are skipped.
pub fn parse_float_columns(df: DataFrame, columns: &[&str]) -> Result<DataFrame, RateioError> {
    let schema = df.schema().clone();
    let mut exprs: Vec<Expr> = Vec::new();
    for &column in columns {
        match schema.get(column) {
            Some(DataType::String) => exprs.push(
                col(column)
                    .str()
                    .strip_chars(lit(" \t\r\n"))
                    .cast(DataType::Float64),
            ),
            Some(_) => exprs.push(col(column).cast(DataType::Float64)),
            None => {}
        }
    }
    if exprs.is_empty() {
        return Ok(df);
    }
    Ok(df.lazy().with_columns(exprs).collect()?)
}

/// Rename columns via a map; keys absent from the frame are an error so a
/// misconfigured preparer fails loudly.
pub fn rename_columns(
    df: DataFrame,
    rename: &HashMap<String, String>,
) -> Result<DataFrame, RateioError> {
    if rename.is_empty() {
        return Ok(df);
    }
    let old: Vec<&str> = rename.keys().map(String::as_str).collect();
    let new: Vec<&str> = rename.values().map(String::as_str).collect();
    Ok(df.lazy().rename(old, new, true).collect()?)
}

// ── Persistence ─────────────────────────────────────────────────────────────

/// Persist the final table to a Parquet file.
pub fn write_parquet(df: &mut DataFrame, path: impl AsRef<Path>) -> Result<(), RateioError> {
    let path = path.as_ref();
    let file = File::create(path)?;
    ParquetWriter::new(file).finish(df)?;
    info!(path = %path.display(), rows = df.height(), "wrote parquet output");
    Ok(())
}
