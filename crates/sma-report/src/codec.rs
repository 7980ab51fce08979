use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use sma_adapter::Measurement;
use sma_core::{format_timestamp, ReportFormat};

/// Serializes one measurement into one report file.
pub trait ReportCodec: Send + Sync {
    fn format(&self) -> ReportFormat;

    /// Write `measurement` to `path`, returning the number of rows written.
    /// The file handle is closed before this returns, on success or error.
    fn write(&self, measurement: &Measurement, path: &Path) -> Result<usize>;
}

pub fn codec_for(format: ReportFormat) -> Box<dyn ReportCodec> {
    match format {
        ReportFormat::Csv => Box::new(CsvCodec),
        ReportFormat::Json => Box::new(JsonCodec),
    }
}

/// `timestamp,value,<label columns...>`; label columns are the sorted union
/// of label keys across samples.
#[derive(Clone, Copy, Debug, Default)]
pub struct CsvCodec;

impl ReportCodec for CsvCodec {
    fn format(&self) -> ReportFormat {
        ReportFormat::Csv
    }

    fn write(&self, measurement: &Measurement, path: &Path) -> Result<usize> {
        let labels: BTreeSet<&str> = measurement
            .samples
            .iter()
            .flat_map(|s| s.labels.keys().map(String::as_str))
            .collect();

        let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
        let mut out = BufWriter::new(file);

        let mut header = vec!["timestamp".to_string(), "value".to_string()];
        header.extend(labels.iter().map(|l| csv_field(l)));
        writeln!(out, "{}", header.join(","))?;

        for sample in &measurement.samples {
            let mut row = vec![format_timestamp(&sample.timestamp), sample.value.to_string()];
            row.extend(
                labels
                    .iter()
                    .map(|l| sample.labels.get(*l).map(|v| csv_field(v)).unwrap_or_default()),
            );
            writeln!(out, "{}", row.join(","))?;
        }
        out.flush().with_context(|| format!("flush {}", path.display()))?;
        Ok(measurement.samples.len())
    }
}

fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl ReportCodec for JsonCodec {
    fn format(&self) -> ReportFormat {
        ReportFormat::Json
    }

    fn write(&self, measurement: &Measurement, path: &Path) -> Result<usize> {
        let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
        let mut out = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut out, measurement)?;
        out.flush().with_context(|| format!("flush {}", path.display()))?;
        Ok(measurement.samples.len())
    }
}
