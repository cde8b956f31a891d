use chrono::{DateTime, Local};
use csv::{Writer, WriterBuilder};
use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    time::Instant,
};
use tracing::info;

use crate::{
    error::Result,
    fanout::TelemetryConsumer,
    types::{TelemetryField, TelemetrySample},
};

/// Fields written after the `timestamp` and `ms` columns, in column order
const RECORDED_FIELDS: [TelemetryField; 6] = [
    TelemetryField::Speed,
    TelemetryField::Cadence,
    TelemetryField::Power,
    TelemetryField::TotalDistance,
    TelemetryField::Resistance,
    TelemetryField::ElapsedTime,
];

/// Appends telemetry samples to a `;`-delimited log file.
///
/// Columns: `timestamp;ms;speed;cadence;power;total_distance;resistance;elapsed_time`.
/// `ms` counts tenths of a second since the recorder was opened. Fields a
/// sample did not report are left empty.
pub struct CsvTelemetryRecorder {
    writer: Writer<File>,
    path: PathBuf,
    opened_at: Instant,
}

impl CsvTelemetryRecorder {
    /// Open a new log named after the current local time inside `dir`
    ///
    /// # Errors
    ///
    /// Returns [`RigError::Io`](crate::RigError::Io) or
    /// [`RigError::Csv`](crate::RigError::Csv) if the file cannot be written.
    pub fn create_in(dir: impl AsRef<Path>) -> Result<Self> {
        let name = Local::now()
            .format("%Y%m%d_%H%M%S_bike_data_log.csv")
            .to_string();
        Self::open(dir.as_ref().join(name))
    }

    /// Append to `path`, writing the header only if the file is new or empty
    ///
    /// # Errors
    ///
    /// Returns [`RigError::Io`](crate::RigError::Io) or
    /// [`RigError::Csv`](crate::RigError::Csv) if the file cannot be written.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let is_new = file.metadata()?.len() == 0;

        let mut writer = WriterBuilder::new()
            .delimiter(b';')
            .has_headers(false)
            .from_writer(file);

        if is_new {
            let mut header = vec!["timestamp", "ms"];
            header.extend(RECORDED_FIELDS.iter().map(|field| field.as_str()));
            writer.write_record(&header)?;
            writer.flush()?;
        }

        info!(path = %path.display(), "Recording telemetry");
        Ok(Self {
            writer,
            path,
            opened_at: Instant::now(),
        })
    }

    /// File being written
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row and flush it
    ///
    /// # Errors
    ///
    /// Returns [`RigError::Io`](crate::RigError::Io) or
    /// [`RigError::Csv`](crate::RigError::Csv) if the row cannot be written.
    pub fn record(&mut self, sample: &TelemetrySample) -> Result<()> {
        let timestamp = DateTime::<Local>::from(sample.received_at)
            .format("%Y-%m-%d %H:%M:%S%.3f")
            .to_string();
        let deciseconds = self.opened_at.elapsed().as_millis() / 100;

        let mut row = vec![timestamp, deciseconds.to_string()];
        row.extend(
            RECORDED_FIELDS
                .iter()
                .map(|field| sample.get(*field).map(format_value).unwrap_or_default()),
        );

        self.writer.write_record(&row)?;
        self.writer.flush()?;
        Ok(())
    }
}

impl TelemetryConsumer for CsvTelemetryRecorder {
    fn on_sample(&mut self, sample: &TelemetrySample) -> Result<()> {
        self.record(sample)
    }
}

fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.0}")
    } else {
        value.to_string()
    }
}
