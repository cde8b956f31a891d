//! Loading command sequences from delimited text files.
//!
//! One step per row. Columns are matched by name, ignoring case, spaces,
//! dashes and underscores:
//!
//! | column       | aliases                          | content                         |
//! |--------------|----------------------------------|---------------------------------|
//! | `delay`      | `delay_seconds`, `delay_s`       | whole seconds until the next row, at most one day |
//! | `level`      | `percentage`                     | resistance level 0-200          |
//! | `power`      | `power_watts`                    | target power in watts           |
//! | `simulation` | `grade`                          | simulated grade in percent      |
//! | `actuator`   | `actuator_speed`, `speed`        | optional speed in km/h          |
//!
//! Exactly one of `level`, `power` and `simulation` must be filled per row.

use csv::{ReaderBuilder, StringRecord, Trim};
use std::{fs::File, io::Read, path::Path};
use tracing::{info, warn};

use crate::{
    error::{Result, RigError},
    types::{ControlCommand, SequenceStep, MAX_STEP_DELAY_SECS},
};

/// Field delimiter used by the rig's files
pub const DEFAULT_DELIMITER: u8 = b';';

#[derive(Debug, Default)]
struct Columns {
    delay: Option<usize>,
    level: Option<usize>,
    power: Option<usize>,
    simulation: Option<usize>,
    actuator: Option<usize>,
}

impl Columns {
    fn from_header(header: &StringRecord) -> Result<Self> {
        let mut columns = Self::default();
        for (index, name) in header.iter().enumerate() {
            let normalized = name.to_lowercase().replace([' ', '-', '_'], "");
            let slot = match normalized.as_str() {
                "delay" | "delayseconds" | "delays" => &mut columns.delay,
                "level" | "percentage" => &mut columns.level,
                "power" | "powerwatts" => &mut columns.power,
                "simulation" | "grade" => &mut columns.simulation,
                "actuator" | "actuatorspeed" | "speed" => &mut columns.actuator,
                _ => continue,
            };
            slot.get_or_insert(index);
        }

        if columns.delay.is_none() {
            return Err(RigError::InvalidStep("missing delay column".to_string()));
        }
        if columns.level.is_none() && columns.power.is_none() && columns.simulation.is_none() {
            return Err(RigError::InvalidStep(
                "no level, power or simulation column".to_string(),
            ));
        }
        Ok(columns)
    }
}

fn cell(record: &StringRecord, column: Option<usize>) -> Option<&str> {
    column
        .and_then(|index| record.get(index))
        .filter(|value| !value.is_empty())
}

fn parse_cell<T: std::str::FromStr>(row: u64, what: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| RigError::InvalidStep(format!("row {row}: {what} {raw:?} is not valid")))
}

fn parse_row(row: u64, record: &StringRecord, columns: &Columns) -> Result<SequenceStep> {
    let raw_delay = cell(record, columns.delay)
        .ok_or_else(|| RigError::InvalidStep(format!("row {row}: delay is empty")))?;
    let delay_secs: i64 = parse_cell(row, "delay", raw_delay)?;
    if delay_secs < 0 {
        return Err(RigError::InvalidStep(format!(
            "row {row}: negative delay {delay_secs}"
        )));
    }
    if delay_secs > MAX_STEP_DELAY_SECS {
        return Err(RigError::InvalidStep(format!(
            "row {row}: delay {delay_secs} exceeds {MAX_STEP_DELAY_SECS} seconds"
        )));
    }

    let values = [
        cell(record, columns.level).map(|raw| ("level", raw)),
        cell(record, columns.power).map(|raw| ("power", raw)),
        cell(record, columns.simulation).map(|raw| ("simulation", raw)),
    ];
    let mut filled = values.into_iter().flatten();
    let (Some((kind, raw)), None) = (filled.next(), filled.next()) else {
        return Err(RigError::InvalidStep(format!(
            "row {row}: expected exactly one of level, power, simulation"
        )));
    };

    let command = match kind {
        "level" => ControlCommand::Percentage(parse_cell(row, kind, raw)?),
        "power" => ControlCommand::PowerWatts(parse_cell(row, kind, raw)?),
        _ => ControlCommand::SimulationGrade(parse_cell(row, kind, raw)?),
    };
    command
        .validate()
        .map_err(|e| RigError::InvalidStep(format!("row {row}: {e}")))?;

    // a bad speed only loses the speed; the guard rejects out-of-bound values later
    let actuator_speed_kmh = cell(record, columns.actuator).and_then(|raw| {
        raw.parse::<f64>()
            .inspect_err(|_| {
                warn!(kind = "invalid_step", row, value = raw, "Ignoring unreadable actuator speed");
            })
            .ok()
    });

    Ok(SequenceStep {
        command,
        delay_secs,
        actuator_speed_kmh,
    })
}

/// Parse a sequence from `reader`.
///
/// Blank rows are skipped.
///
/// # Errors
///
/// Returns [`RigError::InvalidStep`] naming the offending row, or
/// [`RigError::Csv`] if the input is not readable as delimited text.
pub fn read_steps<R: Read>(reader: R, delimiter: u8) -> Result<Vec<SequenceStep>> {
    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .trim(Trim::All)
        .flexible(true)
        .from_reader(reader);

    let columns = Columns::from_header(reader.headers()?)?;

    let mut steps = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record?;
        if record.iter().all(str::is_empty) {
            continue;
        }
        // header is line 1
        let row = record
            .position()
            .map_or(index as u64 + 2, csv::Position::line);
        steps.push(parse_row(row, &record, &columns)?);
    }

    Ok(steps)
}

/// Load a `;`-delimited sequence file
///
/// # Errors
///
/// Returns [`RigError::Io`] if the file cannot be opened, otherwise as
/// [`read_steps`].
pub fn load_steps(path: impl AsRef<Path>) -> Result<Vec<SequenceStep>> {
    let path = path.as_ref();
    let steps = read_steps(File::open(path)?, DEFAULT_DELIMITER)?;
    info!(path = %path.display(), steps = steps.len(), "Loaded command sequence");
    Ok(steps)
}

/// Brake ramp used for bench checks: 25, 50, 75 and 100 percent of the
/// 0-200 scale, then release.
#[must_use]
pub fn brake_ramp() -> Vec<SequenceStep> {
    [(50, 3), (100, 3), (150, 5), (200, 3), (0, 0)]
        .into_iter()
        .map(|(level, delay)| SequenceStep::new(ControlCommand::Percentage(level), delay, None))
        .collect()
}
