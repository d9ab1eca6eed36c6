use std::{fmt, str::FromStr};

use serde::Deserialize;

use crate::Error;

/// On-disk layout of a trace row.
///
/// ```text
/// simple:   <INTERVAL>,<LATENCY>,<RATE>,<LOSS>,<LIMIT>
/// extended: <INTERVAL>,<LATENCY>,<JITTER>,<RATE>,<LOSS>,<LIMIT>,<DUP_PROB>,<DUP_DELAY>,<ROUTE_ID>
///              µs         ns       ns      bps    u32    pkts     u32         ns         u16
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceFormat {
    Simple,
    #[default]
    Extended,
}

impl TraceFormat {
    /// Number of comma separated fields of a row.
    pub const fn fields(self) -> usize {
        match self {
            Self::Simple => 5,
            Self::Extended => 9,
        }
    }

    pub const fn detect(fields: usize) -> Option<Self> {
        match fields {
            5 => Some(Self::Simple),
            9 => Some(Self::Extended),
            _ => None,
        }
    }
}

impl fmt::Display for TraceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simple => f.write_str("simple"),
            Self::Extended => f.write_str("extended"),
        }
    }
}

impl FromStr for TraceFormat {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simple" => Ok(Self::Simple),
            "extended" => Ok(Self::Extended),
            _ => Err(ParseError::UnknownFormat(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("expected 5 (simple) or 9 (extended) fields, found {0}")]
    FieldCount(usize),
    #[error("invalid {field} value {value:?}")]
    InvalidField { field: &'static str, value: String },
    #[error("expected a {expected} row, found a {found} row")]
    UnexpectedFormat {
        expected: TraceFormat,
        found: TraceFormat,
    },
    #[error("unknown trace format {0:?}")]
    UnknownFormat(String),
}

/// One row of a network condition trace, in extended form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceRecord {
    /// Time since the previous record, in microseconds.
    pub interval: u64,
    /// Latency, in nanoseconds.
    pub latency: u64,
    /// Jitter, in nanoseconds.
    pub jitter: u64,
    /// Rate, in bits per second.
    pub rate: u64,
    /// Loss probability scaled to the full `u32` range.
    pub loss: u32,
    /// Queue limit, in packets.
    pub limit: u32,
    /// Duplication probability scaled to the full `u32` range.
    pub dup_prob: u32,
    /// Delay of duplicated packets, in nanoseconds.
    pub dup_delay: u64,
    pub route_id: u16,
}

impl Default for TraceRecord {
    fn default() -> Self {
        Self {
            interval: 0,
            latency: 0,
            jitter: 0,
            rate: 0,
            loss: 0,
            limit: 0,
            dup_prob: 0,
            dup_delay: 0,
            route_id: Self::DEFAULT_ROUTE_ID,
        }
    }
}

impl TraceRecord {
    /// Route id assigned to rows that do not carry one.
    pub const DEFAULT_ROUTE_ID: u16 = 1;

    /// Widens a simple row: no jitter, no duplication, default route.
    pub fn simple(interval: u64, latency: u64, rate: u64, loss: u32, limit: u32) -> Self {
        Self {
            interval,
            latency,
            rate,
            loss,
            limit,
            ..Default::default()
        }
    }

    /// Interval since the previous record, in nanoseconds.
    pub fn interval_ns(&self) -> u64 {
        self.interval.saturating_mul(1_000)
    }

    pub fn loss_fraction(&self) -> f64 {
        self.loss as f64 / u32::MAX as f64
    }

    /// Parses a data row, detecting the format from its field count.
    pub fn parse_row(row: &str) -> Result<Self, ParseError> {
        Self::parse_row_as(row, None)
    }

    /// Parses a data row. If `expected` is set, the row must be in that format.
    pub fn parse_row_as(row: &str, expected: Option<TraceFormat>) -> Result<Self, ParseError> {
        let row = row.trim_end_matches(['\r', '\n']);
        let fields: Vec<&str> = row.split(',').map(str::trim).collect();

        let found = TraceFormat::detect(fields.len())
            .ok_or(ParseError::FieldCount(fields.len()))?;
        if let Some(expected) = expected {
            if expected != found {
                return Err(ParseError::UnexpectedFormat { expected, found });
            }
        }

        match found {
            TraceFormat::Simple => Ok(Self::simple(
                field(fields[0], "interval")?,
                field(fields[1], "latency")?,
                field(fields[2], "rate")?,
                field(fields[3], "loss")?,
                field(fields[4], "limit")?,
            )),
            TraceFormat::Extended => Ok(Self {
                interval: field(fields[0], "interval")?,
                latency: field(fields[1], "latency")?,
                jitter: field(fields[2], "jitter")?,
                rate: field(fields[3], "rate")?,
                loss: field(fields[4], "loss")?,
                limit: field(fields[5], "limit")?,
                dup_prob: field(fields[6], "dup_prob")?,
                dup_delay: field(fields[7], "dup_delay")?,
                route_id: field(fields[8], "route_id")?,
            }),
        }
    }

    /// Renders the record in the given format. Rendering as [`TraceFormat::Simple`] drops jitter,
    /// duplication and route id.
    pub fn display(&self, format: TraceFormat) -> Row<'_> {
        Row {
            record: self,
            format,
        }
    }
}

impl FromStr for TraceRecord {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_row(s)
    }
}

/// Renders the 9 comma joined extended fields, without line terminator.
impl fmt::Display for TraceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.display(TraceFormat::Extended).fmt(f)
    }
}

/// A [`TraceRecord`] rendered in a specific [`TraceFormat`].
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    record: &'a TraceRecord,
    format: TraceFormat,
}

impl fmt::Display for Row<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = self.record;
        match self.format {
            TraceFormat::Simple => {
                write!(f, "{},{},{},{},{}", r.interval, r.latency, r.rate, r.loss, r.limit)
            }
            TraceFormat::Extended => write!(
                f,
                "{},{},{},{},{},{},{},{},{}",
                r.interval,
                r.latency,
                r.jitter,
                r.rate,
                r.loss,
                r.limit,
                r.dup_prob,
                r.dup_delay,
                r.route_id
            ),
        }
    }
}

fn field<T: FromStr>(value: &str, name: &'static str) -> Result<T, ParseError> {
    value.parse().map_err(|_| ParseError::InvalidField {
        field: name,
        value: value.to_string(),
    })
}

/// Returns `true` for rows that carry data. Headers, comments and empty rows start with something
/// other than a digit.
pub fn is_data_row(line: &str) -> bool {
    line.as_bytes().first().is_some_and(u8::is_ascii_digit)
}

/// Converts a probability in `0.0..=1.0` to the `u32` scale used for loss and duplication.
pub fn probability_to_u32(fraction: f64) -> u32 {
    (fraction.clamp(0.0, 1.0) * u32::MAX as f64).round() as u32
}

/// Converts a loss percentage in `0.0..=100.0` to the `u32` scale of [`TraceRecord::loss`].
pub fn loss_probability(percent: f64) -> u32 {
    probability_to_u32(percent / 100.0)
}

/// Parses trace lines in either format into extended records. Non-data rows are skipped.
pub fn normalize<I, S>(lines: I) -> Result<Vec<TraceRecord>, Error>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    normalize_as(lines, None)
}

/// Like [`normalize`], but every data row must be in the `expected` format.
pub fn normalize_as<I, S>(
    lines: I,
    expected: Option<TraceFormat>,
) -> Result<Vec<TraceRecord>, Error>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut records = Vec::new();
    for (index, line) in lines.into_iter().enumerate() {
        let line = line.as_ref();
        if !is_data_row(line) {
            continue;
        }

        let record = TraceRecord::parse_row_as(line, expected).map_err(|source| Error::Parse {
            line: index + 1,
            source,
        })?;
        records.push(record);
    }

    Ok(records)
}

/// Logical length of a trace, in nanoseconds.
pub fn duration(records: &[TraceRecord]) -> u64 {
    records
        .iter()
        .fold(0u64, |acc, r| acc.saturating_add(r.interval_ns()))
}

/// Logical length of a forward/return pair, in nanoseconds: the longer of the two directions.
pub fn total_duration(forward: &[TraceRecord], reverse: &[TraceRecord]) -> u64 {
    duration(forward).max(duration(reverse))
}
