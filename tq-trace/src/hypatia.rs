//! Conversion of Hypatia-as-an-Emulator traces.
//!
//! ```text
//! at,delay,stddev,min_link_cap,max_link_cap,queue_capacity,hops,dropratio,route_id
//! µs  µs    µs       bps            -          pkts         -      rel      int
//! ```
//!
//! `at` is absolute, so the first data row only provides the start time. Every following row
//! becomes one [`TraceRecord`] whose interval is the distance to the previous row.

use std::fmt::Write;

use crate::{
    record::{is_data_row, probability_to_u32, ParseError, TraceFormat, TraceRecord},
    Error, Result,
};

const FIELDS: usize = 9;

/// Processing delay added to every non-zero Hypatia delay, in nanoseconds.
pub const DELAY_OFFSET_NS: u64 = 20_000_000;

/// Header line of a converted trace, without line terminator.
pub fn header(format: TraceFormat) -> &'static str {
    match format {
        TraceFormat::Simple => "keep,latency,rate,loss,limit",
        TraceFormat::Extended => "keep,latency,jitter,rate,loss,limit,dup_prob,dup_delay,route_id",
    }
}

/// Converts Hypatia rows into records for the given output format. Simple output carries no
/// jitter and uses the default route id.
pub fn convert<I, S>(lines: I, format: TraceFormat) -> Result<Vec<TraceRecord>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut records = Vec::new();
    let mut prev = None;

    for (index, line) in lines.into_iter().enumerate() {
        let line = line.as_ref();
        if !is_data_row(line) {
            continue;
        }

        let (at, record) = parse(line, format).map_err(|source| Error::Parse {
            line: index + 1,
            source,
        })?;
        if let Some(prev) = prev.replace(at) {
            let interval = at.checked_sub(prev).ok_or_else(|| Error::Parse {
                line: index + 1,
                source: ParseError::InvalidField {
                    field: "at",
                    value: at.to_string(),
                },
            })?;
            records.push(TraceRecord { interval, ..record });
        }
    }

    Ok(records)
}

/// Renders converted records as a trace file, header included.
pub fn render(records: &[TraceRecord], format: TraceFormat) -> String {
    let mut out = String::with_capacity((records.len() + 1) * 48);
    out.push_str(header(format));
    out.push('\n');
    for record in records {
        // Writing into a String cannot fail.
        let _ = writeln!(out, "{}", record.display(format));
    }
    out
}

fn parse(
    line: &str,
    format: TraceFormat,
) -> std::result::Result<(u64, TraceRecord), ParseError> {
    let fields: Vec<&str> = line
        .trim_end_matches(['\r', '\n'])
        .split(',')
        .map(str::trim)
        .collect();
    if fields.len() != FIELDS {
        return Err(ParseError::FieldCount(fields.len()));
    }

    let at: u64 = int(fields[0], "at")?;
    let delay: i64 = int(fields[1], "delay")?;
    let stddev = float(fields[2], "stddev")?;
    let min_link_cap = float(fields[3], "min_link_cap")?;
    let limit: u32 = int(fields[5], "queue_capacity")?;
    let drops = float(fields[7], "dropratio")?;
    let route_id: u16 = int(fields[8], "route_id")?;

    let latency = if delay == 0 {
        0
    } else {
        (delay.saturating_mul(1_000).saturating_add(DELAY_OFFSET_NS as i64)).max(0) as u64
    };

    let loss = probability_to_u32(drops);
    let base = TraceRecord::simple(0, latency, min_link_cap as u64, loss, limit);
    let record = match format {
        TraceFormat::Simple => base,
        TraceFormat::Extended => TraceRecord {
            jitter: (stddev * 1_000.0) as u64,
            route_id,
            ..base
        },
    };

    Ok((at, record))
}

fn int<T: std::str::FromStr>(
    value: &str,
    field: &'static str,
) -> std::result::Result<T, ParseError> {
    value.parse().map_err(|_| ParseError::InvalidField {
        field,
        value: value.to_string(),
    })
}

fn float(value: &str, field: &'static str) -> std::result::Result<f64, ParseError> {
    int(value, field)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::normalize;

    const INPUT: &str = "\
at,delay,stddev,min_link_cap,max_link_cap,queue_capacity,hops,dropratio,route_id
1000000,12000,1.5,50000000.7,90000000,100,3,0.0,4
1100000,0,0.0,0,0,100,0,1.0,5
1350000,-30000,2.25,25000000.0,25000000,80,3,0.5,6
";

    #[test]
    fn first_row_only_seeds_the_clock() {
        let records = convert(INPUT.lines(), TraceFormat::Extended).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].interval, 100_000);
        assert_eq!(records[1].interval, 250_000);
    }

    #[test]
    fn extended_conversion_keeps_jitter_and_route() {
        let records = convert(INPUT.lines(), TraceFormat::Extended).unwrap();

        assert_eq!(records[0].latency, 0);
        assert_eq!(records[0].loss, u32::MAX);
        assert_eq!(records[0].route_id, 5);

        // Negative delays clamp to zero after the offset is applied.
        assert_eq!(records[1].latency, 0);
        assert_eq!(records[1].jitter, 2_250);
        assert_eq!(records[1].rate, 25_000_000);
        assert_eq!(records[1].loss, 2_147_483_648);
        assert_eq!(records[1].limit, 80);
        assert_eq!(records[1].route_id, 6);
    }

    #[test]
    fn delay_gets_the_processing_offset() {
        let input = "0,0,0,0,0,0,0,0,1\n10,12000,0,1000,0,1,0,0,1\n";
        let records = convert(input.lines(), TraceFormat::Simple).unwrap();
        assert_eq!(records[0].latency, 12_000_000 + DELAY_OFFSET_NS);
    }

    #[test]
    fn simple_output_is_valid_simple_trace() {
        let records = convert(INPUT.lines(), TraceFormat::Simple).unwrap();
        assert!(records.iter().all(|r| r.jitter == 0 && r.route_id == 1));

        let rendered = render(&records, TraceFormat::Simple);
        let mut lines = rendered.lines();
        assert_eq!(lines.next(), Some(header(TraceFormat::Simple)));
        assert_eq!(lines.next(), Some("100000,0,0,4294967295,100"));

        assert_eq!(normalize(rendered.lines()).unwrap(), records);
    }

    #[test]
    fn going_back_in_time_is_an_error() {
        let input = "5,0,0,0,0,0,0,0,1\n9,0,0,0,0,0,0,0,1\n7,0,0,0,0,0,0,0,1\n";
        let err = convert(input.lines(), TraceFormat::Simple).unwrap_err();
        assert!(matches!(err, Error::Parse { line: 3, .. }));
    }

    #[test]
    fn malformed_rows_are_rejected() {
        let err = convert(["1,2,3"], TraceFormat::Simple).unwrap_err();
        assert!(matches!(
            err,
            Error::Parse {
                line: 1,
                source: ParseError::FieldCount(3)
            }
        ));

        let err = convert(["1,2,x,4,5,6,7,8,9"], TraceFormat::Extended).unwrap_err();
        assert!(matches!(
            err,
            Error::Parse {
                source: ParseError::InvalidField {
                    field: "stddev",
                    ..
                },
                ..
            }
        ));
    }
}
