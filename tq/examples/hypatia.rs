//! Converts a Hypatia state export into a trace file.
//!
//! ```text
//! cargo run --example hypatia -- export.csv [simple|extended] > trace.csv
//! ```

use std::{env, fs};

use tq::{
    trace::{hypatia, plot_series},
    TraceFormat,
};

fn main() {
    let _ = tracing_subscriber::fmt().with_writer(std::io::stderr).try_init();

    let mut args = env::args().skip(1);
    let input = args.next().expect("usage: hypatia <export.csv> [simple|extended]");
    let format: TraceFormat = args.next().as_deref().unwrap_or("extended").parse().unwrap();

    let contents = fs::read_to_string(&input).unwrap();
    let records = hypatia::convert(contents.lines(), format).unwrap();

    let peak = plot_series(&records).map(|point| point.delay).fold(0.0, f64::max);
    tracing::info!(records = records.len(), peak_delay = peak, "converted {input}");

    print!("{}", hypatia::render(&records, format));
}
