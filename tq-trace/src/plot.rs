//! Plot-ready views of a trace.

use std::{iter::FusedIterator, slice};

use crate::record::TraceRecord;

/// One point of a trace plot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlotPoint {
    /// Cumulative time since the start of the trace, in seconds.
    pub time: f64,
    /// Latency, in milliseconds.
    pub delay: f64,
    /// Rate, in whole Mbit/s.
    pub rate: u64,
    /// Queue limit, in packets.
    pub queue: u32,
}

/// Lazy iterator over the [`PlotPoint`]s of a trace. Call [`plot_series`] again to start over.
#[derive(Debug, Clone)]
pub struct PlotSeries<'a> {
    records: slice::Iter<'a, TraceRecord>,
    elapsed_us: u64,
}

impl Iterator for PlotSeries<'_> {
    type Item = PlotPoint;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.next()?;
        self.elapsed_us = self.elapsed_us.saturating_add(record.interval);

        Some(PlotPoint {
            time: self.elapsed_us as f64 / 1_000_000.0,
            delay: record.latency as f64 / 1_000_000.0,
            rate: record.rate / 1_000_000,
            queue: record.limit,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.records.size_hint()
    }
}

impl ExactSizeIterator for PlotSeries<'_> {}

impl FusedIterator for PlotSeries<'_> {}

/// Returns the plot points of `records`, one per record, in order.
pub fn plot_series(records: &[TraceRecord]) -> PlotSeries<'_> {
    PlotSeries {
        records: records.iter(),
        elapsed_us: 0,
    }
}

/// Column-wise collection of a [`PlotSeries`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlotDataSeries {
    pub time: Vec<f64>,
    pub delay: Vec<f64>,
    pub rate: Vec<u64>,
    pub queue: Vec<u32>,
}

impl PlotDataSeries {
    pub fn from_records(records: &[TraceRecord]) -> Self {
        plot_series(records).collect()
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// End of the plotted time axis, in seconds.
    pub fn max_time(&self) -> f64 {
        self.time.last().copied().unwrap_or_default()
    }

    pub fn max_rate(&self) -> u64 {
        self.rate.iter().copied().max().unwrap_or_default()
    }

    pub fn max_delay(&self) -> f64 {
        self.delay.iter().copied().fold(0.0, f64::max)
    }
}

impl FromIterator<PlotPoint> for PlotDataSeries {
    fn from_iter<T: IntoIterator<Item = PlotPoint>>(iter: T) -> Self {
        let iter = iter.into_iter();
        let (capacity, _) = iter.size_hint();
        let mut series = Self {
            time: Vec::with_capacity(capacity),
            delay: Vec::with_capacity(capacity),
            rate: Vec::with_capacity(capacity),
            queue: Vec::with_capacity(capacity),
        };

        for point in iter {
            series.time.push(point.time);
            series.delay.push(point.delay);
            series.rate.push(point.rate);
            series.queue.push(point.queue);
        }

        series
    }
}
