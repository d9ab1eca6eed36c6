//! Network condition traces: records, scenarios and their derived views.

use std::{io, path::PathBuf};

pub mod codec;
pub mod hypatia;
pub mod plot;
pub mod provider;
pub mod record;
pub mod scenario;

pub use codec::TraceCodec;
pub use plot::{plot_series, PlotDataSeries, PlotPoint, PlotSeries};
pub use provider::{DirectoryProvider, ScenarioProvider};
pub use record::{
    loss_probability, normalize, normalize_as, total_duration, ParseError, TraceFormat,
    TraceRecord,
};
pub use scenario::{Direction, ScenarioConfig};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("line {line}: {source}")]
    Parse { line: usize, source: ParseError },
    #[error("{}: {source}", .path.display())]
    File {
        path: PathBuf,
        #[source]
        source: Box<Error>,
    },
    #[error("configured trace file does not exist: {}", .0.display())]
    MissingFile(PathBuf),
    #[error("unknown scenario: {0}")]
    UnknownScenario(String),
    #[error("IO error: {0:?}")]
    Io(#[from] io::Error),
    #[error("invalid scenario file: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Attaches the file that caused the error.
    pub(crate) fn in_file(self, path: impl Into<PathBuf>) -> Self {
        Self::File {
            path: path.into(),
            source: Box::new(self),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
