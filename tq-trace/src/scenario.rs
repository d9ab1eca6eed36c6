use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::Deserialize;

use crate::{
    plot::PlotDataSeries,
    record::{self, normalize_as, TraceFormat, TraceRecord},
    Error, Result,
};

/// Direction of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Forward,
    Return,
}

/// Scenario description file.
///
/// ```json
/// { "name": "...", "description": "...",
///   "trace": { "format": "simple", "forward": "fwd.csv", "return": "ret.csv" },
///   "video": "clip.mp4" }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ScenarioFile {
    pub name: String,
    pub description: String,
    pub trace: TraceFiles,
    #[serde(default)]
    pub video: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TraceFiles {
    pub format: TraceFormat,
    pub forward: PathBuf,
    #[serde(rename = "return")]
    pub reverse: PathBuf,
}

/// A loaded scenario: metadata plus both normalized traces.
#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    name: String,
    description: String,
    base_path: PathBuf,
    format: TraceFormat,
    forward_file: PathBuf,
    return_file: PathBuf,
    video: Option<PathBuf>,
    forward: Arc<[TraceRecord]>,
    reverse: Arc<[TraceRecord]>,
}

impl ScenarioConfig {
    /// Loads the scenario described by the JSON file at `path`. Trace and video paths are
    /// resolved relative to the directory that holds the file.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = tokio::fs::read(path)
            .await
            .map_err(|e| Error::from(e).in_file(path))?;
        let file: ScenarioFile =
            serde_json::from_slice(&contents).map_err(|e| Error::from(e).in_file(path))?;

        let base_path = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Self::load(file, base_path).await
    }

    pub(crate) async fn load(file: ScenarioFile, base_path: PathBuf) -> Result<Self> {
        let forward_file = base_path.join(&file.trace.forward);
        let return_file = base_path.join(&file.trace.reverse);

        let forward = read_trace(&forward_file, file.trace.format).await?;
        let reverse = read_trace(&return_file, file.trace.format).await?;

        tracing::debug!(
            name = %file.name,
            forward = forward.len(),
            reverse = reverse.len(),
            format = %file.trace.format,
            "loaded scenario"
        );

        Ok(Self {
            video: file.video.map(|video| base_path.join(video)),
            name: file.name,
            description: file.description,
            base_path,
            format: file.trace.format,
            forward_file,
            return_file,
            forward: forward.into(),
            reverse: reverse.into(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Format the trace files were declared in. The records are always extended.
    pub fn format(&self) -> TraceFormat {
        self.format
    }

    pub fn forward_file(&self) -> &Path {
        &self.forward_file
    }

    pub fn return_file(&self) -> &Path {
        &self.return_file
    }

    pub fn video(&self) -> Option<&Path> {
        self.video.as_deref()
    }

    pub fn forward(&self) -> &Arc<[TraceRecord]> {
        &self.forward
    }

    pub fn reverse(&self) -> &Arc<[TraceRecord]> {
        &self.reverse
    }

    pub fn trace(&self, direction: Direction) -> &Arc<[TraceRecord]> {
        match direction {
            Direction::Forward => &self.forward,
            Direction::Return => &self.reverse,
        }
    }

    pub fn plot_data(&self, direction: Direction) -> PlotDataSeries {
        PlotDataSeries::from_records(self.trace(direction))
    }

    /// Logical length of the scenario, in nanoseconds.
    pub fn total_duration(&self) -> u64 {
        record::total_duration(&self.forward, &self.reverse)
    }
}

impl fmt::Display for ScenarioConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.description)
    }
}

async fn read_trace(path: &Path, format: TraceFormat) -> Result<Vec<TraceRecord>> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Err(Error::MissingFile(path.to_path_buf()));
    }

    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::from(e).in_file(path))?;
    normalize_as(contents.lines(), Some(format)).map_err(|e| e.in_file(path))
}
