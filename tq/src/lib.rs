#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub use tq_common as common;
pub use tq_common::{Command, EventSink, Level, Runner, TracingSink};
pub use tq_sim::*;
pub use tq_trace as trace;
pub use tq_trace::{DirectoryProvider, ScenarioConfig, ScenarioProvider, TraceFormat, TraceRecord};
