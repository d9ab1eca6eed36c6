//! Shaping and routing control for a two-interface emulation host.
//!
//! - [`theaterq`]: a pair of `theaterq` qdiscs replaying a forward and a return trace.
//! - [`poller`]: periodic status reports of a replay.
//! - [`realpath`]: VLAN uplinks selected by packet marks and per-uplink routing tables.
//! - [`mode`]: the emulator, passthrough and uplink modes, one of them enabled at a time.
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub mod config;
pub mod emulator;
pub mod host;
pub mod mode;
pub mod passthrough;
pub mod poller;
pub mod realpath;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod theaterq;

pub use config::{Config, OperationMode};
pub use emulator::EmulatorMode;
pub use mode::{build_modes, Mode, ModeHost, ModeSet, TabList};
pub use passthrough::PassthroughMode;
pub use poller::{Event, StatusPoller, StatusUpdate};
pub use realpath::{RealPath, RealPathEntry, UplinkEntry};
pub use theaterq::{ContMode, DualLinkHandler, DualLinkSettings, HandlerOptions, LinkState, Stage};
