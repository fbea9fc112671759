//! Multiplexer control plane.
//!
//! The bridge drives an external terminal multiplexer (tmux or psmux) by
//! running its CLI and scraping the listing output into a [`Layout`].

pub mod controller;
pub mod parser;
pub mod runner;
pub mod types;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use controller::{
    Controller, ControllerOptions, CopyMode, Multiplexer, MuxController, MuxReply,
    PsmuxController, TmuxController,
};
pub use parser::{parse_panes, parse_sessions, parse_windows, ParseError};
pub use runner::{MuxRunner, ProcessRunner};
pub use types::{Event, Layout, ModeState, Pane, SessionSummary, Window};

/// Which multiplexer binary a controller drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MuxKind {
    Tmux,
    Psmux,
}

impl MuxKind {
    pub fn binary(self) -> &'static str {
        match self {
            MuxKind::Tmux => "tmux",
            MuxKind::Psmux => "psmux",
        }
    }
}

impl std::fmt::Display for MuxKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.binary())
    }
}

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with status {status:?}: {stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("failed to start {kind} session {session}: {source}")]
    Start {
        kind: MuxKind,
        session: String,
        #[source]
        source: Box<MuxError>,
    },

    #[error("failed to {op}: {source}")]
    Operation {
        op: &'static str,
        #[source]
        source: Box<MuxError>,
    },

    #[error("unknown {kind} message type: {tag}")]
    UnknownMessage { kind: MuxKind, tag: char },
}

impl MuxError {
    pub(crate) fn operation(op: &'static str) -> impl FnOnce(MuxError) -> MuxError {
        move |source| MuxError::Operation {
            op,
            source: Box::new(source),
        }
    }
}
