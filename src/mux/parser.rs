//! Parsers for the multiplexer's plain-text listing commands.
//!
//! Every function is all-or-nothing: one line that fails to match makes the
//! whole call fail. Both the psmux forms and tmux's default forms are
//! accepted.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use super::types::{Pane, SessionSummary, Window};

/// `name: N windows (created ...) [WxH] (attached)`; tmux omits `[WxH]`.
static SESSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(\S+): (\d+) windows? \(created [^)]+\)(?: \[(\d+)x(\d+)\])?(?: \(group [^)]+\))?(?: \(attached\))?$",
    )
    .unwrap()
});

/// psmux: `index: name[*] (K panes) [WxH]`. `*` is the only flag.
static PSMUX_WINDOW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+): (\S+?)(\*?) \((\d+) panes?\) \[(\d+)x(\d+)\]$").unwrap()
});

/// tmux: `index: name[flags] (K panes) [WxH] [layout ...] @N (active)`.
/// A flagless name ending in a flag character is indistinguishable from a
/// flagged one.
static TMUX_WINDOW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(\d+): (\S+?)([*\-#!~MZ]*) \((\d+) panes?\) \[(\d+)x(\d+)\] \[layout \S+\] (@\d+)( \(active\))?$",
    )
    .unwrap()
});

/// psmux: `%ID: [WxH] ...`
static PSMUX_PANE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(%\d+): \[(\d+)x(\d+)\]").unwrap());

/// tmux: `N: [WxH] [history ...] %ID (active)`
static TMUX_PANE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+: \[(\d+)x(\d+)\].*? (%\d+)(?: |$)").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to parse {kind} line: {line}")]
pub struct ParseError {
    pub kind: &'static str,
    pub line: String,
}

impl ParseError {
    fn new(kind: &'static str, line: &str) -> Self {
        Self {
            kind,
            line: line.to_string(),
        }
    }
}

fn lines(output: &str) -> impl Iterator<Item = &str> {
    output
        .trim()
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
}

fn group<'h>(caps: &regex::Captures<'h>, i: usize) -> &'h str {
    caps.get(i).map_or("", |m| m.as_str())
}

fn number<T: std::str::FromStr>(kind: &'static str, line: &str, text: &str) -> Result<T, ParseError> {
    text.parse().map_err(|_| ParseError::new(kind, line))
}

/// Parse the output of `ls`.
pub fn parse_sessions(output: &str) -> Result<Vec<SessionSummary>, ParseError> {
    lines(output)
        .map(|line| {
            let caps = SESSION_RE
                .captures(line)
                .ok_or_else(|| ParseError::new("session", line))?;
            let name = caps[1].to_string();
            Ok(SessionSummary {
                id: name.clone(),
                name,
                windows: number("session", line, &caps[2])?,
                attached: line.contains("(attached)"),
                active: false,
            })
        })
        .collect()
}

/// Parse the output of `list-windows`.
pub fn parse_windows(output: &str) -> Result<Vec<Window>, ParseError> {
    lines(output)
        .map(|line| {
            let (caps, id, active) = if let Some(caps) = PSMUX_WINDOW_RE.captures(line) {
                let active = !caps[3].is_empty();
                (caps, None, active)
            } else if let Some(caps) = TMUX_WINDOW_RE.captures(line) {
                let id = caps[7].to_string();
                let active = caps[3].contains('*') || caps.get(8).is_some();
                (caps, Some(id), active)
            } else {
                return Err(ParseError::new("window", line));
            };
            let index: u32 = number("window", line, &caps[1])?;
            Ok(Window {
                id: id.unwrap_or_else(|| format!("@{index}")),
                name: caps[2].to_string(),
                index,
                active,
                panes: Vec::new(),
            })
        })
        .collect()
}

/// Parse the output of `list-panes`.
///
/// `index` is the position in this listing, not the multiplexer's own pane
/// index. The first pane is the active one unless a tmux `(active)` marker
/// says otherwise.
pub fn parse_panes(output: &str) -> Result<Vec<Pane>, ParseError> {
    let mut marked = None;
    let mut panes = lines(output)
        .enumerate()
        .map(|(index, line)| {
            let (id, width, height) = if let Some(caps) = PSMUX_PANE_RE.captures(line) {
                (group(&caps, 1), group(&caps, 2), group(&caps, 3))
            } else if let Some(caps) = TMUX_PANE_RE.captures(line) {
                if line.ends_with("(active)") {
                    marked = Some(index);
                }
                (group(&caps, 3), group(&caps, 1), group(&caps, 2))
            } else {
                return Err(ParseError::new("pane", line));
            };
            Ok(Pane {
                id: id.to_string(),
                index,
                active: false,
                width: number("pane", line, width)?,
                height: number("pane", line, height)?,
                top: None,
                left: None,
                command: None,
                title: None,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let active = marked.unwrap_or(0);
    if let Some(pane) = panes.get_mut(active) {
        pane.active = true;
    }
    Ok(panes)
}
