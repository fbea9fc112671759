use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// One entry from the multiplexer's session listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub name: String,
    pub windows: u32,
    pub attached: bool,
    /// True iff this is the session the controller currently targets.
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pane {
    /// Multiplexer pane id, e.g. `%3`.
    pub id: String,
    /// 0-based position in the window's pane listing.
    pub index: usize,
    pub active: bool,
    pub width: u16,
    pub height: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    /// `@` followed by the window index.
    pub id: String,
    pub name: String,
    pub index: u32,
    pub active: bool,
    #[serde(default)]
    pub panes: Vec<Pane>,
}

/// Immutable snapshot of the multiplexer state.
///
/// A refresh builds a new `Layout` and swaps it in whole; holders of an
/// `Arc<Layout>` never see a partial update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Layout {
    pub session_id: String,
    pub session_name: String,
    pub sessions: Vec<SessionSummary>,
    pub windows: Vec<Window>,
    pub active_window_id: String,
    pub active_pane_id: String,
}

/// Copy-mode state pushed to the client after a toggle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeState {
    pub in_copy_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pane_id: Option<String>,
}

/// Asynchronous notification published by a controller.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The poller observed a layout different from the cached one.
    LayoutChanged(Arc<Layout>),
    /// The controller now targets another session.
    SessionSwitched(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_serializes_with_client_field_names() {
        let layout = Layout {
            session_id: "main".into(),
            session_name: "main".into(),
            sessions: vec![SessionSummary {
                id: "main".into(),
                name: "main".into(),
                windows: 1,
                attached: true,
                active: true,
            }],
            windows: vec![Window {
                id: "@0".into(),
                name: "sh".into(),
                index: 0,
                active: true,
                panes: vec![Pane {
                    id: "%1".into(),
                    index: 0,
                    active: true,
                    width: 80,
                    height: 24,
                    top: None,
                    left: None,
                    command: None,
                    title: None,
                }],
            }],
            active_window_id: "@0".into(),
            active_pane_id: "%1".into(),
        };

        let json = serde_json::to_value(&layout).unwrap();
        assert_eq!(json["sessionId"], "main");
        assert_eq!(json["activeWindowId"], "@0");
        assert_eq!(json["activePaneId"], "%1");
        assert_eq!(json["windows"][0]["panes"][0]["width"], 80);
        assert!(json["windows"][0]["panes"][0].get("top").is_none());
    }

    #[test]
    fn mode_state_json() {
        let json = serde_json::to_string(&ModeState {
            in_copy_mode: true,
            pane_id: None,
        })
        .unwrap();
        assert_eq!(json, r#"{"inCopyMode":true}"#);
    }
}
