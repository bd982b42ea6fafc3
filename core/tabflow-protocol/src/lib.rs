//! IPC protocol types and validation for tabflow-daemon.
//!
//! This crate is shared by the daemon, the browser-side host shim and the CLI
//! to prevent schema drift. Requests and responses are newline-delimited JSON
//! over a Unix socket. The daemon remains the authority on validation, but
//! clients can reuse the same types to construct valid requests.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_URL_BYTES: usize = 16 * 1024;

/// Browsers report "no window" as -1.
pub const WINDOW_ID_NONE: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    /// Tab/window event from the browser host. Params: [`HostEvent`].
    HostEvent,
    /// UI command. Params: the engine's tagged command object.
    Command,
    /// Host actions queued since the last drain.
    DrainHostActions,
    GetRules,
    GetSettings,
    GetStash,
    GetRuntime,
    GetSoonTabs,
    /// Params: [`ChangesParams`].
    GetChanges,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    /// Structured payload, e.g. the conflict list of a `rule_conflict`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Host events
// ─────────────────────────────────────────────────────────────────────────────

/// One tab as the browser reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabSnapshot {
    pub id: i64,
    pub window_id: i64,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub fav_icon_url: Option<String>,
    /// Active within its window.
    #[serde(default)]
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HostEvent {
    /// Full inventory, sent on every (re)connection. Triggers reconciliation.
    Sync {
        tabs: Vec<TabSnapshot>,
        #[serde(default)]
        focused_window_id: Option<i64>,
    },
    TabCreated {
        tab: TabSnapshot,
    },
    /// Navigation or metadata change. `url` is present when it changed or the
    /// load completed.
    TabUpdated {
        tab_id: i64,
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        fav_icon_url: Option<String>,
    },
    TabActivated {
        tab_id: i64,
        window_id: i64,
    },
    TabRemoved {
        tab_id: i64,
    },
    /// `None` or [`WINDOW_ID_NONE`] when the browser lost OS focus.
    WindowFocusChanged {
        #[serde(default)]
        window_id: Option<i64>,
    },
}

impl HostEvent {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        match self {
            HostEvent::Sync {
                tabs,
                focused_window_id,
            } => {
                for tab in tabs {
                    validate_tab(tab)?;
                }
                if let Some(window_id) = focused_window_id {
                    require_window_id_or_none(*window_id)?;
                }
            }
            HostEvent::TabCreated { tab } => validate_tab(tab)?,
            HostEvent::TabUpdated { tab_id, url, .. } => {
                require_tab_id(*tab_id)?;
                if let Some(url) = url {
                    require_url(url)?;
                }
            }
            HostEvent::TabActivated { tab_id, window_id } => {
                require_tab_id(*tab_id)?;
                require_window_id(*window_id)?;
            }
            HostEvent::TabRemoved { tab_id } => require_tab_id(*tab_id)?,
            HostEvent::WindowFocusChanged { window_id } => {
                if let Some(window_id) = window_id {
                    require_window_id_or_none(*window_id)?;
                }
            }
        }
        Ok(())
    }
}

/// Normalizes a reported focus target: [`WINDOW_ID_NONE`] means no focus.
pub fn focused_window(window_id: Option<i64>) -> Option<i64> {
    window_id.filter(|id| *id != WINDOW_ID_NONE)
}

pub fn parse_host_event(params: Value) -> Result<HostEvent, ErrorInfo> {
    let event: HostEvent = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("host event payload is invalid: {}", err),
        )
    })?;
    event.validate()?;
    Ok(event)
}

// ─────────────────────────────────────────────────────────────────────────────
// Host actions
// ─────────────────────────────────────────────────────────────────────────────

/// Side effect the host must carry out, returned by `drain_host_actions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum HostAction {
    CloseTab { tab_id: i64 },
    OpenTab { url: String },
}

// ─────────────────────────────────────────────────────────────────────────────
// Query params
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChangesParams {
    /// Last revision the caller has seen; 0 lists everything.
    #[serde(default)]
    pub since: i64,
}

/// Decodes method params, treating absent params as an empty object.
pub fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, ErrorInfo> {
    let params = params.unwrap_or_else(|| Value::Object(Default::default()));
    serde_json::from_value(params)
        .map_err(|err| ErrorInfo::new("invalid_params", format!("params are invalid: {}", err)))
}

fn validate_tab(tab: &TabSnapshot) -> Result<(), ErrorInfo> {
    require_tab_id(tab.id)?;
    require_window_id(tab.window_id)?;
    if let Some(url) = &tab.url {
        require_url(url)?;
    }
    Ok(())
}

fn require_tab_id(tab_id: i64) -> Result<(), ErrorInfo> {
    if tab_id < 0 {
        return Err(ErrorInfo::new(
            "invalid_tab_id",
            format!("tab_id must be non-negative, got {}", tab_id),
        ));
    }
    Ok(())
}

fn require_window_id(window_id: i64) -> Result<(), ErrorInfo> {
    if window_id < 0 {
        return Err(ErrorInfo::new(
            "invalid_window_id",
            format!("window_id must be non-negative, got {}", window_id),
        ));
    }
    Ok(())
}

fn require_window_id_or_none(window_id: i64) -> Result<(), ErrorInfo> {
    if window_id == WINDOW_ID_NONE {
        return Ok(());
    }
    require_window_id(window_id)
}

fn require_url(url: &str) -> Result<(), ErrorInfo> {
    if url.len() > MAX_URL_BYTES {
        return Err(ErrorInfo::new(
            "invalid_url",
            format!("url must be {} bytes or fewer", MAX_URL_BYTES),
        ));
    }
    Ok(())
}
