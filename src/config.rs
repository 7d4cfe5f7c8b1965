//! Client configuration, structured protocol options, and per-start
//! parameters.
//!
//! Merge semantics follow the session contract: addons win over structured
//! options on key collision, call-supplied headers win over configured
//! headers, and the merged snapshot is immutable for the session's lifetime.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use crate::dispatch::Context;
use crate::error::LiveError;

// =============================================================================
// RECOGNIZED OPTION KEYS
// =============================================================================

/// Enables the keepalive loop when set to `"true"`.
pub const OPT_KEEPALIVE: &str = "keepalive";

/// Re-raise fatal loop failures (after the Error event and shutdown).
pub const OPT_RAISE_ON_ERROR: &str = "termination_exception";

/// Re-raise initial connect failures instead of returning `false`.
pub const OPT_RAISE_ON_CONNECT: &str = "termination_exception_connect";

/// Re-raise send failures instead of returning `false`.
pub const OPT_RAISE_ON_SEND: &str = "termination_exception_send";

// =============================================================================
// CLIENT CONFIG
// =============================================================================

/// Immutable client-level configuration supplied at construction.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server origin; `http(s)://` or `ws(s)://`.
    pub base_url: String,
    /// When non-empty, sent as an `Authorization: Token <key>` header.
    pub api_key: String,
    /// Base headers merged into every connection request.
    pub headers: BTreeMap<String, String>,
    /// String toggles; see the `OPT_*` constants for recognized keys.
    pub options: BTreeMap<String, String>,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            headers: BTreeMap::new(),
            options: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.options.insert(key.into(), value.into());
        self
    }

    /// Whether a string toggle is enabled (`"true"`).
    #[must_use]
    pub fn is_enabled(&self, key: &str) -> bool {
        self.options.get(key).is_some_and(|value| value == "true")
    }

    /// Validate the config at client construction time.
    pub(crate) fn validate(&self) -> Result<(), LiveError> {
        if self.base_url.trim().is_empty() {
            return Err(LiveError::Config("base_url is required".to_owned()));
        }
        // websocket_url rejects unsupported schemes and empty hosts.
        let _ = websocket_url(&self.base_url, "")?;
        Ok(())
    }

    /// Base headers plus the API-key authorization header.
    pub(crate) fn connection_headers(&self) -> BTreeMap<String, String> {
        let mut headers = self.headers.clone();
        if !self.api_key.is_empty() {
            let _ = headers.insert(
                "Authorization".to_owned(),
                format!("Token {}", self.api_key),
            );
        }
        headers
    }
}

// =============================================================================
// STRUCTURED OPTIONS
// =============================================================================

/// Structured protocol options for a live transcription session.
///
/// Every field is optional; only set fields become query parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveOptions {
    pub model: Option<String>,
    pub language: Option<String>,
    pub encoding: Option<String>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub punctuate: Option<bool>,
    pub smart_format: Option<bool>,
    pub interim_results: Option<bool>,
    pub utterance_end_ms: Option<u32>,
    pub vad_events: Option<bool>,
    pub endpointing: Option<u32>,
}

impl LiveOptions {
    /// Self-validation, run before any network activity.
    ///
    /// # Errors
    ///
    /// A description of the first violated constraint.
    pub fn check(&self) -> Result<(), String> {
        if let Some(utterance_end_ms) = self.utterance_end_ms {
            if utterance_end_ms < 1000 {
                return Err(format!(
                    "utterance_end_ms must be at least 1000, got {utterance_end_ms}"
                ));
            }
            if self.interim_results != Some(true) {
                return Err("utterance_end_ms requires interim_results".to_owned());
            }
        }
        if self.encoding.is_some() && self.sample_rate.is_none() {
            return Err("encoding requires sample_rate".to_owned());
        }
        if self.sample_rate == Some(0) {
            return Err("sample_rate must be positive".to_owned());
        }
        if self.channels == Some(0) {
            return Err("channels must be positive".to_owned());
        }
        Ok(())
    }

    /// Set fields as query pairs, deterministically ordered.
    #[must_use]
    pub fn to_query_pairs(&self) -> BTreeMap<String, String> {
        let mut pairs = BTreeMap::new();
        let mut put = |key: &str, value: Option<String>| {
            if let Some(value) = value {
                let _ = pairs.insert(key.to_owned(), value);
            }
        };
        put("model", self.model.clone());
        put("language", self.language.clone());
        put("encoding", self.encoding.clone());
        put("sample_rate", self.sample_rate.map(|v| v.to_string()));
        put("channels", self.channels.map(|v| v.to_string()));
        put("punctuate", self.punctuate.map(|v| v.to_string()));
        put("smart_format", self.smart_format.map(|v| v.to_string()));
        put("interim_results", self.interim_results.map(|v| v.to_string()));
        put(
            "utterance_end_ms",
            self.utterance_end_ms.map(|v| v.to_string()),
        );
        put("vad_events", self.vad_events.map(|v| v.to_string()));
        put("endpointing", self.endpointing.map(|v| v.to_string()));
        pairs
    }
}

/// Protocol options in either structured or raw key/value form.
#[derive(Debug, Clone)]
pub enum OptionsInput {
    Structured(LiveOptions),
    Raw(BTreeMap<String, String>),
}

impl From<LiveOptions> for OptionsInput {
    fn from(options: LiveOptions) -> Self {
        OptionsInput::Structured(options)
    }
}

impl From<BTreeMap<String, String>> for OptionsInput {
    fn from(options: BTreeMap<String, String>) -> Self {
        OptionsInput::Raw(options)
    }
}

// =============================================================================
// START PARAMETERS
// =============================================================================

/// Per-session inputs to [`LiveClient::start`](crate::LiveClient::start).
#[derive(Debug, Clone, Default)]
pub struct StartParams {
    /// Protocol options, structured or raw.
    pub options: Option<OptionsInput>,
    /// Extra key/values merged into the options; addons win on collision.
    pub addons: BTreeMap<String, String>,
    /// Extra headers merged over the configured headers; these win.
    pub headers: BTreeMap<String, String>,
    /// Ad-hoc members attached to the session, readable via
    /// [`LiveClient::member`](crate::LiveClient::member).
    pub members: HashMap<String, Value>,
    /// Free-form context forwarded to every dispatched handler call.
    pub context: Context,
}

impl StartParams {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_options(mut self, options: impl Into<OptionsInput>) -> Self {
        self.options = Some(options.into());
        self
    }

    #[must_use]
    pub fn with_addon(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.addons.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_member(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let _ = self.members.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let _ = self.context.insert(key.into(), value.into());
        self
    }
}

// =============================================================================
// MERGING AND URL BUILDING
// =============================================================================

/// Merge protocol options with addons (addons win), validating structured
/// options first.
pub(crate) fn merge_options(
    options: Option<&OptionsInput>,
    addons: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, LiveError> {
    let mut pairs = match options {
        None => BTreeMap::new(),
        Some(OptionsInput::Raw(raw)) => raw.clone(),
        Some(OptionsInput::Structured(structured)) => {
            structured.check().map_err(LiveError::Config)?;
            structured.to_query_pairs()
        }
    };
    for (key, value) in addons {
        let _ = pairs.insert(key.clone(), value.clone());
    }
    Ok(pairs)
}

/// Convert an `http(s)` origin to a websocket URL with the given endpoint
/// path appended.
pub(crate) fn websocket_url(base_url: &str, endpoint: &str) -> Result<String, LiveError> {
    let trimmed = base_url.trim_end_matches('/');

    let origin = if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        trimmed.to_owned()
    } else {
        return Err(LiveError::Config(format!("invalid base URL: {base_url}")));
    };

    let host = origin
        .split_once("://")
        .map_or("", |(_, host_and_path)| host_and_path);
    if host.is_empty() {
        return Err(LiveError::Config(format!("invalid base URL: {base_url}")));
    }

    if endpoint.is_empty() {
        Ok(origin)
    } else {
        Ok(format!("{origin}/{endpoint}"))
    }
}

/// Append query pairs to a URL.
pub(crate) fn append_query(url: &str, pairs: &BTreeMap<String, String>) -> String {
    if pairs.is_empty() {
        return url.to_owned();
    }
    let query = pairs
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&");
    format!("{url}?{query}")
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
