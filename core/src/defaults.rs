//! Client-wide fallback values merged under every request.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::http::{Headers, HttpMethod, QueryItem};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

/// Values used wherever a request leaves a member unset.
///
/// `parameters` is a flat string map applied whatever parameter variant a
/// request later picks: it becomes data items for multipart, entries for
/// url-encoded and top-level keys for JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDefaults {
    pub base_url: Url,
    pub method: HttpMethod,
    #[serde(default = "default_timeout")]
    pub timeout: Duration,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub query_items: Vec<QueryItem>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl RequestDefaults {
    pub fn new(base_url: Url, method: HttpMethod) -> Self {
        Self {
            base_url,
            method,
            timeout: DEFAULT_TIMEOUT,
            headers: Headers::new(),
            query_items: Vec::new(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(name, value);
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_items.push(QueryItem::new(name, value));
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

/// Where a client gets its defaults from.
///
/// `Computed` is evaluated once per request, so values such as auth headers
/// can change between requests without any shared mutable state.
#[derive(Clone)]
pub enum DefaultsProvider {
    Fixed(RequestDefaults),
    Computed(Arc<dyn Fn() -> RequestDefaults + Send + Sync>),
}

impl DefaultsProvider {
    pub fn computed<F>(f: F) -> Self
    where
        F: Fn() -> RequestDefaults + Send + Sync + 'static,
    {
        DefaultsProvider::Computed(Arc::new(f))
    }

    /// The defaults to apply to the next request.
    pub fn current(&self) -> Cow<'_, RequestDefaults> {
        match self {
            DefaultsProvider::Fixed(defaults) => Cow::Borrowed(defaults),
            DefaultsProvider::Computed(f) => Cow::Owned(f()),
        }
    }
}

impl From<RequestDefaults> for DefaultsProvider {
    fn from(defaults: RequestDefaults) -> Self {
        DefaultsProvider::Fixed(defaults)
    }
}

impl fmt::Debug for DefaultsProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultsProvider::Fixed(defaults) => f.debug_tuple("Fixed").field(defaults).finish(),
            DefaultsProvider::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}
