//! Declarative request descriptions.
//!
//! # Design
//! An `ApiRequest` states only what differs from the client-wide defaults:
//! every member except `path` has a default meaning "unset, use the client's
//! value". The associated `Response` type ties the request to the type its
//! payload decodes into.
//!
//! `RequestSpec<R>` is the concrete, immutable implementation: a consuming
//! builder for ad-hoc requests, and a type eraser (`from_request`) that
//! snapshots any other `ApiRequest` with the same response type.

use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use serde::de::DeserializeOwned;
use url::Url;

use crate::defaults::RequestDefaults;
use crate::error::ApiError;
use crate::http::{Headers, HttpMethod, QueryItem};
use crate::params::Parameters;
use crate::resolve::{resolve, ResolvedRequest};

/// A typed description of one API call.
pub trait ApiRequest: Send + 'static {
    /// The type the response payload decodes into.
    type Response: DeserializeOwned + Send + 'static;

    /// Path appended to the base URL.
    fn path(&self) -> String;

    /// Overrides the client's base URL.
    fn base_url(&self) -> Option<Url> {
        None
    }

    fn query_items(&self) -> Vec<QueryItem> {
        Vec::new()
    }

    /// Overrides the client's default method.
    fn method(&self) -> Option<HttpMethod> {
        None
    }

    fn headers(&self) -> Headers {
        Headers::new()
    }

    fn parameters(&self) -> Parameters {
        Parameters::default()
    }

    /// Overrides the client's default timeout.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// A canned result returned instead of hitting the network.
    fn mock(&self) -> Option<Result<Self::Response, ApiError>> {
        None
    }

    /// Merge this request with `defaults`.
    fn resolve(&self, defaults: &RequestDefaults) -> ResolvedRequest
    where
        Self: Sized,
    {
        resolve(self, defaults)
    }
}

/// Immutable, concrete `ApiRequest` decoding into `R`.
pub struct RequestSpec<R> {
    base_url: Option<Url>,
    path: String,
    query_items: Vec<QueryItem>,
    method: Option<HttpMethod>,
    headers: Headers,
    parameters: Parameters,
    timeout: Option<Duration>,
    mock: Option<Result<R, ApiError>>,
    _response: PhantomData<fn() -> R>,
}

impl<R> RequestSpec<R> {
    /// A request for `path` with every other member unset.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            base_url: None,
            path: path.into(),
            query_items: Vec::new(),
            method: None,
            headers: Headers::new(),
            parameters: Parameters::default(),
            timeout: None,
            mock: None,
            _response: PhantomData,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(path).method(HttpMethod::Get)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(path).method(HttpMethod::Post)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(path).method(HttpMethod::Put)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(path).method(HttpMethod::Delete)
    }

    pub fn base_url(mut self, url: Url) -> Self {
        self.base_url = Some(url);
        self
    }

    pub fn method(mut self, method: HttpMethod) -> Self {
        self.method = Some(method);
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_items.push(QueryItem::new(name, value));
        self
    }

    pub fn query_item(mut self, item: QueryItem) -> Self {
        self.query_items.push(item);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(name, value);
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn mock(mut self, result: Result<R, ApiError>) -> Self {
        self.mock = Some(result);
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn has_mock(&self) -> bool {
        self.mock.is_some()
    }
}

impl<R> RequestSpec<R>
where
    R: DeserializeOwned + Clone + Send + 'static,
{
    /// Snapshot every member of another request with the same response type.
    pub fn from_request<Q>(request: &Q) -> Self
    where
        Q: ApiRequest<Response = R>,
    {
        Self {
            base_url: request.base_url(),
            path: request.path(),
            query_items: request.query_items(),
            method: request.method(),
            headers: request.headers(),
            parameters: request.parameters(),
            timeout: request.timeout(),
            mock: request.mock(),
            _response: PhantomData,
        }
    }
}

impl<R: Clone> Clone for RequestSpec<R> {
    fn clone(&self) -> Self {
        Self {
            base_url: self.base_url.clone(),
            path: self.path.clone(),
            query_items: self.query_items.clone(),
            method: self.method,
            headers: self.headers.clone(),
            parameters: self.parameters.clone(),
            timeout: self.timeout,
            mock: self.mock.clone(),
            _response: PhantomData,
        }
    }
}

impl<R> fmt::Debug for RequestSpec<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSpec")
            .field("base_url", &self.base_url)
            .field("path", &self.path)
            .field("query_items", &self.query_items)
            .field("method", &self.method)
            .field("headers", &self.headers)
            .field("parameters", &self.parameters)
            .field("timeout", &self.timeout)
            .field("mocked", &self.mock.is_some())
            .finish()
    }
}

impl<R> ApiRequest for RequestSpec<R>
where
    R: DeserializeOwned + Clone + Send + 'static,
{
    type Response = R;

    fn path(&self) -> String {
        self.path.clone()
    }

    fn base_url(&self) -> Option<Url> {
        self.base_url.clone()
    }

    fn query_items(&self) -> Vec<QueryItem> {
        self.query_items.clone()
    }

    fn method(&self) -> Option<HttpMethod> {
        self.method
    }

    fn headers(&self) -> Headers {
        self.headers.clone()
    }

    fn parameters(&self) -> Parameters {
        self.parameters.clone()
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn mock(&self) -> Option<Result<R, ApiError>> {
        self.mock.clone()
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    struct Empty {}

    struct Minimal;

    impl ApiRequest for Minimal {
        type Response = Empty;

        fn path(&self) -> String {
            "/".to_string()
        }
    }

    struct Custom;

    impl ApiRequest for Custom {
        type Response = Empty;

        fn path(&self) -> String {
            "/test".to_string()
        }

        fn base_url(&self) -> Option<Url> {
            Some(Url::parse("https://example.com").unwrap())
        }

        fn method(&self) -> Option<HttpMethod> {
            Some(HttpMethod::Post)
        }

        fn headers(&self) -> Headers {
            Headers::new().with("Authorization", "token")
        }

        fn parameters(&self) -> Parameters {
            Parameters::url_encoded([("key", "value")])
        }

        fn query_items(&self) -> Vec<QueryItem> {
            vec![QueryItem::new("key", "value")]
        }

        fn timeout(&self) -> Option<Duration> {
            Some(Duration::from_secs(5))
        }

        fn mock(&self) -> Option<Result<Empty, ApiError>> {
            Some(Ok(Empty {}))
        }
    }

    #[test]
    fn trait_members_default_to_unset() {
        let request = Minimal;
        assert_eq!(request.base_url(), None);
        assert_eq!(request.path(), "/");
        assert_eq!(request.method(), None);
        assert_eq!(request.parameters(), Parameters::default());
        assert!(request.query_items().is_empty());
        assert_eq!(request.timeout(), None);
        assert!(request.headers().is_empty());
        assert!(request.mock().is_none());
    }

    #[test]
    fn from_request_snapshots_every_member() {
        let original = Custom;
        let erased = RequestSpec::from_request(&original);
        assert_eq!(ApiRequest::base_url(&erased), original.base_url());
        assert_eq!(ApiRequest::path(&erased), original.path());
        assert_eq!(ApiRequest::method(&erased), original.method());
        assert_eq!(ApiRequest::headers(&erased), original.headers());
        assert_eq!(ApiRequest::parameters(&erased), original.parameters());
        assert_eq!(ApiRequest::query_items(&erased), original.query_items());
        assert_eq!(ApiRequest::timeout(&erased), original.timeout());
        assert!(erased.has_mock());
    }

    #[test]
    fn builder_sets_members() {
        let spec = RequestSpec::<Empty>::post("/jobs")
            .query("a", "1")
            .query("a", "2")
            .header("X-Trace", "on")
            .timeout(Duration::from_secs(3));
        assert_eq!(ApiRequest::method(&spec), Some(HttpMethod::Post));
        assert_eq!(
            ApiRequest::query_items(&spec),
            vec![QueryItem::new("a", "1"), QueryItem::new("a", "2")]
        );
        assert_eq!(ApiRequest::headers(&spec).get("x-trace"), Some("on"));
        assert_eq!(ApiRequest::timeout(&spec), Some(Duration::from_secs(3)));
        assert_eq!(spec.path(), "/jobs");
    }
}
