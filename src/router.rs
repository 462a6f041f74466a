//! Dispatches incoming requests to the file cache, the document API or a fallback handler.
//!
//! Every request terminates in exactly one of three outcomes:
//! * a **static file** is served when the request path matches a cached file,
//! * the path starts with the reserved [API_PREFIX](API_PREFIX) and is handled by the
//!   document API,
//! * everything else is delegated to the [FallbackHandler](FallbackHandler) which the
//!   embedder may register via the [Fallback](Fallback) wrapper. The default handler
//!   simply responds with 404.
//!
//! The router itself is a pure request to response function over the current snapshots of
//! the store and the file cache - it keeps no mutable state of its own.
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hyper::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE, LAST_MODIFIED};
use hyper::{Body, Method, Request, Response, StatusCode};
use serde_json::Value;
use std::time::SystemTime;

use crate::files::{CachedFile, FileCache};
use crate::platform::Platform;
use crate::store::query::Directives;
use crate::store::{Store, StoreError};

/// Contains the reserved path prefix of the document API.
///
/// Note that the trailing slash is part of the prefix: `/shdb/json` (without it) is an
/// ordinary path which may resolve to a static file or the fallback handler.
pub const API_PREFIX: &str = "/shdb/json/";

/// Handles all requests which neither match a cached file nor the document API.
///
/// Implement this to attach custom endpoints to the server. The request is passed through
/// unmodified, the handler owns the complete response.
#[async_trait]
pub trait FallbackHandler: Send + Sync {
    /// Computes the response for the given request.
    async fn handle(&self, request: Request<Body>) -> Response<Body>;
}

/// Wraps a fallback handler so that it can be registered on the platform.
///
/// # Example
///
/// ```
/// # use std::sync::Arc;
/// # use async_trait::async_trait;
/// # use hyper::{Body, Request, Response};
/// # use shdb::platform::Platform;
/// # use shdb::router::{Fallback, FallbackHandler};
/// struct Teapot;
///
/// #[async_trait]
/// impl FallbackHandler for Teapot {
///     async fn handle(&self, _request: Request<Body>) -> Response<Body> {
///         let mut response = Response::new(Body::from("I'm a teapot"));
///         *response.status_mut() = hyper::StatusCode::IM_A_TEAPOT;
///         response
///     }
/// }
///
/// let platform = Platform::new();
/// platform.register::<Fallback>(Arc::new(Fallback(Arc::new(Teapot))));
/// ```
pub struct Fallback(
    /// The handler all delegated requests are forwarded to.
    pub Arc<dyn FallbackHandler>,
);

/// Responds with 404 for everything. Used when no custom fallback is registered.
struct NotFoundFallback;

#[async_trait]
impl FallbackHandler for NotFoundFallback {
    async fn handle(&self, _request: Request<Body>) -> Response<Body> {
        empty_response(StatusCode::NOT_FOUND)
    }
}

/// Routes requests to the appropriate handler.
pub struct Router {
    store: Arc<Store>,
    files: Arc<FileCache>,
    fallback: Arc<dyn FallbackHandler>,
}

impl Router {
    /// Creates a router from the services registered on the given platform.
    ///
    /// Requires the [Store](crate::store::Store) and the
    /// [FileCache](crate::files::FileCache) to be present. A registered
    /// [Fallback](Fallback) is picked up, otherwise every delegated request yields 404.
    pub fn new(platform: &Arc<Platform>) -> Self {
        Router {
            store: platform.require::<Store>(),
            files: platform.require::<FileCache>(),
            fallback: platform
                .find::<Fallback>()
                .map(|fallback| fallback.0.clone())
                .unwrap_or_else(|| Arc::new(NotFoundFallback)),
        }
    }

    /// Computes the response for the given request.
    pub async fn dispatch(&self, request: Request<Body>) -> Response<Body> {
        let path = request.uri().path();

        if request.method() == Method::GET {
            if let Some(file) = self.files.lookup(path) {
                return static_response(&file);
            }
        }

        if path.starts_with(API_PREFIX) {
            self.api(request).await
        } else {
            self.fallback.handle(request).await
        }
    }

    /// Handles a request below the reserved API prefix.
    async fn api(&self, request: Request<Body>) -> Response<Body> {
        let path = request.uri().path()[API_PREFIX.len()..].to_owned();
        let segments: Vec<&str> = path.split('/').filter(|part| !part.is_empty()).collect();
        let query = request.uri().query().unwrap_or("").to_owned();

        match request.method() {
            &Method::GET => match segments.as_slice() {
                [] => json_response(StatusCode::OK, &self.store.root()),
                [collection] => self.read_collection(collection, &query),
                [collection, id] => match self.store.record(collection, id) {
                    Some(record) => json_response(StatusCode::OK, &record),
                    None => empty_response(StatusCode::NOT_FOUND),
                },
                _ => empty_response(StatusCode::NOT_FOUND),
            },
            &Method::POST => match segments.as_slice() {
                [collection] => {
                    let collection = collection.to_string();
                    match read_json_body(request).await {
                        Ok(record) => match self.store.insert(&collection, record).await {
                            Ok(stored) => json_response(StatusCode::CREATED, &stored),
                            Err(error) => error_response(error),
                        },
                        Err(_) => empty_response(StatusCode::BAD_REQUEST),
                    }
                }
                _ => empty_response(StatusCode::NOT_FOUND),
            },
            &Method::PUT => match segments.as_slice() {
                [collection, id] => {
                    let collection = collection.to_string();
                    let id = id.to_string();
                    match read_json_body(request).await {
                        Ok(record) => match self.store.update(&collection, &id, record).await {
                            Ok(stored) => json_response(StatusCode::OK, &stored),
                            Err(error) => error_response(error),
                        },
                        Err(_) => empty_response(StatusCode::BAD_REQUEST),
                    }
                }
                _ => empty_response(StatusCode::NOT_FOUND),
            },
            &Method::DELETE => match segments.as_slice() {
                [collection, id] => match self.store.delete(collection, id).await {
                    Ok(()) => empty_response(StatusCode::OK),
                    Err(error) => error_response(error),
                },
                _ => empty_response(StatusCode::NOT_FOUND),
            },
            _ => empty_response(StatusCode::METHOD_NOT_ALLOWED),
        }
    }

    /// Serves a whole collection, applying the query directives if the collection is a
    /// list of records.
    fn read_collection(&self, name: &str, query: &str) -> Response<Body> {
        match self.store.collection(name) {
            Some(value) => {
                if let Some(records) = value.as_array() {
                    let result = Directives::parse(query).apply(records);
                    json_response(StatusCode::OK, &Value::Array(result))
                } else {
                    // A scalar top level entry is served as is, directives don't apply...
                    json_response(StatusCode::OK, &value)
                }
            }
            None => empty_response(StatusCode::NOT_FOUND),
        }
    }
}

/// Reads and parses the JSON body of a write request.
async fn read_json_body(request: Request<Body>) -> anyhow::Result<Value> {
    let bytes = hyper::body::to_bytes(request.into_body()).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Builds the response for a cache hit.
fn static_response(file: &CachedFile) -> Response<Body> {
    let mut response = Response::new(Body::from(file.data.clone()));
    let headers = response.headers_mut();
    let _ = headers.insert(CONTENT_TYPE, HeaderValue::from_static(file.content_type));
    let _ = headers.insert(
        "X-Content-Type-Options",
        HeaderValue::from_static("nosniff"),
    );
    let _ = headers.insert(
        CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=31536000, immutable"),
    );
    if let Ok(value) = HeaderValue::from_str(&http_date(file.last_modified)) {
        let _ = headers.insert(LAST_MODIFIED, value);
    }

    response
}

/// Formats a timestamp as an HTTP date (e.g. `Wed, 21 Oct 2015 07:28:00 GMT`).
fn http_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// Builds a JSON response with the given status.
fn json_response(status: StatusCode, value: &Value) -> Response<Body> {
    let mut response = Response::new(Body::from(value.to_string()));
    *response.status_mut() = status;
    let _ = response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/json; charset=utf-8"),
    );

    response
}

/// Builds a response without a body.
fn empty_response(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

/// Maps a store error onto its HTTP representation.
fn error_response(error: StoreError) -> Response<Body> {
    let status = match &error {
        StoreError::UnknownCollection | StoreError::UnknownRecord => StatusCode::NOT_FOUND,
        StoreError::Conflict => StatusCode::CONFLICT,
        StoreError::MissingId => StatusCode::BAD_REQUEST,
        StoreError::Storage(_) => {
            log::error!("{}", error);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };

    empty_response(status)
}
