//! API key authentication middleware
//!
//! Accepts the key as `X-API-Key: <key>` or `Authorization: Bearer <key>`.
//! With no key configured every request passes.

use crate::error::BgRemovalError;
use axum::{
    body::Body,
    http::{header::AUTHORIZATION, HeaderMap, HeaderValue, Request},
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use std::{
    sync::Arc,
    task::{Context, Poll},
};
use tower::{Layer, Service};
use tracing::warn;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Authentication layer
#[derive(Debug, Clone)]
pub struct AuthLayer {
    api_key: Option<Arc<str>>,
}

impl AuthLayer {
    #[must_use]
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key: api_key.filter(|k| !k.is_empty()).map(Arc::from),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthMiddleware {
            inner,
            api_key: self.api_key.clone(),
        }
    }
}

/// Authentication middleware service
#[derive(Debug, Clone)]
pub struct AuthMiddleware<S> {
    inner: S,
    api_key: Option<Arc<str>>,
}

/// Key presented by the client, if any
fn presented_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(key) = headers.get(API_KEY_HEADER).and_then(|h| h.to_str().ok()) {
        return Some(key.trim());
    }

    headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
}

impl<S> Service<Request<Body>> for AuthMiddleware<S>
where
    S: Service<Request<Body>, Response = Response> + Send + Clone + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let Some(expected) = self.api_key.as_deref() else {
            return Box::pin(self.inner.call(request));
        };

        match presented_key(request.headers()) {
            Some(key) if key == expected => Box::pin(self.inner.call(request)),
            Some(_) => {
                warn!(path = %request.uri().path(), "Invalid API key provided");
                Box::pin(async move { Ok(unauthorized_response()) })
            },
            None => {
                warn!(path = %request.uri().path(), "No API key provided");
                Box::pin(async move { Ok(unauthorized_response()) })
            },
        }
    }
}

fn unauthorized_response() -> Response {
    let mut response =
        BgRemovalError::Unauthorized("Invalid or missing API Key".to_string()).into_response();
    if let Ok(value) = HeaderValue::from_str(&uuid::Uuid::new_v4().to_string()) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}
