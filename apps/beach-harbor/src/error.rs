use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Failures between the broker and a connected server instance.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("no server instance is connected")]
    NoInstance,
    #[error("a server instance is already connected")]
    AlreadyConnected,
    #[error("server instance went away")]
    InstanceGone,
    #[error("server instance did not reply in time")]
    Timeout,
    #[error("server instance reported: {0}")]
    Instance(String),
    #[error("requested url unavailable: {0}")]
    UrlUnavailable(String),
    #[error("client went away")]
    ClientGone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub error: &'static str,
    pub description: &'static str,
}

#[derive(Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    description: &'a str,
}

impl ApiError {
    pub const fn new(status: StatusCode, error: &'static str, description: &'static str) -> Self {
        Self {
            status,
            error,
            description,
        }
    }

    pub fn no_pending() -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "No pending session found",
            "Make sure a server is waiting for you before connecting.",
        )
    }

    pub fn invalid_token() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "Invalid Session Token",
            "Your session token is invalid. Please try again.",
        )
    }

    pub fn expired_token() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "Expired Session Token",
            "Your session token is expired. Please try again.",
        )
    }

    pub fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "Unauthorized",
            "This server requires a username and password.",
        )
    }

    pub fn method_not_allowed() -> Self {
        Self::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "Method Not Allowed",
            "Only GET and POST are supported.",
        )
    }

    pub fn queue_full() -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "Client queue is full",
            "Too many clients are currently queued to connect. Please try again later.",
        )
    }

    pub fn conflict() -> Self {
        Self::new(StatusCode::CONFLICT, "Session already exists", "Please try again later.")
    }

    pub fn internal(error: &'static str) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, error, "Please try again later.")
    }

    pub fn bad_request(error: &'static str, description: &'static str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error, description)
    }

    /// JSON body for API callers, an HTML page for browsers.
    pub fn render(&self, json: bool, page_title: &str) -> Response {
        if json {
            return self.clone().into_response();
        }
        let page = format!(
            "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>{}</title></head>\n<body>\n<h1>{}</h1>\n<p>{}</p>\n</body>\n</html>\n",
            escape_html(page_title),
            escape_html(self.error),
            escape_html(self.description),
        );
        (self.status, Html(page)).into_response()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ApiErrorBody {
                error: self.error,
                description: self.description,
            }),
        )
            .into_response()
    }
}

pub fn wants_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains("application/json"))
}

pub fn no_store() -> [(header::HeaderName, HeaderValue); 1] {
    [(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    )]
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}
