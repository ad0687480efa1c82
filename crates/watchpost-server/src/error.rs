use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::Value;

/// Uniform JSON body for every API response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached: Option<bool>,
}

impl Envelope {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            cached: None,
        }
    }

    /// Bare acknowledgement with no payload.
    pub fn empty() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
            cached: None,
        }
    }

    pub fn cached(data: Value, hit: bool) -> Self {
        Self {
            cached: Some(hit),
            ..Self::ok(data)
        }
    }

    /// A request that was understood but refused at the domain level
    /// (empty keyword, wrong key). Still answered with 200.
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            cached: None,
        }
    }
}

impl IntoResponse for Envelope {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

/// Failures that end a request before or during handling.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Whitelist, localhost or CORS origin rejection.
    #[error("{0}")]
    PolicyDenied(String),
    #[error("Rate limit exceeded")]
    RateExceeded,
    #[error("Too many failed attempts, IP temporarily banned")]
    Banned,
    #[error("Authentication required")]
    AuthRequired,
    #[error("Invalid API key or session token")]
    AuthInvalid,
    #[error("No route for {method} {path}")]
    RouteNotFound { method: String, path: String },
    #[error("{0:#}")]
    HandlerFailure(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::PolicyDenied(_) => StatusCode::FORBIDDEN,
            ApiError::RateExceeded | ApiError::Banned => StatusCode::TOO_MANY_REQUESTS,
            ApiError::AuthRequired | ApiError::AuthInvalid => StatusCode::UNAUTHORIZED,
            ApiError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::HandlerFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable label used in audit entries.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::PolicyDenied(_) => "policy_denied",
            ApiError::RateExceeded => "rate_exceeded",
            ApiError::Banned => "banned",
            ApiError::AuthRequired => "auth_required",
            ApiError::AuthInvalid => "auth_invalid",
            ApiError::RouteNotFound { .. } => "route_not_found",
            ApiError::HandlerFailure(_) => "handler_failure",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::HandlerFailure(ref e) = self {
            tracing::error!(error = %format!("{e:#}"), "handler failure");
        }
        (self.status(), Envelope::rejected(self.to_string())).into_response()
    }
}
