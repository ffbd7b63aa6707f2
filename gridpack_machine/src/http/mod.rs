//! Endpoint plumbing for the REST façade: the error-to-response mapping
//! and the JSON request/response helpers the route handlers build on.

use hyper::header::CONTENT_TYPE;
use hyper::{Body, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

pub mod routes;

pub type RouterBuilder = routerify::RouterBuilder<Body, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Validation failure or bad precondition.
    #[error("{0:#}")]
    BadRequest(anyhow::Error),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("{0}")]
    NotFound(String),
    #[error("{0:#}")]
    InternalServerError(anyhow::Error),
}

impl ApiError {
    pub fn into_response(self) -> Response<Body> {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        message_response(status, self.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        ApiError::InternalServerError(error)
    }
}

/// `{"message": …}` with the status code; the shape every mutation
/// endpoint answers with.
pub fn message_response(status: StatusCode, message: impl Into<String>) -> Response<Body> {
    let body = serde_json::json!({ "message": message.into() });
    json_body(status, &body)
}

pub fn json_response<T: Serialize>(
    status: StatusCode,
    value: T,
) -> Result<Response<Body>, ApiError> {
    let body = serde_json::to_value(value)
        .map_err(|e| ApiError::InternalServerError(e.into()))?;
    Ok(json_body(status, &body))
}

fn json_body(status: StatusCode, body: &serde_json::Value) -> Response<Body> {
    let rendered = serde_json::to_string_pretty(body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Body::from(rendered))
        .expect("building a response out of static parts cannot fail")
}

pub fn plain_text_response(text: String) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(text))
        .expect("building a response out of static parts cannot fail")
}

pub async fn json_request<T: DeserializeOwned>(request: &mut Request<Body>) -> Result<T, ApiError> {
    let body = hyper::body::to_bytes(request.body_mut())
        .await
        .map_err(|e| ApiError::BadRequest(e.into()))?;
    serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.into()))
}

/// Routerify surfaces handler errors as opaque boxes; unwrap ours back.
pub async fn route_error_handler(error: routerify::RouteError) -> Response<Body> {
    match error.downcast::<ApiError>() {
        Ok(api_error) => api_error.into_response(),
        Err(other) => {
            error!("unexpected routing error: {other}");
            message_response(StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
        }
    }
}
