//! Error types for request dispatch and route registration.
//!
//! Every failure a request can hit is a [`DispatchError`]. Its [`ErrorClass`]
//! decides the HTTP status and whether the caller sees the detail: client-class
//! errors name the offending field, server-class errors are logged in full and
//! reported opaquely.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use handled::Handle;
use serde_json::json;

use crate::config::Method;
use crate::sink::PublishError;
use crate::template::{RenderError, TemplateSyntaxError};

/// Why the credential gate refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// No credential header was sent.
    MissingCredential,
    /// A credential was sent but does not match the configured secret.
    InvalidCredential,
}

impl std::fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingCredential => write!(
                f,
                "Missing API key. Include 'X-API-Key' header with your request."
            ),
            Self::InvalidCredential => write!(f, "Invalid API key"),
        }
    }
}

impl std::error::Error for AuthFailure {}

/// The coarse class of a dispatch failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Missing or mismatched credential.
    Auth,
    /// Malformed request.
    Client,
    /// Well-formed request with unacceptable values.
    Semantic,
    /// Fault on our side or the broker's.
    Server,
}

/// Errors that end a request's dispatch pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchError {
    /// The credential gate refused the request.
    Unauthorized(AuthFailure),
    /// A required parameter is missing or the body is unusable.
    BadRequest(String),
    /// A parameter value failed conversion, enum or bounds checks.
    UnprocessableParameter {
        /// The offending parameter.
        field: String,
        /// What is wrong with it.
        message: String,
    },
    /// Topic or payload rendering failed, or the payload is not JSON.
    TemplateRender(RenderError),
    /// The sink could not deliver the message.
    Publish(PublishError),
}

impl DispatchError {
    /// The class this error belongs to.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Unauthorized(_) => ErrorClass::Auth,
            Self::BadRequest(_) => ErrorClass::Client,
            Self::UnprocessableParameter { .. } => ErrorClass::Semantic,
            Self::TemplateRender(_) | Self::Publish(_) => ErrorClass::Server,
        }
    }

    /// The HTTP status reported for this error.
    pub fn status(&self) -> StatusCode {
        match self.class() {
            ErrorClass::Auth => StatusCode::UNAUTHORIZED,
            ErrorClass::Client => StatusCode::BAD_REQUEST,
            ErrorClass::Semantic => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorClass::Server => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unauthorized(failure) => write!(f, "Unauthorized: {}", failure),
            Self::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            Self::UnprocessableParameter { field, message } => {
                write!(f, "Invalid parameter '{}': {}", field, message)
            }
            Self::TemplateRender(e) => write!(f, "Template render error: {}", e),
            Self::Publish(e) => write!(f, "Publish error: {}", e),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<AuthFailure> for DispatchError {
    fn from(failure: AuthFailure) -> Self {
        Self::Unauthorized(failure)
    }
}

impl From<RenderError> for DispatchError {
    fn from(e: RenderError) -> Self {
        Self::TemplateRender(e)
    }
}

impl From<PublishError> for DispatchError {
    fn from(e: PublishError) -> Self {
        Self::Publish(e)
    }
}

/// The message a caller is allowed to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMessage {
    /// The detail text for the response body.
    pub detail: String,
}

impl std::fmt::Display for ClientMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.detail)
    }
}

impl Handle<ClientMessage> for DispatchError {
    fn handle(&self) -> Option<ClientMessage> {
        let detail = match self {
            Self::Unauthorized(failure) => failure.to_string(),
            Self::BadRequest(msg) => msg.clone(),
            Self::UnprocessableParameter { field, message } => {
                format!("Invalid value for '{}': {}", field, message)
            }
            Self::TemplateRender(_) => "internal error".to_string(),
            Self::Publish(_) => "failed to publish message".to_string(),
        };
        Some(ClientMessage { detail })
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = self
            .handle()
            .map(|message| message.detail)
            .unwrap_or_else(|| "internal error".to_string());
        let mut response = (status, Json(json!({ "detail": detail }))).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("ApiKey"));
        }
        response
    }
}

/// Errors that can occur while compiling routes into a router.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistrationError {
    /// Two routes share a method and path shape.
    DuplicateRoute {
        /// The shared method.
        method: Method,
        /// The path of the route registered first.
        first: String,
        /// The path of the conflicting route.
        second: String,
    },
    /// Two routes share a path shape but spell its placeholders differently.
    ConflictingPlaceholders {
        /// The path registered first.
        first: String,
        /// The conflicting path.
        second: String,
    },
    /// A path placeholder that does not span a whole segment.
    UnsupportedPath {
        /// The route label, e.g. `POST /v1/x`.
        route: String,
    },
    /// One route's templates failed to parse.
    InvalidTemplate {
        /// The route label, e.g. `POST /v1/x`.
        route: String,
        /// Which template failed, `topic` or `payload`.
        template: &'static str,
        /// The parse error.
        error: TemplateSyntaxError,
    },
}

impl std::fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateRoute {
                method,
                first,
                second,
            } => write!(
                f,
                "Duplicate route: {} {} conflicts with {} {}",
                method, second, method, first
            ),
            Self::ConflictingPlaceholders { first, second } => write!(
                f,
                "Path {} spells the placeholders of {} differently",
                second, first
            ),
            Self::UnsupportedPath { route } => write!(
                f,
                "Route {} has a placeholder that is not a whole path segment",
                route
            ),
            Self::InvalidTemplate {
                route,
                template,
                error,
            } => write!(f, "Route {} has an invalid {} template: {}", route, template, error),
        }
    }
}

impl std::error::Error for RegistrationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_per_class() {
        assert_eq!(
            DispatchError::Unauthorized(AuthFailure::MissingCredential).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            DispatchError::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            DispatchError::UnprocessableParameter {
                field: "scene".into(),
                message: "bad".into()
            }
            .status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            DispatchError::TemplateRender(RenderError::DivisionByZero).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            DispatchError::Publish(PublishError::NotConnected).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn server_errors_are_opaque() {
        let error = DispatchError::TemplateRender(RenderError::MissingPlaceholder {
            name: "secret_field".into(),
        });
        let message = error.handle().unwrap();
        assert_eq!(message.detail, "internal error");
        assert!(!message.detail.contains("secret_field"));

        let error = DispatchError::Publish(PublishError::Rejected("broker details".into()));
        assert_eq!(error.handle().unwrap().detail, "failed to publish message");
    }

    #[test]
    fn client_errors_name_the_field() {
        let error = DispatchError::UnprocessableParameter {
            field: "scene".into(),
            message: "must be one of [\"morning\", \"evening\"]".into(),
        };
        assert!(error.handle().unwrap().detail.contains("scene"));
        assert_eq!(error.class(), ErrorClass::Semantic);
    }

    #[test]
    fn unauthorized_response_carries_challenge() {
        let response =
            DispatchError::Unauthorized(AuthFailure::InvalidCredential).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
            "ApiKey"
        );
    }

    #[test]
    fn missing_credential_message() {
        assert_eq!(
            AuthFailure::MissingCredential.to_string(),
            "Missing API key. Include 'X-API-Key' header with your request."
        );
    }
}
