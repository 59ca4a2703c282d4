//! # Request Dispatch
//!
//! One request runs one strictly sequential pipeline:
//!
//! ```text
//! received -> authenticated -> resolved -> topic rendered -> payload rendered
//!          -> JSON validated -> published
//! ```
//!
//! Each step can end the request with a [`DispatchError`]. Nothing is published
//! unless every earlier step succeeded, and the body is not touched until the
//! credential gate has passed.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    http::HeaderValue,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::app::BridgeContext;
use crate::config::{ParamLocation, RouteDescriptor};
use crate::errors::{DispatchError, ErrorClass, RegistrationError};
use crate::params::{self, RawParameters};
use crate::template::{PayloadTemplate, TopicTemplate};

/// A route with its templates parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRoute {
    /// The route as configured.
    pub descriptor: RouteDescriptor,
    /// The parsed topic template.
    pub topic: TopicTemplate,
    /// The parsed payload template.
    pub payload: PayloadTemplate,
}

impl CompiledRoute {
    /// Parse both templates of `descriptor`.
    pub fn compile(descriptor: RouteDescriptor) -> Result<Self, RegistrationError> {
        let topic = TopicTemplate::parse(&descriptor.topic_template).map_err(|error| {
            RegistrationError::InvalidTemplate {
                route: descriptor.label(),
                template: "topic",
                error,
            }
        })?;
        let payload = PayloadTemplate::parse(&descriptor.payload_template).map_err(|error| {
            RegistrationError::InvalidTemplate {
                route: descriptor.label(),
                template: "payload",
                error,
            }
        })?;

        for name in topic.placeholders() {
            if descriptor.parameter(name).is_none() {
                tracing::warn!(
                    route = %descriptor.label(),
                    placeholder = name,
                    "topic placeholder names no declared parameter"
                );
            }
        }

        Ok(Self {
            descriptor,
            topic,
            payload,
        })
    }

    /// Whether dispatch needs to read the request body.
    pub fn needs_body(&self) -> bool {
        self.descriptor
            .parameters_at(ParamLocation::Body)
            .next()
            .is_some()
    }
}

/// The raw request as the dispatcher sees it.
#[derive(Debug, Default)]
pub struct InboundRequest {
    /// Segments matched by the route's path pattern.
    pub path_params: HashMap<String, String>,
    /// Query string key-values.
    pub query: HashMap<String, String>,
    /// The `X-API-Key` header, if sent, as raw bytes.
    pub credential: Option<HeaderValue>,
    /// The unread request body.
    pub body: Body,
}

/// The result of a successful dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedMessage {
    /// Always `"published"`.
    pub status: String,
    /// The rendered topic.
    pub topic: String,
    /// The rendered payload, parsed.
    pub payload: Value,
}

/// Run the pipeline for one request against one compiled route.
pub async fn dispatch(
    route: &CompiledRoute,
    context: &BridgeContext,
    request: InboundRequest,
) -> Result<PublishedMessage, DispatchError> {
    let descriptor = &route.descriptor;
    let InboundRequest {
        path_params,
        query,
        credential,
        body,
    } = request;

    context
        .auth()
        .check(credential.as_ref().map(HeaderValue::as_bytes))?;

    let body = if route.needs_body() {
        let bytes = axum::body::to_bytes(body, context.max_body_bytes())
            .await
            .map_err(|e| {
                DispatchError::BadRequest(format!(
                    "Request body could not be read (limit {} bytes): {}",
                    context.max_body_bytes(),
                    e
                ))
            })?;
        Some(bytes)
    } else {
        None
    };

    let raw = RawParameters {
        path: path_params,
        query,
        body,
    };
    let resolved = params::resolve(descriptor, &raw)?;
    tracing::debug!(route = %descriptor.label(), parameters = %resolved, "resolved parameters");

    let topic = route.topic.render(resolved.as_map())?;
    let (text, payload) = route.payload.render_json(resolved.as_map())?;
    tracing::debug!(route = %descriptor.label(), payload = %text, "rendered payload");

    context
        .sink()
        .publish(&topic, text.as_bytes(), descriptor.qos, descriptor.retain)
        .await?;
    tracing::info!(
        route = %descriptor.label(),
        topic = %topic,
        qos = u8::from(descriptor.qos),
        retain = descriptor.retain,
        "published message"
    );

    Ok(PublishedMessage {
        status: "published".to_string(),
        topic,
        payload,
    })
}

/// A handler bound to exactly one compiled route.
#[derive(Debug, Clone)]
pub struct RouteHandler {
    route: Arc<CompiledRoute>,
    context: Arc<BridgeContext>,
}

impl RouteHandler {
    /// Bind `route` to the shared application context.
    pub fn new(route: Arc<CompiledRoute>, context: Arc<BridgeContext>) -> Self {
        Self { route, context }
    }

    /// The route this handler serves.
    pub fn route(&self) -> &CompiledRoute {
        &self.route
    }

    /// Dispatch `request` and turn the outcome into an HTTP response.
    pub async fn handle(&self, request: InboundRequest) -> Response {
        match dispatch(&self.route, &self.context, request).await {
            Ok(message) => Json(message).into_response(),
            Err(error) => {
                let label = self.route.descriptor.label();
                match error.class() {
                    ErrorClass::Server => {
                        tracing::error!(route = %label, error = %error, "request failed");
                    }
                    ErrorClass::Auth | ErrorClass::Client | ErrorClass::Semantic => {
                        tracing::warn!(route = %label, error = %error, "request rejected");
                    }
                }
                error.into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use axum::body::Bytes;
    use axum::http::StatusCode;
    use serde_json::json;

    use super::*;
    use crate::auth::ApiKeyGate;
    use crate::config::{BrokerConfig, Config, Method, ParamType, ParameterSchema};
    use crate::errors::AuthFailure;
    use crate::sink::{InMemorySink, PublishError};
    use crate::template::RenderError;

    fn context_with(sink: Arc<InMemorySink>, gate: ApiKeyGate) -> BridgeContext {
        BridgeContext::new(Config::new(BrokerConfig::new("localhost"), Vec::new()), sink)
            .with_auth(gate)
    }

    fn compiled(descriptor: RouteDescriptor) -> CompiledRoute {
        CompiledRoute::compile(descriptor).unwrap()
    }

    fn simple_route() -> CompiledRoute {
        compiled(
            RouteDescriptor::new(
                "/v1/test/simple",
                "test/simple",
                r#"{"message":"{{message}}","timestamp":"{{now()}}"}"#,
            )
            .with_parameter(ParameterSchema::new("message", ParamType::String)),
        )
    }

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn publishes_rendered_message() {
        let sink = Arc::new(InMemorySink::new());
        let context = context_with(Arc::clone(&sink), ApiKeyGate::disabled());
        let request = InboundRequest {
            query: query(&[("message", "hello")]),
            ..Default::default()
        };

        let message = dispatch(&simple_route(), &context, request).await.unwrap();
        assert_eq!(message.status, "published");
        assert_eq!(message.topic, "test/simple");
        assert_eq!(message.payload["message"], json!("hello"));
        assert!(message.payload.get("timestamp").is_some());

        let published = sink.published();
        assert_eq!(published.len(), 1);
        let payload: Value = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(payload, message.payload);
    }

    #[tokio::test]
    async fn body_is_not_read_before_auth() {
        let sink = Arc::new(InMemorySink::new());
        let context = context_with(Arc::clone(&sink), ApiKeyGate::new(Some("k".into())));
        let route = compiled(
            RouteDescriptor::new("/t", "t", r#"{"a": "{{ a }}"}"#)
                .with_parameter(
                    ParameterSchema::new("a", ParamType::String).at(ParamLocation::Body),
                ),
        );

        let polled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&polled);
        let stream = futures::stream::once(async move {
            flag.store(true, Ordering::SeqCst);
            Ok::<_, std::io::Error>(Bytes::from_static(br#"{"a": "x"}"#))
        });
        let request = InboundRequest {
            body: Body::from_stream(stream),
            ..Default::default()
        };

        let error = dispatch(&route, &context, request).await.unwrap_err();
        assert_eq!(
            error,
            DispatchError::Unauthorized(AuthFailure::MissingCredential)
        );
        assert!(!polled.load(Ordering::SeqCst));
        assert!(sink.published().is_empty());
    }

    #[tokio::test]
    async fn enum_violation_publishes_nothing() {
        let sink = Arc::new(InMemorySink::new());
        let context = context_with(Arc::clone(&sink), ApiKeyGate::disabled());
        let route = compiled(
            RouteDescriptor::new("/v1/scene", "scenes/activate", r#"{"scene": "{{ scene }}"}"#)
                .with_method(Method::Get)
                .with_parameter(
                    ParameterSchema::new("scene", ParamType::String).one_of(["morning", "evening"]),
                ),
        );
        let request = InboundRequest {
            query: query(&[("scene", "invalid")]),
            ..Default::default()
        };
        let error = dispatch(&route, &context, request).await.unwrap_err();
        assert_eq!(error.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(sink.published().is_empty());
    }

    #[tokio::test]
    async fn undeclared_topic_placeholder_is_server_error() {
        let sink = Arc::new(InMemorySink::new());
        let context = context_with(Arc::clone(&sink), ApiKeyGate::disabled());
        let route = compiled(RouteDescriptor::new("/t", "dev/{missing}", "{}"));
        let error = dispatch(&route, &context, InboundRequest::default())
            .await
            .unwrap_err();
        assert_eq!(
            error,
            DispatchError::TemplateRender(RenderError::MissingPlaceholder {
                name: "missing".into()
            })
        );
        assert!(sink.published().is_empty());
    }

    #[tokio::test]
    async fn invalid_rendered_json_is_server_error() {
        let sink = Arc::new(InMemorySink::new());
        let context = context_with(Arc::clone(&sink), ApiKeyGate::disabled());
        let route = compiled(
            RouteDescriptor::new("/t", "t", r#"{"message": {{ message }}}"#)
                .with_parameter(ParameterSchema::new("message", ParamType::String)),
        );
        let request = InboundRequest {
            query: query(&[("message", "hello")]),
            ..Default::default()
        };
        let error = dispatch(&route, &context, request).await.unwrap_err();
        assert!(matches!(
            error,
            DispatchError::TemplateRender(RenderError::InvalidJson { .. })
        ));
        assert_eq!(error.class(), ErrorClass::Server);
        assert!(sink.published().is_empty());
    }

    #[tokio::test]
    async fn disconnected_sink_is_publish_error() {
        let sink = Arc::new(InMemorySink::new());
        sink.set_connected(false);
        let context = context_with(Arc::clone(&sink), ApiKeyGate::disabled());
        let request = InboundRequest {
            query: query(&[("message", "hello")]),
            ..Default::default()
        };
        let error = dispatch(&simple_route(), &context, request).await.unwrap_err();
        assert_eq!(error, DispatchError::Publish(PublishError::NotConnected));
    }

    #[tokio::test]
    async fn oversized_body_is_bad_request() {
        let sink = Arc::new(InMemorySink::new());
        let mut config = Config::new(BrokerConfig::new("localhost"), Vec::new());
        config.server.max_body_bytes = 8;
        let context = BridgeContext::new(config, sink).with_auth(ApiKeyGate::disabled());
        let route = compiled(
            RouteDescriptor::new("/t", "t", r#"{"a": "{{ a }}"}"#)
                .with_parameter(
                    ParameterSchema::new("a", ParamType::String).at(ParamLocation::Body),
                ),
        );
        let request = InboundRequest {
            body: Body::from(r#"{"a": "far too long for the limit"}"#),
            ..Default::default()
        };
        let error = dispatch(&route, &context, request).await.unwrap_err();
        assert!(matches!(error, DispatchError::BadRequest(_)));
    }

    #[tokio::test]
    async fn handler_renders_error_body() {
        let sink = Arc::new(InMemorySink::new());
        let context = Arc::new(context_with(sink, ApiKeyGate::disabled()));
        let handler = RouteHandler::new(Arc::new(simple_route()), context);
        let response = handler.handle(InboundRequest::default()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body, json!({"detail": "Missing required parameter: message"}));
    }

    #[test]
    fn invalid_payload_template_fails_compile() {
        let result = CompiledRoute::compile(RouteDescriptor::new("/t", "t", "{% if %}"));
        assert!(matches!(
            result,
            Err(RegistrationError::InvalidTemplate {
                template: "payload",
                ..
            })
        ));
    }
}
