//! # Webhook Bridge: HTTP Endpoints that Publish to MQTT
//!
//! The bridge serves a set of HTTP endpoints described entirely by configuration.
//! Each endpoint maps its request onto one MQTT message: the request's path,
//! query and body values are resolved against a parameter schema, rendered into
//! a topic and a JSON payload, and published to the broker.
//!
//! This crate provides:
//!
//! - **Declarative Routes**: a YAML document lists every endpoint with its method,
//!   parameter schema, topic template and payload template
//! - **Parameter Resolution**: typed, validated values from path, query and body,
//!   with defaults, enum membership and numeric bounds
//! - **Templates**: `{name}` substitution for topics and a small, sandboxed
//!   template language for payloads whose output is checked to be valid JSON
//! - **Pluggable Publishing**: a `PublishSink` trait with an MQTT implementation
//!   and an in-memory one for tests
//! - **API Key Authentication**: an optional shared secret checked before any
//!   request input is read
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ HTTP Layer (Axum router, one handler    │
//! │ per configured route)                   │
//! ├─────────────────────────────────────────┤
//! │ Dispatch (auth → resolve → render →     │
//! │ validate JSON → publish)                │
//! ├─────────────────────────────────────────┤
//! │ Templates (topic + payload renderers)   │
//! ├─────────────────────────────────────────┤
//! │ Publish Sink (MQTT or in-memory)        │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Usage Example
//!
//! ```rust
//! # use std::sync::Arc;
//! # use webhook_bridge::{BridgeContext, Config, InMemorySink, create_bridge_router};
//! let config = Config::from_yaml_str(r#"
//! mqtt:
//!   broker: "localhost"
//! routes:
//!   - path: "/v1/room/{room}/light"
//!     method: PUT
//!     mqtt_topic: "home/{room}/light/set"
//!     parameters:
//!       - name: room
//!         type: string
//!         location: path
//!       - name: power
//!         type: boolean
//!         location: body
//!     payload_template: '{"on": {{ power }}}'
//! "#).unwrap();
//!
//! let sink = Arc::new(InMemorySink::new());
//! let context = Arc::new(BridgeContext::new(config, sink));
//! let router = create_bridge_router(context).unwrap();
//! # let _ = router;
//! ```

#![deny(missing_docs)]

mod app;
mod auth;
mod config;
mod dispatch;
mod errors;
mod params;
mod router;
mod sink;

/// Command-line helpers shared by the bridge binaries.
///
/// Error and usage exits, and locating the configuration file.
pub mod cli_utils;

/// Payload and topic templates.
///
/// See [`PayloadTemplate`] for the template language.
pub mod template;

pub use app::BridgeContext;
pub use auth::{API_KEY_HEADER, ApiKeyGate};
pub use config::{
    AuthConfig, BrokerConfig, Config, ConfigError, Method, ParamLocation, ParamType,
    ParameterSchema, Qos, RouteDescriptor, ServerConfig, placeholders,
};
pub use dispatch::{CompiledRoute, InboundRequest, PublishedMessage, RouteHandler, dispatch};
pub use errors::{AuthFailure, ClientMessage, DispatchError, ErrorClass, RegistrationError};
pub use params::{RawParameters, ResolvedParameterSet, resolve};
pub use router::{SERVICE_NAME, compile_routes, create_bridge_router};
pub use sink::{InMemorySink, MqttSink, PublishError, PublishSink, RecordedPublish};
pub use template::{PayloadTemplate, RenderError, TemplateSyntaxError, TopicTemplate};
