//! Configuration management for the webhook bridge.
//!
//! The bridge is configured by a single YAML document that holds the broker
//! connection block, optional server and auth blocks, and the ordered list of
//! route descriptors.  The document is loaded once at startup and never
//! mutated afterwards.
//!
//! ```rust
//! use webhook_bridge::{Config, Method, ParamLocation, Qos};
//!
//! let config = Config::from_yaml_str(r#"
//! mqtt:
//!   broker: "localhost"
//! routes:
//!   - path: "/v1/device/{device_id}/control"
//!     mqtt_topic: "devices/{device_id}/command"
//!     qos: 1
//!     parameters:
//!       - name: device_id
//!         type: string
//!         location: path
//!     payload_template: '{"device": "{{ device_id }}"}'
//! "#).unwrap();
//!
//! let route = &config.routes[0];
//! assert_eq!(route.method, Method::Post);
//! assert_eq!(route.qos, Qos::AtLeastOnce);
//! assert_eq!(route.parameters[0].location, ParamLocation::Path);
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
});

/// Errors that can occur while loading or validating a configuration document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The configuration file could not be read.
    Io {
        /// The path that failed to load.
        path: String,
        /// The underlying I/O error message.
        message: String,
    },
    /// The document is not valid YAML or does not match the configuration schema.
    Parse(String),
    /// A route violates a structural invariant.
    InvalidRoute {
        /// The offending route, as `METHOD path`.
        route: String,
        /// What is wrong with it.
        message: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, message } => write!(f, "Failed to read {}: {}", path, message),
            Self::Parse(msg) => write!(f, "Invalid configuration: {}", msg),
            Self::InvalidRoute { route, message } => {
                write!(f, "Invalid route {}: {}", route, message)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Declared type of a route parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    /// Free-form text.
    String,
    /// Signed 64-bit integer.
    Integer,
    /// 64-bit float.
    Float,
    /// `true` or `false`.
    Boolean,
}

impl ParamType {
    /// Whether `min`/`max` bounds apply to this type.
    pub const fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::Float)
    }

    /// The lowercase name used in configuration and error messages.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where in the inbound request a parameter is read from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamLocation {
    /// The URL query string.
    #[default]
    Query,
    /// A named segment of the route path.
    Path,
    /// A top-level key of the JSON request body.
    Body,
}

/// HTTP method a route answers to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// GET
    Get,
    /// POST
    #[default]
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
}

impl Method {
    /// The uppercase method name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// MQTT delivery quality of service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Qos {
    /// QoS 0: fire and forget.
    #[default]
    AtMostOnce,
    /// QoS 1: acknowledged delivery.
    AtLeastOnce,
    /// QoS 2: assured single delivery.
    ExactlyOnce,
}

impl TryFrom<u8> for Qos {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            _ => Err(format!("qos must be 0, 1 or 2, got {}", level)),
        }
    }
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

/// Schema for one input field of a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSchema {
    /// Parameter name, unique within its route.
    pub name: String,
    /// Declared type.
    #[serde(rename = "type")]
    pub param_type: ParamType,
    /// Whether the request must supply the parameter.  Required parameters ignore `default`.
    #[serde(default = "default_required")]
    pub required: bool,
    /// Where the value is read from.
    #[serde(default)]
    pub location: ParamLocation,
    /// Allowed values, compared by their string form.
    #[serde(
        default,
        rename = "enum",
        deserialize_with = "deserialize_enum_values",
        skip_serializing_if = "Option::is_none"
    )]
    pub allowed: Option<Vec<String>>,
    /// Inclusive lower bound for integer and float parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Inclusive upper bound for integer and float parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Value used when an optional parameter is not supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ParameterSchema {
    /// Creates a required query parameter of the given type.
    pub fn new(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: true,
            location: ParamLocation::Query,
            allowed: None,
            min: None,
            max: None,
            default: None,
        }
    }

    /// Sets where the parameter is read from.
    pub fn at(mut self, location: ParamLocation) -> Self {
        self.location = location;
        self
    }

    /// Marks the parameter optional with an optional default.
    pub fn optional(mut self, default: Option<Value>) -> Self {
        self.required = false;
        self.default = default;
        self
    }

    /// Restricts the parameter to the given values.
    pub fn one_of<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed = Some(values.into_iter().map(Into::into).collect());
        self
    }

    /// Sets inclusive numeric bounds.
    pub fn bounded(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    /// The default that applies when the parameter is missing, if any.
    pub fn effective_default(&self) -> Option<&Value> {
        if self.required {
            None
        } else {
            self.default.as_ref().filter(|value| !value.is_null())
        }
    }
}

fn default_required() -> bool {
    true
}

fn deserialize_enum_values<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let values: Option<Vec<Value>> = Option::deserialize(deserializer)?;
    values
        .map(|values| {
            values
                .into_iter()
                .map(|value| match value {
                    Value::String(s) => Ok(s),
                    Value::Number(n) => Ok(n.to_string()),
                    Value::Bool(b) => Ok(b.to_string()),
                    other => Err(serde::de::Error::custom(format!(
                        "enum values must be scalars, got {}",
                        other
                    ))),
                })
                .collect()
        })
        .transpose()
}

/// Declarative description of one HTTP endpoint and the message it publishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDescriptor {
    /// Path pattern with `{name}` placeholders.
    pub path: String,
    /// HTTP method.
    #[serde(default)]
    pub method: Method,
    /// Topic with `{name}` placeholders referencing resolved parameters.
    #[serde(rename = "mqtt_topic", alias = "topic_template")]
    pub topic_template: String,
    /// Ordered parameter schema.
    #[serde(default)]
    pub parameters: Vec<ParameterSchema>,
    /// Payload template that must render to JSON.
    pub payload_template: String,
    /// Delivery quality of service.
    #[serde(default)]
    pub qos: Qos,
    /// Whether the broker retains the message.
    #[serde(default)]
    pub retain: bool,
}

impl RouteDescriptor {
    /// Creates a POST route with no parameters, QoS 0 and no retain.
    pub fn new(
        path: impl Into<String>,
        topic_template: impl Into<String>,
        payload_template: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            method: Method::Post,
            topic_template: topic_template.into(),
            parameters: Vec::new(),
            payload_template: payload_template.into(),
            qos: Qos::AtMostOnce,
            retain: false,
        }
    }

    /// Sets the HTTP method.
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Appends a parameter to the schema.
    pub fn with_parameter(mut self, parameter: ParameterSchema) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Sets QoS and retain.
    pub fn with_delivery(mut self, qos: Qos, retain: bool) -> Self {
        self.qos = qos;
        self.retain = retain;
        self
    }

    /// Looks up a parameter by name.
    pub fn parameter(&self, name: &str) -> Option<&ParameterSchema> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Parameters read from the given location, in declaration order.
    pub fn parameters_at(&self, location: ParamLocation) -> impl Iterator<Item = &ParameterSchema> {
        self.parameters
            .iter()
            .filter(move |p| p.location == location)
    }

    /// `METHOD path`, used in logs and errors.
    pub fn label(&self) -> String {
        format!("{} {}", self.method, self.path)
    }

    /// Placeholder names in the path, in order of appearance.
    pub fn path_placeholders(&self) -> Vec<String> {
        placeholders(&self.path)
    }

    /// The path with every placeholder name erased, so `/a/{x}` and `/a/{y}` compare equal.
    pub fn path_shape(&self) -> String {
        PLACEHOLDER.replace_all(&self.path, "{}").into_owned()
    }

    /// Checks the structural invariants of a single route.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::InvalidRoute {
            route: self.label(),
            message,
        };

        if !self.path.starts_with('/') {
            return Err(invalid("path must start with '/'".to_string()));
        }

        let mut seen = HashSet::new();
        for parameter in &self.parameters {
            if !seen.insert(parameter.name.as_str()) {
                return Err(invalid(format!(
                    "parameter '{}' is declared more than once",
                    parameter.name
                )));
            }
            if (parameter.min.is_some() || parameter.max.is_some())
                && !parameter.param_type.is_numeric()
            {
                return Err(invalid(format!(
                    "parameter '{}' has bounds but is of type {}",
                    parameter.name, parameter.param_type
                )));
            }
            if let (Some(min), Some(max)) = (parameter.min, parameter.max)
                && min > max
            {
                return Err(invalid(format!(
                    "parameter '{}' has min {} greater than max {}",
                    parameter.name, min, max
                )));
            }
            if let Some(default) = parameter.effective_default()
                && let Err(message) = crate::params::check_default(parameter, default)
            {
                return Err(invalid(format!(
                    "default for parameter '{}' is invalid: {}",
                    parameter.name, message
                )));
            }
        }

        let placeholders = self.path_placeholders();
        for parameter in self.parameters_at(ParamLocation::Path) {
            if !placeholders.contains(&parameter.name) {
                return Err(invalid(format!(
                    "path parameter '{}' does not appear in the path",
                    parameter.name
                )));
            }
        }
        for placeholder in &placeholders {
            match self.parameter(placeholder) {
                Some(p) if p.location == ParamLocation::Path => {}
                _ => {
                    return Err(invalid(format!(
                        "path placeholder '{{{}}}' has no matching path parameter",
                        placeholder
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker hostname.
    #[serde(alias = "host")]
    pub broker: String,
    /// Broker TCP port.
    #[serde(default = "default_broker_port")]
    pub port: u16,
    /// Optional username.
    #[serde(default)]
    pub username: Option<String>,
    /// Optional password.
    #[serde(default)]
    pub password: Option<String>,
    /// MQTT client identifier.
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Keepalive interval in seconds.
    #[serde(default = "default_keepalive")]
    pub keepalive: u64,
    /// Seconds a QoS 1 or 2 publish waits for the broker's acknowledgement.
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout: u64,
}

impl BrokerConfig {
    /// Settings for a broker at `host` with every other field defaulted.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            broker: host.into(),
            port: default_broker_port(),
            username: None,
            password: None,
            client_id: default_client_id(),
            keepalive: default_keepalive(),
            ack_timeout: default_ack_timeout(),
        }
    }
}

fn default_broker_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "webhook-bridge".to_string()
}

fn default_keepalive() -> u64 {
    60
}

fn default_ack_timeout() -> u64 {
    10
}

/// HTTP listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind host.
    #[serde(default = "default_server_host")]
    pub host: String,
    /// Bind port.
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Largest accepted request body.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    8000
}

fn default_max_body_bytes() -> usize {
    1 << 20
}

/// Credential gate settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Shared secret expected in the `X-API-Key` header.  `None` disables the gate.
    #[serde(default)]
    pub api_key: Option<String>,
}

/// The whole configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Broker connection block.
    pub mqtt: BrokerConfig,
    /// HTTP listener block.
    #[serde(default)]
    pub server: ServerConfig,
    /// Credential gate block.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Routes, in declaration order.
    pub routes: Vec<RouteDescriptor>,
}

impl Config {
    /// Creates a configuration from parts, with default server and auth blocks.
    pub fn new(mqtt: BrokerConfig, routes: Vec<RouteDescriptor>) -> Self {
        Self {
            mqtt,
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            routes,
        }
    }

    /// Parses and validates a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_yml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Checks every route, and that routes sharing a path shape spell their placeholders alike.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut shapes: HashMap<String, &RouteDescriptor> = HashMap::new();
        for route in &self.routes {
            route.validate()?;
            let shape = route.path_shape();
            if let Some(previous) = shapes.get(&shape) {
                if previous.path_placeholders() != route.path_placeholders() {
                    return Err(ConfigError::InvalidRoute {
                        route: route.label(),
                        message: format!(
                            "placeholder names differ from {} which shares its path shape",
                            previous.label()
                        ),
                    });
                }
            } else {
                shapes.insert(shape, route);
            }
        }
        Ok(())
    }

    /// The secret to check credentials against: `API_KEY` from the environment wins over the file.
    pub fn effective_api_key(&self) -> Option<String> {
        std::env::var("API_KEY")
            .ok()
            .filter(|key| !key.is_empty())
            .or_else(|| self.auth.api_key.clone().filter(|key| !key.is_empty()))
    }
}

/// `{name}` placeholder names in `template`, in order of appearance.
pub fn placeholders(template: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(template)
        .map(|caps| caps[1].to_string())
        .collect()
}
