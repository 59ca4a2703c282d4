//! # Parameter Resolution
//!
//! Turns the raw pieces of a request into the named, typed values a route's
//! templates render against. Sources are consulted in a fixed order:
//!
//! 1. path segments, converted to the declared type;
//! 2. query string values, converted to the declared type;
//! 3. the JSON body object, whose values keep their JSON type;
//! 4. defaults for optional parameters that are still missing;
//! 5. enum and bounds validation over everything populated.
//!
//! An optional parameter that was not supplied and has no default is left out
//! of the result entirely. Templates rely on that: `is defined` tests presence,
//! and no value is ever present as `null`.

use std::collections::HashMap;

use axum::body::Bytes;
use serde_json::{Map, Value};

use crate::config::{ParamLocation, ParamType, ParameterSchema, RouteDescriptor};
use crate::errors::DispatchError;

/// The raw inputs of one request, before resolution.
#[derive(Debug, Clone, Default)]
pub struct RawParameters {
    /// Segments matched by the path pattern.
    pub path: HashMap<String, String>,
    /// Query string key-values.
    pub query: HashMap<String, String>,
    /// Request body bytes, `None` when no body was read.
    pub body: Option<Bytes>,
}

/// The validated, named values of one request.
///
/// Keys iterate in sorted order, so two resolutions of the same request are
/// byte-identical when serialized.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedParameterSet {
    values: Map<String, Value>,
}

impl ResolvedParameterSet {
    /// The value for `name`, if present.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Whether `name` is present.
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no value is present.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The values as template bindings.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    /// Consume into the underlying map.
    pub fn into_map(self) -> Map<String, Value> {
        self.values
    }
}

impl std::fmt::Display for ResolvedParameterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Value::Object(self.values.clone()))
    }
}

/// Resolve and validate the parameters of `route` from `raw`.
pub fn resolve(
    route: &RouteDescriptor,
    raw: &RawParameters,
) -> Result<ResolvedParameterSet, DispatchError> {
    let mut values = Map::new();

    for parameter in route.parameters_at(ParamLocation::Path) {
        let text = raw.path.get(&parameter.name).ok_or_else(|| {
            DispatchError::BadRequest(format!("Missing required parameter: {}", parameter.name))
        })?;
        values.insert(parameter.name.clone(), convert(parameter, text)?);
    }

    for parameter in route.parameters_at(ParamLocation::Query) {
        if let Some(text) = raw.query.get(&parameter.name) {
            values.insert(parameter.name.clone(), convert(parameter, text)?);
        }
    }

    let body_parameters: Vec<&ParameterSchema> =
        route.parameters_at(ParamLocation::Body).collect();
    if !body_parameters.is_empty() {
        match parse_body_object(raw.body.as_deref()) {
            Some(body) => {
                for parameter in &body_parameters {
                    if let Some(value) = body.get(&parameter.name).filter(|v| !v.is_null()) {
                        check_json_type(parameter, value)?;
                        values.insert(parameter.name.clone(), value.clone());
                    }
                }
            }
            None if body_parameters.iter().any(|p| p.required) => {
                tracing::warn!(route = %route.label(), "invalid JSON in request body");
                return Err(DispatchError::BadRequest(
                    "Invalid JSON in request body".to_string(),
                ));
            }
            None => {
                tracing::debug!(
                    route = %route.label(),
                    "ignoring unusable body; no body parameter is required"
                );
            }
        }
    }

    for parameter in &route.parameters {
        if values.contains_key(&parameter.name) {
            continue;
        }
        if let Some(default) = parameter.effective_default() {
            values.insert(parameter.name.clone(), default.clone());
        } else if parameter.required {
            return Err(DispatchError::BadRequest(format!(
                "Missing required parameter: {}",
                parameter.name
            )));
        }
    }

    for parameter in &route.parameters {
        if let Some(value) = values.get(&parameter.name) {
            validate(parameter, value)?;
        }
    }

    Ok(ResolvedParameterSet { values })
}

fn unprocessable(parameter: &ParameterSchema, message: String) -> DispatchError {
    DispatchError::UnprocessableParameter {
        field: parameter.name.clone(),
        message,
    }
}

/// Convert a path or query string to the declared type.
fn convert(parameter: &ParameterSchema, text: &str) -> Result<Value, DispatchError> {
    let mismatch = || {
        unprocessable(
            parameter,
            format!("expected {}, got {:?}", parameter.param_type, text),
        )
    };
    match parameter.param_type {
        ParamType::String => Ok(Value::String(text.to_string())),
        ParamType::Integer => text
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| mismatch()),
        ParamType::Float => text
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(mismatch),
        ParamType::Boolean => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Value::Bool(true)),
            "false" | "0" | "no" | "off" => Ok(Value::Bool(false)),
            _ => Err(mismatch()),
        },
    }
}

/// Parse the body as a JSON object; anything else is treated as unusable.
fn parse_body_object(body: Option<&[u8]>) -> Option<Map<String, Value>> {
    match serde_json::from_slice(body?) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn check_json_type(parameter: &ParameterSchema, value: &Value) -> Result<(), DispatchError> {
    let matches = match parameter.param_type {
        ParamType::String => value.is_string(),
        ParamType::Integer => value.is_i64() || value.is_u64(),
        ParamType::Float => value.is_number(),
        ParamType::Boolean => value.is_boolean(),
    };
    if matches {
        Ok(())
    } else {
        Err(unprocessable(
            parameter,
            format!("expected {}, got {}", parameter.param_type, value),
        ))
    }
}

/// Check a configured default the way a body value is checked.
pub(crate) fn check_default(parameter: &ParameterSchema, value: &Value) -> Result<(), String> {
    check_json_type(parameter, value)
        .and_then(|()| validate(parameter, value))
        .map_err(|e| match e {
            DispatchError::UnprocessableParameter { message, .. } => message,
            other => other.to_string(),
        })
}

/// The form enum membership compares: strings as-is, other scalars as JSON text.
fn string_form(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn validate(parameter: &ParameterSchema, value: &Value) -> Result<(), DispatchError> {
    if let Some(allowed) = &parameter.allowed {
        let shown = string_form(value);
        if !allowed.contains(&shown) {
            return Err(unprocessable(
                parameter,
                format!("{:?} is not one of {:?}", shown, allowed),
            ));
        }
    }

    if parameter.param_type.is_numeric()
        && let Some(number) = value.as_f64()
    {
        if let Some(min) = parameter.min
            && number < min
        {
            return Err(unprocessable(
                parameter,
                format!("{} is below the minimum of {}", value, min),
            ));
        }
        if let Some(max) = parameter.max
            && number > max
        {
            return Err(unprocessable(
                parameter,
                format!("{} is above the maximum of {}", value, max),
            ));
        }
    }
    Ok(())
}
