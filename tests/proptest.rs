use std::collections::HashMap;

use axum::body::Bytes;
use proptest::prelude::*;
use serde_json::{Map, Value, json};

use webhook_bridge::{
    DispatchError, ParamLocation, ParamType, ParameterSchema, PayloadTemplate, RawParameters,
    RouteDescriptor, TopicTemplate, resolve,
};

/// A parameter declaration plus the value a caller might send for it.
#[derive(Debug, Clone)]
pub struct ParameterCase {
    pub schema: ParameterSchema,
    pub sent: Option<Value>,
}

/// Property test strategies for generating routes and requests
pub mod strategies {
    use super::*;

    pub fn param_type() -> impl Strategy<Value = ParamType> {
        prop_oneof![
            Just(ParamType::String),
            Just(ParamType::Integer),
            Just(ParamType::Float),
            Just(ParamType::Boolean),
        ]
    }

    pub fn location() -> impl Strategy<Value = ParamLocation> {
        prop_oneof![Just(ParamLocation::Query), Just(ParamLocation::Body)]
    }

    /// Text with the characters most likely to break a JSON string.
    pub fn text() -> impl Strategy<Value = String> {
        prop_oneof![
            "[a-zA-Z0-9 _-]{0,16}",
            "[\"\\\\/\t\n{}%#]{0,8}",
            "\\PC{0,12}",
        ]
    }

    pub fn value_of(param_type: ParamType) -> BoxedStrategy<Value> {
        match param_type {
            ParamType::String => text().prop_map(Value::from).boxed(),
            ParamType::Integer => (-1_000_000i64..1_000_000).prop_map(Value::from).boxed(),
            ParamType::Float => (-1.0e6f64..1.0e6).prop_map(|f| json!(f)).boxed(),
            ParamType::Boolean => any::<bool>().prop_map(Value::from).boxed(),
        }
    }

    /// One parameter: required or optional (with or without default), sent or not.
    pub fn parameter(name: String) -> impl Strategy<Value = ParameterCase> {
        (param_type(), location()).prop_flat_map(move |(param_type, location)| {
            let name = name.clone();
            (
                any::<bool>(),
                prop::option::of(value_of(param_type)),
                prop::option::of(value_of(param_type)),
            )
                .prop_map(move |(required, default, sent)| {
                    let mut schema = ParameterSchema::new(name.clone(), param_type).at(location);
                    if !required {
                        schema = schema.optional(default);
                    }
                    ParameterCase { schema, sent }
                })
        })
    }

    pub fn parameters() -> impl Strategy<Value = Vec<ParameterCase>> {
        (1usize..6).prop_flat_map(|count| {
            (0..count)
                .map(|i| parameter(format!("p{}", i)))
                .collect::<Vec<_>>()
        })
    }
}

fn query_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn route_for(cases: &[ParameterCase], payload_template: &str) -> RouteDescriptor {
    cases.iter().fold(
        RouteDescriptor::new("/prop", "prop/topic", payload_template),
        |route, case| route.with_parameter(case.schema.clone()),
    )
}

fn request_for(cases: &[ParameterCase]) -> RawParameters {
    let mut query = HashMap::new();
    let mut body = Map::new();
    for case in cases {
        let Some(value) = &case.sent else { continue };
        match case.schema.location {
            ParamLocation::Body => {
                body.insert(case.schema.name.clone(), value.clone());
            }
            _ => {
                query.insert(case.schema.name.clone(), query_text(value));
            }
        }
    }
    RawParameters {
        path: HashMap::new(),
        query,
        body: Some(Bytes::from(Value::Object(body).to_string())),
    }
}

/// `{"p0": "{{ p0 }}", "p1": {{ p1 }}}`, guarding optional parameters with `is defined`.
fn payload_template_for(cases: &[ParameterCase]) -> String {
    let fields: Vec<String> = cases
        .iter()
        .map(|case| {
            let name = &case.schema.name;
            let output = match case.schema.param_type {
                ParamType::String => format!("\"{{{{ {} }}}}\"", name),
                _ => format!("{{{{ {} }}}}", name),
            };
            format!(
                "\"{name}\": {{% if {name} is defined %}}{output}{{% else %}}null{{% endif %}}"
            )
        })
        .collect();
    format!("{{{}}}", fields.join(", "))
}

proptest! {
    #[test]
    fn required_present_and_optional_never_null(cases in strategies::parameters()) {
        let route = route_for(&cases, "{}");
        let raw = request_for(&cases);

        let missing_required = cases.iter().any(|c| c.schema.required && c.sent.is_none());
        match resolve(&route, &raw) {
            Ok(resolved) => {
                prop_assert!(!missing_required);
                for case in &cases {
                    let name = &case.schema.name;
                    if case.schema.required {
                        prop_assert!(resolved.contains(name));
                    }
                    if let Some(value) = resolved.get(name) {
                        prop_assert!(!value.is_null());
                    }
                    if case.sent.is_none() && case.schema.default.is_none() {
                        prop_assert!(!resolved.contains(name));
                    }
                }
            }
            Err(DispatchError::BadRequest(message)) => {
                prop_assert!(missing_required, "unexpected bad request: {}", message);
            }
            Err(e) => prop_assert!(false, "unexpected error: {}", e),
        }
    }

    #[test]
    fn valid_parameters_render_valid_json(cases in strategies::parameters()) {
        let template = payload_template_for(&cases);
        let route = route_for(&cases, &template);
        let raw = request_for(&cases);

        if let Ok(resolved) = resolve(&route, &raw) {
            let payload = PayloadTemplate::parse(&template).unwrap();
            let (text, value) = payload.render_json(resolved.as_map()).unwrap();
            prop_assert_eq!(serde_json::from_str::<Value>(&text).unwrap(), value.clone());
            for case in &cases {
                let rendered = &value[&case.schema.name];
                match resolved.get(&case.schema.name) {
                    Some(expected) if case.schema.param_type == ParamType::Float => {
                        prop_assert_eq!(rendered.as_f64(), expected.as_f64());
                    }
                    Some(expected) => prop_assert_eq!(rendered, expected),
                    None => prop_assert!(rendered.is_null()),
                }
            }
        }
    }

    #[test]
    fn resolution_is_idempotent(cases in strategies::parameters()) {
        let route = route_for(&cases, "{}");
        let raw = request_for(&cases);

        match (resolve(&route, &raw), resolve(&route, &raw)) {
            (Ok(first), Ok(second)) => {
                prop_assert_eq!(first.to_string(), second.to_string());
                prop_assert_eq!(first, second);
            }
            (Err(first), Err(second)) => prop_assert_eq!(first, second),
            (first, second) => prop_assert!(false, "diverged: {:?} vs {:?}", first, second),
        }
    }

    #[test]
    fn integer_bounds_are_inclusive(
        min in -1000i64..1000,
        span in 0i64..100,
        offset in -3i64..104,
    ) {
        let max = min + span;
        let value = min + offset;
        let route = RouteDescriptor::new("/prop", "t", "{}").with_parameter(
            ParameterSchema::new("level", ParamType::Integer)
                .bounded(Some(min as f64), Some(max as f64)),
        );
        let raw = RawParameters {
            query: HashMap::from([("level".to_string(), value.to_string())]),
            ..RawParameters::default()
        };

        let result = resolve(&route, &raw);
        if (min..=max).contains(&value) {
            let resolved = result.unwrap();
            prop_assert_eq!(resolved.get("level"), Some(&json!(value)));
        } else {
            let is_unprocessable = matches!(
                result,
                Err(DispatchError::UnprocessableParameter { ref field, .. }) if field == "level"
            );
            prop_assert!(is_unprocessable);
        }
    }

    #[test]
    fn topic_substitutes_every_placeholder(
        a in any::<i64>(),
        b in "[a-z0-9-]{1,12}",
    ) {
        let topic = TopicTemplate::parse("dev/{a}/{b}").unwrap();
        let mut bindings = Map::new();
        bindings.insert("a".to_string(), json!(a));
        bindings.insert("b".to_string(), json!(b));
        prop_assert_eq!(topic.render(&bindings).unwrap(), format!("dev/{}/{}", a, b));
    }
}

#[test]
fn topic_round_trip_example() {
    let topic = TopicTemplate::parse("dev/{a}/{b}").unwrap();
    let bindings = json!({"a": 1, "b": "x"});
    assert_eq!(
        topic.render(bindings.as_object().unwrap()).unwrap(),
        "dev/1/x"
    );
}
