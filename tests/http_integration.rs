use std::sync::Arc;

use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum_test::TestServer;
use serde_json::{Value, json};

use webhook_bridge::{
    ApiKeyGate, BridgeContext, Config, InMemorySink, PublishError, Qos, compile_routes,
    create_bridge_router,
};

const ROUTES: &str = r#"
mqtt:
  broker: "localhost"
routes:
  - path: "/v1/test/simple"
    method: POST
    mqtt_topic: "test/simple"
    qos: 1
    parameters:
      - name: message
        type: string
    payload_template: '{"message": "{{ message }}", "timestamp": "{{ now() }}"}'

  - path: "/v1/room/{room}/device/{device}/state"
    method: PUT
    mqtt_topic: "home/{room}/{device}/state"
    retain: true
    parameters:
      - name: room
        type: string
        location: path
      - name: device
        type: string
        location: path
      - name: state
        type: boolean
        location: body
      - name: brightness
        type: integer
        location: body
        required: false
        min: 0
        max: 100
    payload_template: >-
      {"state": {{ state }}{% if brightness is defined %}, "brightness": {{ brightness }}{% endif %}}

  - path: "/v1/scene"
    method: GET
    mqtt_topic: "home/scene"
    parameters:
      - name: scene
        type: string
        enum: ["morning", "evening"]
    payload_template: '{"scene": "{{ scene }}"}'

  - path: "/v1/thermostat"
    mqtt_topic: "home/thermostat/{zone}"
    parameters:
      - name: target
        type: float
        location: body
    payload_template: '{"target": {{ target }}}'

  - path: "/v1/notify"
    mqtt_topic: "home/notify"
    parameters:
      - name: text
        type: string
        required: false
    payload_template: '{"text": "{{ text }}"}'
"#;

struct Harness {
    server: TestServer,
    sink: Arc<InMemorySink>,
}

impl Harness {
    fn new(gate: ApiKeyGate) -> Self {
        let config = Config::from_yaml_str(ROUTES).unwrap();
        let sink = Arc::new(InMemorySink::new());
        let context = Arc::new(BridgeContext::new(config, sink.clone()).with_auth(gate));
        let server = TestServer::new(create_bridge_router(context).unwrap()).unwrap();
        Self { server, sink }
    }

    fn open() -> Self {
        Self::new(ApiKeyGate::disabled())
    }

    fn payload(&self, index: usize) -> Value {
        serde_json::from_slice(&self.sink.published()[index].payload).unwrap()
    }
}

fn api_key(value: &'static str) -> (HeaderName, HeaderValue) {
    (
        HeaderName::from_static("x-api-key"),
        HeaderValue::from_static(value),
    )
}

#[tokio::test]
async fn query_message_is_published_with_timestamp() {
    let harness = Harness::open();

    let response = harness
        .server
        .post("/v1/test/simple")
        .add_query_param("message", "hello")
        .await;
    response.assert_status_ok();

    let body: Value = response.json();
    assert_eq!(body["status"], json!("published"));
    assert_eq!(body["topic"], json!("test/simple"));
    assert_eq!(body["payload"]["message"], json!("hello"));

    let published = harness.sink.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic, "test/simple");
    assert_eq!(published[0].qos, Qos::AtLeastOnce);
    assert!(!published[0].retain);

    let payload = harness.payload(0);
    assert_eq!(payload["message"], json!("hello"));
    assert!(payload["timestamp"].as_str().is_some_and(|t| !t.is_empty()));
}

#[tokio::test]
async fn path_and_body_parameters_render_without_absent_optional() {
    let harness = Harness::open();

    harness
        .server
        .put("/v1/room/bedroom/device/lamp-02/state")
        .json(&json!({"state": false}))
        .await
        .assert_status_ok();

    let published = harness.sink.published();
    assert_eq!(published[0].topic, "home/bedroom/lamp-02/state");
    assert!(published[0].retain);

    let payload = harness.payload(0);
    assert_eq!(payload, json!({"state": false}));
    assert!(payload.get("brightness").is_none());
}

#[tokio::test]
async fn optional_body_parameter_is_rendered_when_sent() {
    let harness = Harness::open();

    harness
        .server
        .put("/v1/room/kitchen/device/strip/state")
        .json(&json!({"state": true, "brightness": 100}))
        .await
        .assert_status_ok();

    assert_eq!(harness.payload(0), json!({"state": true, "brightness": 100}));
}

#[tokio::test]
async fn bounds_are_inclusive_over_http() {
    let harness = Harness::open();

    harness
        .server
        .put("/v1/room/a/device/b/state")
        .json(&json!({"state": true, "brightness": 0}))
        .await
        .assert_status_ok();
    harness
        .server
        .put("/v1/room/a/device/b/state")
        .json(&json!({"state": true, "brightness": 101}))
        .await
        .assert_status(StatusCode::UNPROCESSABLE_ENTITY);

    assert_eq!(harness.sink.published().len(), 1);
}

#[tokio::test]
async fn enum_violation_is_unprocessable_and_not_published() {
    let harness = Harness::open();

    let response = harness
        .server
        .get("/v1/scene")
        .add_query_param("scene", "invalid")
        .await;
    response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = response.json();
    assert!(body["detail"].as_str().unwrap().contains("scene"));
    assert!(harness.sink.published().is_empty());

    harness
        .server
        .get("/v1/scene")
        .add_query_param("scene", "evening")
        .await
        .assert_status_ok();
    assert_eq!(harness.payload(0), json!({"scene": "evening"}));
}

#[tokio::test]
async fn missing_credential_is_rejected_before_resolution() {
    let harness = Harness::new(ApiKeyGate::new(Some("secret".into())));

    // Invalid JSON would be a 400 if the body were read.
    let response = harness
        .server
        .put("/v1/room/a/device/b/state")
        .text("not json")
        .await;
    response.assert_status(StatusCode::UNAUTHORIZED);
    assert_eq!(response.header("www-authenticate"), "ApiKey");
    let body: Value = response.json();
    assert_eq!(
        body["detail"],
        json!("Missing API key. Include 'X-API-Key' header with your request.")
    );

    let (name, value) = api_key("wrong");
    let response = harness
        .server
        .put("/v1/room/a/device/b/state")
        .add_header(name, value)
        .json(&json!({"state": true}))
        .await;
    response.assert_status(StatusCode::UNAUTHORIZED);
    let body: Value = response.json();
    assert_eq!(body["detail"], json!("Invalid API key"));

    let (name, value) = api_key("secret");
    harness
        .server
        .put("/v1/room/a/device/b/state")
        .add_header(name, value)
        .json(&json!({"state": true}))
        .await
        .assert_status_ok();

    assert_eq!(harness.sink.published().len(), 1);
}

#[tokio::test]
async fn builtin_endpoints_do_not_require_credentials() {
    let harness = Harness::new(ApiKeyGate::new(Some("secret".into())));

    harness.server.get("/health").await.assert_status_ok();
    harness.server.get("/").await.assert_status_ok();
}

#[tokio::test]
async fn invalid_body_is_bad_request() {
    let harness = Harness::open();

    let response = harness
        .server
        .put("/v1/room/a/device/b/state")
        .text("{not json")
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["detail"], json!("Invalid JSON in request body"));

    harness
        .server
        .put("/v1/room/a/device/b/state")
        .json(&json!([true]))
        .await
        .assert_status(StatusCode::BAD_REQUEST);

    assert!(harness.sink.published().is_empty());
}

#[tokio::test]
async fn missing_required_parameter_is_bad_request() {
    let harness = Harness::open();

    let response = harness.server.post("/v1/test/simple").await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["detail"], json!("Missing required parameter: message"));
}

#[tokio::test]
async fn body_type_mismatch_is_unprocessable() {
    let harness = Harness::open();

    harness
        .server
        .put("/v1/room/a/device/b/state")
        .json(&json!({"state": "yes please"}))
        .await
        .assert_status(StatusCode::UNPROCESSABLE_ENTITY);
    assert!(harness.sink.published().is_empty());
}

#[tokio::test]
async fn render_failures_are_opaque_server_errors() {
    let harness = Harness::open();

    // Topic names an undeclared placeholder.
    let response = harness
        .server
        .post("/v1/thermostat")
        .json(&json!({"target": 21.5}))
        .await;
    response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = response.json();
    assert_eq!(body, json!({"detail": "internal error"}));

    // Payload references an optional parameter that was not sent.
    let response = harness.server.post("/v1/notify").await;
    response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = response.json();
    assert_eq!(body, json!({"detail": "internal error"}));

    assert!(harness.sink.published().is_empty());
}

#[tokio::test]
async fn publish_failures_are_server_errors() {
    let harness = Harness::open();

    harness.sink.set_connected(false);
    let response = harness
        .server
        .post("/v1/notify")
        .add_query_param("text", "hi")
        .await;
    response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = response.json();
    assert_eq!(body["detail"], json!("failed to publish message"));

    harness.sink.set_connected(true);
    harness
        .sink
        .fail_with(Some(PublishError::Rejected("queue full".into())));
    harness
        .server
        .post("/v1/notify")
        .add_query_param("text", "hi")
        .await
        .assert_status(StatusCode::INTERNAL_SERVER_ERROR);

    harness.sink.fail_with(None);
    harness
        .server
        .post("/v1/notify")
        .add_query_param("text", "hi")
        .await
        .assert_status_ok();
    assert_eq!(harness.payload(0), json!({"text": "hi"}));
}

#[tokio::test]
async fn unknown_paths_are_not_found() {
    let harness = Harness::open();

    harness
        .server
        .post("/v1/nope")
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[test]
fn shipped_configuration_compiles() {
    let config = Config::load(concat!(env!("CARGO_MANIFEST_DIR"), "/config/routes.yaml")).unwrap();
    let (compiled, problems) = compile_routes(&config);
    assert!(problems.is_empty(), "{:?}", problems);
    assert_eq!(compiled.len(), config.routes.len());
}
