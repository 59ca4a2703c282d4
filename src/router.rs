//! # Route Registration
//!
//! Compiles every configured route into its own handler and mounts them on one
//! axum [`Router`], next to the `/health` and `/` endpoints.
//!
//! A route whose templates or path cannot be compiled is logged and left out;
//! the rest still register. Two routes on the same method and path shape make
//! dispatch ambiguous, so that fails registration as a whole.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::HeaderMap,
    routing::{MethodFilter, MethodRouter, get, on},
};
use serde_json::{Value, json};

use crate::app::BridgeContext;
use crate::auth::API_KEY_HEADER;
use crate::config::{Config, Method};
use crate::dispatch::{CompiledRoute, InboundRequest, RouteHandler};
use crate::errors::RegistrationError;

/// Name reported by the root endpoint.
pub const SERVICE_NAME: &str = "webhook-bridge";

/// Endpoints the bridge always serves, which configured routes may not shadow.
const BUILTIN_ROUTES: &[(Method, &str)] = &[(Method::Get, "/health"), (Method::Get, "/")];

fn method_filter(method: Method) -> MethodFilter {
    match method {
        Method::Get => MethodFilter::GET,
        Method::Post => MethodFilter::POST,
        Method::Put => MethodFilter::PUT,
        Method::Delete => MethodFilter::DELETE,
    }
}

/// Rewrite `/a/{x}/b` as `/a/:x/b`.
///
/// Returns `None` when a placeholder does not span a whole segment, or when a
/// literal segment carries axum's own `:` or `*` capture syntax.
fn to_axum_path(path: &str) -> Option<String> {
    let segments = path
        .split('/')
        .map(|segment| {
            match segment
                .strip_prefix('{')
                .and_then(|rest| rest.strip_suffix('}'))
            {
                Some(name)
                    if !name.is_empty()
                        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') =>
                {
                    Some(format!(":{}", name))
                }
                _ if segment.contains(['{', '}', ':', '*']) => None,
                _ => Some(segment.to_string()),
            }
        })
        .collect::<Option<Vec<_>>>()?;
    Some(segments.join("/"))
}

/// Fails when two routes share a method and path shape, or a shape is spelled two ways.
fn check_conflicts(context: &BridgeContext) -> Result<(), RegistrationError> {
    let mut by_method: HashMap<(Method, String), String> = BUILTIN_ROUTES
        .iter()
        .map(|(method, path)| ((*method, path.to_string()), path.to_string()))
        .collect();
    let mut by_shape: HashMap<String, String> = HashMap::new();

    for route in &context.config().routes {
        let shape = route.path_shape();
        if let Some(first) = by_method.get(&(route.method, shape.clone())) {
            return Err(RegistrationError::DuplicateRoute {
                method: route.method,
                first: first.clone(),
                second: route.path.clone(),
            });
        }
        by_method.insert((route.method, shape.clone()), route.path.clone());

        match by_shape.get(&shape) {
            Some(first) if first != &route.path => {
                return Err(RegistrationError::ConflictingPlaceholders {
                    first: first.clone(),
                    second: route.path.clone(),
                });
            }
            Some(_) => {}
            None => {
                by_shape.insert(shape, route.path.clone());
            }
        }
    }
    Ok(())
}

fn route_method_router(handler: RouteHandler) -> MethodRouter<Arc<BridgeContext>> {
    let filter = method_filter(handler.route().descriptor.method);
    on(
        filter,
        move |path: Option<Path<HashMap<String, String>>>,
              Query(query): Query<HashMap<String, String>>,
              headers: HeaderMap,
              body: Body| {
            let handler = handler.clone();
            async move {
                let request = InboundRequest {
                    path_params: path.map(|Path(params)| params).unwrap_or_default(),
                    query,
                    credential: headers.get(API_KEY_HEADER).cloned(),
                    body,
                };
                handler.handle(request).await
            }
        },
    )
}

/// Compile every configured route that can be mounted.
///
/// Returns the mountable routes keyed by their axum path, alongside the
/// problems of the routes that were left out.
pub fn compile_routes(config: &Config) -> (Vec<(String, CompiledRoute)>, Vec<RegistrationError>) {
    let mut compiled = Vec::new();
    let mut problems = Vec::new();
    for descriptor in &config.routes {
        let Some(axum_path) = to_axum_path(&descriptor.path) else {
            problems.push(RegistrationError::UnsupportedPath {
                route: descriptor.label(),
            });
            continue;
        };
        match CompiledRoute::compile(descriptor.clone()) {
            Ok(route) => compiled.push((axum_path, route)),
            Err(error) => problems.push(error),
        }
    }
    (compiled, problems)
}

/// Build the router for every configured route plus the built-in endpoints.
pub fn create_bridge_router(context: Arc<BridgeContext>) -> Result<Router, RegistrationError> {
    check_conflicts(&context)?;

    let (compiled, problems) = compile_routes(context.config());
    for error in &problems {
        tracing::error!(error = %error, "skipping route");
    }

    let mut by_path: BTreeMap<String, MethodRouter<Arc<BridgeContext>>> = BTreeMap::new();
    let registered = compiled.len();
    for (axum_path, route) in compiled {
        tracing::debug!(
            route = %route.descriptor.label(),
            topic = %route.descriptor.topic_template,
            "registered route"
        );
        let handler = RouteHandler::new(Arc::new(route), Arc::clone(&context));
        let method_router = route_method_router(handler);
        let merged = match by_path.remove(&axum_path) {
            Some(existing) => existing.merge(method_router),
            None => method_router,
        };
        by_path.insert(axum_path, merged);
    }

    tracing::info!(
        registered,
        configured = context.config().routes.len(),
        "routes registered"
    );

    let mut router = Router::new()
        .route("/health", get(health))
        .route("/", get(root));
    for (path, method_router) in by_path {
        router = router.route(&path, method_router);
    }
    Ok(router.with_state(context))
}

async fn health(State(context): State<Arc<BridgeContext>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "mqtt_connected": context.sink().is_connected(),
    }))
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "health": "/health",
    }))
}
