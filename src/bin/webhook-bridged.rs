use std::sync::Arc;
use std::time::Duration;

use arrrg::CommandLine;
use arrrg_derive::CommandLine;
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use webhook_bridge::cli_utils::{self, exit_with_error};
use webhook_bridge::{
    BridgeContext, Config, InMemorySink, MqttSink, PublishSink, create_bridge_router,
};

#[derive(CommandLine, Default, PartialEq, Eq)]
struct Args {
    #[arrrg(optional, "Path to the routes configuration file")]
    config: Option<String>,
    #[arrrg(optional, "Host to bind the HTTP server")]
    host: Option<String>,
    #[arrrg(optional, "Port to bind the HTTP server")]
    port: Option<u16>,
    #[arrrg(optional, "Seconds to wait for the MQTT broker at startup")]
    connect_timeout: Option<u64>,
    #[arrrg(flag, "Record publishes in memory instead of connecting to a broker")]
    dry_run: bool,
    #[arrrg(flag, "Enable verbose logging")]
    verbose: bool,
}

const HELP_TEXT: &str = r#"webhook-bridged - HTTP to MQTT bridge daemon

USAGE:
    webhook-bridged [OPTIONS]

OPTIONS:
    --config <PATH>            Routes configuration file [default: $CONFIG_PATH or config/routes.yaml]
    --host <HOST>              Host to bind the HTTP server [default: server.host or 0.0.0.0]
    --port <PORT>              Port to bind the HTTP server [default: server.port or 8000]
    --connect-timeout <SECS>   Seconds to wait for the MQTT broker at startup [default: 10]
    --dry-run                  Record publishes in memory instead of connecting to a broker
    --verbose                  Enable verbose logging

ENVIRONMENT:
    CONFIG_PATH    Routes configuration file when --config is not given
    API_KEY        Shared secret expected in the X-API-Key header; overrides auth.api_key
    RUST_LOG       Log filter [default: info, or debug with --verbose]

DESCRIPTION:
    Serves one HTTP endpoint per configured route. Each request is resolved
    against the route's parameter schema, rendered into an MQTT topic and JSON
    payload, and published to the broker.

    The server supports graceful shutdown via Ctrl+C.

BUILT-IN ENDPOINTS:
    GET    /          Service name and version
    GET    /health    Health status and broker connectivity"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (args, free) = Args::from_command_line("USAGE: webhook-bridged [OPTIONS]");

    if !free.is_empty() && free[0] == "help" {
        println!("{}", HELP_TEXT);
        return Ok(());
    }

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = cli_utils::config_path(args.config);
    tracing::info!(path = %config_path.display(), "loading configuration");
    let mut config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => exit_with_error(&format!("Error loading configuration: {}", e)),
    };
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    tracing::info!(
        broker = %format!("{}:{}", config.mqtt.broker, config.mqtt.port),
        routes = config.routes.len(),
        "configuration loaded"
    );

    let mqtt = if args.dry_run {
        tracing::warn!("dry run: publishes are recorded in memory, not sent to the broker");
        None
    } else {
        let sink = Arc::new(MqttSink::connect(&config.mqtt));
        let timeout = Duration::from_secs(args.connect_timeout.unwrap_or(10));
        if !sink.wait_connected(timeout).await {
            tracing::warn!(
                broker = %format!("{}:{}", config.mqtt.broker, config.mqtt.port),
                waited_secs = timeout.as_secs(),
                "broker not connected yet; serving anyway and retrying in the background"
            );
        }
        Some(sink)
    };
    let sink: Arc<dyn PublishSink> = match &mqtt {
        Some(sink) => Arc::clone(sink) as Arc<dyn PublishSink>,
        None => Arc::new(InMemorySink::new()),
    };

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let context = Arc::new(BridgeContext::new(config, sink));
    let app = match create_bridge_router(Arc::clone(&context)) {
        Ok(app) => app,
        Err(e) => exit_with_error(&format!("Error registering routes: {}", e)),
    };

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("Failed to bind to {}: {}", addr, e))?;

    println!("🚀 Webhook bridge started successfully!");
    println!("📡 Server listening on: http://{}", addr);
    println!("📬 Broker: {}:{}", context.config().mqtt.broker, context.config().mqtt.port);
    let auth = if context.auth().is_enabled() {
        "enabled"
    } else {
        "disabled"
    };
    println!("🔐 Authentication: {}", auth);
    if args.verbose {
        print_routes(&context);
    }
    println!("💡 Use Ctrl+C for graceful shutdown");
    println!();

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    if let Some(sink) = &mqtt {
        sink.disconnect().await;
    }
    if let Err(e) = result {
        eprintln!("❌ Server error: {}", e);
        std::process::exit(1);
    }
    println!("👋 Webhook bridge stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    println!();
    println!("🛑 Shutdown signal received, stopping server gracefully...");
}

fn print_routes(context: &BridgeContext) {
    println!();
    println!("📋 Configured routes:");
    for route in &context.config().routes {
        println!(
            "    {:<6} {:<40} -> {} (qos {}, retain {})",
            route.method.as_str(),
            route.path,
            route.topic_template,
            u8::from(route.qos),
            route.retain
        );
    }
    println!();
}
