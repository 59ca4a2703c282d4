use std::sync::Arc;

use crate::auth::ApiKeyGate;
use crate::config::Config;
use crate::sink::PublishSink;

/// Everything a request handler needs, owned in one place.
///
/// Built once at startup and shared behind an `Arc`; nothing in it changes
/// while the server runs.
#[derive(Clone)]
pub struct BridgeContext {
    config: Arc<Config>,
    sink: Arc<dyn PublishSink>,
    auth: ApiKeyGate,
}

impl BridgeContext {
    /// Bind `config` to `sink`, taking the API key from the environment or the config.
    pub fn new(config: Config, sink: Arc<dyn PublishSink>) -> Self {
        let auth = ApiKeyGate::new(config.effective_api_key());
        Self {
            config: Arc::new(config),
            sink,
            auth,
        }
    }

    /// Replace the credential gate.
    pub fn with_auth(mut self, auth: ApiKeyGate) -> Self {
        self.auth = auth;
        self
    }

    /// The loaded configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The publish sink.
    pub fn sink(&self) -> &Arc<dyn PublishSink> {
        &self.sink
    }

    /// The credential gate.
    pub fn auth(&self) -> &ApiKeyGate {
        &self.auth
    }

    /// Upper bound on request body size.
    pub fn max_body_bytes(&self) -> usize {
        self.config.server.max_body_bytes
    }
}

impl std::fmt::Debug for BridgeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeContext")
            .field("routes", &self.config.routes.len())
            .field("auth_enabled", &self.auth.is_enabled())
            .field("sink_connected", &self.sink.is_connected())
            .finish()
    }
}
