pub mod aggregator;
pub mod backend;
pub mod config;
pub mod error;
pub mod filters;
pub mod gateway;
pub mod handlers;
pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use aggregator::SystemMessageAggregator;
use backend::{BackendApi, BackendGateway};
use config::Config;
use gateway::fanout::GatewayBroadcast;
use gateway::presence::PresenceTracker;
use gateway::registry::ConnectionRegistry;
use handlers::typing::TypingLimiter;

/// Shared application state available to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub backend: Arc<BackendGateway>,
    pub registry: Arc<ConnectionRegistry>,
    pub presence: Arc<PresenceTracker>,
    pub broadcast: GatewayBroadcast,
    pub aggregator: Arc<SystemMessageAggregator>,
    pub typing: Arc<TypingLimiter>,
}

impl AppState {
    pub fn new(config: Config, api: Arc<dyn BackendApi>) -> Self {
        let config = Arc::new(config);
        let backend = Arc::new(BackendGateway::new(api, &config));
        let broadcast = GatewayBroadcast::new();
        let aggregator = SystemMessageAggregator::new(
            Duration::from_millis(config.aggregation_window_ms),
            broadcast.clone(),
            backend.clone(),
        );
        let typing = Arc::new(TypingLimiter::new(Duration::from_millis(
            config.typing_min_interval_ms,
        )));
        Self {
            config,
            backend,
            registry: Arc::new(ConnectionRegistry::new()),
            presence: Arc::new(PresenceTracker::new()),
            broadcast,
            aggregator,
            typing,
        }
    }
}
