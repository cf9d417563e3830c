//! # External Integration Points
//!
//! The engine never talks to a telephony provider itself. The dispatcher hands admitted
//! calls to a [`SignalingAdapter`], and asks a [`RouteProvider`] which trunk and caller-ID
//! to use. Provider-specific crates implement these traits; the adapter reports call
//! progress back through [`CallStateMachine::post_event`].
//!
//! [`CallStateMachine::post_event`]: crate::attempt::CallStateMachine::post_event

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::attempt::CallAttempt;

/// Everything a provider needs to place one call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginationRequest {
    pub attempt_id: String,
    pub campaign_id: String,
    pub destination: String,
    pub trunk_id: String,
    pub caller_id: Option<String>,
    pub carrier: Option<String>,
    /// How long the provider should let the call ring before giving up
    pub ring_timeout: Duration,
}

/// Outbound route chosen for an attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundRoute {
    pub trunk_id: String,
    pub caller_id: Option<String>,
    pub carrier: Option<String>,
}

/// Places calls with a telephony provider
#[async_trait]
pub trait SignalingAdapter: Send + Sync {
    /// Start the call; returns the provider's call identifier.
    ///
    /// Returning an error fails the attempt with `ORIGINATE_FAILED`. Progress after a
    /// successful return is reported asynchronously as attempt events.
    async fn originate(&self, request: &OriginationRequest) -> anyhow::Result<String>;
}

/// Caller-ID and carrier selection
#[async_trait]
pub trait RouteProvider: Send + Sync {
    async fn select_route(&self, attempt: &CallAttempt) -> anyhow::Result<OutboundRoute>;
}

/// Routes by campaign from a fixed table, falling back to a default route
#[derive(Debug, Clone, Default)]
pub struct StaticRouteProvider {
    default_route: Option<OutboundRoute>,
    campaign_routes: HashMap<String, OutboundRoute>,
}

impl StaticRouteProvider {
    pub fn new(default_route: OutboundRoute) -> Self {
        Self {
            default_route: Some(default_route),
            campaign_routes: HashMap::new(),
        }
    }

    pub fn with_campaign_route(mut self, campaign_id: &str, route: OutboundRoute) -> Self {
        self.campaign_routes.insert(campaign_id.to_string(), route);
        self
    }
}

#[async_trait]
impl RouteProvider for StaticRouteProvider {
    async fn select_route(&self, attempt: &CallAttempt) -> anyhow::Result<OutboundRoute> {
        self.campaign_routes
            .get(&attempt.campaign_id)
            .or(self.default_route.as_ref())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no route configured for campaign {}", attempt.campaign_id))
    }
}
