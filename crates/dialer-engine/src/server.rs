//! # Dialer Server
//!
//! [`DialerServer`] wires the subsystems together around one shared
//! [`DialerDatabase`] and owns the periodic loops that drive them:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                       DialerServer                        │
//! ├──────────────────┬───────────────────┬────────────────────┤
//! │ scheduler loop   │ dispatcher loop   │ timer loop         │
//! │ (one per account)│                   │                    │
//! ├──────────────────┴───────────────────┴────────────────────┤
//! │ AdmissionScheduler │ OriginateDispatcher │ TimerService   │
//! │                    │ TrunkRateLimiter    │                │
//! │                  CallStateMachine                         │
//! ├───────────────────────────────────────────────────────────┤
//! │                    DialerDatabase                         │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! The loops run on fixed intervals and skip missed ticks. An error inside a loop
//! iteration is logged and the loop carries on.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rvoip_dialer_engine::prelude::*;
//!
//! # async fn example(adapter: Arc<dyn SignalingAdapter>) -> rvoip_dialer_engine::Result<()> {
//! let route = OutboundRoute {
//!     trunk_id: "carrier-a".into(),
//!     caller_id: Some("+15550001000".into()),
//!     carrier: None,
//! };
//! let mut server = DialerServerBuilder::new()
//!     .with_config(DialerConfig::default())
//!     .with_adapter(adapter)
//!     .with_route_provider(Arc::new(StaticRouteProvider::new(route)))
//!     .build()
//!     .await?;
//!
//! server.limiter().set_limits("carrier-a", TrunkLimitConfig::new(10)).await?;
//! server.start(vec!["acme".into()])?;
//! // ...
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::attempt::{CallStateMachine, TimerService};
use crate::campaign::CampaignStatus;
use crate::config::DialerConfig;
use crate::database::DialerDatabase;
use crate::dispatcher::OriginateDispatcher;
use crate::error::{DialerError, Result};
use crate::integration::{RouteProvider, SignalingAdapter};
use crate::monitoring::{DialerEvent, DialerEvents};
use crate::rate_limit::TrunkRateLimiter;
use crate::scheduler::AdmissionScheduler;

/// A running (or ready to run) dialer engine
pub struct DialerServer {
    config: DialerConfig,
    db: DialerDatabase,
    events: DialerEvents,
    machine: CallStateMachine,
    limiter: TrunkRateLimiter,
    scheduler: AdmissionScheduler,
    dispatcher: Arc<OriginateDispatcher>,
    timers: TimerService,
    handles: Vec<JoinHandle<()>>,
}

impl DialerServer {
    fn new(
        config: DialerConfig,
        db: DialerDatabase,
        adapter: Arc<dyn SignalingAdapter>,
        routes: Arc<dyn RouteProvider>,
    ) -> Self {
        let events = DialerEvents::default();
        let machine = CallStateMachine::new(db.clone(), config.timers.clone(), events.clone());
        let limiter = TrunkRateLimiter::new(db.clone(), config.rate_limiter.clone(), events.clone());
        let scheduler = AdmissionScheduler::new(
            db.clone(),
            config.scheduler.clone(),
            config.pacing.clone(),
            config.general.instance_id.clone(),
            events.clone(),
        );
        let dispatcher = Arc::new(OriginateDispatcher::new(
            machine.clone(),
            limiter.clone(),
            routes,
            adapter,
            config.dispatcher.clone(),
            config.timers.clone(),
            events.clone(),
        ));
        let timers = TimerService::new(machine.clone(), config.timers.clone());

        Self {
            config,
            db,
            events,
            machine,
            limiter,
            scheduler,
            dispatcher,
            timers,
            handles: Vec::new(),
        }
    }

    /// Spawn the scheduler loops for `accounts` (the configured accounts when empty),
    /// the dispatcher loop and the timer loop
    pub fn start(&mut self, accounts: Vec<String>) -> Result<()> {
        if self.is_running() {
            return Err(DialerError::configuration("dialer server already started"));
        }
        let accounts = if accounts.is_empty() {
            self.config.general.accounts.clone()
        } else {
            accounts
        };
        if accounts.is_empty() {
            return Err(DialerError::configuration("no accounts to schedule"));
        }

        for account_id in accounts {
            let scheduler = self.scheduler.clone();
            let period = self.config.scheduler.tick_interval();
            info!("Starting scheduler loop for account {} every {:?}", account_id, period);
            self.handles.push(tokio::spawn(async move {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    match scheduler.run_tick(&account_id).await {
                        Ok(report) => debug!(
                            "Account {} tick: {} campaigns, {} attempts created",
                            account_id,
                            report.outcomes.len(),
                            report.total_created()
                        ),
                        Err(e) => error!("Scheduler tick for account {} failed: {}", account_id, e),
                    }
                }
            }));
        }

        let dispatcher = self.dispatcher.clone();
        let period = self.config.dispatcher.poll_interval();
        self.handles.push(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = dispatcher.dispatch_due().await {
                    error!("Dispatch pass failed: {}", e);
                }
            }
        }));

        let timers = self.timers.clone();
        let period = self.config.timers.poll_interval();
        self.handles.push(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = timers.fire_due().await {
                    error!("Timer pass failed: {}", e);
                }
            }
        }));

        info!("Dialer {} started", self.config.general.instance_id);
        Ok(())
    }

    /// Stop the loops and wait for originations already handed to the adapter.
    ///
    /// Attempts in flight are left to drain through their own events.
    pub async fn stop(&mut self) {
        info!("Stopping dialer {}", self.config.general.instance_id);
        for handle in self.handles.drain(..) {
            handle.abort();
            let _ = handle.await;
        }
        self.dispatcher.wait_for_inflight().await;
        info!("Dialer {} stopped", self.config.general.instance_id);
    }

    pub fn is_running(&self) -> bool {
        !self.handles.is_empty()
    }

    /// Stop new reservations for a campaign from the next tick on
    pub async fn pause_campaign(&self, campaign_id: &str) -> Result<()> {
        self.db.set_campaign_status(campaign_id, CampaignStatus::Paused).await?;
        info!("Campaign {} paused", campaign_id);
        self.events.publish(DialerEvent::CampaignPaused {
            campaign_id: campaign_id.to_string(),
        });
        Ok(())
    }

    pub async fn resume_campaign(&self, campaign_id: &str) -> Result<()> {
        self.db.set_campaign_status(campaign_id, CampaignStatus::Active).await?;
        info!("Campaign {} resumed", campaign_id);
        Ok(())
    }

    pub fn config(&self) -> &DialerConfig {
        &self.config
    }

    pub fn database(&self) -> &DialerDatabase {
        &self.db
    }

    pub fn events(&self) -> &DialerEvents {
        &self.events
    }

    /// Entry point for signaling adapters reporting call progress
    pub fn machine(&self) -> &CallStateMachine {
        &self.machine
    }

    pub fn limiter(&self) -> &TrunkRateLimiter {
        &self.limiter
    }

    pub fn scheduler(&self) -> &AdmissionScheduler {
        &self.scheduler
    }

    pub fn dispatcher(&self) -> &OriginateDispatcher {
        &self.dispatcher
    }

    pub fn timer_service(&self) -> &TimerService {
        &self.timers
    }
}

impl Drop for DialerServer {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Builder for [`DialerServer`]
#[derive(Default)]
pub struct DialerServerBuilder {
    config: Option<DialerConfig>,
    database: Option<DialerDatabase>,
    adapter: Option<Arc<dyn SignalingAdapter>>,
    routes: Option<Arc<dyn RouteProvider>>,
}

impl DialerServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: DialerConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use an existing database instead of connecting to `config.database.url`
    pub fn with_database(mut self, database: DialerDatabase) -> Self {
        self.database = Some(database);
        self
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn SignalingAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn with_route_provider(mut self, routes: Arc<dyn RouteProvider>) -> Self {
        self.routes = Some(routes);
        self
    }

    pub async fn build(self) -> Result<DialerServer> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        if config.logging.enabled {
            let installed = crate::logging::init_logging(&config.logging)?;
            debug!("Tracing subscriber installed by dialer: {}", installed);
        }

        let adapter = self
            .adapter
            .ok_or_else(|| DialerError::configuration("signaling adapter not provided"))?;
        let routes = self
            .routes
            .ok_or_else(|| DialerError::configuration("route provider not provided"))?;
        let db = match self.database {
            Some(db) => db,
            None => DialerDatabase::from_config(&config.database).await?,
        };

        Ok(DialerServer::new(config, db, adapter, routes))
    }
}
