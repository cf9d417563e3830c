//! Integration tests for the dialer engine
//!
//! These tests run the scheduler, dispatcher, rate limiter, state machine and timers
//! together through a [`DialerServer`], with a recording signaling adapter standing in
//! for the telephony provider.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use rvoip_dialer_engine::attempt::AmdResult;
use rvoip_dialer_engine::database::LeadStatus;
use rvoip_dialer_engine::prelude::*;
use serial_test::serial;

#[derive(Default)]
struct RecordingAdapter {
    requests: Mutex<Vec<OriginationRequest>>,
}

#[async_trait]
impl SignalingAdapter for RecordingAdapter {
    async fn originate(&self, request: &OriginationRequest) -> anyhow::Result<String> {
        self.requests.lock().push(request.clone());
        Ok(format!("call-{}", request.attempt_id))
    }
}

async fn create_test_dialer(config: DialerConfig) -> Result<(DialerServer, Arc<RecordingAdapter>)> {
    let db = DialerDatabase::new_in_memory().await?;
    let adapter = Arc::new(RecordingAdapter::default());
    let routes = StaticRouteProvider::new(OutboundRoute {
        trunk_id: "trunk-a".into(),
        caller_id: Some("+15550009999".into()),
        carrier: Some("carrier-a".into()),
    });

    let server = DialerServerBuilder::new()
        .with_config(config)
        .with_database(db)
        .with_adapter(adapter.clone())
        .with_route_provider(Arc::new(routes))
        .build()
        .await?;
    server.limiter().set_limits("trunk-a", TrunkLimitConfig::new(3)).await?;
    Ok((server, adapter))
}

async fn seed_campaign(server: &DialerServer, agents: usize, leads: usize) -> Result<()> {
    let db = server.database();
    db.upsert_campaign(&Campaign {
        campaign_id: "spring".into(),
        account_id: "acme".into(),
        name: "Spring sale".into(),
        status: CampaignStatus::Active,
        dial_config: CampaignDialConfig {
            dial_mode: DialMode::Power,
            dial_ratio: 2.0,
            max_concurrent: 20,
            ring_timeout_secs: Some(20),
            ..Default::default()
        },
    })
    .await?;
    for i in 0..agents {
        let mut agent = DbAgent::new(&format!("agent-{}", i), "acme", "spring");
        agent.status = AgentStatus::Available;
        db.upsert_agent(&agent).await?;
    }
    for i in 0..leads {
        db.insert_lead(&NewLead::new(&format!("lead-{}", i), "spring", "acme", &format!("+1555{:07}", i)))
            .await?;
    }
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_builder_requires_adapter() {
    let result = DialerServerBuilder::new()
        .with_config(DialerConfig::default())
        .build()
        .await;
    assert!(matches!(result, Err(DialerError::Configuration(_))));
}

#[tokio::test]
#[serial]
async fn test_builder_applies_logging_config() -> Result<()> {
    let mut config = DialerConfig::default();
    config.logging = LoggingConfig::new(tracing::Level::DEBUG).with_file_info();

    // Whichever build installs the subscriber first, later builds find it in place
    create_test_dialer(config.clone()).await?;
    create_test_dialer(config.clone()).await?;

    config.logging.level = "shouting".into();
    let result = create_test_dialer(config).await;
    assert!(result.is_err());
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_tick_dispatch_and_call_lifecycle() -> Result<()> {
    let (server, adapter) = create_test_dialer(DialerConfig::default()).await?;
    seed_campaign(&server, 2, 10).await?;
    let now = Utc::now();

    // 2 agents x ratio 2.0
    let report = server.scheduler().run_tick_at("acme", now).await?;
    assert_eq!(report.total_created(), 4);

    // The trunk admits 3 per second; the fourth job waits for the window
    let dispatch = server.dispatcher().dispatch_due_at(now).await?;
    assert_eq!(dispatch.dispatched, 3);
    assert_eq!(dispatch.requeued, 1);
    server.dispatcher().wait_for_inflight().await;

    let requests = adapter.requests.lock().clone();
    assert_eq!(requests.len(), 3);
    assert!(requests.iter().all(|r| r.trunk_id == "trunk-a"));
    assert!(requests.iter().all(|r| r.ring_timeout == std::time::Duration::from_secs(20)));
    assert_eq!(requests[0].carrier.as_deref(), Some("carrier-a"));

    let later = now + Duration::seconds(1);
    assert_eq!(server.dispatcher().dispatch_due_at(later).await?.dispatched, 1);
    server.dispatcher().wait_for_inflight().await;
    assert_eq!(adapter.requests.lock().len(), 4);

    // Provider reports progress for the first call
    let machine = server.machine();
    let first = requests[0].attempt_id.clone();
    let attempt = server.database().get_attempt(&first).await?.expect("attempt exists");
    assert_eq!(attempt.provider_call_id, Some(format!("call-{}", first)));
    for event in [
        CallEvent::SipResponse { code: 180, reason: None },
        CallEvent::SipResponse { code: 200, reason: None },
        CallEvent::Amd { result: AmdResult::Human },
        CallEvent::BridgeComplete { agent_id: Some("agent-0".into()) },
        CallEvent::Bye,
    ] {
        machine.post_event_at(&first, event, later).await?;
    }
    let attempt = server.database().get_attempt(&first).await?.expect("attempt exists");
    assert_eq!(attempt.state, CallState::Ended);

    // The others never answer and time out
    let after_ring = later + Duration::seconds(21);
    let fired = server.timer_service().fire_due_at(after_ring).await?;
    assert_eq!(fired, 3);

    let attempts = server.database().list_campaign_attempts("spring").await?;
    let timed_out = attempts.iter().filter(|a| a.state == CallState::Timeout).count();
    assert_eq!(timed_out, 3);

    // Next tick recycles the leads: the answered one is done, the rest go back
    server.scheduler().run_tick_at("acme", after_ring).await?;
    let lead = server.database().get_lead(&attempt.lead_id).await?.expect("lead exists");
    assert_eq!(lead.status, LeadStatus::Completed);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_pause_stops_new_reservations_but_not_in_flight_calls() -> Result<()> {
    let (server, _) = create_test_dialer(DialerConfig::default()).await?;
    seed_campaign(&server, 2, 10).await?;
    let mut events = server.events().subscribe();
    let now = Utc::now();

    assert_eq!(server.scheduler().run_tick_at("acme", now).await?.total_created(), 4);
    server.pause_campaign("spring").await?;

    let report = server.scheduler().run_tick_at("acme", now).await?;
    assert!(report.outcomes.is_empty());

    // Queued attempts still dispatch and progress
    assert_eq!(server.dispatcher().dispatch_due_at(now).await?.dispatched, 3);
    server.dispatcher().wait_for_inflight().await;

    let mut paused = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, DialerEvent::CampaignPaused { ref campaign_id } if campaign_id == "spring") {
            paused = true;
        }
    }
    assert!(paused);

    server.resume_campaign("spring").await?;
    let report = server.scheduler().run_tick_at("acme", now).await?;
    assert!(report.outcome("spring").is_some());
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_server_loops_drive_calls() -> Result<()> {
    let mut config = DialerConfig::default();
    config.scheduler.tick_interval_ms = 50;
    config.dispatcher.poll_interval_ms = 20;
    config.timers.poll_interval_ms = 20;
    let (mut server, adapter) = create_test_dialer(config).await?;
    seed_campaign(&server, 1, 5).await?;

    server.start(vec!["acme".into()])?;
    assert!(server.is_running());
    assert!(server.start(vec!["acme".into()]).is_err());

    let mut originated = 0;
    for _ in 0..100 {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        originated = adapter.requests.lock().len();
        if originated >= 2 {
            break;
        }
    }
    server.stop().await;
    assert!(!server.is_running());
    assert!(originated >= 2, "only {} calls originated", originated);
    Ok(())
}
