//! Call attempt state machine against a real store

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rvoip_dialer_engine::attempt::{AmdResult, CallEvent, CallState, TimerKind, TransitionOutcome};
use rvoip_dialer_engine::prelude::*;

async fn setup() -> Result<(CallStateMachine, DialerDatabase)> {
    let db = DialerDatabase::new_in_memory().await?;
    let machine = CallStateMachine::new(db.clone(), TimerConfig::default(), DialerEvents::default());
    Ok((machine, db))
}

async fn new_attempt(db: &DialerDatabase, lead: &str, now: DateTime<Utc>) -> Result<String> {
    let (attempt, created) = db
        .create_attempt_with_job(
            &NewAttempt {
                campaign_id: "camp".into(),
                account_id: "acme".into(),
                lead_id: lead.into(),
                destination: "+15550100".into(),
                attempt_number: 1,
                job_priority: 0,
            },
            now,
        )
        .await?;
    assert!(created);
    Ok(attempt.attempt_id)
}

async fn drive(machine: &CallStateMachine, id: &str, events: Vec<CallEvent>, now: DateTime<Utc>) -> Result<CallState> {
    let mut state = CallState::Queued;
    for event in events {
        state = machine.post_event_at(id, event, now).await?.state();
    }
    Ok(state)
}

async fn originating(machine: &CallStateMachine, db: &DialerDatabase, now: DateTime<Utc>) -> Result<String> {
    let id = new_attempt(db, "lead-1", now).await?;
    let state = drive(
        machine,
        &id,
        vec![
            CallEvent::Reserved,
            CallEvent::OriginateSent {
                trunk_id: Some("trunk-a".into()),
                caller_id: Some("+15550001".into()),
            },
        ],
        now,
    )
    .await?;
    assert_eq!(state, CallState::Originating);
    Ok(id)
}

#[tokio::test]
async fn test_answer_stamps_and_cancels_ring_timeout() -> Result<()> {
    let (machine, db) = setup().await?;
    let now = Utc::now();
    let id = originating(&machine, &db, now).await?;

    let active = db.active_timers(&id).await?;
    assert!(active.iter().any(|t| t.kind == TimerKind::RingTimeout));

    let answered_at = now + Duration::seconds(4);
    let outcome = machine
        .post_event_at(&id, CallEvent::SipResponse { code: 200, reason: Some("OK".into()) }, answered_at)
        .await?;
    assert!(outcome.is_applied());
    assert_eq!(outcome.state(), CallState::Answered);

    let attempt = db.get_attempt(&id).await?.expect("attempt exists");
    assert_eq!(attempt.state, CallState::Answered);
    let stamped = attempt.answer_at.expect("answer_at stamped");
    assert!((stamped - answered_at).num_milliseconds().abs() < 1);
    assert_eq!(attempt.trunk_id.as_deref(), Some("trunk-a"));

    let timers = db.list_attempt_timers(&id).await?;
    let ring = timers
        .iter()
        .find(|t| t.kind == TimerKind::RingTimeout)
        .expect("ring timer was armed");
    assert!(ring.cancelled);
    assert!(!ring.fired);
    Ok(())
}

#[tokio::test]
async fn test_machine_answer_plays_then_ends() -> Result<()> {
    let (machine, db) = setup().await?;
    let now = Utc::now();
    let id = originating(&machine, &db, now).await?;

    let state = drive(
        &machine,
        &id,
        vec![
            CallEvent::SipResponse { code: 200, reason: None },
            CallEvent::Amd { result: AmdResult::Machine },
        ],
        now,
    )
    .await?;
    assert_eq!(state, CallState::Playing);

    let state = machine.post_event_at(&id, CallEvent::PlayEnded, now).await?.state();
    assert_eq!(state, CallState::Ending);
    Ok(())
}

#[tokio::test]
async fn test_terminal_attempt_accepts_nothing() -> Result<()> {
    let (machine, db) = setup().await?;
    let now = Utc::now();
    let id = originating(&machine, &db, now).await?;

    let state = machine
        .post_event_at(&id, CallEvent::SipResponse { code: 486, reason: Some("Busy Here".into()) }, now)
        .await?
        .state();
    assert_eq!(state, CallState::Failed);

    let attempt = db.get_attempt(&id).await?.expect("attempt exists");
    assert_eq!(attempt.final_sip_code, Some(486));
    assert_eq!(attempt.final_reason.as_deref(), Some("Busy Here"));
    assert!(attempt.end_at.is_some());
    assert!(db.active_timers(&id).await?.is_empty());

    let late_events = vec![
        CallEvent::SipResponse { code: 200, reason: None },
        CallEvent::Bye,
        CallEvent::RingTimeout,
        CallEvent::SystemError { message: "late".into() },
    ];
    for event in late_events {
        let outcome = machine.post_event_at(&id, event, now).await?;
        assert!(matches!(outcome, TransitionOutcome::Ignored { state: CallState::Failed, .. }));
    }
    assert_eq!(db.get_attempt(&id).await?.expect("attempt exists").version, attempt.version);
    Ok(())
}

#[tokio::test]
async fn test_out_of_order_event_is_ignored() -> Result<()> {
    let (machine, db) = setup().await?;
    let now = Utc::now();
    let id = originating(&machine, &db, now).await?;

    // A duplicate 180 after 183 has no edge from EARLY_MEDIA
    drive(
        &machine,
        &id,
        vec![CallEvent::SipResponse { code: 183, reason: None }],
        now,
    )
    .await?;
    let outcome = machine
        .post_event_at(&id, CallEvent::SipResponse { code: 180, reason: None }, now)
        .await?;
    assert!(!outcome.is_applied());
    assert_eq!(outcome.state(), CallState::EarlyMedia);
    Ok(())
}

#[tokio::test]
async fn test_human_path_to_ended_with_audit_log() -> Result<()> {
    let (machine, db) = setup().await?;
    let now = Utc::now();
    let id = originating(&machine, &db, now).await?;

    let state = drive(
        &machine,
        &id,
        vec![
            CallEvent::SipResponse { code: 180, reason: None },
            CallEvent::SipResponse { code: 200, reason: None },
            CallEvent::MediaStarted,
            CallEvent::Amd { result: AmdResult::Human },
            CallEvent::AgentAssigned { agent_id: "agent-7".into() },
            CallEvent::BridgeComplete { agent_id: Some("agent-7".into()) },
            CallEvent::RecordStarted,
            CallEvent::RecordEnded,
            CallEvent::Hangup { cause: Some("normal clearing".into()) },
            CallEvent::Bye,
        ],
        now,
    )
    .await?;
    assert_eq!(state, CallState::Ended);

    let attempt = db.get_attempt(&id).await?.expect("attempt exists");
    assert_eq!(attempt.agent_id.as_deref(), Some("agent-7"));
    assert!(attempt.bridge_at.is_some());

    let log = db.list_attempt_events(&id).await?;
    let path: Vec<CallState> = log.iter().map(|e| e.to_state).collect();
    assert_eq!(
        path,
        vec![
            CallState::Reserving,
            CallState::Originating,
            CallState::Ringing,
            CallState::Answered,
            CallState::AmdProcessing,
            CallState::Bridging,
            CallState::Bridged,
            CallState::Recording,
            CallState::Bridged,
            CallState::Ending,
            CallState::Ended,
        ]
    );
    assert!(log.windows(2).all(|w| w[0].to_state == w[1].from_state));
    assert!(db.active_timers(&id).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_concurrent_events_apply_one_edge_each() -> Result<()> {
    let (machine, db) = setup().await?;
    let now = Utc::now();
    let id = originating(&machine, &db, now).await?;

    // A 200 and a ring timeout racing: exactly one of them wins
    let (a, b) = tokio::join!(
        machine.post_event_at(&id, CallEvent::SipResponse { code: 200, reason: None }, now),
        machine.post_event_at(&id, CallEvent::RingTimeout, now),
    );
    let (a, b) = (a?, b?);
    assert_eq!(u8::from(a.is_applied()) + u8::from(b.is_applied()), 1);

    let attempt = db.get_attempt(&id).await?.expect("attempt exists");
    assert!(matches!(attempt.state, CallState::Answered | CallState::Timeout));
    Ok(())
}

#[tokio::test]
async fn test_local_hangup_without_bye_still_ends() -> Result<()> {
    let (machine, db) = setup().await?;
    let timers = TimerService::new(machine.clone(), TimerConfig::default());
    let now = Utc::now();
    let id = originating(&machine, &db, now).await?;

    let state = drive(
        &machine,
        &id,
        vec![
            CallEvent::SipResponse { code: 200, reason: None },
            CallEvent::Hangup { cause: Some("agent unavailable".into()) },
        ],
        now,
    )
    .await?;
    assert_eq!(state, CallState::Ending);
    assert_eq!(db.count_active_attempts("camp").await?, 1);

    let active = db.active_timers(&id).await?;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].kind, TimerKind::HangupGuard);

    // The far end never answers the hangup with a BYE
    let fired = timers.fire_due_at(now + Duration::days(30)).await?;
    assert_eq!(fired, 1);

    let attempt = db.get_attempt(&id).await?.expect("attempt exists");
    assert_eq!(attempt.state, CallState::Ended);
    assert!(attempt.end_at.is_some());
    assert_eq!(db.count_active_attempts("camp").await?, 0);
    assert!(db.active_timers(&id).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_oversized_ring_timeout_cannot_crash_the_machine() -> Result<()> {
    let (machine, db) = setup().await?;
    let now = Utc::now();
    let mut campaign = Campaign {
        campaign_id: "camp".into(),
        account_id: "acme".into(),
        name: "camp".into(),
        status: CampaignStatus::Active,
        dial_config: CampaignDialConfig {
            ring_timeout_secs: Some(10_000_000_000_000),
            ..Default::default()
        },
    };
    let rejected = db.upsert_campaign(&campaign).await;
    assert!(matches!(rejected, Err(DialerError::InvalidInput(_))));

    // A row written before the bound existed still loads with the oversized value
    campaign.dial_config.ring_timeout_secs = Some(45);
    db.upsert_campaign(&campaign).await?;
    campaign.dial_config.ring_timeout_secs = Some(10_000_000_000_000);
    sqlx::query("UPDATE campaigns SET dial_config = ? WHERE campaign_id = 'camp'")
        .bind(serde_json::to_string(&campaign.dial_config)?)
        .execute(db.pool())
        .await?;

    let id = originating(&machine, &db, now).await?;
    let active = db.active_timers(&id).await?;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].kind, TimerKind::RingTimeout);
    assert!(active[0].fire_at <= now + Duration::days(7) + Duration::seconds(1));
    Ok(())
}
