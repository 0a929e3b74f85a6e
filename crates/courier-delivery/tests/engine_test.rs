//! Integration tests for delivery rounds.
//!
//! Every test runs the engine against in-memory storage, a virtual clock and
//! a wiremock endpoint standing in for the destination, then checks which
//! requests went out and what is left in the backlog.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_core::{
    storage::memory::InMemoryStorage, Backlog, Clock, Destination, Directory, DestinationId,
    Message, NewDestination, NewMessage, TestClock,
};
use courier_delivery::{ClientConfig, DeliveryConfig, DeliveryEngine, RoundOutcome};
use tokio_util::sync::CancellationToken;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

struct TestEnv {
    storage: InMemoryStorage,
    clock: TestClock,
    engine: Arc<DeliveryEngine>,
    server: MockServer,
}

impl TestEnv {
    async fn new() -> Result<Self> {
        let config = DeliveryConfig {
            client_config: ClientConfig { timeout: Duration::from_secs(5), ..Default::default() },
            ..Default::default()
        };
        Self::with_config(config).await
    }

    async fn with_config(config: DeliveryConfig) -> Result<Self> {
        let storage = InMemoryStorage::new();
        let clock = TestClock::new();
        let engine = DeliveryEngine::new(
            Arc::new(storage.clone()),
            Arc::new(storage.clone()),
            config,
            Arc::new(clock.clone()),
        )?;

        Ok(Self { storage, clock, engine: Arc::new(engine), server: MockServer::start().await })
    }

    async fn destination(&self, path: &str) -> Result<Destination> {
        let url = format!("{}{path}", self.server.uri());
        Ok(self.storage.create(NewDestination::new(url)).await?)
    }

    async fn accept(&self, destination: &Destination, body: &str) -> Result<Message> {
        let message = NewMessage::new(destination.id, body.as_bytes().to_vec(), "text/plain");
        Ok(self.storage.insert(message, self.clock.now_utc()).await?)
    }

    async fn online(&self, destination: &Destination) -> Result<bool> {
        let stored = self.storage.destination(destination.id).await.context("destination gone")?;
        Ok(stored.online)
    }

    async fn received_bodies(&self) -> Vec<String> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .map(|request| String::from_utf8_lossy(&request.body).into_owned())
            .collect()
    }

    async fn respond_with(&self, status: u16) {
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.server)
            .await;
    }
}

#[tokio::test]
async fn delivered_message_is_removed_and_destination_online() -> Result<()> {
    let env = TestEnv::new().await?;
    let destination = env.destination("/x/y").await?;

    Mock::given(matchers::method("POST"))
        .and(matchers::path("/x/y"))
        .and(matchers::header("content-type", "text/plain"))
        .and(matchers::body_string("hello"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&env.server)
        .await;

    let message = env.accept(&destination, "hello").await?;

    let report = env.engine.process_destination(destination.id).await;

    assert_eq!(report.outcome, RoundOutcome::Drained);
    assert_eq!(report.delivered, 1);
    assert!(!env.storage.contains_message(message.id).await);
    assert!(env.online(&destination).await?);
    Ok(())
}

#[tokio::test]
async fn server_error_keeps_message_and_marks_offline() -> Result<()> {
    let env = TestEnv::new().await?;
    let destination = env.destination("/x/y").await?;
    env.respond_with(500).await;

    let message = env.accept(&destination, "hello").await?;

    let report = env.engine.process_destination(destination.id).await;

    assert_eq!(report.outcome, RoundOutcome::Halted);
    assert_eq!(report.halted_on, Some(message.id));
    assert!(env.storage.contains_message(message.id).await);
    assert!(!env.online(&destination).await?);
    Ok(())
}

#[tokio::test]
async fn expired_message_is_discarded_without_a_request() -> Result<()> {
    let env = TestEnv::new().await?;
    let destination = env.destination("/x/y").await?;

    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&env.server)
        .await;

    let message = env.accept(&destination, "hello").await?;
    env.clock.advance(Duration::from_secs(25 * 60 * 60));

    let report = env.engine.process_destination(destination.id).await;

    assert_eq!(report.expired, 1);
    assert_eq!(report.delivered, 0);
    assert!(!env.storage.contains_message(message.id).await);
    assert!(env.online(&destination).await?);
    Ok(())
}

#[tokio::test]
async fn expiry_applies_to_offline_destinations() -> Result<()> {
    let env = TestEnv::new().await?;
    let destination = env.destination("/x/y").await?;
    env.respond_with(500).await;

    env.accept(&destination, "old").await?;
    env.storage.set_offline(destination.id).await?;
    env.clock.advance(Duration::from_secs(24 * 60 * 60));

    let report = env.engine.process_destination(destination.id).await;

    assert_eq!(report.expired, 1);
    assert_eq!(report.outcome, RoundOutcome::Drained);
    assert!(env.received_bodies().await.is_empty());
    assert!(env.online(&destination).await?);
    Ok(())
}

#[tokio::test]
async fn backlog_is_attempted_in_acceptance_order() -> Result<()> {
    let env = TestEnv::new().await?;
    let destination = env.destination("/hook").await?;
    env.respond_with(200).await;

    env.accept(&destination, "first").await?;
    env.accept(&destination, "second").await?;
    env.accept(&destination, "third").await?;

    let report = env.engine.process_destination(destination.id).await;

    assert_eq!(report.delivered, 3);
    assert_eq!(env.received_bodies().await, vec!["first", "second", "third"]);
    assert_eq!(env.storage.message_count().await, 0);
    Ok(())
}

#[tokio::test]
async fn first_failure_halts_the_round() -> Result<()> {
    let env = TestEnv::new().await?;
    let destination = env.destination("/hook").await?;

    Mock::given(matchers::body_string("first"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&env.server)
        .await;
    Mock::given(matchers::body_string("second"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&env.server)
        .await;
    Mock::given(matchers::body_string("third"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&env.server)
        .await;

    let first = env.accept(&destination, "first").await?;
    let second = env.accept(&destination, "second").await?;
    let third = env.accept(&destination, "third").await?;

    let report = env.engine.process_destination(destination.id).await;

    assert_eq!(report.delivered, 1);
    assert_eq!(report.halted_on, Some(second.id));
    assert!(!env.storage.contains_message(first.id).await);
    assert!(env.storage.contains_message(second.id).await);
    assert!(env.storage.contains_message(third.id).await);
    assert_eq!(env.received_bodies().await, vec!["first", "second"]);
    assert!(!env.online(&destination).await?);
    Ok(())
}

#[tokio::test]
async fn only_exact_200_counts_as_delivered() -> Result<()> {
    let env = TestEnv::new().await?;
    let destination = env.destination("/hook").await?;
    env.respond_with(201).await;

    let message = env.accept(&destination, "hello").await?;

    let report = env.engine.process_destination(destination.id).await;

    assert_eq!(report.outcome, RoundOutcome::Halted);
    assert!(env.storage.contains_message(message.id).await);
    assert!(!env.online(&destination).await?);
    Ok(())
}

#[tokio::test]
async fn unreachable_destination_is_marked_offline() -> Result<()> {
    let env = TestEnv::new().await?;
    let destination = env.storage.create(NewDestination::new("http://127.0.0.1:1/hook")).await?;
    let message = env.accept(&destination, "hello").await?;

    let report = env.engine.process_destination(destination.id).await;

    assert_eq!(report.halted_on, Some(message.id));
    assert!(env.storage.contains_message(message.id).await);
    assert!(!env.online(&destination).await?);
    assert_eq!(env.engine.stats().await.failed_attempts, 1);
    Ok(())
}

#[tokio::test]
async fn empty_backlog_round_only_marks_online() -> Result<()> {
    let env = TestEnv::new().await?;
    let destination = env.destination("/hook").await?;
    env.respond_with(200).await;

    env.accept(&destination, "hello").await?;
    env.engine.process_destination(destination.id).await;
    assert_eq!(env.received_bodies().await.len(), 1);

    env.storage.set_offline(destination.id).await?;
    let report = env.engine.process_destination(destination.id).await;

    assert_eq!(report.outcome, RoundOutcome::Drained);
    assert_eq!(report.delivered, 0);
    assert_eq!(env.received_bodies().await.len(), 1);
    assert!(env.online(&destination).await?);
    Ok(())
}

#[tokio::test]
async fn destination_recovers_on_next_round() -> Result<()> {
    let env = TestEnv::new().await?;
    let destination = env.destination("/hook").await?;
    env.respond_with(500).await;

    let message = env.accept(&destination, "hello").await?;

    env.engine.process_destination(destination.id).await;
    assert!(!env.online(&destination).await?);

    env.server.reset().await;
    env.respond_with(200).await;

    let report = env.engine.process_destination(destination.id).await;

    assert_eq!(report.outcome, RoundOutcome::Drained);
    assert!(!env.storage.contains_message(message.id).await);
    assert!(env.online(&destination).await?);
    Ok(())
}

#[tokio::test]
async fn pacing_delay_precedes_every_attempt() -> Result<()> {
    let env = TestEnv::new().await?;
    let destination = env.destination("/hook").await?;
    env.respond_with(200).await;

    env.accept(&destination, "one").await?;
    env.accept(&destination, "two").await?;
    let before = env.clock.elapsed();

    env.engine.process_destination(destination.id).await;

    assert_eq!(env.clock.elapsed() - before, Duration::from_millis(1_000));
    Ok(())
}

#[tokio::test]
async fn missing_destination_is_skipped() -> Result<()> {
    let env = TestEnv::new().await?;

    let report = env.engine.process_destination(DestinationId(42)).await;

    assert_eq!(report.outcome, RoundOutcome::Skipped);
    assert!(env.received_bodies().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn backlog_read_failure_skips_the_round() -> Result<()> {
    let env = TestEnv::new().await?;
    let destination = env.destination("/hook").await?;
    env.respond_with(200).await;

    let message = env.accept(&destination, "hello").await?;
    env.storage.inject_list_error("connection reset").await;

    let report = env.engine.process_destination(destination.id).await;

    assert_eq!(report.outcome, RoundOutcome::Skipped);
    assert!(env.storage.contains_message(message.id).await);
    assert!(env.received_bodies().await.is_empty());
    assert_eq!(env.engine.stats().await.storage_errors, 1);
    Ok(())
}

#[tokio::test]
async fn failed_removal_after_delivery_halts_without_going_offline() -> Result<()> {
    let env = TestEnv::new().await?;
    let destination = env.destination("/hook").await?;
    env.respond_with(200).await;

    let first = env.accept(&destination, "one").await?;
    let second = env.accept(&destination, "two").await?;
    env.storage.inject_delete_error("connection reset").await;

    let report = env.engine.process_destination(destination.id).await;

    assert_eq!(report.outcome, RoundOutcome::Halted);
    assert_eq!(report.halted_on, Some(first.id));
    assert_eq!(report.delivered, 0);
    assert_eq!(env.received_bodies().await, vec!["one"]);
    assert!(env.storage.contains_message(first.id).await);
    assert!(env.storage.contains_message(second.id).await);
    assert!(env.online(&destination).await?);

    let stats = env.engine.stats().await;
    assert_eq!(stats.storage_errors, 1);
    assert_eq!(stats.failed_attempts, 0);
    Ok(())
}

#[tokio::test]
async fn failed_discard_of_expired_message_halts_the_round() -> Result<()> {
    let env = TestEnv::new().await?;
    let destination = env.destination("/hook").await?;
    env.respond_with(200).await;

    let stale = env.accept(&destination, "stale").await?;
    env.clock.advance(Duration::from_secs(25 * 60 * 60));
    let fresh = env.accept(&destination, "fresh").await?;
    env.storage.inject_delete_error("connection reset").await;

    let report = env.engine.process_destination(destination.id).await;

    assert_eq!(report.outcome, RoundOutcome::Halted);
    assert_eq!(report.halted_on, Some(stale.id));
    assert_eq!(report.expired, 0);
    assert!(env.received_bodies().await.is_empty());
    assert!(env.storage.contains_message(stale.id).await);
    assert!(env.storage.contains_message(fresh.id).await);
    assert!(env.online(&destination).await?);
    Ok(())
}

#[tokio::test]
async fn concurrent_rounds_for_one_destination_do_not_duplicate() -> Result<()> {
    let env = TestEnv::new().await?;
    let destination = env.destination("/hook").await?;

    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(100)))
        .mount(&env.server)
        .await;

    env.accept(&destination, "one").await?;
    env.accept(&destination, "two").await?;

    let (a, b) = tokio::join!(
        env.engine.process_destination(destination.id),
        env.engine.process_destination(destination.id),
    );

    assert_eq!(a.delivered + b.delivered, 2);
    assert_eq!(env.received_bodies().await, vec!["one", "two"]);
    assert_eq!(env.engine.active_rounds(), 0);
    Ok(())
}

#[tokio::test]
async fn slow_destination_does_not_block_another() -> Result<()> {
    let env = TestEnv::new().await?;
    let slow = env.destination("/slow").await?;
    let fast = env.destination("/fast").await?;

    Mock::given(matchers::path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&env.server)
        .await;
    Mock::given(matchers::path("/fast"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&env.server)
        .await;

    env.accept(&slow, "slow").await?;
    env.accept(&fast, "fast").await?;

    let engine = Arc::clone(&env.engine);
    let slow_round = tokio::spawn(async move { engine.process_destination(slow.id).await });

    let fast_report =
        tokio::time::timeout(Duration::from_secs(1), env.engine.process_destination(fast.id))
            .await?;

    assert_eq!(fast_report.delivered, 1);
    assert_eq!(slow_round.await?.delivered, 1);
    Ok(())
}

#[tokio::test]
async fn sweep_processes_every_destination() -> Result<()> {
    let env = TestEnv::new().await?;
    let healthy = env.destination("/healthy").await?;
    let broken = env.destination("/broken").await?;

    Mock::given(matchers::path("/healthy"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&env.server)
        .await;
    Mock::given(matchers::path("/broken"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&env.server)
        .await;

    env.accept(&healthy, "a").await?;
    env.accept(&broken, "b").await?;

    let report = env.engine.sweep().await;

    assert_eq!(report.destinations, 2);
    assert_eq!(report.delivered, 1);
    assert_eq!(report.halted, 1);
    assert!(env.online(&healthy).await?);
    assert!(!env.online(&broken).await?);

    let stats = env.engine.stats().await;
    assert_eq!(stats.sweeps, 1);
    assert_eq!(stats.rounds, 2);
    Ok(())
}

#[tokio::test]
async fn cancelled_sweep_starts_no_rounds() -> Result<()> {
    let env = TestEnv::new().await?;
    let destination = env.destination("/hook").await?;
    env.respond_with(200).await;
    let message = env.accept(&destination, "hello").await?;

    let token = CancellationToken::new();
    token.cancel();
    let report = env.engine.sweep_until(&token).await;

    assert_eq!(report.destinations, 0);
    assert!(env.storage.contains_message(message.id).await);
    assert_eq!(env.engine.stats().await.rounds, 0);
    Ok(())
}

#[tokio::test]
async fn default_content_type_is_forwarded() -> Result<()> {
    let env = TestEnv::new().await?;
    let destination = env.destination("/hook").await?;

    Mock::given(matchers::header("content-type", "application/octet-stream"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&env.server)
        .await;

    env.storage
        .insert(NewMessage::new(destination.id, b"raw".to_vec(), ""), env.clock.now_utc())
        .await?;

    let report = env.engine.process_destination(destination.id).await;

    assert_eq!(report.delivered, 1);
    Ok(())
}

#[tokio::test]
async fn custom_ttl_is_honoured() -> Result<()> {
    let config = DeliveryConfig { message_ttl: Duration::from_secs(60), ..Default::default() };
    let env = TestEnv::with_config(config).await?;
    let destination = env.destination("/hook").await?;
    env.respond_with(200).await;

    env.accept(&destination, "stale").await?;
    env.clock.advance(Duration::from_secs(60));
    let fresh = env.accept(&destination, "fresh").await?;

    let report = env.engine.process_destination(destination.id).await;

    assert_eq!(report.expired, 1);
    assert_eq!(report.delivered, 1);
    assert_eq!(env.received_bodies().await, vec!["fresh"]);
    assert!(!env.storage.contains_message(fresh.id).await);
    Ok(())
}
