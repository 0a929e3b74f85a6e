//! Lifecycle tests for the background delivery service.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use courier_core::{
    storage::memory::InMemoryStorage, Backlog, Clock, Directory, NewDestination, NewMessage,
    RealClock, TestClock,
};
use courier_delivery::{
    schedule::run_sweeper, ClientConfig, DeliveryConfig, DeliveryEngine, DeliveryService,
    SweepSchedule,
};
use tokio_util::sync::CancellationToken;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

fn engine(storage: &InMemoryStorage, config: DeliveryConfig) -> Result<Arc<DeliveryEngine>> {
    engine_on(storage, config, Arc::new(RealClock::new()))
}

fn engine_on(
    storage: &InMemoryStorage,
    config: DeliveryConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<DeliveryEngine>> {
    let engine =
        DeliveryEngine::new(Arc::new(storage.clone()), Arc::new(storage.clone()), config, clock)?;
    Ok(Arc::new(engine))
}

async fn wait_for_request(server: &MockServer) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while server.received_requests().await.unwrap_or_default().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "request was never sent");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn fast_config() -> DeliveryConfig {
    DeliveryConfig {
        pacing_delay: Duration::ZERO,
        client_config: ClientConfig { timeout: Duration::from_secs(5), ..Default::default() },
        shutdown_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

#[tokio::test]
async fn idle_service_shuts_down_cleanly() -> Result<()> {
    let storage = InMemoryStorage::new();
    let service = DeliveryService::start(engine(&storage, fast_config())?);

    service.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn fired_trigger_runs_a_round() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let storage = InMemoryStorage::new();
    let service = DeliveryService::start(engine(&storage, fast_config())?);

    let destination = storage.create(NewDestination::new(server.uri())).await?;
    let message = storage
        .insert(NewMessage::new(destination.id, b"ping".to_vec(), "text/plain"), Utc::now())
        .await?;

    assert!(service.trigger_handle().fire(&message));

    let engine = service.engine();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while engine.stats().await.rounds == 0 {
        assert!(tokio::time::Instant::now() < deadline, "round did not run in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(engine.stats().await.delivered, 1);
    assert!(!storage.contains_message(message.id).await);

    service.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn trigger_after_shutdown_is_dropped() -> Result<()> {
    let storage = InMemoryStorage::new();
    let service = DeliveryService::start(engine(&storage, fast_config())?);
    let handle = service.trigger_handle();

    let destination = storage.create(NewDestination::new("http://127.0.0.1:1/")).await?;
    let message = storage
        .insert(NewMessage::new(destination.id, b"late".to_vec(), "text/plain"), Utc::now())
        .await?;

    service.shutdown().await?;

    assert!(!handle.fire(&message));
    assert!(storage.contains_message(message.id).await);
    Ok(())
}

#[tokio::test]
async fn shutdown_times_out_on_stuck_round() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let storage = InMemoryStorage::new();
    let config = DeliveryConfig { shutdown_timeout: Duration::from_millis(200), ..fast_config() };
    let service = DeliveryService::start(engine(&storage, config)?);

    let destination = storage.create(NewDestination::new(server.uri())).await?;
    let message = storage
        .insert(NewMessage::new(destination.id, b"slow".to_vec(), "text/plain"), Utc::now())
        .await?;
    service.trigger_handle().fire(&message);
    wait_for_request(&server).await;

    let result = service.shutdown().await;

    assert!(matches!(
        result,
        Err(courier_delivery::DeliveryError::ShutdownTimeout { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn shutdown_lets_a_running_sweep_round_finish() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .expect(1)
        .mount(&server)
        .await;

    let storage = InMemoryStorage::new();
    let clock = TestClock::new();
    let destination = storage.create(NewDestination::new(server.uri())).await?;
    let message = storage
        .insert(NewMessage::new(destination.id, b"swept".to_vec(), "text/plain"), clock.now_utc())
        .await?;

    // The virtual clock skips the wait, so the first sweep starts at once.
    let service = DeliveryService::start(engine_on(&storage, fast_config(), Arc::new(clock))?);
    wait_for_request(&server).await;

    service.shutdown().await?;

    assert!(!storage.contains_message(message.id).await);
    Ok(())
}

#[tokio::test]
async fn sweeper_exits_at_once_when_already_cancelled() -> Result<()> {
    let storage = InMemoryStorage::new();
    let clock: Arc<dyn Clock> = Arc::new(TestClock::new());
    let engine = engine_on(&storage, fast_config(), Arc::clone(&clock))?;

    let token = CancellationToken::new();
    token.cancel();
    tokio::time::timeout(
        Duration::from_secs(1),
        run_sweeper(Arc::clone(&engine), SweepSchedule::default(), clock, token),
    )
    .await?;

    assert_eq!(engine.stats().await.sweeps, 0);
    Ok(())
}

#[tokio::test]
async fn trigger_burst_for_one_destination_is_coalesced() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(500).set_delay(Duration::from_millis(300)))
        .mount(&server)
        .await;

    let storage = InMemoryStorage::new();
    let service = DeliveryService::start(engine(&storage, fast_config())?);

    let destination = storage.create(NewDestination::new(server.uri())).await?;
    let message = storage
        .insert(NewMessage::new(destination.id, b"burst".to_vec(), "text/plain"), Utc::now())
        .await?;

    let handle = service.trigger_handle();
    for _ in 0..5 {
        assert!(handle.fire(&message));
    }

    let engine = service.engine();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while engine.stats().await.rounds < 2 {
        assert!(tokio::time::Instant::now() < deadline, "follow-up round did not run");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(engine.stats().await.rounds, 2);
    assert_eq!(server.received_requests().await.unwrap_or_default().len(), 2);
    assert!(storage.contains_message(message.id).await);

    service.shutdown().await?;
    Ok(())
}
