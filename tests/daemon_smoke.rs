use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use glm_warmd::clock::SystemClock;
use glm_warmd::config::ConfigStore;
use glm_warmd::events::{AppEvent, BroadcastEmitter};
use glm_warmd::file_logger::NullSink;
use glm_warmd::models::AppConfig;
use glm_warmd::App;

/// Cold key on first observation, warm afterwards: the daemon must send
/// one wake, confirm it against the advanced reset time, and surface the
/// whole thing through events and the runtime snapshot.
#[tokio::test]
async fn daemon_wakes_a_cold_key_and_confirms() {
    let server = MockServer::start().await;
    let reset = chrono::Local::now().timestamp_millis() + 5 * 3600 * 1000;

    Mock::given(method("GET"))
        .and(path("/api/monitor/usage/quota/limit"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 200,
            "data": { "limits": [{ "type": "TOKENS_LIMIT", "percentage": 0 }] }
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/monitor/usage/quota/limit"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 200,
            "data": { "limits": [
                { "type": "TOKENS_LIMIT", "percentage": 55, "nextResetTime": reset }
            ] }
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/coding/paas/v4/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
        .expect(1..)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/monitor/usage/model-usage"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 200,
            "data": { "totalUsage": { "totalModelCallCount": 7, "totalTokensUsage": 999 } }
        })))
        .mount(&server)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let emitter = Arc::new(BroadcastEmitter::default());
    let mut events = emitter.subscribe();
    let app = App::new(
        ConfigStore::at_path(tmp.path().join("settings.json")),
        Arc::new(SystemClock),
        emitter,
        Arc::new(NullSink),
    );

    // debug mode redirects the stock provider URLs to the mock server
    let mut cfg = AppConfig::default();
    cfg.debug = true;
    cfg.mock_url = Some(server.uri());
    cfg.slots[0].enabled = true;
    cfg.slots[0].api_key = "key-1".into();
    cfg.slots[0].poll_interval_minutes = 1;
    app.save_settings(cfg).await.unwrap();

    app.start_monitoring().await.unwrap();

    let confirmed_slot = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(AppEvent::WakeConfirmed { slot }) => break slot,
                Ok(_) => continue,
                Err(err) => panic!("event stream closed: {err}"),
            }
        }
    })
    .await
    .expect("wake was never confirmed");
    assert_eq!(confirmed_slot, 1);

    let status = app.get_runtime_status().await;
    assert!(status.monitoring);
    let slot = &status.slots[0];
    assert!(slot.enabled);
    assert!(!slot.wake_pending);
    assert_eq!(slot.percentage, Some(55));
    assert!(slot.timer_active);
    assert_eq!(slot.next_reset_epoch_ms, Some(reset));
    assert_eq!(slot.wake_consecutive_errors, 0);
    assert_eq!(slot.model_calls_5h, 7);
    assert_eq!(slot.tokens_5h, 999);

    app.stop_monitoring().await.unwrap();
    assert!(!app.get_runtime_status().await.monitoring);
}

/// Saving settings while monitoring runs must apply the diff without a
/// full restart: newly enabled slots get a task pair and start polling.
#[tokio::test]
async fn save_settings_hot_enables_a_slot() {
    let server = MockServer::start().await;
    let reset = chrono::Local::now().timestamp_millis() + 3600 * 1000;

    Mock::given(method("GET"))
        .and(path("/api/monitor/usage/quota/limit"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 200,
            "data": { "limits": [
                { "type": "TOKENS_LIMIT", "percentage": 20, "nextResetTime": reset }
            ] }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/monitor/usage/model-usage"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 200,
            "data": { "totalUsage": {} }
        })))
        .mount(&server)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let app = App::new(
        ConfigStore::at_path(tmp.path().join("settings.json")),
        Arc::new(SystemClock),
        Arc::new(BroadcastEmitter::default()),
        Arc::new(NullSink),
    );

    let mut cfg = AppConfig::default();
    cfg.debug = true;
    cfg.mock_url = Some(server.uri());
    cfg.slots[0].enabled = true;
    cfg.slots[0].api_key = "key-1".into();
    let saved = app.save_settings(cfg).await.unwrap();

    app.start_monitoring().await.unwrap();

    // enable slot 2 while running
    let mut reconfig = saved.clone();
    reconfig.slots[1].enabled = true;
    reconfig.slots[1].api_key = "key-2".into();
    app.save_settings(reconfig).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let status = app.get_runtime_status().await;
        if status.slots[1].enabled && status.slots[1].percentage == Some(20) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "slot 2 never came online: {status:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    app.stop_monitoring().await.unwrap();
}
