//! Gateway behaviour end to end, against an in-process upstream and a mock HTTP server.

mod common;

use common::{fast_config, gateway, shared_config, wait_for, MockServerFixture, MockUpstream, Reply};
use mockito::Matcher;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use synthgate::telemetry::{InMemoryEventSink, Operation};
use synthgate::transport::{ClassifiedError, TimeoutPhase};
use synthgate::{AssetUpload, Error, Gateway, JobId, JobParams, PriorityLevel};
use tokio::time::Instant;

fn status(s: &str) -> Reply {
    Reply::Json(json!({"job_id": "job-1", "status": s}))
}

fn done() -> Reply {
    Reply::Json(json!({"job_id": "job-1", "status": "done", "result_url": "https://cdn/out.mp4"}))
}

#[tokio::test(start_paused = true)]
async fn test_capacity_two_five_callers() {
    for cfg in [fast_config(2), shared_config(2)] {
        let backend = cfg.admission.backend;
        let upstream = MockUpstream::slow(json!({"job_id": "j", "status": "created"}), Duration::from_millis(100));
        let gw = gateway(cfg, upstream.clone());

        let started = Instant::now();
        let mut tasks = Vec::new();
        for _ in 0..5 {
            let gw = gw.clone();
            tasks.push(tokio::spawn(async move {
                gw.create_job(&JobParams::new(), PriorityLevel::Normal).await
            }));
        }
        for t in tasks {
            assert_eq!(t.await.unwrap().unwrap(), JobId::from("j"));
        }
        let elapsed = started.elapsed();

        assert_eq!(upstream.calls(), 5);
        assert_eq!(upstream.max_in_flight(), 2, "{:?} backend", backend);
        assert!(elapsed >= Duration::from_millis(300), "{:?}: {:?}", backend, elapsed);
        assert!(elapsed < Duration::from_millis(400), "{:?}: {:?}", backend, elapsed);
        assert_eq!(gw.stats().await.active(), 0);
    }
}

#[tokio::test(start_paused = true)]
async fn test_overloaded_never_calls_upstream() {
    let mut cfg = fast_config(1);
    cfg.admission.admission_timeout_ms = 50;
    let upstream = MockUpstream::slow(json!({"job_id": "j"}), Duration::from_millis(500));
    let gw = gateway(cfg, upstream.clone());

    let busy = {
        let gw = gw.clone();
        tokio::spawn(async move { gw.create_job(&JobParams::new(), PriorityLevel::Low).await })
    };
    assert!(wait_for(gw.admission(), |s| s.active == 1).await);

    let err = gw.get_status(&JobId::from("j"), PriorityLevel::Critical).await.unwrap_err();
    assert!(matches!(err, Error::Overloaded { priority: PriorityLevel::Critical, .. }));
    assert_eq!(upstream.calls(), 1);

    busy.await.unwrap().unwrap();
    assert_eq!(gw.stats().await.active(), 0);
}

#[tokio::test]
async fn test_failures_never_leak_slots() {
    for cfg in [fast_config(3), shared_config(3)] {
        let upstream = MockUpstream::failing(503);
        let gw = gateway(cfg, upstream.clone());
        let mut tasks = Vec::new();
        for _ in 0..10 {
            let gw = gw.clone();
            tasks.push(tokio::spawn(async move {
                gw.get_status(&JobId::from("j"), PriorityLevel::Normal).await
            }));
        }
        for t in tasks {
            let err = t.await.unwrap().unwrap_err();
            assert!(matches!(err, Error::UpstreamUnavailable { attempts: 4, .. }), "{}", err);
        }
        assert_eq!(upstream.calls(), 40);
        assert_eq!(gw.stats().await.active(), 0);
    }
}

#[tokio::test]
async fn test_no_retry_classes() {
    let upstream = MockUpstream::failing(400);
    let gw = gateway(fast_config(1), upstream.clone());
    let err = gw.create_job(&JobParams::new(), PriorityLevel::Normal).await.unwrap_err();
    assert!(matches!(err, Error::InvalidRequest { status: 400, .. }));
    assert_eq!(upstream.calls(), 1);

    let upstream = MockUpstream::failing(429);
    let gw = gateway(fast_config(1), upstream.clone());
    let err = gw.create_job(&JobParams::new(), PriorityLevel::Normal).await.unwrap_err();
    assert!(matches!(err, Error::QuotaExceeded { .. }));
    assert_eq!(upstream.calls(), 1);
}

#[tokio::test]
async fn test_timeouts_retry_then_surface() {
    let upstream = MockUpstream::new(Reply::Fail(ClassifiedError::timeout(
        TimeoutPhase::Read,
        Duration::from_millis(10),
    )));
    let gw = gateway(fast_config(1), upstream.clone());
    let err = gw.get_status(&JobId::from("j"), PriorityLevel::High).await.unwrap_err();
    assert!(matches!(
        err,
        Error::TransportTimeout {
            phase: TimeoutPhase::Read,
            attempts: 4,
            ..
        }
    ));
    assert_eq!(upstream.calls(), 4);
}

#[tokio::test]
async fn test_panic_releases_slot() {
    for cfg in [fast_config(1), shared_config(1)] {
        let upstream = MockUpstream::new(Reply::Panic);
        let gw = gateway(cfg, upstream);
        let task = {
            let gw = gw.clone();
            tokio::spawn(async move { gw.get_status(&JobId::from("j"), PriorityLevel::Normal).await })
        };
        assert!(task.await.unwrap_err().is_panic());
        assert_eq!(gw.stats().await.active(), 0);
        // and the slot is usable again
        assert!(gw.admission().acquire(PriorityLevel::Low, Duration::from_millis(100)).await.is_ok());
    }
}

#[tokio::test]
async fn test_cancelled_call_releases_slot() {
    for cfg in [fast_config(1), shared_config(1)] {
        let upstream = MockUpstream::slow(json!({}), Duration::from_secs(30));
        let gw = gateway(cfg, upstream);
        let task = {
            let gw = gw.clone();
            tokio::spawn(async move { gw.get_status(&JobId::from("j"), PriorityLevel::Normal).await })
        };
        assert!(wait_for(gw.admission(), |s| s.active == 1).await);
        task.abort();
        let _ = task.await;
        assert!(wait_for(gw.admission(), |s| s.active == 0).await);
    }
}

#[tokio::test(start_paused = true)]
async fn test_wait_until_done_polls_to_completion() {
    let upstream = MockUpstream::scripted(done(), vec![status("created"), status("processing")], Duration::ZERO);
    let gw = gateway(fast_config(1), upstream.clone());
    let result = gw
        .wait_until_done(&JobId::from("job-1"), Duration::from_secs(10), PriorityLevel::Normal)
        .await
        .unwrap();
    assert_eq!(result.url, "https://cdn/out.mp4");
    assert_eq!(result.job_id, JobId::from("job-1"));
    assert_eq!(upstream.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_terminal_failures_return_immediately() {
    let upstream = MockUpstream::ok(json!({"job_id": "job-1", "status": "error", "error": "bad face"}));
    let gw = gateway(fast_config(1), upstream.clone());
    let err = gw
        .wait_until_done(&JobId::from("job-1"), Duration::from_secs(60), PriorityLevel::Normal)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::JobFailed { ref message, .. } if message == "bad face"));
    assert_eq!(upstream.calls(), 1);

    let upstream = MockUpstream::ok(json!({"job_id": "job-1", "status": "rejected"}));
    let gw = gateway(fast_config(1), upstream.clone());
    let err = gw
        .wait_until_done(&JobId::from("job-1"), Duration::from_secs(60), PriorityLevel::Normal)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::JobRejected { .. }));
    assert_eq!(upstream.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_poll_timeout() {
    let upstream = MockUpstream::ok(json!({"job_id": "job-1", "status": "processing"}));
    let gw = gateway(fast_config(1), upstream.clone());
    let started = Instant::now();
    let err = gw
        .wait_until_done(&JobId::from("job-1"), Duration::from_secs(2), PriorityLevel::Normal)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PollTimeout { ref last_status, .. } if last_status == "processing"));
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(started.elapsed() < Duration::from_millis(2_500));
    // 100, 125, 156, 195, 243, 303, 378, 400... ms between polls
    assert!(upstream.calls() > 3);
    assert_eq!(gw.stats().await.active(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_poll_timeout_while_waiting_for_slot() {
    let upstream = MockUpstream::ok(json!({"job_id": "job-1", "status": "processing"}));
    let gw = gateway(fast_config(1), upstream.clone());
    let held = gw.admission().acquire(PriorityLevel::Critical, Duration::from_secs(1)).await.unwrap();

    let err = gw
        .wait_until_done(&JobId::from("job-1"), Duration::from_secs(1), PriorityLevel::Normal)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PollTimeout { .. }), "{}", err);
    assert_eq!(upstream.calls(), 0);
    gw.admission().release(held).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_slow_poll_is_cut_off_at_max_wait() {
    for cfg in [fast_config(1), shared_config(1)] {
        let backend = cfg.admission.backend;
        let upstream = MockUpstream::slow(
            json!({"job_id": "job-1", "status": "processing"}),
            Duration::from_secs(30),
        );
        let gw = gateway(cfg, upstream.clone());

        let started = Instant::now();
        let err = gw
            .wait_until_done(&JobId::from("job-1"), Duration::from_secs(1), PriorityLevel::Normal)
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(
            matches!(err, Error::PollTimeout { ref last_status, .. } if last_status == "created"),
            "{:?}: {}",
            backend,
            err
        );
        assert!(elapsed >= Duration::from_secs(1), "{:?}: {:?}", backend, elapsed);
        assert!(elapsed < Duration::from_millis(1_100), "{:?}: {:?}", backend, elapsed);
        assert_eq!(upstream.calls(), 1);
        // the abandoned poll gives its slot back
        assert!(wait_for(gw.admission(), |s| s.active == 0).await, "{:?} backend", backend);
        assert_eq!(gw.stats().await.transport.in_use, 0);
    }
}

#[tokio::test(start_paused = true)]
async fn test_unbounded_max_wait() {
    for cfg in [fast_config(1), shared_config(1)] {
        let upstream = MockUpstream::scripted(done(), vec![status("processing")], Duration::ZERO);
        let gw = gateway(cfg, upstream.clone());
        let result = gw
            .wait_until_done(&JobId::from("job-1"), Duration::MAX, PriorityLevel::Normal)
            .await
            .unwrap();
        assert_eq!(result.url, "https://cdn/out.mp4");
        assert_eq!(upstream.calls(), 2);
    }
}

#[tokio::test(start_paused = true)]
async fn test_unknown_status_keeps_polling() {
    let upstream = MockUpstream::scripted(done(), vec![status("warming_up")], Duration::ZERO);
    let gw = gateway(fast_config(1), upstream.clone());
    let status = gw.get_status(&JobId::from("job-1"), PriorityLevel::Normal).await.unwrap();
    assert_eq!(status.state, synthgate::JobState::Processing);
    assert_eq!(status.raw_status, "warming_up");
    let result = gw
        .wait_until_done(&JobId::from("job-1"), Duration::from_secs(5), PriorityLevel::Normal)
        .await
        .unwrap();
    assert_eq!(result.url, "https://cdn/out.mp4");
}

#[tokio::test]
async fn test_events_are_recorded() {
    let sink = Arc::new(InMemoryEventSink::new(16));
    let upstream = MockUpstream::scripted(Reply::Fail(common::status_error(429)), vec![status("created")], Duration::ZERO);
    let gw = Gateway::builder()
        .config(fast_config(1))
        .transport(upstream)
        .event_sink(sink.clone())
        .build()
        .unwrap();

    gw.get_status(&JobId::from("job-1"), PriorityLevel::High).await.unwrap();
    gw.get_status(&JobId::from("job-1"), PriorityLevel::Low).await.unwrap_err();

    let events = sink.events_for(Operation::GetStatus);
    assert_eq!(events.len(), 2);
    assert!(events[0].is_ok());
    assert_eq!(events[0].priority, PriorityLevel::High);
    assert_eq!(events[1].outcome, "quota_exceeded");
    assert_eq!(events[1].attempts, 1);
    assert_eq!(events[1].http_status, Some(429));
}

#[tokio::test]
async fn test_close_rejects_further_calls() {
    let upstream = MockUpstream::ok(json!({"job_id": "j"}));
    let gw = gateway(fast_config(2), upstream.clone());
    gw.close().await;

    let err = gw.create_job(&JobParams::new(), PriorityLevel::Critical).await.unwrap_err();
    assert!(matches!(err, Error::Closed));
    assert_eq!(upstream.calls(), 0);
    let stats = gw.stats().await;
    assert!(stats.admission.closed);
    assert!(stats.transport.closed);
    assert!(upstream.is_closed());
}

#[tokio::test]
async fn test_stats_snapshot() {
    let upstream = MockUpstream::ok(json!({"job_id": "j"}));
    let gw = gateway(fast_config(4), upstream);
    let held = gw.admission().acquire(PriorityLevel::Normal, Duration::from_secs(1)).await.unwrap();
    let stats = gw.stats().await;
    assert_eq!(stats.admission.capacity, 4);
    assert_eq!(stats.active(), 1);
    assert_eq!(stats.available(), 3);
    assert_eq!(stats.waiting(), 0);
    assert_eq!(stats.retry.max_retries, 3);
    assert_eq!(stats.transport.transport, "mock");
    gw.admission().release(held).await.unwrap();
}

#[tokio::test]
async fn test_http_flow_against_mock_server() {
    let mut fx = MockServerFixture::new().await;
    let upload = fx
        .server
        .mock("POST", "/assets")
        .match_header("authorization", "Bearer test-key")
        .match_header("x-synthgate-request-id", Matcher::Any)
        .match_header("content-type", Matcher::Regex("multipart/form-data".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"asset_url":"https://cdn/in.png"}"#)
        .expect(1)
        .create_async()
        .await;
    let create = fx
        .server
        .mock("POST", "/jobs")
        .match_body(Matcher::PartialJson(json!({"assets": {"image": "https://cdn/in.png"}})))
        .with_status(201)
        .with_body(r#"{"job_id":"job-9","status":"created"}"#)
        .expect(1)
        .create_async()
        .await;
    let poll = fx
        .server
        .mock("GET", "/jobs/job-9")
        .with_status(200)
        .with_header("x-request-id", "up-1")
        .with_body(r#"{"job_id":"job-9","status":"done","result_url":"https://cdn/out.mp4"}"#)
        .expect(1)
        .create_async()
        .await;

    let gw = fx.gateway();
    let asset = gw
        .upload_asset(AssetUpload::new("in.png", "image/png", vec![1u8, 2, 3]), PriorityLevel::Normal)
        .await
        .unwrap();
    let job = gw
        .create_job(&JobParams::new().with_asset("image", &asset), PriorityLevel::Normal)
        .await
        .unwrap();
    assert_eq!(job, JobId::from("job-9"));
    let result = gw
        .wait_until_done(&job, Duration::from_secs(5), PriorityLevel::Normal)
        .await
        .unwrap();
    assert_eq!(result.url, "https://cdn/out.mp4");

    upload.assert_async().await;
    create.assert_async().await;
    poll.assert_async().await;

    let stats = gw.stats().await;
    assert_eq!(stats.transport.attempts_total, 3);
    assert_eq!(stats.active(), 0);
    gw.close().await;
}
