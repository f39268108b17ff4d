//! Retry loop and lifecycle hooks, driven by a scripted transport.

mod common;

use callweave::trace::{ClientTrace, TraceEvent, TraceEventKind};
use callweave::{ApiRequest, CallContext, Client, Error, Request, RetryConfig, Slot};
use common::{init_logging, recording_factory, respond, respond_with_header, ScriptedTransport, Step};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
struct Item {
    id: u32,
}

fn fast_retries(count: u32) -> RetryConfig {
    RetryConfig::default()
        .with_count(count)
        .with_initial_wait(Duration::from_millis(1))
        .with_max_wait(Duration::from_millis(20))
        .with_randomization(0.0)
}

fn client(transport: &ScriptedTransport, retry: RetryConfig) -> Client {
    Client::builder()
        .base_url("https://api.example.com/v1")
        .unwrap()
        .transport(transport.clone())
        .retry_config(retry)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_locked_then_throttled_then_ok() {
    init_logging();
    let transport = ScriptedTransport::new([
        respond(423, "locked"),
        respond(429, "slow down"),
        respond(200, r#"{"id": 7}"#),
    ]);
    let log = Arc::new(Mutex::new(Vec::new()));
    let client = client(&transport, fast_retries(3)).and_trace(recording_factory("t", log.clone()));

    let item = Slot::<Item>::default();
    let outcome = client
        .get("/items/7")
        .with_result(&item)
        .send_raw(&CallContext::new())
        .await
        .unwrap();

    assert_eq!(outcome.attempts(), 3);
    assert!(outcome.was_retried());
    assert_eq!(outcome.status().unwrap().as_u16(), 200);
    assert_eq!(item.get(), Item { id: 7 });

    let log = log.lock();
    let count = |kind: &str| log.iter().filter(|e| *e == &format!("t:{}", kind)).count();
    assert_eq!(count("Start"), 3);
    assert_eq!(count("Retry"), 2);
    assert_eq!(count("AttemptDone"), 3);
    assert_eq!(count("ParseStart"), 1);
    assert_eq!(count("Done"), 1);

    assert_eq!(
        log[log.len() - 7..],
        [
            "t:Start",
            "t:ResponseHeaders",
            "t:FirstByte",
            "t:ParseStart",
            "t:ParseDone",
            "t:AttemptDone",
            "t:Done",
        ]
    );
}

#[tokio::test]
async fn test_exhausted_retries_return_last_error() {
    let transport = ScriptedTransport::always(respond(429, "still throttled"));
    let client = client(&transport, fast_retries(3));

    let result = client.get("/items").send_raw(&CallContext::new()).await;

    match result {
        Err(Error::Http {
            status,
            raw_response,
            ..
        }) => {
            assert_eq!(status.as_u16(), 429);
            assert_eq!(raw_response, "still throttled");
        }
        other => panic!("expected the last HTTP error, got {:?}", other),
    }
    assert_eq!(transport.calls(), 3);
}

#[tokio::test]
async fn test_default_predicate_does_not_retry_server_errors() {
    let transport = ScriptedTransport::always(respond(503, "down"));
    let client = client(&transport, fast_retries(5));

    let outcome = client.get("/items").dispatch(&CallContext::new()).await;

    assert_eq!(outcome.attempts(), 1);
    assert_eq!(outcome.error().and_then(Error::status).unwrap().as_u16(), 503);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn test_timeouts_retried_with_retryable_predicate() {
    let transport = ScriptedTransport::new([Step::Timeout, Step::Timeout, respond(204, "")]);
    let retry = fast_retries(3).with_predicate(callweave::retry::RetryOnRetryable);
    let client = client(&transport, retry);

    let outcome = client.delete("/items/1").send_raw(&CallContext::new()).await.unwrap();
    assert_eq!(outcome.attempts(), 3);
    assert_eq!(outcome.status().unwrap().as_u16(), 204);
}

#[tokio::test]
async fn test_retry_hook_sees_backoff_sequence() {
    let transport = ScriptedTransport::always(respond(429, ""));
    let delays = Arc::new(Mutex::new(Vec::new()));
    let recorded = delays.clone();

    let client = client(&transport, fast_retries(4)).and_trace(
        move |ctx: &CallContext, _: &Request| {
            let recorded = recorded.clone();
            let trace = ClientTrace::new().on(TraceEventKind::Retry, move |event| {
                if let TraceEvent::Retry { attempt, delay, .. } = event {
                    recorded.lock().push((*attempt, *delay));
                }
            });
            (ctx.clone(), trace)
        },
    );

    let _ = client.get("/items").dispatch(&CallContext::new()).await;

    assert_eq!(
        *delays.lock(),
        vec![
            (1, Duration::from_millis(1)),
            (2, Duration::from_millis(2)),
            (3, Duration::from_millis(4)),
        ]
    );
}

#[tokio::test]
async fn test_retry_after_header_overrides_backoff() {
    let transport = ScriptedTransport::new([
        respond_with_header(429, "retry-after", "0", "throttled"),
        respond(200, ""),
    ]);
    let delays = Arc::new(Mutex::new(Vec::new()));
    let recorded = delays.clone();

    let retry = fast_retries(2).with_initial_wait(Duration::from_secs(30));
    let client = client(&transport, retry).and_trace(move |ctx: &CallContext, _: &Request| {
        let recorded = recorded.clone();
        let trace = ClientTrace::new().on(TraceEventKind::Retry, move |event| {
            if let TraceEvent::Retry { delay, .. } = event {
                recorded.lock().push(*delay);
            }
        });
        (ctx.clone(), trace)
    });

    client.get("/items").send_raw(&CallContext::new()).await.unwrap();
    assert_eq!(*delays.lock(), vec![Duration::ZERO]);
}

#[tokio::test]
async fn test_factories_compose_in_registration_order() {
    let transport = ScriptedTransport::new([respond(200, "")]);
    let log = Arc::new(Mutex::new(Vec::new()));
    let client = client(&transport, fast_retries(1))
        .and_trace(recording_factory("a", log.clone()))
        .and_trace(recording_factory("b", log.clone()));

    client.get("/items").send_raw(&CallContext::new()).await.unwrap();

    let log = log.lock();
    assert_eq!(
        log[..4],
        ["a:Start", "b:Start", "a:ResponseHeaders", "b:ResponseHeaders"]
    );
    assert_eq!(log[log.len() - 2..], ["a:Done", "b:Done"]);
}

#[tokio::test]
async fn test_listeners_see_final_attempt_in_order() {
    let transport = ScriptedTransport::new([respond(429, ""), respond(200, "")]);
    let client = client(&transport, fast_retries(2));

    let order = Arc::new(Mutex::new(Vec::new()));
    let seen_attempt = Arc::new(AtomicU32::new(0));
    let (first, second, attempt) = (order.clone(), order.clone(), seen_attempt.clone());

    client
        .get("/items")
        .and_listener(move |ctx, outcome| {
            attempt.store(ctx.attempt(), Ordering::SeqCst);
            assert!(outcome.is_success());
            first.lock().push("first");
        })
        .and_listener(move |ctx, _| {
            assert!(ctx.is_retry());
            second.lock().push("second");
        })
        .send_raw(&CallContext::new())
        .await
        .unwrap();

    assert_eq!(*order.lock(), vec!["first", "second"]);
    assert_eq!(seen_attempt.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_error_target_filled_before_failure() {
    #[derive(Debug, Clone, Default, Deserialize)]
    struct Problem {
        code: String,
    }

    let transport = ScriptedTransport::new([respond(404, r#"{"code": "missing"}"#)]);
    let client = client(&transport, fast_retries(1));

    let problem = Slot::<Problem>::default();
    let result = client
        .get("/items/9")
        .with_error(&problem)
        .send_raw(&CallContext::new())
        .await;

    assert!(matches!(result, Err(Error::Http { .. })));
    assert_eq!(problem.get().code, "missing");
}

#[tokio::test]
async fn test_undecodable_body_is_not_retried() {
    let transport = ScriptedTransport::always(respond(200, "<html>"));
    let client = client(&transport, fast_retries(3));

    let item = Slot::<Item>::default();
    let result = client
        .get("/items/1")
        .with_result(&item)
        .send_raw(&CallContext::new())
        .await;

    match result {
        Err(Error::DeserializationFailed { raw_response, .. }) => assert_eq!(raw_response, "<html>"),
        other => panic!("expected DeserializationFailed, got {:?}", other),
    }
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn test_cancelled_during_backoff() {
    let transport = ScriptedTransport::always(respond(429, ""));
    let retry = fast_retries(5)
        .with_initial_wait(Duration::from_secs(10))
        .with_max_wait(Duration::from_secs(10));
    let client = client(&transport, retry);

    let ctx = CallContext::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let started = std::time::Instant::now();
    let result = client.get("/items").send_raw(&ctx).await;

    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn test_cancelled_context_sends_nothing() {
    let transport = ScriptedTransport::new([]);
    let client = client(&transport, fast_retries(3));

    let ctx = CallContext::new();
    ctx.cancel();
    let outcome = client.get("/items").dispatch(&ctx).await;

    assert!(matches!(outcome.error(), Some(Error::Cancelled)));
    assert_eq!(outcome.attempts(), 0);
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn test_redirect_is_followed_within_one_try() {
    init_logging();
    let transport = ScriptedTransport::new([
        respond_with_header(303, "location", "/jobs/1/result", ""),
        respond(200, r#"{"id": 1}"#),
    ]);
    let log = Arc::new(Mutex::new(Vec::new()));
    let client = client(&transport, fast_retries(1)).and_trace(recording_factory("t", log.clone()));

    let item = Slot::<Item>::default();
    let outcome = client
        .post("/jobs")
        .with_json(&serde_json::json!({"run": true}))
        .unwrap()
        .with_result(&item)
        .send_raw(&CallContext::new())
        .await
        .unwrap();

    assert_eq!(outcome.attempts(), 1);
    assert_eq!(item.get().id, 1);

    let seen = transport.seen();
    assert_eq!(seen[0].0, http::Method::POST);
    assert_eq!(seen[1].0, http::Method::GET);
    assert_eq!(seen[1].1.as_str(), "https://api.example.com/jobs/1/result");

    let starts = log.lock().iter().filter(|e| *e == "t:Start").count();
    assert_eq!(starts, 2);
}

#[tokio::test]
async fn test_transport_receives_try_number() {
    let transport = ScriptedTransport::new([respond(429, ""), respond(429, ""), respond(200, "")]);
    let client = client(&transport, fast_retries(3));

    client.get("/items").send_raw(&CallContext::new()).await.unwrap();
    assert_eq!(transport.tries(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_post_hooks_see_retries_of_wrapped_request() {
    let transport = ScriptedTransport::new([respond(429, "busy"), respond(409, "exists")]);
    let client = client(&transport, fast_retries(3));

    let seen = Arc::new(Mutex::new(None));
    let recorded = seen.clone();
    let request = client
        .post("/things")
        .into_api::<serde_json::Value>()
        .after(move |ctx, _, result| {
            *recorded.lock() = Some((ctx.is_retry(), ctx.attempt()));
            // A conflict after a retry means the first try went through.
            match result {
                Err(e) if ctx.is_retry() && e.status().map(|s| s.as_u16()) == Some(409) => Ok(()),
                other => other,
            }
        });

    request.call(&CallContext::new()).await.unwrap();

    assert_eq!(transport.calls(), 2);
    assert_eq!(*seen.lock(), Some((true, 2)));
}

#[tokio::test]
async fn test_post_hooks_see_first_try_without_retries() {
    let transport = ScriptedTransport::new([respond(200, "")]);
    let client = client(&transport, fast_retries(3));

    let seen = Arc::new(Mutex::new(None));
    let recorded = seen.clone();
    let request = ApiRequest::all(vec![Arc::new(client.get("/items")) as Arc<dyn callweave::Sendable>])
        .after(move |ctx, _, result| {
            *recorded.lock() = Some((ctx.is_retry(), ctx.attempt()));
            result
        });

    request.call(&CallContext::new()).await.unwrap();
    assert_eq!(*seen.lock(), Some((false, 1)));
}
