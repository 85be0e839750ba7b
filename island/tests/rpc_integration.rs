//
// Copyright 2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//


//! Integration tests for rpc calls between services on one broker.
//!
//! These tests verify:
//! - Request/response round trips and raw responses
//! - Error propagation with the origin's extra info and uuid
//! - Request and error hooks
//! - Schema validation of requests and results
//! - Pause/resume and purge with a request in flight
//! - Callers that stop waiting leave nothing pending
//! - Redelivery of 503 failures
//! - Flow mode quarantine of delayed shards

mod common;

use common::{TestIsland, handler, test_config};
use island::broker::{MemoryBroker, Properties};
use island::codec::RpcResponse;
use island::context::RequestContext;
use island::error::{ErrorCode, ErrorKind, IslandCode, IslandError};
use island::rpc::{
    InvokeOptions, RpcErrorHookType, RpcHookType, RpcOptions, RpcType, Schema,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::{sleep, timeout};

struct StringSchema;

impl Schema for StringSchema {
    fn validate(&self, value: &Value) -> Result<(), String> {
        if value.is_string() {
            Ok(())
        } else {
            Err(format!("expected a string, got {value}"))
        }
    }
}

fn custom_error() -> IslandError {
    IslandError::uncategorized(IslandCode::UNKNOWN, "Error", "custom error")
}

async fn island(broker: &Arc<MemoryBroker>, service: &str, dir: &TempDir) -> TestIsland {
    TestIsland::start(broker, test_config(service, dir.path())).await
}

#[tokio::test]
async fn test_rpc_call() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(MemoryBroker::new());
    let island = island(&broker, "haha", &dir).await;

    island.rpc.register(
        "testMethod",
        handler(|req, _ctx| async move {
            assert_eq!(req, json!("hello"));
            Ok(json!("world"))
        }),
        RpcType::Rpc,
        RpcOptions::default(),
    );
    island.rpc.listen().await.unwrap();

    let res = island.rpc.invoke("testMethod", json!("hello")).await.unwrap();
    assert_eq!(res, json!("world"));
    assert_eq!(island.rpc.pending_count(), 0);

    island.stop().await;
}

#[tokio::test]
async fn test_listen_declares_sharded_topology() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(MemoryBroker::new());
    let island = island(&broker, "topology", &dir).await;

    island.rpc.register(
        "lookup",
        handler(|req, _ctx| async move { Ok(req) }),
        RpcType::Endpoint,
        RpcOptions::default(),
    );
    island.rpc.listen().await.unwrap();

    assert!(broker.has_exchange("lookup"));
    let mut bindings = broker.bindings("lookup");
    bindings.sort();
    assert_eq!(
        bindings,
        vec![
            ("rpc.req.topology.0".to_string(), "0".to_string()),
            ("rpc.req.topology.1".to_string(), "1".to_string()),
        ]
    );
    assert_eq!(broker.consumer_count("rpc.req.topology.0"), 1);
    assert_eq!(broker.consumer_count(island.rpc.response_queue()), 1);
    assert!(
        island
            .rpc
            .response_queue()
            .starts_with("rpc.res.topology.test-host.")
    );

    island.stop().await;
}

#[tokio::test]
async fn test_raw_response() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(MemoryBroker::new());
    let island = island(&broker, "haha", &dir).await;

    island.rpc.register(
        "testMethod",
        handler(|_req, _ctx| async move { Ok(json!("haha")) }),
        RpcType::Rpc,
        RpcOptions::default(),
    );
    island.rpc.listen().await.unwrap();

    let res = island
        .rpc
        .invoke_raw(
            &RequestContext::new(),
            "testMethod",
            Value::Null,
            InvokeOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(res.body, json!("haha"));
    assert_eq!(RpcResponse::decode(&res.raw).into_result().unwrap(), json!("haha"));

    island.stop().await;
}

#[tokio::test]
async fn test_error_carries_extra_info() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(MemoryBroker::new());
    let island = island(&broker, "haha", &dir).await;

    island.rpc.register(
        "HOHO",
        handler(|_req, _ctx| async move {
            Err(IslandError::fatal(10010001, "islet already has been registered"))
        }),
        RpcType::Rpc,
        RpcOptions::default(),
    );
    island.rpc.listen().await.unwrap();

    let error = island.rpc.invoke("HOHO", json!("asdf")).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Fatal);
    assert_eq!(error.code(), 10010001);
    assert_eq!(error.extra_str("rpcName"), Some("HOHO"));
    assert_eq!(error.extra_str("island"), Some("haha"));
    assert_eq!(error.extra()["req"], json!("asdf"));
    assert!(error.uuid().is_some());

    island.stop().await;
}

#[tokio::test]
async fn test_uuid_is_kept_through_the_chain() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(MemoryBroker::new());
    let island = island(&broker, "haha", &dir).await;
    let origin_uuid = Arc::new(parking_lot::Mutex::new(None::<String>));

    let recorded = Arc::clone(&origin_uuid);
    island.rpc.register(
        "in",
        handler(move |_req, _ctx| {
            let recorded = Arc::clone(&recorded);
            async move {
                let error = IslandError::fatal(10010001, "inner failure");
                *recorded.lock() = error.uuid().map(str::to_string);
                Err(error)
            }
        }),
        RpcType::Rpc,
        RpcOptions::default(),
    );
    let rpc = island.rpc.clone();
    island.rpc.register(
        "out",
        handler(move |_req, ctx| {
            let rpc = rpc.clone();
            async move {
                rpc.invoke_with(&ctx, "in", json!("a"), InvokeOptions::default())
                    .await
            }
        }),
        RpcType::Rpc,
        RpcOptions::default(),
    );
    island.rpc.listen().await.unwrap();

    let error = island.rpc.invoke("out", json!("b")).await.unwrap_err();
    let expected = origin_uuid.lock().clone();
    assert!(expected.is_some());
    assert_eq!(error.uuid().map(str::to_string), expected);
    assert_eq!(error.extra_str("rpcName"), Some("in"));
    assert_eq!(error.extra()["req"], json!("a"));

    island.stop().await;
}

#[tokio::test]
async fn test_error_names_the_island_it_came_from() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(MemoryBroker::new());
    let first = island(&broker, "haha", &dir).await;
    let second = island(&broker, "second-island", &dir).await;
    let third = island(&broker, "third-island", &dir).await;

    third.rpc.register(
        "THIRD",
        handler(|_req, _ctx| async move { Err(custom_error()) }),
        RpcType::Rpc,
        RpcOptions::default(),
    );
    third.rpc.listen().await.unwrap();

    let rpc = second.rpc.clone();
    second.rpc.register(
        "SECOND",
        handler(move |_req, ctx| {
            let rpc = rpc.clone();
            async move {
                rpc.invoke_with(&ctx, "THIRD", json!("hello"), InvokeOptions::default())
                    .await
            }
        }),
        RpcType::Rpc,
        RpcOptions::default(),
    );
    second.rpc.listen().await.unwrap();

    let rpc = first.rpc.clone();
    first.rpc.register(
        "FIRST",
        handler(move |_req, ctx| {
            let rpc = rpc.clone();
            async move {
                rpc.invoke_with(&ctx, "SECOND", json!("hello"), InvokeOptions::default())
                    .await
            }
        }),
        RpcType::Rpc,
        RpcOptions::default(),
    );
    first.rpc.listen().await.unwrap();

    let error = second.rpc.invoke("FIRST", json!("hello")).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Etc);
    assert_eq!(error.code(), 10020001);
    assert_eq!(error.name(), "Error");
    assert_eq!(error.extra_str("island"), Some("third-island"));
    assert_eq!(error.extra_str("rpcName"), Some("THIRD"));

    first.stop().await;
    second.stop().await;
    third.stop().await;
}

#[tokio::test]
async fn test_schema_errors_name_their_origin() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(MemoryBroker::new());
    let second = island(&broker, "second-island", &dir).await;
    let third = island(&broker, "third-island", &dir).await;

    let options = RpcOptions::default()
        .with_query(Arc::new(StringSchema))
        .with_result(Arc::new(StringSchema));
    third.rpc.register(
        "THIRD",
        handler(|_req, _ctx| async move { Ok(json!("hello")) }),
        RpcType::Rpc,
        options,
    );
    third.rpc.listen().await.unwrap();

    let rpc = second.rpc.clone();
    second.rpc.register(
        "SECOND",
        handler(move |_req, ctx| {
            let rpc = rpc.clone();
            async move {
                rpc.invoke_with(&ctx, "THIRD", json!(1234), InvokeOptions::default())
                    .await
            }
        }),
        RpcType::Rpc,
        RpcOptions::default(),
    );
    second.rpc.listen().await.unwrap();

    assert_eq!(
        second.rpc.invoke("THIRD", json!("hi")).await.unwrap(),
        json!("hello")
    );

    let error = second.rpc.invoke("SECOND", json!("hello")).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Logic);
    assert_eq!(error.split().error_code, ErrorCode::WrongParameterSchema.get());
    assert_eq!(error.reason(), "Wrong parameter schema");
    assert_eq!(error.extra_str("island"), Some("third-island"));
    assert_eq!(error.extra_str("rpcName"), Some("THIRD"));

    second.stop().await;
    third.stop().await;
}

#[tokio::test]
async fn test_result_schema_failure_is_fatal() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(MemoryBroker::new());
    let island = island(&broker, "haha", &dir).await;

    island.rpc.register(
        "numbers",
        handler(|_req, _ctx| async move { Ok(json!(42)) }),
        RpcType::Rpc,
        RpcOptions::default().with_result(Arc::new(StringSchema)),
    );
    island.rpc.listen().await.unwrap();

    let error = island.rpc.invoke("numbers", json!("x")).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Fatal);
    assert_eq!(error.split().error_code, ErrorCode::HandleMessageError.get());
    assert_eq!(error.reason(), "Wrong result schema");

    island.stop().await;
}

#[tokio::test]
async fn test_hooks_chain_in_registration_order() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(MemoryBroker::new());
    let island = island(&broker, "haha", &dir).await;

    let prefix = |prefix: &'static str| {
        Arc::new(move |v: Value| async move {
            Ok::<_, IslandError>(json!(format!("{prefix}{}", v.as_str().unwrap_or_default())))
        })
    };
    island.rpc.register_hook(RpcHookType::PreRpc, prefix("hi-"));
    island.rpc.register_hook(RpcHookType::PreRpc, prefix("hey-"));
    island.rpc.register_hook(
        RpcHookType::PostRpc,
        Arc::new(|v: Value| async move { Ok::<_, IslandError>(json!({ "first": v })) }),
    );
    island.rpc.register_hook(
        RpcHookType::PostRpc,
        Arc::new(|v: Value| async move { Ok::<_, IslandError>(json!({ "second": v })) }),
    );

    for (name, suffix) in [("world", "world"), ("hell", "hell")] {
        island.rpc.register(
            name,
            handler(move |req, _ctx| async move {
                let key = req.as_str().unwrap_or_default().to_string();
                Ok(json!({ key: suffix }))
            }),
            RpcType::Rpc,
            RpcOptions::default(),
        );
    }
    island.rpc.listen().await.unwrap();

    assert_eq!(
        island.rpc.invoke("world", json!("hello")).await.unwrap(),
        json!({ "second": { "first": { "hey-hi-hello": "world" } } })
    );
    assert_eq!(
        island.rpc.invoke("hell", json!("damn")).await.unwrap(),
        json!({ "second": { "first": { "hey-hi-damn": "hell" } } })
    );

    island.stop().await;
}

#[tokio::test]
async fn test_endpoints_use_endpoint_hooks() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(MemoryBroker::new());
    let island = island(&broker, "haha", &dir).await;

    island.rpc.register_hook(
        RpcHookType::PreRpc,
        Arc::new(|_v: Value| async move { Ok::<_, IslandError>(json!("rpc hook")) }),
    );
    island.rpc.register_hook(
        RpcHookType::PreEndpoint,
        Arc::new(|_v: Value| async move { Ok::<_, IslandError>(json!("endpoint hook")) }),
    );
    island.rpc.register(
        "GET /users",
        handler(|req, _ctx| async move { Ok(req) }),
        RpcType::Endpoint,
        RpcOptions::default(),
    );
    island.rpc.listen().await.unwrap();

    assert_eq!(
        island.rpc.invoke("GET /users", json!("raw")).await.unwrap(),
        json!("endpoint hook")
    );

    island.stop().await;
}

#[tokio::test]
async fn test_pre_error_hook_changes_the_reply() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(MemoryBroker::new());
    let island = island(&broker, "haha", &dir).await;
    let post_called = Arc::new(AtomicBool::new(false));

    island.rpc.register_error_hook(
        RpcErrorHookType::PreRpcError,
        Arc::new(|e: IslandError| async move { e.with_extra("message", "pre-hooked") }),
    );
    let called = Arc::clone(&post_called);
    island.rpc.register_error_hook(
        RpcErrorHookType::PostRpcError,
        Arc::new(move |e: IslandError| {
            let called = Arc::clone(&called);
            async move {
                called.store(true, Ordering::SeqCst);
                e.with_extra("message", "post-hooked")
            }
        }),
    );
    island.rpc.register(
        "world",
        handler(|_req, _ctx| async move { Err(custom_error()) }),
        RpcType::Rpc,
        RpcOptions::default(),
    );
    island.rpc.listen().await.unwrap();

    let error = island.rpc.invoke("world", json!("hello")).await.unwrap_err();
    assert!(error.to_string().contains("custom error"));
    assert_eq!(error.extra_str("message"), Some("pre-hooked"));
    sleep(Duration::from_millis(20)).await;
    assert!(post_called.load(Ordering::SeqCst));

    island.stop().await;
}

#[tokio::test]
async fn test_pause_and_resume() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(MemoryBroker::new());
    let island = island(&broker, "haha", &dir).await;

    island.rpc.register(
        "testPause",
        handler(|req, _ctx| async move {
            Ok(json!(format!("{} world", req.as_str().unwrap_or_default())))
        }),
        RpcType::Rpc,
        RpcOptions::default(),
    );
    island.rpc.listen().await.unwrap();
    island.rpc.pause_all().await;

    let rpc = island.rpc.clone();
    let call = tokio::spawn(async move { rpc.invoke("testPause", json!("hello")).await });
    sleep(Duration::from_millis(50)).await;
    assert!(!call.is_finished());

    island.rpc.resume_all().await.unwrap();
    assert_eq!(call.await.unwrap().unwrap(), json!("hello world"));

    island.stop().await;
}

#[tokio::test]
async fn test_ongoing_request_is_answered_despite_purge() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(MemoryBroker::new());
    let island = island(&broker, "haha", &dir).await;

    let rpc = island.rpc.clone();
    island.rpc.register(
        "AAA",
        handler(move |_req, _ctx| {
            let rpc = rpc.clone();
            async move {
                rpc.sig_info();
                tokio::spawn(async move { rpc.purge().await });
                sleep(Duration::from_millis(50)).await;
                Ok(json!("world"))
            }
        }),
        RpcType::Rpc,
        RpcOptions::default(),
    );
    island.rpc.listen().await.unwrap();

    assert_eq!(island.rpc.invoke("AAA", json!(50)).await.unwrap(), json!("world"));
    assert!(!island.rpc.has_rpc("AAA"));

    island.stop().await;
}

#[tokio::test]
async fn test_failed_publish_leaves_nothing_pending() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(MemoryBroker::new());
    let island = island(&broker, "haha", &dir).await;

    island.rpc.register(
        "testMethod",
        handler(|_req, _ctx| async move { Ok(json!("world")) }),
        RpcType::Rpc,
        RpcOptions::default(),
    );
    island.rpc.listen().await.unwrap();

    broker.fail_next_publishes(1);
    let error = island.rpc.invoke("testMethod", json!("hello")).await.unwrap_err();
    assert!(error.reason().contains("injected failure"));
    assert_eq!(island.rpc.pending_count(), 0);

    assert_eq!(
        island.rpc.invoke("testMethod", json!("hello")).await.unwrap(),
        json!("world")
    );

    island.stop().await;
}

#[tokio::test]
async fn test_503_is_redelivered() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(MemoryBroker::new());
    let island = island(&broker, "haha", &dir).await;
    let called = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&called);
    island.rpc.register(
        "testMethod",
        handler(move |_req, _ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Err(custom_error().with_status_code(503)) }
        }),
        RpcType::Rpc,
        RpcOptions::default(),
    );
    island.rpc.listen().await.unwrap();

    let result = island
        .rpc
        .invoke_with(
            &RequestContext::new(),
            "testMethod",
            json!("hello"),
            InvokeOptions::with_timeout(Duration::from_millis(1500)),
        )
        .await;
    let error = result.unwrap_err();
    assert!(error.is_timeout());
    assert!(called.load(Ordering::SeqCst) >= 2);

    island.stop().await;
}

#[tokio::test]
async fn test_delayed_request_quarantines_its_shard() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(MemoryBroker::new());
    let island = TestIsland::start(
        &broker,
        test_config("haha", dir.path()).with_flow_mode_delay(Duration::from_secs(10)),
    )
    .await;

    island.rpc.register(
        "testTest",
        handler(|req, _ctx| async move { Ok(req) }),
        RpcType::Rpc,
        RpcOptions::default(),
    );
    island.rpc.listen().await.unwrap();
    island.rpc.pause_all().await;

    let rpc = island.rpc.clone();
    let call = tokio::spawn(async move { rpc.invoke("testTest", json!("hi")).await });
    sleep(Duration::from_millis(400)).await;
    island.rpc.resume_all().await.unwrap();
    assert_eq!(call.await.unwrap().unwrap(), json!("hi"));

    let available = island.rpc.router().available();
    assert_eq!(available.len(), 1);
    let remaining = available[0];
    for _ in 0..100 {
        assert_eq!(island.rpc.router().select(), remaining);
    }

    island.stop().await;
}

#[tokio::test]
async fn test_unknown_rpc_is_rejected_at_publish() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(MemoryBroker::new());
    let island = island(&broker, "haha", &dir).await;

    let error = island.rpc.invoke("UNMETHOD", json!("arg")).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Etc);
    assert!(error.reason().contains("UNMETHOD"));
    assert_eq!(island.rpc.pending_count(), 0);

    island.stop().await;
}

#[tokio::test]
async fn test_dropped_invoke_leaves_nothing_pending() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(MemoryBroker::new());
    let island = island(&broker, "haha", &dir).await;

    island.rpc.register(
        "ghost",
        handler(|req, _ctx| async move { Ok(req) }),
        RpcType::Rpc,
        RpcOptions::default(),
    );
    island.rpc.listen().await.unwrap();
    island.rpc.pause_all().await;

    let abandoned = timeout(
        Duration::from_millis(50),
        island.rpc.invoke("ghost", json!("boo")),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(island.rpc.pending_count(), 0);

    // The reply to the abandoned call arrives late and is dropped.
    island.rpc.resume_all().await.unwrap();
    assert_eq!(island.rpc.invoke("ghost", json!("again")).await.unwrap(), json!("again"));
    assert_eq!(island.rpc.pending_count(), 0);

    island.stop().await;
}

#[tokio::test]
async fn test_exec_timeout_abandons_nested_call() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(MemoryBroker::new());
    let island = TestIsland::start(
        &broker,
        test_config("haha", dir.path()).with_rpc_exec_timeout(Duration::from_millis(300)),
    )
    .await;

    island.rpc.register(
        "slow",
        handler(|req, _ctx| async move {
            sleep(Duration::from_millis(800)).await;
            Ok(req)
        }),
        RpcType::Rpc,
        RpcOptions::default(),
    );
    let rpc = island.rpc.clone();
    island.rpc.register(
        "outer",
        handler(move |req, _ctx| {
            let rpc = rpc.clone();
            async move {
                rpc.invoke_with(
                    &RequestContext::new(),
                    "slow",
                    req,
                    InvokeOptions::with_timeout(Duration::from_secs(3)),
                )
                .await
            }
        }),
        RpcType::Rpc,
        RpcOptions::default(),
    );
    island.rpc.listen().await.unwrap();

    let error = island.rpc.invoke("outer", json!("hi")).await.unwrap_err();
    assert!(error.is_timeout());
    assert_eq!(error.extra().get("location"), Some(&json!("consume")));
    assert_eq!(error.extra().get("rpcName"), Some(&json!("outer")));
    assert_eq!(island.rpc.pending_count(), 0);

    island.stop().await;
}

#[tokio::test]
async fn test_purge_serves_requests_already_delivered() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(MemoryBroker::new());
    let island = island(&broker, "haha", &dir).await;
    let served = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&served);
    island.rpc.register(
        "slowpoke",
        handler(move |req, _ctx| {
            let counter = Arc::clone(&counter);
            async move {
                sleep(Duration::from_millis(100)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(req)
            }
        }),
        RpcType::Rpc,
        RpcOptions::default(),
    );
    island.rpc.listen().await.unwrap();

    for (n, shard) in ["0", "1", "0", "1"].into_iter().enumerate() {
        let properties = Properties {
            correlation_id: Some(format!("unawaited-{n}")),
            reply_to: Some(island.rpc.response_queue().to_string()),
            ..Properties::default()
        };
        island
            .pool
            .using_channel(|channel| async move {
                channel
                    .publish("slowpoke", shard, b"1".to_vec(), properties)
                    .await
                    .map_err(IslandError::from)
            })
            .await
            .unwrap();
    }
    island.rpc.purge().await;

    assert_eq!(served.load(Ordering::SeqCst), 4);
    assert_eq!(island.collector.ongoing_count("rpc"), 0);
    assert!(!island.rpc.has_rpc("slowpoke"));

    island.stop().await;
}
