//! End-to-end tests for the bridge runtime.
//!
//! These exercise the whole stack together: transfer buffers, the context
//! pool, deadline enforcement, fault eviction, and rolling reloads under
//! concurrent dispatch.

use fastbridge_runtime::{
    Bridge, BridgeError, Encoding, HandlerSource, RuntimeConfig,
};
use serde_json::json;
use std::fs;
use std::time::Duration;
use tempfile::NamedTempFile;

fn create_handler_script(content: &str) -> NamedTempFile {
    let file = NamedTempFile::new().unwrap();
    fs::write(file.path(), content).unwrap();
    file
}

fn src(text: &str) -> HandlerSource {
    HandlerSource::new("test.js", text)
}

async fn start_bridge(source: &str, config: RuntimeConfig) -> Bridge {
    Bridge::start_with_sources(config, vec![src(source)])
        .await
        .unwrap()
}

// ============================================================================
// Dispatch Path
// ============================================================================

#[tokio::test]
async fn test_dispatch_from_script_file() {
    let script = create_handler_script(
        r#"
        fastbridge.register('add', function(args) {
            return { sum: args.a + args.b };
        });
        "#,
    );

    let bridge = Bridge::start(RuntimeConfig::default(), &[script.path()])
        .await
        .unwrap();

    let body = serde_json::to_vec(&json!({"a": 2, "b": 3})).unwrap();
    let result = bridge.dispatch("add", &body, Encoding::Json).await.unwrap();
    let value: serde_json::Value = serde_json::from_slice(&result).unwrap();
    assert_eq!(value, json!({"sum": 5}));
}

#[tokio::test]
async fn test_concurrent_dispatch_spreads_over_pool() {
    let bridge = start_bridge(
        "fastbridge.register('echo', function(args) { return args; });",
        RuntimeConfig {
            pool_size: 4,
            ..Default::default()
        },
    )
    .await;

    let mut tasks = Vec::new();
    for i in 0..32u64 {
        let bridge = bridge.clone();
        tasks.push(tokio::spawn(async move {
            let body = serde_json::to_vec(&json!({"i": i})).unwrap();
            let result = bridge.dispatch("echo", &body, Encoding::Json).await.unwrap();
            let value: serde_json::Value = serde_json::from_slice(&result).unwrap();
            assert_eq!(value, json!({"i": i}));
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let health = bridge.health();
    assert_eq!(health.total_executed, 32);
    assert_eq!(health.total_failed, 0);
    assert_eq!(health.idle_contexts, 4);
}

#[tokio::test]
async fn test_byte_payload_round_trip() {
    let bridge = start_bridge(
        r#"
        fastbridge.register('sum', function(bytes) {
            var total = 0;
            for (var i = 0; i < bytes.length; i++) { total += bytes[i]; }
            return total;
        });
        "#,
        RuntimeConfig::default(),
    )
    .await;

    let result = bridge
        .dispatch("sum", &[10, 20, 30], Encoding::Bytes)
        .await
        .unwrap();
    let value: serde_json::Value = serde_json::from_slice(&result).unwrap();
    assert_eq!(value, json!(60));
}

#[tokio::test]
async fn test_script_throw_does_not_kill_context() {
    let bridge = start_bridge(
        r#"
        fastbridge.register('fragile', function(args) {
            if (args.fail) { throw new Error('requested failure'); }
            return 'ok';
        });
        "#,
        RuntimeConfig {
            pool_size: 1,
            ..Default::default()
        },
    )
    .await;

    let body = serde_json::to_vec(&json!({"fail": true})).unwrap();
    let err = bridge.dispatch("fragile", &body, Encoding::Json).await.unwrap_err();
    assert!(matches!(err, BridgeError::HandlerPanicked { .. }));

    // same single context keeps serving
    let body = serde_json::to_vec(&json!({"fail": false})).unwrap();
    let result = bridge.dispatch("fragile", &body, Encoding::Json).await.unwrap();
    let value: serde_json::Value = serde_json::from_slice(&result).unwrap();
    assert_eq!(value, json!("ok"));

    let health = bridge.health();
    assert_eq!(health.total_failed, 1);
}

// ============================================================================
// Deadlines and Fault Eviction
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_deadline_miss_sacrifices_context_others_unaffected() {
    // pool of 2, three concurrent requests, all on a 50ms deadline, one of
    // them stuck well past it: the two fast ones succeed within the
    // deadline, the slow one times out, and the stuck context is replaced
    let bridge = start_bridge(
        r#"
        fastbridge.register('work', function(args) {
            var end = Date.now() + args.ms;
            while (Date.now() < end) {}
            return 'done';
        });
        "#,
        RuntimeConfig {
            pool_size: 2,
            request_timeout_ms: 1_000,
            ..Default::default()
        },
    )
    .await;

    let slow = {
        let bridge = bridge.clone();
        tokio::spawn(async move {
            let body = serde_json::to_vec(&json!({"ms": 200})).unwrap();
            bridge
                .dispatch_with_deadline("work", &body, Encoding::Json, Duration::from_millis(50))
                .await
        })
    };
    // let the slow request claim a context first
    tokio::time::sleep(Duration::from_millis(10)).await;

    let mut fast = Vec::new();
    for _ in 0..2 {
        let bridge = bridge.clone();
        fast.push(tokio::spawn(async move {
            let body = serde_json::to_vec(&json!({"ms": 1})).unwrap();
            bridge
                .dispatch_with_deadline("work", &body, Encoding::Json, Duration::from_millis(50))
                .await
        }));
    }

    let err = slow.await.unwrap().unwrap_err();
    assert!(matches!(err, BridgeError::Timeout(50)));
    for task in fast {
        let result = task.await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&result).unwrap();
        assert_eq!(value, json!("done"));
    }

    // the sacrificed slot's replacement rejoins the pool
    for _ in 0..100 {
        if bridge.health().idle_contexts == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(bridge.health().idle_contexts, 2);
}

#[tokio::test]
async fn test_repeated_faults_evict_context() {
    let bridge = start_bridge(
        r#"
        var served = 0;
        fastbridge.register('boom', function() { throw new Error('no'); });
        fastbridge.register('count', function() { served += 1; return served; });
        "#,
        RuntimeConfig {
            pool_size: 1,
            fault_threshold: 3,
            ..Default::default()
        },
    )
    .await;

    // warm the context's private counter
    bridge.dispatch("count", b"{}", Encoding::Json).await.unwrap();

    for _ in 0..3 {
        let err = bridge.dispatch("boom", b"{}", Encoding::Json).await.unwrap_err();
        assert!(matches!(err, BridgeError::HandlerPanicked { .. }));
    }

    // the evicted context's replacement starts with fresh globals
    let mut value = json!(null);
    for _ in 0..100 {
        if let Ok(result) = bridge
            .dispatch_with_deadline("count", b"{}", Encoding::Json, Duration::from_secs(2))
            .await
        {
            value = serde_json::from_slice(&result).unwrap();
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(value, json!(1));
}

// ============================================================================
// Rolling Reload
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reload_under_concurrent_dispatch() {
    let bridge = start_bridge(
        "fastbridge.register('version', function() { return 1; });",
        RuntimeConfig {
            pool_size: 3,
            reload_parallelism: 1,
            ..Default::default()
        },
    )
    .await;

    let traffic = {
        let bridge = bridge.clone();
        tokio::spawn(async move {
            // every in-flight response is a whole value from exactly one
            // generation, never a mix
            for _ in 0..60 {
                let result = bridge.dispatch("version", b"{}", Encoding::Json).await.unwrap();
                let value: serde_json::Value = serde_json::from_slice(&result).unwrap();
                assert!(value == json!(1) || value == json!(2), "got {value}");
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    let report = bridge
        .reload_sources(vec![src(
            "fastbridge.register('version', function() { return 2; });",
        )])
        .await
        .unwrap();
    assert!(report.is_complete());
    assert_eq!(report.generation, 2);

    traffic.await.unwrap();

    // after convergence only the new generation answers
    let result = bridge.dispatch("version", b"{}", Encoding::Json).await.unwrap();
    let value: serde_json::Value = serde_json::from_slice(&result).unwrap();
    assert_eq!(value, json!(2));
}

#[tokio::test]
async fn test_failed_reload_leaves_old_set_serving() {
    let bridge = start_bridge(
        "fastbridge.register('greet', function() { return 'hello'; });",
        RuntimeConfig {
            pool_size: 2,
            ..Default::default()
        },
    )
    .await;

    let err = bridge
        .reload_sources(vec![src("function ( broken")])
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::CompileError(_)));
    assert_eq!(bridge.generation(), 1);

    // old handlers still answer on every context
    for _ in 0..4 {
        let result = bridge.dispatch("greet", b"{}", Encoding::Json).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&result).unwrap();
        assert_eq!(value, json!("hello"));
    }
}

#[tokio::test]
async fn test_reload_replaces_route_table() {
    let bridge = start_bridge(
        "fastbridge.register('old_route', function() { return 1; });",
        RuntimeConfig {
            pool_size: 2,
            ..Default::default()
        },
    )
    .await;

    bridge
        .reload_sources(vec![src(
            "fastbridge.register('new_route', function() { return 2; });",
        )])
        .await
        .unwrap();

    let err = bridge.dispatch("old_route", b"{}", Encoding::Json).await.unwrap_err();
    assert!(matches!(err, BridgeError::HandlerNotFound(_)));

    let result = bridge.dispatch("new_route", b"{}", Encoding::Json).await.unwrap();
    let value: serde_json::Value = serde_json::from_slice(&result).unwrap();
    assert_eq!(value, json!(2));
    assert_eq!(bridge.routes(), vec!["new_route".to_string()]);
}

#[tokio::test]
async fn test_reload_from_updated_file() {
    let script = create_handler_script(
        "fastbridge.register('config', function() { return 'v1'; });",
    );
    let bridge = Bridge::start(
        RuntimeConfig {
            pool_size: 2,
            ..Default::default()
        },
        &[script.path()],
    )
    .await
    .unwrap();

    fs::write(
        script.path(),
        "fastbridge.register('config', function() { return 'v2'; });",
    )
    .unwrap();
    let report = bridge.reload(&[script.path()]).await.unwrap();
    assert!(report.is_complete());

    let result = bridge.dispatch("config", b"{}", Encoding::Json).await.unwrap();
    let value: serde_json::Value = serde_json::from_slice(&result).unwrap();
    assert_eq!(value, json!("v2"));
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_resize_then_dispatch() {
    let bridge = start_bridge(
        "fastbridge.register('noop', function() { return null; });",
        RuntimeConfig {
            pool_size: 1,
            ..Default::default()
        },
    )
    .await;

    bridge.resize(3).await.unwrap();
    assert_eq!(bridge.health().idle_contexts, 3);

    for _ in 0..6 {
        bridge.dispatch("noop", b"{}", Encoding::Json).await.unwrap();
    }
    assert_eq!(bridge.health().total_executed, 6);
}

#[tokio::test]
async fn test_shutdown_is_terminal() {
    let bridge = start_bridge(
        "fastbridge.register('noop', function() { return null; });",
        RuntimeConfig::default(),
    )
    .await;

    bridge.shutdown().await;
    let err = bridge.dispatch("noop", b"{}", Encoding::Json).await.unwrap_err();
    assert!(matches!(err, BridgeError::Shutdown));

    // repeat shutdown is harmless
    bridge.shutdown().await;
}
