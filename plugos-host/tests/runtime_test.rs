//! End-to-end tests of the plug runtime on the thread substrate

use plugos_host::audit::{AuditAction, MemoryAuditSink};
use plugos_host::testing::wat;
use plugos_host::{
    system_syscalls, Environment, FunctionDef, Hook, LogLevel, Manifest, PlugError, SandboxError,
    SyscallError, SyscallMapping, System, SystemConfig, SystemError, ThreadUnitFactory, UnitChannel,
    UnitFactory, UnitHandle, Value,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn echo_system() -> System {
    let system = System::default();
    system.register_syscalls(
        &[],
        SyscallMapping::new().with("echo", |_ctx, args: Vec<Value>| async move {
            anyhow::Ok(args.into_iter().next().unwrap_or_default())
        }),
    );
    system
}

/// Registers `danger` behind the `admin` permission and counts its calls
fn danger_system(calls: Arc<AtomicUsize>) -> System {
    let system = System::default();
    system.register_syscalls(
        &["admin"],
        SyscallMapping::new().with("danger", move |_ctx, _args| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(json!("done"))
            }
        }),
    );
    system
}

#[tokio::test]
async fn test_syscall_echo() {
    let system = echo_system();
    let manifest = Manifest::new("greeter").function(
        "greet",
        FunctionDef::with_code(wat::calls_syscall("echo", &[json!("hi")])),
    );

    let plug = system
        .load(manifest, &ThreadUnitFactory)
        .await
        .expect("Failed to load plug");
    let result = plug.invoke("greet", vec![]).await.expect("Invoke failed");
    assert_eq!(result, json!("hi"));

    // Same call, same answer
    let again = plug.invoke("greet", vec![]).await.expect("Invoke failed");
    assert_eq!(again, result);
}

#[tokio::test]
async fn test_missing_permission_never_reaches_handler() {
    let calls = Arc::new(AtomicUsize::new(0));
    let system = danger_system(calls.clone());

    let manifest = Manifest::new("intruder").function(
        "attack",
        FunctionDef::with_code(wat::calls_syscall("danger", &[])),
    );
    let plug = system.load(manifest, &ThreadUnitFactory).await.unwrap();

    let err = plug.invoke("attack", vec![]).await.unwrap_err();
    assert!(
        err.to_string().contains("Missing permission"),
        "unexpected error: {}",
        err
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let err = plug.syscall("danger", vec![]).await.unwrap_err();
    assert!(matches!(err, SyscallError::MissingPermission { ref permission, .. } if permission == "admin"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // Host context has no plug to check
    assert!(matches!(
        system.syscall("danger", vec![]).await,
        Err(SyscallError::MissingContext { .. })
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_granted_permission_reaches_handler() {
    let calls = Arc::new(AtomicUsize::new(0));
    let system = danger_system(calls.clone());

    let manifest = Manifest::new("admin-tool").permission("admin").function(
        "run",
        FunctionDef::with_code(wat::calls_syscall("danger", &[])),
    );
    let plug = system.load(manifest, &ThreadUnitFactory).await.unwrap();

    assert!(plug.has_permission("admin"));
    assert_eq!(plug.invoke("run", vec![]).await.unwrap(), json!("done"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unregistered_syscall_from_plug() {
    let system = System::default();
    let manifest = Manifest::new("lost").function(
        "run",
        FunctionDef::with_code(wat::calls_syscall("nowhere", &[])),
    );
    let plug = system.load(manifest, &ThreadUnitFactory).await.unwrap();

    let err = plug.invoke("run", vec![]).await.unwrap_err();
    assert_eq!(err.to_string(), "Unregistered syscall nowhere");
}

#[tokio::test]
async fn test_function_error_message() {
    let system = System::default();
    let manifest = Manifest::new("crashy").function("boom", FunctionDef::with_code(wat::fails("BOOM")));
    let plug = system.load(manifest, &ThreadUnitFactory).await.unwrap();

    match plug.invoke("boom", vec![]).await {
        Err(PlugError::Sandbox(SandboxError::Unit(message))) => assert_eq!(message, "BOOM"),
        other => panic!("Expected unit error, got {:?}", other),
    }

    // The unit survives a failing call
    assert!(!plug.is_stopped());
}

#[tokio::test]
async fn test_trap_is_reported() {
    let system = System::default();
    let manifest = Manifest::new("trappy").function("trap", FunctionDef::with_code(wat::traps()));
    let plug = system.load(manifest, &ThreadUnitFactory).await.unwrap();

    let err = plug.invoke("trap", vec![]).await.unwrap_err();
    assert!(err.to_string().contains("unreachable"));
}

#[tokio::test]
async fn test_args_reach_function() {
    let system = System::default();
    let manifest = Manifest::new("echo").function("echo", FunctionDef::with_code(wat::echo_args()));
    let plug = system.load(manifest, &ThreadUnitFactory).await.unwrap();

    let result = plug
        .invoke("echo", vec![json!(1), json!("two"), json!({"three": [3]})])
        .await
        .unwrap();
    assert_eq!(result, json!([1, "two", {"three": [3]}]));
}

#[tokio::test]
async fn test_unknown_function_and_missing_code() {
    let system = System::default();
    let manifest = Manifest::new("sparse").function("empty", FunctionDef::default());
    let plug = system.load(manifest, &ThreadUnitFactory).await.unwrap();

    assert!(matches!(
        plug.invoke("nope", vec![]).await,
        Err(PlugError::FunctionNotFound { .. })
    ));
    assert!(matches!(
        plug.invoke("empty", vec![]).await,
        Err(PlugError::MissingCode { .. })
    ));
    assert!(!plug.can_invoke("nope"));
}

#[tokio::test]
async fn test_environment_gating() {
    let system = System::new(SystemConfig::new().with_env(Environment::Client));
    let manifest = Manifest::new("split")
        // Invalid code: reaching the unit would fail differently
        .function("server_only", FunctionDef::with_code("(module (func").env(Environment::Server))
        .function("client_ok", FunctionDef::with_code(wat::returns(&json!("client"))).env(Environment::Client))
        .function("anywhere", FunctionDef::with_code(wat::returns(&json!("any"))));
    let plug = system.load(manifest, &ThreadUnitFactory).await.unwrap();

    match plug.invoke("server_only", vec![]).await {
        Err(PlugError::EnvironmentMismatch { required, host, .. }) => {
            assert_eq!(required, Environment::Server);
            assert_eq!(host, Environment::Client);
        }
        other => panic!("Expected environment mismatch, got {:?}", other),
    }
    assert!(!plug.can_invoke("server_only"));
    assert!(plug.can_invoke("client_ok"));

    assert_eq!(plug.invoke("client_ok", vec![]).await.unwrap(), json!("client"));
    assert_eq!(plug.invoke("anywhere", vec![]).await.unwrap(), json!("any"));
}

#[tokio::test]
async fn test_can_invoke_agrees_with_invoke() {
    for env in [None, Some(Environment::Client), Some(Environment::Server)] {
        let mut config = SystemConfig::new();
        config.env = env;
        let system = System::new(config);
        let manifest = Manifest::new("split")
            .function("client", FunctionDef::with_code(wat::returns(&json!(1))).env(Environment::Client))
            .function("server", FunctionDef::with_code(wat::returns(&json!(2))).env(Environment::Server))
            .function("anywhere", FunctionDef::with_code(wat::returns(&json!(3))));
        let plug = system.load(manifest, &ThreadUnitFactory).await.unwrap();

        for function in ["client", "server", "anywhere"] {
            let invoked = plug.invoke(function, vec![]).await;
            assert_eq!(plug.can_invoke(function), invoked.is_ok(), "{} on {:?}", function, env);
        }
    }
}

#[tokio::test]
async fn test_hybrid_host_runs_everything() {
    let system = System::default();
    let manifest = Manifest::new("split").function(
        "server_only",
        FunctionDef::with_code(wat::returns(&json!("server"))).env(Environment::Server),
    );
    let plug = system.load(manifest, &ThreadUnitFactory).await.unwrap();

    assert_eq!(plug.invoke("server_only", vec![]).await.unwrap(), json!("server"));
}

/// Thread factory that records spawns and terminations in order
struct RecordingFactory {
    events: Arc<Mutex<Vec<String>>>,
}

struct RecordingHandle {
    inner: Box<dyn UnitHandle>,
    name: String,
    events: Arc<Mutex<Vec<String>>>,
}

impl UnitHandle for RecordingHandle {
    fn terminate(&self) {
        self.events.lock().unwrap().push(format!("terminate:{}", self.name));
        self.inner.terminate();
    }
}

impl UnitFactory for RecordingFactory {
    fn spawn(&self, plug_name: &str) -> Result<UnitChannel, SandboxError> {
        let channel = ThreadUnitFactory.spawn(plug_name)?;
        self.events.lock().unwrap().push(format!("spawn:{}", plug_name));
        Ok(UnitChannel {
            outbox: channel.outbox,
            inbox: channel.inbox,
            handle: Box::new(RecordingHandle {
                inner: channel.handle,
                name: plug_name.to_string(),
                events: self.events.clone(),
            }),
        })
    }
}

#[tokio::test]
async fn test_load_replaces_plug() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let factory = RecordingFactory {
        events: events.clone(),
    };
    let system = System::default();

    let first = system
        .load(
            Manifest::new("x").function("version", FunctionDef::with_code(wat::returns(&json!(1)))),
            &factory,
        )
        .await
        .unwrap();
    assert_eq!(first.invoke("version", vec![]).await.unwrap(), json!(1));

    let second = system
        .load(
            Manifest::new("x").function("version", FunctionDef::with_code(wat::returns(&json!(2)))),
            &factory,
        )
        .await
        .unwrap();

    assert!(first.is_stopped());
    assert!(!second.is_stopped());
    assert_eq!(
        *events.lock().unwrap(),
        vec!["spawn:x", "terminate:x", "spawn:x"]
    );

    assert_eq!(system.plug_names(), vec!["x"]);
    assert_eq!(
        system.invoke("x", "version", vec![]).await.unwrap(),
        json!(2)
    );
    assert!(matches!(
        first.invoke("version", vec![]).await,
        Err(PlugError::Sandbox(SandboxError::Terminated))
    ));
}

struct RejectMarked;

impl Hook for RejectMarked {
    fn validate_manifest(&self, manifest: &Manifest) -> Vec<String> {
        manifest
            .functions
            .iter()
            .filter(|(_, def)| def.hooks.contains_key("reject"))
            .map(|(name, _)| format!("{} is marked for rejection", name))
            .collect()
    }

    fn apply(self: Arc<Self>, _system: &System) {}
}

#[tokio::test]
async fn test_rejected_reload_keeps_old_plug() {
    let system = System::default();
    system.add_hook(Arc::new(RejectMarked));

    let good = system
        .load(
            Manifest::new("x").function("f", FunctionDef::with_code(wat::returns(&json!("old")))),
            &ThreadUnitFactory,
        )
        .await
        .unwrap();

    let bad = Manifest::new("x")
        .function("a", FunctionDef::with_code("(module)").hook("reject", json!(true)))
        .function("b", FunctionDef::with_code("(module)").hook("reject", json!(true)));
    let err = system.load(bad, &ThreadUnitFactory).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Invalid manifest: a is marked for rejection, b is marked for rejection"
    );

    assert!(!good.is_stopped());
    assert!(Arc::ptr_eq(&system.plug("x").unwrap(), &good));
    assert_eq!(good.invoke("f", vec![]).await.unwrap(), json!("old"));
}

#[tokio::test]
async fn test_unload_rejects_running_invocation() {
    let system = System::default();
    let manifest = Manifest::new("spinner").function("spin", FunctionDef::with_code(wat::spins()));
    let plug = system.load(manifest, &ThreadUnitFactory).await.unwrap();

    let running = {
        let plug = plug.clone();
        tokio::spawn(async move { plug.invoke("spin", vec![]).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    system.unload("spinner").await.unwrap();

    let result = running.await.unwrap();
    assert!(matches!(result, Err(PlugError::Sandbox(SandboxError::Terminated))));
    assert!(plug.is_stopped());
    assert!(matches!(
        plug.invoke("spin", vec![]).await,
        Err(PlugError::Sandbox(SandboxError::Terminated))
    ));
}

#[tokio::test]
async fn test_json_snapshot_and_replace() {
    let system = System::default();
    for name in ["beta", "alpha"] {
        let manifest = Manifest::new(name).function("id", FunctionDef::with_code(wat::returns(&json!(name))));
        system.load(manifest, &ThreadUnitFactory).await.unwrap();
    }

    let snapshot = system.to_json();
    let names: Vec<&str> = snapshot.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["alpha", "beta"]);

    // Manifests survive a JSON round trip through the snapshot
    let text = serde_json::to_string(&snapshot).unwrap();
    let restored: Vec<Manifest> = serde_json::from_str(&text).unwrap();
    assert_eq!(restored, snapshot);

    let alpha = system.plug("alpha").unwrap();
    let gamma = Manifest::new("gamma").function("id", FunctionDef::with_code(wat::returns(&json!("gamma"))));
    system
        .replace_all_from_json(vec![gamma], &ThreadUnitFactory)
        .await
        .unwrap();

    assert!(alpha.is_stopped());
    assert_eq!(system.plug_names(), vec!["gamma"]);
    assert_eq!(system.invoke("gamma", "id", vec![]).await.unwrap(), json!("gamma"));

    system.unload_all().await;
    assert!(system.loaded_plugs().is_empty());
}

#[tokio::test]
async fn test_dependencies() {
    let system = System::default();
    let manifest = Manifest::new("calc")
        .dependency("math", wat::dependency("answer", 42))
        .function("ask", FunctionDef::with_code(wat::calls_dependency("math", "answer")));
    let plug = system.load(manifest, &ThreadUnitFactory).await.unwrap();

    assert_eq!(plug.invoke("ask", vec![]).await.unwrap(), json!(42));
}

#[tokio::test]
async fn test_broken_dependency_fails_load() {
    let system = System::default();
    let manifest = Manifest::new("calc").dependency("math", "(module (func");

    let err = system.load(manifest, &ThreadUnitFactory).await.unwrap_err();
    assert!(matches!(err, SystemError::Sandbox(SandboxError::Unit(_))));
    assert!(system.plug("calc").is_none());
}

#[tokio::test]
async fn test_invoke_function_across_plugs() {
    let system = System::default();
    system.register_syscalls(&[], system_syscalls(&system));

    system
        .load(
            Manifest::new("callee").function("hello", FunctionDef::with_code(wat::returns(&json!("hello")))),
            &ThreadUnitFactory,
        )
        .await
        .unwrap();
    let caller = system
        .load(
            Manifest::new("caller").function(
                "relay",
                FunctionDef::with_code(wat::calls_syscall("system.invokeFunction", &[json!("callee.hello")])),
            ),
            &ThreadUnitFactory,
        )
        .await
        .unwrap();

    assert_eq!(caller.invoke("relay", vec![]).await.unwrap(), json!("hello"));
}

#[tokio::test]
async fn test_invoke_function_reenters_same_plug() {
    let system = System::default();
    system.register_syscalls(&[], system_syscalls(&system));

    let plug = system
        .load(
            Manifest::new("loop")
                .function(
                    "outer",
                    FunctionDef::with_code(wat::calls_syscall("system.invokeFunction", &[json!("inner")])),
                )
                .function("inner", FunctionDef::with_code(wat::returns(&json!(7)))),
            &ThreadUnitFactory,
        )
        .await
        .unwrap();

    assert_eq!(plug.invoke("outer", vec![]).await.unwrap(), json!(7));
}

#[tokio::test]
async fn test_guest_logs_are_buffered() {
    let system = System::new(SystemConfig::new().with_log_buffer_size(10));
    let manifest = Manifest::new("chatty").function(
        "talk",
        FunctionDef::with_code(wat::logs(LogLevel::Warn, "careful")),
    );
    let plug = system.load(manifest, &ThreadUnitFactory).await.unwrap();

    assert_eq!(plug.invoke("talk", vec![]).await.unwrap(), Value::Null);

    let logs = plug.logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].level, LogLevel::Warn);
    assert_eq!(logs[0].message, "careful");
}

#[tokio::test]
async fn test_audit_trail() {
    let sink = Arc::new(MemoryAuditSink::new());
    let system = System::with_audit(SystemConfig::default(), sink.clone());
    system.register_syscalls(
        &["admin"],
        SyscallMapping::new().with("danger", |_ctx, _args| async move { anyhow::Ok(json!(null)) }),
    );

    let manifest = Manifest::new("audited").function(
        "attack",
        FunctionDef::with_code(wat::calls_syscall("danger", &[])),
    );
    let plug = system.load(manifest, &ThreadUnitFactory).await.unwrap();
    assert!(plug.invoke("attack", vec![]).await.is_err());
    system.unload("audited").await.unwrap();

    assert_eq!(
        sink.actions_for("audited"),
        vec!["plug_loaded", "syscall_denied", "plug_unloaded"]
    );
    let denied = sink
        .events()
        .into_iter()
        .find_map(|event| match event.action {
            AuditAction::SyscallDenied { syscall, permission } => Some((syscall, permission)),
            _ => None,
        })
        .unwrap();
    assert_eq!(denied, ("danger".to_string(), "admin".to_string()));
}
