//! The process substrate runs the same plugs as the thread substrate

use plugos_host::testing::wat;
use plugos_host::{
    system_syscalls, FunctionDef, LogLevel, Manifest, PlugError, ProcessUnitFactory, SandboxError,
    SyscallMapping, System, SystemConfig, Value,
};
use serde_json::json;
use std::time::Duration;

fn worker() -> ProcessUnitFactory {
    ProcessUnitFactory::new(env!("CARGO_BIN_EXE_plug-worker"))
}

fn system() -> System {
    let system = System::new(SystemConfig::default());
    system.register_syscalls(&[], system_syscalls(&system));
    system.register_syscalls(
        &[],
        SyscallMapping::new().with("echo", |_ctx, args: Vec<Value>| async move {
            anyhow::Ok(args.into_iter().next().unwrap_or_default())
        }),
    );
    system
}

#[tokio::test]
async fn test_process_syscall_and_errors() {
    let system = system();
    let manifest = Manifest::new("remote")
        .function("greet", FunctionDef::with_code(wat::calls_syscall("echo", &[json!("hi")])))
        .function("boom", FunctionDef::with_code(wat::fails("BOOM")))
        .function("echo", FunctionDef::with_code(wat::echo_args()));
    let plug = system
        .load(manifest, &worker())
        .await
        .expect("Failed to start worker");

    assert_eq!(plug.invoke("greet", vec![]).await.unwrap(), json!("hi"));
    assert_eq!(
        plug.invoke("echo", vec![json!({"k": [1, 2]})]).await.unwrap(),
        json!([{"k": [1, 2]}])
    );
    match plug.invoke("boom", vec![]).await {
        Err(PlugError::Sandbox(SandboxError::Unit(message))) => assert_eq!(message, "BOOM"),
        other => panic!("Expected unit error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_process_reentrant_invoke_and_dependencies() {
    let system = system();
    let manifest = Manifest::new("nested")
        .dependency("math", wat::dependency("answer", 42))
        .function("ask", FunctionDef::with_code(wat::calls_dependency("math", "answer")))
        .function(
            "outer",
            FunctionDef::with_code(wat::calls_syscall("system.invokeFunction", &[json!("ask")])),
        );
    let plug = system.load(manifest, &worker()).await.unwrap();

    assert_eq!(plug.invoke("outer", vec![]).await.unwrap(), json!(42));
}

#[tokio::test]
async fn test_process_logs() {
    let system = system();
    let manifest = Manifest::new("chatty").function(
        "talk",
        FunctionDef::with_code(wat::logs(LogLevel::Error, "from the worker")),
    );
    let plug = system.load(manifest, &worker()).await.unwrap();

    plug.invoke("talk", vec![]).await.unwrap();
    let logs = plug.logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].level, LogLevel::Error);
    assert_eq!(logs[0].message, "from the worker");
}

#[tokio::test]
async fn test_process_killed_on_unload() {
    let system = system();
    let manifest = Manifest::new("spinner").function("spin", FunctionDef::with_code(wat::spins()));
    let plug = system.load(manifest, &worker()).await.unwrap();

    let running = {
        let plug = plug.clone();
        tokio::spawn(async move { plug.invoke("spin", vec![]).await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    system.unload("spinner").await.unwrap();
    assert!(matches!(
        running.await.unwrap(),
        Err(PlugError::Sandbox(SandboxError::Terminated))
    ));
}

#[tokio::test]
async fn test_missing_worker_binary() {
    let system = system();
    let factory = ProcessUnitFactory::new("/nonexistent/plug-worker");

    let err = system.load(Manifest::new("ghost"), &factory).await.unwrap_err();
    assert!(err.to_string().contains("Failed to spawn execution unit"));
    assert!(system.plug("ghost").is_none());
}
