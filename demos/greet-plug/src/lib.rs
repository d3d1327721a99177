//! Greet plug: a PlugOS function written with the SDK
//!
//! Build with `cargo build --release --target wasm32-unknown-unknown`,
//! base64 the resulting `.wasm` and put it in a manifest:
//!
//! ```json
//! {
//!   "name": "greet",
//!   "requiredPermissions": [],
//!   "functions": { "greet": { "code": "<base64 wasm>", "events": ["greet:*"] } }
//! }
//! ```

use plugos_sdk::prelude::*;

fn greet(args: Vec<Value>) -> PlugResult {
    let name = args.first().and_then(Value::as_str).unwrap_or("World");
    info(&format!("Greeting {}", name));

    let env = syscall("system.getEnv", vec![])?;
    let greeting = match env.as_str() {
        Some(env) => format!("Hello, {}! (from the {})", name, env),
        None => format!("Hello, {}!", name),
    };
    Ok(Value::from(greeting))
}

export_function!(greet);
