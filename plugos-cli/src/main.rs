//! plugos: run PlugOS plugs from the command line
//!
//! Loads every `*.plug.json` manifest from the plug directories into a
//! system with the builtin syscalls and the event and endpoint hooks.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use plugos_host::audit::{AuditSink, FileAuditSink, NullAuditSink};
use plugos_host::discovery::{default_plug_dirs, ManifestScanner};
use plugos_host::hooks::{event_syscalls, EndpointHook, EndpointRequest, EventHook};
use plugos_host::tracing_support::{init_subscriber_with_config, TracingConfig, TracingFormat};
use plugos_host::watcher::{HotReloadWatcher, WatcherConfig};
use plugos_host::{
    system_syscalls, Environment, ProcessUnitFactory, System, SystemConfig, ThreadUnitFactory, UnitFactory,
    Value,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Prefix endpoint routes are served under
const ENDPOINT_PREFIX: &str = "/_";

/// PlugOS plug host
#[derive(Parser, Debug)]
#[command(name = "plugos", version)]
#[command(about = "Load and run PlugOS plugs", long_about = None)]
struct Args {
    /// Plug directories (defaults to the user data dir and ./plugs)
    #[arg(short, long = "dir", env = "PLUGOS_DIR", value_delimiter = ',', global = true)]
    dirs: Vec<PathBuf>,

    /// Host environment: client or server (unset runs every function)
    #[arg(short, long, env = "PLUGOS_ENV", global = true)]
    env: Option<Environment>,

    /// Run each plug in a child process using this plug-worker binary
    #[arg(long, global = true)]
    worker: Option<PathBuf>,

    /// Append audit events to this JSON lines file
    #[arg(long, global = true)]
    audit: Option<PathBuf>,

    /// Log format: pretty, compact or json
    #[arg(long, default_value = "compact", global = true)]
    log_format: TracingFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List loaded plugs, their functions and the registered syscalls
    List,

    /// Invoke a plug function; arguments are parsed as JSON, falling back to strings
    Invoke {
        plug: String,
        function: String,
        args: Vec<String>,
    },

    /// Dispatch an event and print the collected results
    Dispatch { event: String, args: Vec<String> },

    /// Send a request to a plug endpoint
    Request {
        method: String,
        path: String,
        /// JSON request body
        body: Option<String>,
    },

    /// Print the manifests of all loaded plugs as JSON
    Dump,

    /// Load plugs and reload them as their manifests change
    Watch {
        /// Debounce for file events, in milliseconds
        #[arg(long, default_value = "500")]
        debounce: u64,
    },
}

struct Host {
    system: System,
    factory: Arc<dyn UnitFactory>,
    events: Arc<EventHook>,
    endpoints: Arc<EndpointHook>,
}

impl Host {
    fn new(args: &Args) -> Result<Self> {
        let mut config = SystemConfig::new();
        config.env = args.env;

        let audit: Arc<dyn AuditSink> = match &args.audit {
            Some(path) => Arc::new(FileAuditSink::new(path).context("Failed to open audit log")?),
            None => Arc::new(NullAuditSink::new()),
        };
        let system = System::with_audit(config, audit);

        let events = Arc::new(EventHook::new());
        let endpoints = Arc::new(EndpointHook::new(ENDPOINT_PREFIX));
        system.add_hook(events.clone());
        system.add_hook(endpoints.clone());
        system.register_syscalls(&[], system_syscalls(&system));
        system.register_syscalls(&[], event_syscalls(&events));

        let factory: Arc<dyn UnitFactory> = match &args.worker {
            Some(worker) => Arc::new(ProcessUnitFactory::new(worker)),
            None => Arc::new(ThreadUnitFactory::new()),
        };

        Ok(Self {
            system,
            factory,
            events,
            endpoints,
        })
    }

    /// Load every manifest found in `dirs`, reporting failures as warnings
    async fn load_all(&self, dirs: &[PathBuf]) -> usize {
        let result = ManifestScanner::new().scan_directories(dirs);
        for (path, e) in &result.failures {
            tracing::warn!(path = %path.display(), error = %e, "Skipping");
        }

        let mut loaded = 0;
        for found in result.manifests {
            match self.system.load(found.manifest, self.factory.as_ref()).await {
                Ok(_) => loaded += 1,
                Err(e) => tracing::warn!(path = %found.path.display(), error = %e, "Failed to load plug"),
            }
        }
        loaded
    }
}

fn parse_arg(arg: &str) -> Value {
    serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.to_string()))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_subscriber_with_config(TracingConfig {
        format: args.log_format,
        ..Default::default()
    });

    let dirs = if args.dirs.is_empty() {
        default_plug_dirs("plugos")
    } else {
        args.dirs.clone()
    };
    let host = Host::new(&args)?;

    match args.command {
        Command::List => {
            host.load_all(&dirs).await;
            for plug in host.system.loaded_plugs() {
                println!("{}", plug.name());
                for (name, def) in &plug.manifest().functions {
                    let env = def.env.map(|env| format!(" [{}]", env)).unwrap_or_default();
                    println!("  {}{}", name, env);
                }
            }
            println!();
            println!("Syscalls:");
            for syscall in host.system.registered_syscalls() {
                if syscall.required_permissions.is_empty() {
                    println!("  {}", syscall.name);
                } else {
                    println!("  {} (requires {})", syscall.name, syscall.required_permissions.join(", "));
                }
            }
        }
        Command::Invoke {
            plug,
            function,
            args: call_args,
        } => {
            host.load_all(&dirs).await;
            let call_args = call_args.iter().map(|arg| parse_arg(arg)).collect();
            let result = host
                .system
                .invoke(&plug, &function, call_args)
                .await
                .with_context(|| format!("{}.{} failed", plug, function))?;
            print_json(&result)?;
        }
        Command::Dispatch { event, args: event_args } => {
            host.load_all(&dirs).await;
            let event_args = event_args.iter().map(|arg| parse_arg(arg)).collect();
            let results = host.events.dispatch_event(&event, event_args).await?;
            print_json(&results)?;
        }
        Command::Request { method, path, body } => {
            host.load_all(&dirs).await;
            let mut request = EndpointRequest::new(method.to_uppercase(), path);
            if let Some(body) = body {
                request = request.with_body(parse_arg(&body));
            }
            match host.endpoints.handle(request).await {
                Some(response) => print_json(&response)?,
                None => bail!("No endpoint matches this request"),
            }
        }
        Command::Dump => {
            host.load_all(&dirs).await;
            print_json(&host.system.to_json())?;
        }
        Command::Watch { debounce } => {
            let watcher = HotReloadWatcher::new(
                host.system.clone(),
                host.factory.clone(),
                &dirs,
                WatcherConfig {
                    debounce: Duration::from_millis(debounce),
                    load_existing: true,
                },
            )
            .await?;
            tracing::info!(plugs = ?host.system.plug_names(), "Watching for changes, Ctrl-C to stop");

            tokio::signal::ctrl_c().await?;
            watcher.shutdown().await;
            host.system.unload_all().await;
        }
    }

    Ok(())
}
