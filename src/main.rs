mod cli;

use std::collections::VecDeque;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use cli::{Cli, Command};
use mio::net::TcpStream as MioTcpStream;
use remctx::bootstrap::{self, BootstrapConfig};
use remctx::broker::Broker;
use remctx::config::RuntimeConfig;
use remctx::context::{Context, FnRef};
use remctx::marshal::RemoteValue;
use remctx::registry::FunctionRegistry;
use remctx::stream::Stream;
use tracing_subscriber::EnvFilter;

/// A context spawn the controller is waiting to hear back from, keyed
/// by arrival order (spec §4.4: the accept path doesn't know a
/// connection's identity until it reads a frame, and reading a frame
/// requires the key up front, so single-shot CLI usage matches
/// connections to spawns in the order they were launched).
struct PendingSpawn {
    config: BootstrapConfig,
    ready: std::sync::mpsc::Sender<Arc<Context>>,
}

type PendingQueue = Arc<Mutex<VecDeque<PendingSpawn>>>;

fn demo_registry() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();
    registry.register("demo", "add", |args, _kwargs| {
        let sum: i64 = args.iter().filter_map(RemoteValue::as_int).sum();
        Ok(RemoteValue::Int(sum))
    });
    registry.register("demo", "echo", |args, _kwargs| {
        Ok(args.into_iter().next().unwrap_or(RemoteValue::Unit))
    });
    registry
}

fn random_key() -> std::io::Result<Vec<u8>> {
    let mut f = std::fs::File::open("/dev/urandom")?;
    let mut buf = [0u8; 16];
    f.read_exact(&mut buf)?;
    Ok(buf.to_vec())
}

fn on_accept(
    io: MioTcpStream,
    peer: SocketAddr,
    broker: std::sync::Weak<Broker>,
    pending: PendingQueue,
) {
    let Some(broker_arc) = broker.upgrade() else {
        return;
    };
    let Some(spawn) = pending.lock().unwrap().pop_front() else {
        tracing::warn!(%peer, "unexpected data connection with no pending spawn");
        return;
    };

    let token = broker_arc.next_token();
    let stream = Arc::new(Stream::new(1, io, token, &spawn.config.key, broker.clone()));
    let context = Arc::new(Context::new(
        spawn.config.context_name.clone(),
        None,
        None,
        spawn.config.key.clone(),
        Some(spawn.config.parent_addr),
    ));
    context.set_stream(stream.clone());

    let stream_for_cb = stream.clone();
    broker_arc.register_stream(stream.clone(), move |result| {
        if result.is_ok() {
            stream_for_cb.mark_connected();
        }
    });
    let _ = spawn.ready.send(context);
}

fn run_call(
    broker_listen: SocketAddr,
    pending: PendingQueue,
    broker: Arc<Broker>,
    argv: Vec<String>,
    context_name: &str,
    call_module: &str,
    call_func: &str,
    args: Vec<i64>,
    deadline: Option<Duration>,
) -> Result<(), Box<dyn std::error::Error>> {
    let key = random_key()?;
    let config = BootstrapConfig {
        context_name: context_name.to_string(),
        parent_addr: broker_listen,
        key,
    };

    let (tx, rx) = std::sync::mpsc::channel();
    pending.lock().unwrap().push_back(PendingSpawn {
        config: config.clone(),
        ready: tx,
    });

    let mut child = bootstrap::spawn_and_bootstrap(&argv, &config)?;
    let context = rx.recv_timeout(Duration::from_secs(10))?;

    let fn_ref = FnRef::new(call_module, call_func);
    let call_args = args.into_iter().map(RemoteValue::Int).collect();
    let result = context.call_with_deadline(&fn_ref, deadline, call_args, RemoteValue::Map(Vec::new()))?;
    println!("{result:?}");

    let _ = child.try_wait();
    let _ = broker;
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::BootstrapStage1 { context_name } => {
            if let Err(e) = bootstrap::run_stage1(&context_name) {
                tracing::error!(error = %e, "bootstrap stage one failed");
                eprintln!("remctxd bootstrap-stage1: {e}");
                std::process::exit(1);
            }
        }
        Command::BootstrapStage2 { context_name: _ } => {
            match bootstrap::run_stage2() {
                Ok(config) => {
                    if let Err(e) = remctx::remote_main::run(config, demo_registry()) {
                        tracing::error!(error = %e, "remote main exited with error");
                        eprintln!("remctxd bootstrap-stage2: {e}");
                        std::process::exit(1);
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "bootstrap stage two failed");
                    eprintln!("remctxd bootstrap-stage2: {e}");
                    std::process::exit(1);
                }
            }
        }
        Command::SpawnLocal {
            name,
            call_module,
            call_func,
            args,
            deadline_ms,
        } => {
            let pending: PendingQueue = Arc::new(Mutex::new(VecDeque::new()));
            let pending_for_accept = pending.clone();
            let handle = Broker::spawn(
                Some("127.0.0.1:0".parse().unwrap()),
                Some(Arc::new(
                    move |io: MioTcpStream, peer: SocketAddr, broker: std::sync::Weak<Broker>| {
                        on_accept(io, peer, broker, pending_for_accept.clone());
                    },
                )),
            )
            .expect("failed to start broker");

            let argv = bootstrap::local_boot_argv(&name).expect("resolve current_exe");
            let config = RuntimeConfig::default();
            let deadline = deadline_ms
                .map(Duration::from_millis)
                .or(config.default_call_deadline);

            let result = run_call(
                parent_listen_addr(&handle),
                pending,
                handle.broker.clone(),
                argv,
                &name,
                &call_module,
                &call_func,
                args,
                deadline,
            );

            if let Err(e) = result {
                tracing::error!(error = %e, "spawn-local failed");
                eprintln!("remctxd spawn-local: {e}");
                std::process::exit(1);
            }
        }
        Command::SpawnSsh {
            host,
            user,
            name,
            remote_binary,
            call_module,
            call_func,
            args,
            deadline_ms,
        } => {
            let pending: PendingQueue = Arc::new(Mutex::new(VecDeque::new()));
            let pending_for_accept = pending.clone();
            let handle = Broker::spawn(
                Some("0.0.0.0:0".parse().unwrap()),
                Some(Arc::new(
                    move |io: MioTcpStream, peer: SocketAddr, broker: std::sync::Weak<Broker>| {
                        on_accept(io, peer, broker, pending_for_accept.clone());
                    },
                )),
            )
            .expect("failed to start broker");

            let config = RuntimeConfig::default();
            let argv = bootstrap::ssh_boot_argv(&config.ssh_path, &host, user.as_deref(), &remote_binary, &name);
            let deadline = deadline_ms
                .map(Duration::from_millis)
                .or(config.default_call_deadline);

            let result = run_call(
                parent_listen_addr(&handle),
                pending,
                handle.broker.clone(),
                argv,
                &name,
                &call_module,
                &call_func,
                args,
                deadline,
            );

            if let Err(e) = result {
                tracing::error!(error = %e, "spawn-ssh failed");
                eprintln!("remctxd spawn-ssh: {e}");
                std::process::exit(1);
            }
        }
    }
}

fn parent_listen_addr(handle: &remctx::broker::BrokerHandle) -> SocketAddr {
    handle
        .listen_addr()
        .expect("broker was started with a listener")
}
