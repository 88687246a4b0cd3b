use std::process;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use gibridge::{Bridge, BridgeConfig, VERSION};

const DEFAULT_ADDR: &str = "127.0.0.1:0";

#[derive(Debug, PartialEq, Eq)]
enum Action {
    Run { addr: String },
    Version,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let addr = match parse_args(&args) {
        Ok(Action::Run { addr }) => addr,
        Ok(Action::Version) => {
            println!("{VERSION}");
            process::exit(0);
        }
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: gibridge [--addr <host:port>] [--version]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --addr <host:port>   TCP address to listen [default: {DEFAULT_ADDR}]");
            eprintln!("  --version            Show version");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(&addr) {
        let msg = format!("{e:#}");
        tracing::error!(error = %msg, "gibridge failed");
        process::exit(1);
    }
    process::exit(0);
}

fn parse_args(args: &[String]) -> Result<Action, String> {
    let mut addr = DEFAULT_ADDR.to_string();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--addr" | "-addr" => {
                i += 1;
                addr = args.get(i).ok_or("--addr requires a value")?.clone();
            }
            arg if arg.starts_with("--addr=") || arg.starts_with("-addr=") => {
                addr = arg.split_once('=').map(|(_, v)| v.to_string()).unwrap_or_default();
            }
            "--version" | "-version" => return Ok(Action::Version),
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    if addr.is_empty() {
        return Err("--addr requires a value".to_string());
    }
    Ok(Action::Run { addr })
}

/// Initialize tracing with GIBRIDGE_LOG and LOG_FORMAT support.
///
/// Always writes to stderr: stdout carries the bridge protocol.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("GIBRIDGE_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("gibridge={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn run(addr: &str) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    let result = runtime.block_on(async {
        let shutdown = CancellationToken::new();
        tokio::spawn(shutdown_signal(shutdown.clone()));

        let config = BridgeConfig::new().with_shutdown(shutdown);
        let bridge = Bridge::new(tokio::io::stdin(), tokio::io::stdout(), config);
        bridge.run(addr).await
    });

    // stdin is read on a blocking thread that may never return.
    runtime.shutdown_background();
    result?;
    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
    shutdown.cancel();
}
