//! corral CLI - command line client for the sandbox daemon

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use corral_core::config::default_socket_path;
use corral_core::protocol::{self, Request, Response, RunRequest};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

#[derive(Parser)]
#[command(name = "corral")]
#[command(author, version, about = "Client for the corral sandbox daemon")]
struct Cli {
    /// Socket path (defaults to CORRAL_SOCKET env var or /run/corral/corral.sock)
    #[arg(short, long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program inside a pooled sandbox environment
    Run {
        /// Program and arguments
        #[arg(required = true, trailing_var_arg = true)]
        argv: Vec<String>,

        /// Wall-clock limit in seconds
        #[arg(short, long, default_value = "30")]
        timeout: u64,

        /// Memory limit in MB
        #[arg(short, long, default_value = "256")]
        memory: u64,

        /// Process-count limit
        #[arg(short, long, default_value = "64")]
        pids: u32,
    },

    /// Get daemon status
    Status,

    /// Ping the daemon
    Ping,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("corral_core=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let socket = cli.socket.unwrap_or_else(default_socket_path);

    let request = match cli.command {
        Commands::Run {
            argv,
            timeout,
            memory,
            pids,
        } => Request::Run(RunRequest {
            argv,
            env: vec!["PATH=/usr/bin:/bin".into()],
            stdin: None,
            time_limit: Some(Duration::from_secs(timeout)),
            memory_limit: Some(memory * 1024 * 1024),
            proc_limit: Some(pids),
            files: Vec::new(),
        }),
        Commands::Status => Request::Status,
        Commands::Ping => Request::Ping,
    };

    let response = roundtrip(&socket, &request)
        .await
        .with_context(|| format!("daemon not reachable at {}", socket.display()))?;

    match response {
        Response::Run(run) => {
            if let Some(result) = run.result {
                println!(
                    "{}",
                    serde_json::json!({
                        "exit_code": result.exit_code,
                        "stdout": result.stdout_str(),
                        "stderr": result.stderr_str(),
                        "duration_ms": result.duration.as_millis(),
                        "memory_peak": result.memory_peak,
                        "cpu_time_us": result.cpu_time_us,
                        "timed_out": result.timed_out,
                        "oom_killed": result.oom_killed,
                    })
                );
                if !result.is_success() {
                    std::process::exit(1);
                }
            } else {
                bail!("run failed: {}", run.error.unwrap_or_default());
            }
        }
        Response::Status {
            parallelism,
            free_slots,
            idle_environments,
        } => {
            println!(
                "{}",
                serde_json::json!({
                    "parallelism": parallelism,
                    "free_slots": free_slots,
                    "idle_environments": idle_environments,
                })
            );
        }
        Response::Pong => println!("pong"),
        Response::Error { message } => bail!("daemon error: {message}"),
    }

    Ok(())
}

/// Send one length-prefixed request and read one response
async fn roundtrip(socket: &std::path::Path, request: &Request) -> Result<Response> {
    let mut stream = UnixStream::connect(socket).await?;

    let payload = protocol::encode(request)?;
    stream
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await?;
    stream.write_all(&payload).await?;

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(protocol::decode(&buf)?)
}
