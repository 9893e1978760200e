//! Unix socket server

use crate::executor::ProcessExecutor;
use corral_core::Dispatcher;
use corral_core::protocol::{self, Request, Response, RunResponse};
use std::sync::Arc;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{UnixListener, UnixStream},
};

/// Run the daemon server
pub async fn run(
    listener: UnixListener,
    dispatcher: Arc<Dispatcher>,
    executor: Arc<ProcessExecutor>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    loop {
        let (stream, _) = listener.accept().await?;
        let dispatcher = Arc::clone(&dispatcher);
        let executor = Arc::clone(&executor);

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, dispatcher, executor).await {
                tracing::error!(error = %e, "connection error");
            }
        });
    }
}

/// Handle a single client connection
async fn handle_connection(
    mut stream: UnixStream,
    dispatcher: Arc<Dispatcher>,
    executor: Arc<ProcessExecutor>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut buf = vec![0u8; 64 * 1024]; // 64KB buffer

    loop {
        // Read length prefix (4 bytes, big-endian)
        let mut len_buf = [0u8; 4];
        if stream.read_exact(&mut len_buf).await.is_err() {
            break; // Client disconnected
        }
        let len = u32::from_be_bytes(len_buf) as usize;

        if len > buf.len() {
            buf.resize(len, 0);
        }

        // Read message
        stream.read_exact(&mut buf[..len]).await?;

        // Decode request
        let request: Request = protocol::decode(&buf[..len])?;
        tracing::debug!(?request, "received request");

        // Handle request
        let response = handle_request(request, &dispatcher, &executor).await;

        // Encode response
        let response_bytes = protocol::encode(&response)?;

        // Write length prefix + response
        let len_bytes = (response_bytes.len() as u32).to_be_bytes();
        stream.write_all(&len_bytes).await?;
        stream.write_all(&response_bytes).await?;
    }

    Ok(())
}

/// Handle a single request
async fn handle_request(
    request: Request,
    dispatcher: &Dispatcher,
    executor: &ProcessExecutor,
) -> Response {
    match request {
        Request::Run(req) => match dispatcher.dispatch(executor, &req).await {
            Ok(result) => Response::Run(RunResponse {
                success: true,
                result: Some(result),
                error: None,
            }),
            Err(e) => Response::Run(RunResponse {
                success: false,
                result: None,
                error: Some(e.to_string()),
            }),
        },
        Request::Status => {
            let status = dispatcher.status();
            Response::Status {
                parallelism: status.parallelism,
                free_slots: status.free_slots,
                idle_environments: status.idle_environments,
            }
        }
        Request::Ping => Response::Pong,
    }
}
