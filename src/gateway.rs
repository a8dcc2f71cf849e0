//! Per-request orchestration: environment, subprocess, output interpretation, teardown

use crate::config::GatewayConfig;
use crate::env::{build_env, RequestContext};
use crate::error::{error_response, GatewayBody, GatewayError, GatewayErrorCode};
use crate::output::{Interpreted, OutputBody};
use crate::process::{pump_request_body, Subprocess};
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame};
use hyper::header::TRANSFER_ENCODING;
use hyper::{Request, Response};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error};
use uuid::Uuid;

/// Body sent back for chunked requests
pub const CHUNKED_BODY_MESSAGE: &str = "Chunked request bodies are not supported by CGI.";

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// Read size when streaming subprocess output
const COPY_BUF_SIZE: usize = 8 * 1024;

/// Runs the configured executable once per request
#[derive(Debug, Clone)]
pub struct Gateway {
    config: Arc<GatewayConfig>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Serve one request.
    ///
    /// The returned response streams the subprocess output. Errors found
    /// before the response head is known become error responses; later
    /// failures truncate the body.
    pub async fn serve<B>(&self, req: Request<B>, remote_addr: &str, is_tls: bool) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: std::fmt::Display + Send,
    {
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        debug!(request_id, method = %req.method(), uri = %req.uri(), remote_addr, "Incoming request");

        if is_chunked(&req) {
            debug!(request_id, "Rejecting chunked request body");
            return error_response(GatewayErrorCode::ChunkedRequestBody, CHUNKED_BODY_MESSAGE);
        }

        let (parts, body) = req.into_parts();
        let ctx = RequestContext::from_parts(&parts, remote_addr, is_tls);
        let env = build_env(&ctx, &self.config);
        let pipe_stdin = match ctx.content_length {
            Some(len) => len > 0,
            None => !body.is_end_stream(),
        };
        let deadline = self.config.timeout.map(|t| Instant::now() + t);

        let mut process = match Subprocess::spawn(&self.config, &env, pipe_stdin) {
            Ok(process) => process,
            Err(e) => return self.fail(&request_id, e.into()),
        };

        if let Some(stdin) = process.take_stdin() {
            let request_id = request_id.clone();
            let pid = process.id();
            tokio::spawn(async move {
                match pump_request_body(body, stdin).await {
                    Ok(bytes) => debug!(request_id, pid, bytes, "Request body delivered"),
                    Err(e) => debug!(request_id, pid, error = %e, "Request body not fully delivered"),
                }
            });
        }

        let stdout = match process.take_stdout() {
            Ok(stdout) => stdout,
            Err(e) => {
                process.abort().await;
                return self.fail(&request_id, e.into());
            }
        };

        let head = self
            .config
            .output_mode
            .interpret(&self.config.default_headers, stdout);
        let head = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, head).await {
                Ok(head) => head,
                Err(_) => {
                    process.abort().await;
                    return self.fail(&request_id, self.timeout_error());
                }
            },
            None => head.await,
        };

        let Interpreted { status, headers, body } = match head {
            Ok(interpreted) => interpreted,
            Err(e) => {
                process.abort().await;
                return self.fail(&request_id, e.into());
            }
        };

        debug!(request_id, pid = process.id(), status = status.as_u16(), "Response head ready");

        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(stream_output(
            Arc::clone(&self.config),
            request_id,
            body,
            tx,
            process,
            deadline,
        ));

        let mut response = Response::new(ChannelBody { rx }.boxed());
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }

    fn fail(&self, request_id: &str, err: GatewayError) -> Response<GatewayBody> {
        let code = err.code();
        report(&self.config, request_id, &err);
        error_response(code, "")
    }

    fn timeout_error(&self) -> GatewayError {
        GatewayError::Timeout(self.config.timeout.unwrap_or_default())
    }
}

fn report(config: &GatewayConfig, request_id: &str, err: &GatewayError) {
    match config.error_log {
        Some(ref log) => log.log(err),
        None => error!(request_id, error = %err, "CGI error"),
    }
}

fn is_chunked<B>(req: &Request<B>) -> bool {
    req.headers()
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}

/// Copy the remaining output into the response, then tear the subprocess down.
async fn stream_output<R>(
    config: Arc<GatewayConfig>,
    request_id: String,
    mut body: OutputBody<R>,
    tx: mpsc::Sender<io::Result<Bytes>>,
    process: Subprocess,
    deadline: Option<Instant>,
) where
    R: AsyncRead + Unpin,
{
    let copy = copy_output(&mut body, &tx);
    let result = match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, copy).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(config.timeout.unwrap_or_default())),
        },
        None => copy.await,
    };
    drop(body);

    match result {
        Ok(bytes) => {
            debug!(request_id, pid = process.id(), bytes, "Response body streamed");
            process.finish(deadline).await;
        }
        Err(err) => {
            report(&config, &request_id, &err);
            process.abort().await;
            // Status and headers are gone already; make sure the client sees
            // a broken body rather than a short but complete one
            let _ = tx.send(Err(io::Error::other(err.to_string()))).await;
        }
    }
}

async fn copy_output<R>(
    body: &mut OutputBody<R>,
    tx: &mpsc::Sender<io::Result<Bytes>>,
) -> Result<u64, GatewayError>
where
    R: AsyncRead + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        // A quiet subprocess must not outlive a client that already left
        let n = tokio::select! {
            read = body.read(&mut buf) => read.map_err(GatewayError::Copy)?,
            _ = tx.closed() => return Err(client_gone()),
        };
        if n == 0 {
            return Ok(total);
        }
        if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
            return Err(client_gone());
        }
        total += n as u64;
    }
}

fn client_gone() -> GatewayError {
    GatewayError::Copy(io::Error::new(io::ErrorKind::BrokenPipe, "client went away"))
}

/// Response body fed by the output copy task.
///
/// The channel holds at most one chunk, so a slow client stalls the copy
/// task and, through the pipe, the subprocess itself.
struct ChannelBody {
    rx: mpsc::Receiver<io::Result<Bytes>>,
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        self.rx
            .poll_recv(cx)
            .map(|chunk| chunk.map(|result| result.map(Frame::data)))
    }
}
