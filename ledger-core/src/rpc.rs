//! Line-delimited JSON-RPC transport
//!
//! One request per line:
//!
//! ```text
//! {"id": 7, "method": "post", "params": [{"uid": "tx1", ...}, ...]}
//! {"id": 8, "method": "ping"}
//! {"id": 9, "method": "metrics"}
//! ```
//!
//! One reply per line, `{"id": 7, "result": true}` or
//! `{"id": 7, "error": {"kind": ..., "code": ..., "message": ...}}`.
//!
//! Requests on one connection run concurrently, since a `post` may wait on
//! postings that other callers have yet to send. Replies can therefore come
//! back out of order; callers correlate by `id`.

use crate::{
    export::{AccountantExport, ErrorReply},
    Error,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Incoming request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Caller-chosen correlation id, echoed in the reply
    #[serde(default)]
    pub id: Value,

    /// `post`, `ping` or `metrics`
    pub method: String,

    /// Positional arguments
    #[serde(default)]
    pub params: Vec<Value>,
}

/// Outgoing reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Request id
    pub id: Value,

    /// Present on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Present on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReply>,
}

impl Response {
    fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    fn err(id: Value, error: ErrorReply) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Route one request to the facade
pub async fn dispatch(export: &AccountantExport, request: Request) -> Response {
    match request.method.as_str() {
        "post" => match export.post(request.params).await {
            Ok(result) => Response::ok(request.id, Value::Bool(result)),
            Err(error) => Response::err(request.id, error),
        },
        "ping" => Response::ok(request.id, Value::String(export.ping().to_string())),
        "metrics" => match export.metrics() {
            Ok(text) => Response::ok(request.id, Value::String(text)),
            Err(error) => Response::err(request.id, error),
        },
        other => {
            tracing::warn!(method = other, "Unknown method");
            let error = Error::Argument(format!("unknown method {:?}", other));
            Response::err(request.id, ErrorReply::from(&error))
        }
    }
}

/// Accept connections until the listener fails
pub async fn serve(listener: TcpListener, export: AccountantExport) -> std::io::Result<()> {
    tracing::info!(addr = ?listener.local_addr()?, "Accountant export listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let export = export.clone();

        tokio::spawn(async move {
            tracing::debug!(%peer, "Connection opened");
            if let Err(e) = handle_connection(stream, export).await {
                tracing::warn!(%peer, error = %e, "Connection closed with error");
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, export: AccountantExport) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<String>(256);

    let write_task = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
        }
        writer.shutdown().await
    });

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                tracing::error!(%line, error = %e, "Undecodable request");
                let error = Error::Argument(format!("invalid request: {}", e));
                send(&tx, Response::err(Value::Null, ErrorReply::from(&error))).await;
                continue;
            }
        };

        let export = export.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let response = dispatch(&export, request).await;
            send(&tx, response).await;
        });
    }

    // Writer drains once every in-flight request has replied
    drop(tx);
    write_task
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
}

async fn send(tx: &mpsc::Sender<String>, response: Response) {
    match serde_json::to_string(&response) {
        Ok(line) => {
            if tx.send(line).await.is_err() {
                tracing::debug!(id = %response.id, "Peer gone before reply");
            }
        }
        Err(e) => tracing::error!(error = %e, "Failed to encode reply"),
    }
}
