//! Client-facing RPC service.
//!
//! Exposes the `Datastore` methods over a persistent TCP connection:
//! one JSON request per line, one JSON response per line, in lockstep.
//! The façade forwards calls to the ordering engine and converts
//! engine failures into RPC error payloads verbatim; it never retries.
//! A request that fails to decode is answered with an in-band error
//! and the connection stays usable for the next call.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

use crate::engine::Engine;

/// Distinguished value returned by a GET on an absent key, so an
/// absent key is never reported as a successful empty string.
pub const NOT_FOUND: &str = "key not found";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum RpcRequest {
    #[serde(rename = "Datastore.Get")]
    Get {
        #[serde(rename = "Key")]
        key: String,
        #[serde(rename = "Value", default)]
        value: String,
    },
    #[serde(rename = "Datastore.Put")]
    Put {
        #[serde(rename = "Key")]
        key: String,
        #[serde(rename = "Value")]
        value: String,
    },
    #[serde(rename = "Datastore.Delete")]
    Delete {
        #[serde(rename = "Key")]
        key: String,
        #[serde(rename = "Value", default)]
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RpcResponse {
    Ok {
        #[serde(rename = "Key")]
        key: String,
        #[serde(rename = "Value")]
        value: String,
    },
    Error {
        message: String,
    },
}

/// Serves one client connection until it closes.
pub async fn serve_client(stream: TcpStream, engine: Arc<Engine>) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader
            .read_line(&mut line)
            .await
            .context("failed to read client request")?;
        if bytes == 0 {
            return Ok(());
        }
        let payload = line.trim();
        if payload.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<RpcRequest>(payload) {
            Ok(request) => {
                debug!(?peer, ?request, "client request");
                dispatch(&engine, request).await
            }
            Err(err) => RpcResponse::Error {
                message: format!("malformed request: {err}"),
            },
        };
        send_response(&mut writer, &response).await?;
    }
}

async fn dispatch(engine: &Engine, request: RpcRequest) -> RpcResponse {
    match request {
        RpcRequest::Get { key, .. } => match engine.get(&key).await {
            Ok(value) => RpcResponse::Ok {
                key,
                value: value.unwrap_or_else(|| NOT_FOUND.to_string()),
            },
            Err(err) => RpcResponse::Error {
                message: format!("{err:#}"),
            },
        },
        RpcRequest::Put { key, value } => {
            engine.put(key.clone(), value.clone());
            RpcResponse::Ok { key, value }
        }
        RpcRequest::Delete { key, .. } => {
            engine.delete(key.clone());
            RpcResponse::Ok {
                key,
                value: String::new(),
            }
        }
    }
}

async fn send_response(writer: &mut OwnedWriteHalf, response: &RpcResponse) -> Result<()> {
    let mut frame = serde_json::to_vec(response).context("failed to encode rpc response")?;
    frame.push(b'\n');
    writer
        .write_all(&frame)
        .await
        .context("failed to write rpc response")?;
    writer
        .flush()
        .await
        .context("failed to flush rpc response")?;
    Ok(())
}

/// Client side of the `Datastore` RPC surface, used by the
/// interactive client, the test driver, and the integration tests.
pub struct DatastoreClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl DatastoreClient {
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to replica at {addr}"))?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    /// Returns the stored value, or [`NOT_FOUND`] for an absent key.
    pub async fn get(&mut self, key: &str) -> Result<String> {
        self.call(RpcRequest::Get {
            key: key.to_string(),
            value: String::new(),
        })
        .await
    }

    pub async fn put(&mut self, key: &str, value: &str) -> Result<String> {
        self.call(RpcRequest::Put {
            key: key.to_string(),
            value: value.to_string(),
        })
        .await
    }

    pub async fn delete(&mut self, key: &str) -> Result<String> {
        self.call(RpcRequest::Delete {
            key: key.to_string(),
            value: String::new(),
        })
        .await
    }

    async fn call(&mut self, request: RpcRequest) -> Result<String> {
        let mut frame = serde_json::to_vec(&request).context("failed to encode rpc request")?;
        frame.push(b'\n');
        self.writer
            .write_all(&frame)
            .await
            .context("failed to send rpc request")?;
        self.writer
            .flush()
            .await
            .context("failed to flush rpc request")?;

        let mut line = String::new();
        let bytes = self
            .reader
            .read_line(&mut line)
            .await
            .context("failed to read rpc response")?;
        if bytes == 0 {
            return Err(anyhow!("replica closed the connection"));
        }
        match serde_json::from_str::<RpcResponse>(line.trim())
            .context("malformed rpc response")?
        {
            RpcResponse::Ok { value, .. } => Ok(value),
            RpcResponse::Error { message } => Err(anyhow!(message)),
        }
    }
}
