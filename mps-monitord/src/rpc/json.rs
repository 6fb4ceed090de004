use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use shared::protocol::*;
use shared::types::{ChannelInfo, FreshnessVector, TripEvent};
use crate::error::RemoteError;
use super::RemoteServiceProxy;

/// Longest reply line accepted from a portal
pub const MAX_REPLY_LENGTH: usize = 4 * 1024 * 1024;

#[derive(Serialize)]
struct Request<'a> {
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct Response {
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Fault>,
}

#[derive(Deserialize)]
struct Fault {
    message: String,
}

struct Connection {
    reader: FramedRead<OwnedReadHalf, LinesCodec>,
    writer: OwnedWriteHalf,
}

/// Newline-delimited JSON-RPC over a single TCP stream.
///
/// The stream is opened on first use and dropped after any I/O failure,
/// oversized reply or reply to another request, so the next call reconnects.
pub struct JsonRpcProxy {
    endpoint: String,
    connection: Mutex<Option<Connection>>,
    next_id: AtomicU64,
}

impl JsonRpcProxy {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            connection: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    async fn connect(&self) -> Result<Connection, RemoteError> {
        let stream = TcpStream::connect(&self.endpoint)
            .await
            .map_err(|source| RemoteError::Connect {
                endpoint: self.endpoint.clone(),
                source,
            })?;
        let (reader, writer) = stream.into_split();
        tracing::debug!("Connected to portal at {}", self.endpoint);
        Ok(Connection {
            reader: FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_REPLY_LENGTH)),
            writer,
        })
    }

    async fn exchange(&self, conn: &mut Connection, line: &[u8]) -> Result<Response, RemoteError> {
        let transport = |source| RemoteError::Transport {
            endpoint: self.endpoint.clone(),
            source,
        };

        conn.writer.write_all(line).await.map_err(transport)?;
        conn.writer.flush().await.map_err(transport)?;

        let reply = match conn.reader.next().await {
            Some(Ok(reply)) => reply,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                return Err(RemoteError::Data {
                    method: "response".to_string(),
                    message: format!("reply exceeds {} bytes", MAX_REPLY_LENGTH),
                });
            }
            Some(Err(LinesCodecError::Io(source))) => return Err(transport(source)),
            None => {
                return Err(RemoteError::Disconnected {
                    endpoint: self.endpoint.clone(),
                });
            }
        };

        serde_json::from_str(&reply).map_err(|e| RemoteError::Data {
            method: "response".to_string(),
            message: e.to_string(),
        })
    }

    async fn call<R: DeserializeOwned>(&self, method: &str, params: Value) -> Result<R, RemoteError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut line = serde_json::to_vec(&Request { id, method, params }).map_err(|e| RemoteError::Data {
            method: method.to_string(),
            message: e.to_string(),
        })?;
        line.push(b'\n');

        let response = {
            let mut guard = self.connection.lock().await;
            let mut conn = match guard.take() {
                Some(conn) => conn,
                None => self.connect().await?,
            };
            // A failed exchange leaves the stream in an unknown state, so it is dropped here
            let response = self.exchange(&mut conn, &line).await?;
            if response.id != id {
                // Out of step with our requests: drop the stream so the next call starts clean
                return Err(RemoteError::Data {
                    method: method.to_string(),
                    message: format!("response id {} does not match request id {}", response.id, id),
                });
            }
            *guard = Some(conn);
            response
        };
        if let Some(fault) = response.error {
            return Err(RemoteError::Fault {
                method: method.to_string(),
                message: fault.message,
            });
        }

        serde_json::from_value(response.result.unwrap_or(Value::Null)).map_err(|e| RemoteError::Data {
            method: method.to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl RemoteServiceProxy for JsonRpcProxy {
    async fn host_name(&self) -> Result<String, RemoteError> {
        self.call(METHOD_HOST_NAME, json!([])).await
    }

    async fn launch_time(&self) -> Result<DateTime<Utc>, RemoteError> {
        self.call(METHOD_LAUNCH_TIME, json!([])).await
    }

    async fn process_id(&self) -> Result<u32, RemoteError> {
        self.call(METHOD_PROCESS_ID, json!([])).await
    }

    async fn logs_statistics(&self) -> Result<bool, RemoteError> {
        self.call(METHOD_LOGS_STATISTICS, json!([])).await
    }

    async fn categories(&self) -> Result<Vec<String>, RemoteError> {
        self.call(METHOD_CATEGORIES, json!([])).await
    }

    async fn last_event_timestamps(&self, category: usize) -> Result<FreshnessVector, RemoteError> {
        let table: HashMap<String, Option<DateTime<Utc>>> =
            self.call(METHOD_LAST_EVENT_TIMES, json!([category])).await?;
        Ok(FreshnessVector::from_table(&table))
    }

    async fn first_hit_summary(&self, category: usize) -> Result<String, RemoteError> {
        self.call(METHOD_FIRST_HIT_TEXT, json!([category])).await
    }

    async fn trip_summary(&self, category: usize) -> Result<String, RemoteError> {
        self.call(METHOD_TRIP_SUMMARY, json!([category])).await
    }

    async fn latest_events(&self, category: usize) -> Result<Vec<TripEvent>, RemoteError> {
        self.call(METHOD_LATEST_EVENTS, json!([category])).await
    }

    async fn channel_info(&self, category: usize) -> Result<Vec<ChannelInfo>, RemoteError> {
        self.call(METHOD_CHANNEL_INFO, json!([category])).await
    }

    async fn input_channel_info(&self, category: usize) -> Result<Vec<ChannelInfo>, RemoteError> {
        self.call(METHOD_INPUT_CHANNEL_INFO, json!([category])).await
    }

    async fn reload_signals(&self, category: usize) -> Result<(), RemoteError> {
        self.call(METHOD_RELOAD_SIGNALS, json!([category])).await
    }

    async fn shutdown(&self, code: i32) -> Result<(), RemoteError> {
        self.call(METHOD_SHUTDOWN, json!([code])).await
    }
}
