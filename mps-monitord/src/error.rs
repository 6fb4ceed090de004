use std::time::Duration;

/// Failure of a single remote call.
///
/// `Connect`, `Transport`, `Disconnected` and `Timeout` are transport
/// failures; `Fault` and `Data` mean the portal answered but the answer was
/// unusable. Both are retried on the next poll tick.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("Failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        source: std::io::Error,
    },

    #[error("Transport failure talking to {endpoint}: {source}")]
    Transport {
        endpoint: String,
        source: std::io::Error,
    },

    #[error("Connection to {endpoint} closed by peer")]
    Disconnected { endpoint: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Remote fault in {method}: {message}")]
    Fault { method: String, message: String },

    #[error("Malformed response to {method}: {message}")]
    Data { method: String, message: String },
}

impl RemoteError {
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RemoteError::Connect { .. }
                | RemoteError::Transport { .. }
                | RemoteError::Disconnected { .. }
                | RemoteError::Timeout { .. }
        )
    }
}
