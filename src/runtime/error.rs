use std::string::FromUtf8Error;
use std::time::Duration;

/// Session-fatal failures. Recoverable conditions (tip timeouts, unknown
/// commands, internal interpreter errors) never surface as `Error` values;
/// they are resolved empty or logged in place, so any `Err` from the session
/// tears the session down.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- transport errors ------------------------------------------
    #[error("bind loopback listener: {0}")]
    Bind(std::io::Error),
    #[error("spawn interpreter `{0}`: {1}")]
    Spawn(String, std::io::Error),
    #[error("no connection from the spawned interpreter within {0:?}")]
    AcceptTimeout(Duration),
    #[error("no handshake acknowledgment within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("interpreter exited before the handshake completed")]
    ExitedBeforeHandshake,
    #[error("interpreter disconnected before the handshake completed")]
    DisconnectBeforeHandshake,
    #[error(transparent)]
    IO(#[from] std::io::Error),

    // --------------------------------- protocol errors -------------------------------------------
    #[error("bad protocol message (declared frame length {0})")]
    BadFrame(u32),
    #[error("unsupported RIDE protocol version `{0}`")]
    UnsupportedProtocol(String),
    #[error("frame payload is not valid utf-8")]
    PayloadUtf8(#[from] FromUtf8Error),
    #[error("malformed `{0}` payload: {1}")]
    Payload(String, serde_json::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!(target: "bridge", "{:#}", e);
                None
            }
        }
    };
    ($res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!(target: "bridge", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}
