use std::time::Duration;

/// Frame and message size limits, shared by both accept-side and dial-side
/// connections. `max_message_size` defaults to 32,768 bytes, the assembled-
/// message ceiling a caller is expected to raise explicitly via
/// `Connection::set_read_limit` or this config once it knows its workload.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    pub max_frame_size: usize,
    pub max_message_size: usize,
    /// How long a `Close` sender waits for the peer's echo before giving up
    /// and tearing the connection down unilaterally.
    pub close_grace_period: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        WebSocketConfig {
            max_frame_size: 16 << 20,
            max_message_size: 32 * 1024,
            close_grace_period: Duration::from_secs(5),
        }
    }
}

/// Which `Origin` header values a server accepts during the handshake.
#[derive(Debug, Clone)]
pub enum OriginPolicy {
    AllowAny,
    AllowList(Vec<String>),
}

impl Default for OriginPolicy {
    fn default() -> Self {
        OriginPolicy::AllowAny
    }
}

/// Options for `accept()`.
#[derive(Debug, Clone, Default)]
pub struct AcceptOptions {
    pub subprotocols: Vec<String>,
    pub config: WebSocketConfig,
    pub origin_policy: OriginPolicy,
}

/// Options for `dial()`.
#[derive(Debug, Clone, Default)]
pub struct DialOptions {
    pub subprotocols: Vec<String>,
    pub config: WebSocketConfig,
}

/// The negotiated outcome of a client-initiated handshake: the subprotocol
/// the server picked, if any, and any extra headers it sent back.
#[derive(Debug, Clone, Default)]
pub struct DialResponse {
    pub subprotocol: Option<String>,
}
