use std::time::Duration;

use clap::ValueEnum;

pub const DEFAULT_LISTEN: &str = "localhost:8000";
pub const DEFAULT_PROMPT: &str = "Chat username: ";
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;
pub const DEFAULT_HUB_CAPACITY: usize = 64;
/// Longest inbound line accepted before the session is dropped.
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

/// What the hub does when a recipient's outbound queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OverflowPolicy {
    /// Drop the message for that recipient only.
    #[default]
    Drop,
    /// Close the recipient's connection; it then leaves like any other client.
    Disconnect,
}

#[derive(Debug, Clone)]
pub struct HubOptions {
    /// Broadcast a roster after every join and leave.
    pub headcount: bool,
    pub overflow: OverflowPolicy,
    /// Capacity of the hub's event queue. Submitters wait when it is full.
    pub event_capacity: usize,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            headcount: false,
            overflow: OverflowPolicy::default(),
            event_capacity: DEFAULT_HUB_CAPACITY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Prompt written on connect. `None` skips the handshake and names the
    /// client after its peer address.
    pub prompt: Option<String>,
    /// `None` disables the idle monitor.
    pub idle_timeout: Option<Duration>,
    pub outbound_capacity: usize,
    pub max_line_bytes: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            prompt: Some(DEFAULT_PROMPT.to_string()),
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    pub hub: HubOptions,
    pub session: SessionOptions,
}
