use std::time::Duration;

use clap::Parser;

use crate::config::{
    DEFAULT_HUB_CAPACITY, DEFAULT_LISTEN, DEFAULT_MAX_LINE_BYTES, DEFAULT_OUTBOUND_CAPACITY,
    DEFAULT_PROMPT, HubOptions, OverflowPolicy, RelayConfig, SessionOptions,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = DEFAULT_LISTEN)]
    pub listen: String,

    /// Close connections that stay silent for this many milliseconds. 0 disables.
    #[arg(long, default_value_t = 300_000, conflicts_with = "no_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// Never close connections for inactivity.
    #[arg(long)]
    pub no_idle_timeout: bool,

    /// Skip the username prompt and name clients after their peer address.
    #[arg(long)]
    pub anonymous: bool,

    /// Prompt sent to new connections before reading their username.
    #[arg(long, default_value = DEFAULT_PROMPT)]
    pub prompt: String,

    /// Broadcast the list of connected clients whenever someone joins or leaves.
    #[arg(long)]
    pub headcount: bool,

    /// Messages buffered per client before the overflow policy applies.
    #[arg(long, default_value_t = DEFAULT_OUTBOUND_CAPACITY)]
    pub outbound_capacity: usize,

    /// What to do with a client whose outbound buffer is full.
    #[arg(long, value_enum, default_value_t = OverflowPolicy::Drop)]
    pub overflow: OverflowPolicy,

    /// Events queued for the hub before submitting sessions wait.
    #[arg(long, default_value_t = DEFAULT_HUB_CAPACITY)]
    pub hub_capacity: usize,

    /// Longest accepted inbound line, in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_LINE_BYTES)]
    pub max_line_bytes: usize,
}

impl Cli {
    pub fn relay_config(&self) -> RelayConfig {
        let idle_timeout = (!self.no_idle_timeout && self.idle_timeout_ms > 0)
            .then(|| Duration::from_millis(self.idle_timeout_ms));
        let prompt = (!self.anonymous).then(|| self.prompt.clone());

        RelayConfig {
            hub: HubOptions {
                headcount: self.headcount,
                overflow: self.overflow,
                event_capacity: self.hub_capacity.max(1),
            },
            session: SessionOptions {
                prompt,
                idle_timeout,
                outbound_capacity: self.outbound_capacity.max(1),
                max_line_bytes: self.max_line_bytes,
            },
        }
    }
}
