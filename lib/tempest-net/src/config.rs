// Copyright 2026 - developers of the `tempest` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
use std::time::Duration;

use tempest_proto::DEFAULT_MAX_MESSAGE_SIZE;

/// Tuning knobs shared by every connection created from one endpoint.
///
/// The defaults match the protocol's documented behavior; most callers
/// use `ConnectionConfig::default()` with struct update syntax for the
/// odd override.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Upper bound on one frame, header included.
    pub max_message_size: usize,

    /// How often a ping is sent on an otherwise healthy connection.
    pub ping_interval: Duration,

    /// Silence longer than this declares the peer dead.
    pub ping_timeout: Duration,

    /// How often the delivery timer walks the pending-reliable table
    /// (datagram transport only).
    pub resend_tick: Duration,

    /// Backoff before the first retransmission; doubles per attempt.
    pub resend_backoff: Duration,

    /// Ceiling for the retransmission backoff.
    pub resend_backoff_cap: Duration,

    /// A reliable datagram unacknowledged for this long disconnects the
    /// connection.
    pub resend_deadline: Duration,

    /// How often pending responses are checked for elapsed deadlines.
    pub sweep_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            ping_interval: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(15),
            resend_tick: Duration::from_millis(100),
            resend_backoff: Duration::from_millis(100),
            resend_backoff_cap: Duration::from_secs(2),
            resend_deadline: Duration::from_secs(15),
            sweep_interval: Duration::from_millis(100),
        }
    }
}
