#![forbid(unsafe_code)]

// Point-to-point forwarding of offers, answers and ICE candidates.

use super::protocol::{try_deliver, Delivery, ServerMessage, SignalMessage};
use super::registry::ConnectionRegistry;
use crate::metrics::ServerMetrics;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct SignalRelay {
    registry: ConnectionRegistry,
    metrics: ServerMetrics,
}

impl SignalRelay {
    pub fn new(registry: ConnectionRegistry, metrics: ServerMetrics) -> Self {
        Self { registry, metrics }
    }

    /// Forwards a signal to its target with `from` stamped on. The payload bytes are
    /// passed through unchanged. Returns false if the target is unknown or its queue
    /// is full.
    pub fn relay(&self, from: &str, signal: SignalMessage) -> bool {
        let SignalMessage { kind, to, payload } = signal;

        let Some(target) = self.registry.sender_for(&to) else {
            debug!("{} from {} dropped: unknown target {}", kind.event_name(), from, to);
            self.metrics.inc_signals_dropped();
            return false;
        };

        let json = match ServerMessage::relayed(kind, from.to_string(), payload).encode() {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize {} from {}: {}", kind.event_name(), from, e);
                self.metrics.inc_signals_dropped();
                return false;
            }
        };

        // Signals tolerate loss; a full queue only costs this frame
        if try_deliver(&target, json, &to, &self.metrics) == Delivery::Queued {
            self.metrics.inc_signals_relayed();
            true
        } else {
            self.metrics.inc_signals_dropped();
            false
        }
    }
}
