//! Selector/payload routing for the source byte stream
//!
//! Every byte read from the source terminal is either a selector (value
//! below the endpoint count) or payload. Selectors change which endpoint
//! receives the next payload byte and are consumed, never forwarded.

/// Stateful interpreter for the in-band selector protocol.
///
/// In the default single-shot mode, one selector byte addresses exactly
/// one following payload byte; after that byte is routed, the selection
/// reverts to the default endpoint. In sticky mode the selection persists
/// until the next selector byte.
pub struct Router {
    endpoint_count: usize,
    default_endpoint: usize,
    sticky: bool,
    selection: usize,
}

impl Router {
    pub fn new(endpoint_count: usize, default_endpoint: usize, sticky: bool) -> Self {
        debug_assert!(endpoint_count > 0);
        debug_assert!(default_endpoint < endpoint_count);
        Self {
            endpoint_count,
            default_endpoint,
            sticky,
            selection: default_endpoint,
        }
    }

    /// The endpoint the next payload byte would be routed to.
    #[allow(dead_code)]
    pub fn selection(&self) -> usize {
        self.selection
    }

    /// Classify one source byte.
    ///
    /// Returns `None` for a selector byte (consumed, selection updated) or
    /// `Some(index)` naming the endpoint that should receive the byte.
    /// Bytes in `[0, endpoint_count)` can never be routed as payload;
    /// that is an inherent limitation of the protocol, not a bug.
    pub fn route(&mut self, byte: u8) -> Option<usize> {
        if (byte as usize) < self.endpoint_count {
            self.selection = byte as usize;
            return None;
        }

        let target = self.selection;
        if !self.sticky {
            self.selection = self.default_endpoint;
        }
        Some(target)
    }
}
