//! Inbound message reassembly.
//!
//! A WebSocket message may arrive split into several fragments.  The
//! [`FrameBuffer`] collects them into one contiguous byte vector and hands the
//! complete message back on the final fragment.
//!
//! # Size cap
//!
//! The buffer grows in fixed increments and never beyond
//! [`FrameLimits::max_message_size`].  A message that would exceed the cap is
//! dropped whole: the partial buffer is freed and every remaining fragment of
//! that message is skipped.  A truncated message is never delivered.

use crate::domain::frames::{InboundFragment, PayloadKind};

/// Default hard cap on a reassembled inbound message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 650_000;

/// Default growth step when an appended fragment does not fit.
pub const DEFAULT_GROWTH_INCREMENT: usize = 16 * 1024;

/// Size limits applied during reassembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    pub max_message_size: usize,
    pub growth_increment: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            growth_increment: DEFAULT_GROWTH_INCREMENT,
        }
    }
}

/// A complete inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledMessage {
    pub kind: PayloadKind,
    pub payload: Vec<u8>,
}

/// What happened to one fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentOutcome {
    /// More fragments are needed.
    Incomplete,
    /// The final fragment arrived; here is the whole message.
    Complete(AssembledMessage),
    /// The message crossed the cap.  Reported once per message.
    Oversized { received: usize },
    /// Fragment belongs to a message already dropped, or arrived without a
    /// first fragment.
    Skipped,
}

#[derive(Debug)]
enum Assembly {
    Idle,
    Collecting {
        kind: PayloadKind,
        buf: Vec<u8>,
        capacity: usize,
    },
    Discarding,
}

/// Reassembly buffer for one connection.
#[derive(Debug)]
pub struct FrameBuffer {
    limits: FrameLimits,
    state: Assembly,
}

impl FrameBuffer {
    pub fn new(limits: FrameLimits) -> Self {
        Self {
            limits,
            state: Assembly::Idle,
        }
    }

    pub fn limits(&self) -> FrameLimits {
        self.limits
    }

    /// `true` between the first and the final fragment of a message that is
    /// still being kept.
    pub fn is_assembling(&self) -> bool {
        matches!(self.state, Assembly::Collecting { .. })
    }

    /// Bytes collected so far for the message in progress.
    pub fn received(&self) -> usize {
        match &self.state {
            Assembly::Collecting { buf, .. } => buf.len(),
            _ => 0,
        }
    }

    /// Current reserved size of the assembly buffer (0 when none is live).
    pub fn capacity(&self) -> usize {
        match &self.state {
            Assembly::Collecting { capacity, .. } => *capacity,
            _ => 0,
        }
    }

    /// Feeds one fragment.
    pub fn push(&mut self, fragment: InboundFragment) -> FragmentOutcome {
        let cap = self.limits.max_message_size;

        if fragment.is_first {
            if self.is_assembling() {
                tracing::warn!(
                    "new message started before the previous one finished; discarding {} bytes",
                    self.received()
                );
            }

            if fragment.payload.len() > cap {
                self.state = if fragment.is_final {
                    Assembly::Idle
                } else {
                    Assembly::Discarding
                };
                return FragmentOutcome::Oversized {
                    received: fragment.payload.len(),
                };
            }

            if fragment.is_final {
                self.state = Assembly::Idle;
                return FragmentOutcome::Complete(AssembledMessage {
                    kind: fragment.kind,
                    payload: fragment.payload,
                });
            }

            let initial = fragment
                .payload
                .len()
                .saturating_add(fragment.remaining)
                .min(cap);
            let mut buf = Vec::with_capacity(initial);
            buf.extend_from_slice(&fragment.payload);
            self.state = Assembly::Collecting {
                kind: fragment.kind,
                buf,
                capacity: initial,
            };
            return FragmentOutcome::Incomplete;
        }

        match &mut self.state {
            Assembly::Idle => FragmentOutcome::Skipped,
            Assembly::Discarding => {
                if fragment.is_final {
                    self.state = Assembly::Idle;
                }
                FragmentOutcome::Skipped
            }
            Assembly::Collecting {
                kind,
                buf,
                capacity,
            } => {
                let needed = buf.len() + fragment.payload.len();
                if needed > cap {
                    let received = needed;
                    self.state = if fragment.is_final {
                        Assembly::Idle
                    } else {
                        Assembly::Discarding
                    };
                    return FragmentOutcome::Oversized { received };
                }

                if needed > *capacity {
                    let shortfall = needed - *capacity;
                    let step = self.limits.growth_increment.max(1);
                    let steps = (shortfall + step - 1) / step;
                    let grown = capacity.saturating_add(steps * step).min(cap);
                    buf.reserve_exact(grown - buf.len());
                    *capacity = grown;
                }
                buf.extend_from_slice(&fragment.payload);

                if !fragment.is_final {
                    return FragmentOutcome::Incomplete;
                }

                let kind = *kind;
                let payload = std::mem::take(buf);
                self.state = Assembly::Idle;
                FragmentOutcome::Complete(AssembledMessage { kind, payload })
            }
        }
    }

    /// Frees any partial message.
    pub fn clear(&mut self) {
        self.state = Assembly::Idle;
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(FrameLimits::default())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(payload: &[u8], is_first: bool, is_final: bool, remaining: usize) -> InboundFragment {
        InboundFragment {
            kind: PayloadKind::Text,
            payload: payload.to_vec(),
            is_first,
            is_final,
            remaining,
        }
    }

    fn small_limits() -> FrameLimits {
        FrameLimits {
            max_message_size: 100,
            growth_increment: 8,
        }
    }

    #[test]
    fn test_single_fragment_message_is_complete_immediately() {
        // Arrange
        let mut fb = FrameBuffer::default();

        // Act
        let outcome = fb.push(fragment(b"hello", true, true, 0));

        // Assert
        assert_eq!(
            outcome,
            FragmentOutcome::Complete(AssembledMessage {
                kind: PayloadKind::Text,
                payload: b"hello".to_vec()
            })
        );
        assert!(!fb.is_assembling());
    }

    #[test]
    fn test_two_fragments_concatenate() {
        let mut fb = FrameBuffer::default();

        assert_eq!(fb.push(fragment(b"{\"a\":", true, false, 2)), FragmentOutcome::Incomplete);
        assert!(fb.is_assembling());
        let outcome = fb.push(fragment(b"1}", false, true, 0));

        match outcome {
            FragmentOutcome::Complete(msg) => assert_eq!(msg.payload, b"{\"a\":1}"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(!fb.is_assembling());
    }

    #[test]
    fn test_first_fragment_allocates_declared_size() {
        let mut fb = FrameBuffer::new(small_limits());

        fb.push(fragment(&[0u8; 10], true, false, 30));

        assert_eq!(fb.capacity(), 40);
        assert_eq!(fb.received(), 10);
    }

    #[test]
    fn test_growth_is_in_fixed_increments_and_capacity_covers_received() {
        // Arrange: no size hint, so the first allocation is exactly 10 bytes
        let mut fb = FrameBuffer::new(small_limits());
        fb.push(fragment(&[0u8; 10], true, false, 0));

        // Act: 5 more bytes need one 8-byte step
        fb.push(fragment(&[0u8; 5], false, false, 0));

        // Assert
        assert_eq!(fb.capacity(), 18);
        assert!(fb.capacity() >= fb.received());
    }

    #[test]
    fn test_growth_is_clamped_to_cap() {
        let mut fb = FrameBuffer::new(small_limits());
        fb.push(fragment(&[0u8; 95], true, false, 0));

        let outcome = fb.push(fragment(&[0u8; 5], false, true, 0));

        match outcome {
            FragmentOutcome::Complete(msg) => assert_eq!(msg.payload.len(), 100),
            other => panic!("message at the cap must be delivered, got {other:?}"),
        }
    }

    #[test]
    fn test_oversized_message_is_dropped_and_rest_skipped() {
        // Arrange
        let mut fb = FrameBuffer::new(small_limits());
        fb.push(fragment(&[0u8; 60], true, false, 0));

        // Act
        let crossing = fb.push(fragment(&[0u8; 60], false, false, 0));
        let tail = fb.push(fragment(&[0u8; 10], false, true, 0));

        // Assert
        assert_eq!(crossing, FragmentOutcome::Oversized { received: 120 });
        assert_eq!(tail, FragmentOutcome::Skipped);
        assert!(!fb.is_assembling());
        assert_eq!(fb.capacity(), 0);
    }

    #[test]
    fn test_buffer_is_reusable_after_oversized_message() {
        let mut fb = FrameBuffer::new(small_limits());
        fb.push(fragment(&[0u8; 200], true, true, 0));

        let outcome = fb.push(fragment(b"ok", true, true, 0));

        assert!(matches!(outcome, FragmentOutcome::Complete(_)));
    }

    #[test]
    fn test_oversized_first_fragment_is_reported() {
        let mut fb = FrameBuffer::new(small_limits());

        let outcome = fb.push(fragment(&[0u8; 150], true, false, 0));

        assert_eq!(outcome, FragmentOutcome::Oversized { received: 150 });
        assert_eq!(fb.push(fragment(b"x", false, true, 0)), FragmentOutcome::Skipped);
    }

    #[test]
    fn test_continuation_without_first_fragment_is_skipped() {
        let mut fb = FrameBuffer::default();
        assert_eq!(fb.push(fragment(b"orphan", false, true, 0)), FragmentOutcome::Skipped);
    }

    #[test]
    fn test_new_first_fragment_discards_partial_message() {
        let mut fb = FrameBuffer::default();
        fb.push(fragment(b"stale", true, false, 0));

        fb.push(fragment(b"fre", true, false, 0));
        let outcome = fb.push(fragment(b"sh", false, true, 0));

        match outcome {
            FragmentOutcome::Complete(msg) => assert_eq!(msg.payload, b"fresh"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_binary_kind_is_preserved() {
        let mut fb = FrameBuffer::default();
        fb.push(InboundFragment {
            kind: PayloadKind::Binary,
            payload: vec![1, 2],
            is_first: true,
            is_final: false,
            remaining: 0,
        });

        let outcome = fb.push(fragment(&[3], false, true, 0));

        match outcome {
            FragmentOutcome::Complete(msg) => {
                assert_eq!(msg.kind, PayloadKind::Binary);
                assert_eq!(msg.payload, vec![1, 2, 3]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
