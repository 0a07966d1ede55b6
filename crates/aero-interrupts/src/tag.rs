//! Opaque causal-tracing tags carried from an interrupt source to the vector
//! fetch that consumes it.

use serde::{Deserialize, Serialize};

/// Tracing identifier attached to an asserted pin.
///
/// The first tag to arrive on an idle pin is kept. If a different non-zero tag
/// arrives before the first is consumed, [`TraceTag::SATURATED`] is or'ed in so
/// consumers can tell several sources were folded together.
///
/// Re-asserting the tag already held is deliberately not a collision, unlike
/// controllers that saturate on any re-assert while a tag is pending.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceTag(pub u32);

impl TraceTag {
    pub const NONE: TraceTag = TraceTag(0);
    pub const SATURATED: u32 = 1 << 31;

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn is_saturated(self) -> bool {
        self.0 & Self::SATURATED != 0
    }

    /// Folds `incoming` into this slot.
    pub fn merge(&mut self, incoming: TraceTag) {
        if self.0 == 0 {
            self.0 = incoming.0;
        } else if incoming.0 != 0 && incoming.0 != self.0 {
            self.0 |= Self::SATURATED;
        }
    }

    /// Returns the tag and leaves the slot empty.
    pub fn take(&mut self) -> TraceTag {
        std::mem::take(self)
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl From<u32> for TraceTag {
    fn from(value: u32) -> Self {
        TraceTag(value)
    }
}
