use serde::{Deserialize, Serialize};

/// Source-side semantic of an interrupt line change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IrqLevel {
    Low,
    High,
    /// A synthetic deassert-then-assert, used by sources that only know "an
    /// event happened" and need a guaranteed rising edge.
    FlipFlop,
}
