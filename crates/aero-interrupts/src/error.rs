use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InterruptError {
    /// The controller lock was held by another thread; retry from a context that may block.
    #[error("interrupt controller busy")]
    Busy,

    #[error("unknown I/O APIC chipset type {0:?}")]
    UnknownChipType(String),

    #[error("pin {pin} out of range (controller has {pins} pins)")]
    PinOutOfRange { pin: u32, pins: u32 },

    #[error("snapshot does not match controller: {0}")]
    SnapshotMismatch(&'static str),
}

pub type Result<T> = std::result::Result<T, InterruptError>;
