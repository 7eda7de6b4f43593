//! Crate-wide error type.

/// Error kinds the core framework may surface.
///
/// Mirrors the kind names used throughout the component design rather than
/// wrapping OS errno values directly; callers that need an errno translate
/// at the boundary (char-device glue, ioctl handling), which is out of
/// scope for this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    /// Endpoint, leaf, property, or group not found.
    NotFound,
    /// Malformed blob, bad length, or unknown command.
    Invalid,
    /// Delete blocked by holders, even after a killable wait was
    /// interrupted and its holders force-dropped.
    Busy,
    /// Duplicate registration, or bring-up attempted twice.
    Exists,
    /// Allocation failure.
    OutOfMemory,
    /// Resource mapping conflict, page-pin failure, or ring transport I/O
    /// failure.
    Io,
    /// Internal consistency break inside a worker; the caller should tear
    /// down whatever the worker was driving.
    Fatal,
    /// Operation would have to block and the caller asked not to.
    WouldBlock,
    /// Command not implemented by this leaf/driver.
    NotSupported,
    /// Partial group bring-up: at least one driver failed to claim its
    /// endpoints, but the group itself is usable.
    ChildFailed,
}

pub type DeviceResult<T = ()> = core::result::Result<T, DeviceError>;
