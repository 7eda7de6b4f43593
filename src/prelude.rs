//! Re-export the most commonly used framework types.

pub use crate::error::{DeviceError, DeviceResult};
pub use crate::events::Event;
pub use crate::fabric::{
    root_cmd, group_cmd, Arg, BarResolver, EndpointClaim, EventArg, Group, LeafCall, LeafDriver, PfCallbacks, Registry,
    Resource, ResourceFlags, Root, SubdeviceId, CMD_CUSTOM_BASE, CMD_EVENT,
};
pub use crate::metadata::{Blob, EndpointDesc, Uuid};
pub use crate::pool::{Leaf, Match, NoopHandler, SubdevicePool};
pub use crate::ring::{PageMapper, RegisterRequest, Ring, RingLayout, RingSet, Stage, Worker, WorkerClock};
