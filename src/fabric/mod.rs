//! Root / group / leaf fabric (C3): the two-tier composition hierarchy,
//! its shared command protocol, the driver registry, and resource
//! derivation.

mod group;
mod registry;
mod root;

pub use group::{BarResolver, Group};
pub use registry::{DriverRecord, EndpointClaim, Registry};
pub use root::{PfCallbacks, Root};

use crate::error::{DeviceError, DeviceResult};
use crate::events::Event;
use crate::metadata::Blob;
use crate::pool::{Leaf, Match};
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;

numeric_enum_macro::numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// The closed enumeration of subdevice kinds. Order matters: sibling
/// leaves within a group are created in this order and destroyed in
/// reverse.
pub enum SubdeviceId {
    Group = 0,
    Vsec = 1,
    VsecGolden = 2,
    Devctl = 3,
    Axigate = 4,
    Icap = 5,
    Test = 6,
    MgmtMain = 7,
    Qspi = 8,
    Mailbox = 9,
    Cmc = 10,
    Calib = 11,
    ClkFreq = 12,
    Clock = 13,
    Srsr = 14,
    Ucs = 15,
    PcieFirewall = 16,
}
}

bitflags::bitflags! {
    pub struct ResourceFlags: u32 {
        const MEM = 0b0000_0001;
    }
}

/// A conflict-checked address range derived from an endpoint's `reg`
/// tuple and its owning PCIe BAR.
#[derive(Debug, Clone)]
pub struct Resource {
    pub start: u64,
    pub end: u64,
    pub flags: ResourceFlags,
    pub name: String,
}

/// Command space partition shared by every layer of the fabric.
/// `[0, 1)` is the always-defined event command; `[1, 64)` is reserved
/// infrastructure; `[64, )` is leaf-defined.
pub const CMD_EVENT: u32 = 0;
pub const CMD_CUSTOM_BASE: u32 = 64;

/// Root-facing infrastructure commands (leaf -> root), `[1, 64)`.
pub mod root_cmd {
    pub const GET_LEAF: u32 = 1;
    pub const PUT_LEAF: u32 = 2;
    pub const GET_LEAF_HOLDERS: u32 = 3;
    pub const CREATE_GROUP: u32 = 4;
    pub const REMOVE_GROUP: u32 = 5;
    pub const LOOKUP_GROUP: u32 = 6;
    pub const WAIT_GROUP_BRINGUP: u32 = 7;
    pub const EVENT: u32 = 8;
    pub const EVENT_ASYNC: u32 = 9;
    pub const GET_RESOURCE: u32 = 10;
    pub const GET_ID: u32 = 11;
    pub const HOT_RESET: u32 = 12;
    pub const HWMON_REGISTER: u32 = 13;
}

/// Group-facing infrastructure commands (root -> group, or self),
/// `[1, 64)`.
pub mod group_cmd {
    pub const GET_LEAF: u32 = 1;
    pub const PUT_LEAF: u32 = 2;
    pub const INIT_CHILDREN: u32 = 2 + 1;
    pub const FINI_CHILDREN: u32 = 2 + 2;
    pub const TRIGGER_EVENT: u32 = 2 + 3;
}

/// A command argument, erased behind `Any` per the command-dispatch
/// design note ("`cmd -> &mut dyn Any`-style erasure with per-cmd
/// newtype wrappers").
pub type Arg<'a> = &'a mut dyn Any;

/// Every leaf, group, and root speaks this same shape.
pub trait LeafCall: Send + Sync {
    /// Dispatch `cmd`, discriminating `arg` by `cmd`'s value. `EVENT`
    /// must always forward to the implementor's event handler.
    fn leaf_call(&self, cmd: u32, arg: Arg) -> DeviceResult<i32>;
}

/// Newtype wrapper for the `EVENT` command's argument. Owned rather than
/// borrowed: any type crossing the `dyn Any` erasure boundary must be
/// `'static`, so `Event`'s `Copy` is relied on here instead of a
/// reference.
pub struct EventArg(pub Event);

/// Owned counterpart of [`crate::pool::Match`] for command arguments
/// that must cross the `dyn Any` boundary: `EpName` holds a `String`
/// rather than a borrowed `&str`.
#[derive(Clone)]
pub enum MatchSpec {
    Id(SubdeviceId, u32),
    EpName(String),
    Next(u64),
    Prev(u64),
    Any,
}

impl MatchSpec {
    pub fn as_match(&self) -> Match {
        match self {
            MatchSpec::Id(id, instance) => Match::Id(*id, *instance),
            MatchSpec::EpName(name) => Match::EpName(name),
            MatchSpec::Next(seq) => Match::Next(*seq),
            MatchSpec::Prev(seq) => Match::Prev(*seq),
            MatchSpec::Any => Match::Any,
        }
    }
}

/// `root_cmd::GET_LEAF` / `group_cmd::GET_LEAF` argument: `m` in,
/// `holder` in, the held leaf out.
pub struct GetLeafArg {
    pub m: MatchSpec,
    pub holder: String,
    pub out: Option<Arc<Leaf>>,
}

impl GetLeafArg {
    pub fn new(m: MatchSpec, holder: String) -> Self {
        GetLeafArg { m, holder, out: None }
    }
}

/// `root_cmd::PUT_LEAF` / `group_cmd::PUT_LEAF` argument.
pub struct PutLeafArg {
    pub leaf: Arc<Leaf>,
    pub holder: String,
}

/// `root_cmd::GET_LEAF_HOLDERS` argument: `m` in, the formatted holder
/// list out.
pub struct GetLeafHoldersArg {
    pub m: MatchSpec,
    pub out: Option<String>,
}

impl GetLeafHoldersArg {
    pub fn new(m: MatchSpec) -> Self {
        GetLeafHoldersArg { m, out: None }
    }
}

/// `root_cmd::CREATE_GROUP` argument: `dtb` in, the new instance out.
pub struct CreateGroupArg {
    pub dtb: Option<Blob>,
    pub out: Option<u32>,
}

impl CreateGroupArg {
    pub fn new(dtb: Blob) -> Self {
        CreateGroupArg { dtb: Some(dtb), out: None }
    }
}

/// `root_cmd::REMOVE_GROUP` argument.
pub struct RemoveGroupArg {
    pub instance: u32,
}

/// `root_cmd::LOOKUP_GROUP` argument: `m` in, the owning group's
/// instance out.
pub struct LookupGroupArg {
    pub m: MatchSpec,
    pub out: Option<u32>,
}

impl LookupGroupArg {
    pub fn new(m: MatchSpec) -> Self {
        LookupGroupArg { m, out: None }
    }
}

/// `root_cmd::WAIT_GROUP_BRINGUP` argument: `last_result` in, the
/// ready-to-use verdict out.
pub struct WaitGroupBringupArg {
    pub last_result: DeviceResult,
    pub out: Option<bool>,
}

impl WaitGroupBringupArg {
    pub fn new(last_result: DeviceResult) -> Self {
        WaitGroupBringupArg { last_result, out: None }
    }
}

/// `root_cmd::GET_RESOURCE` argument: `bar_idx` in, the resolved address
/// out.
pub struct GetResourceArg {
    pub bar_idx: u32,
    pub out: Option<u64>,
}

impl GetResourceArg {
    pub fn new(bar_idx: u32) -> Self {
        GetResourceArg { bar_idx, out: None }
    }
}

/// `root_cmd::GET_ID` argument: `(vendor, device, subvendor, subdevice)`
/// out.
pub struct GetIdArg {
    pub out: Option<(u16, u16, u16, u16)>,
}

impl GetIdArg {
    pub fn new() -> Self {
        GetIdArg { out: None }
    }
}

impl Default for GetIdArg {
    fn default() -> Self {
        Self::new()
    }
}

/// `root_cmd::HWMON_REGISTER` argument: an opaque descriptor blob passed
/// through to the host's hwmon glue.
pub struct HwmonRegisterArg {
    pub desc: Vec<u8>,
}

/// `group_cmd::INIT_CHILDREN` has no argument: `Group` owns the
/// [`Registry`] it bring-up reads from.
pub struct InitChildrenArg;

/// A registered leaf driver: one per [`SubdeviceId`].
pub struct LeafDriver {
    pub id: SubdeviceId,
    pub claims: alloc::vec::Vec<EndpointClaim>,
    pub probe: Box<dyn Fn(crate::metadata::Blob) -> DeviceResult<Box<dyn LeafCall>> + Send + Sync>,
}

pub(crate) fn invalid_command() -> DeviceError {
    DeviceError::NotSupported
}
