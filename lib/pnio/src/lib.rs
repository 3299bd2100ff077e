//! PROFINET IO controller engine for the headworks water-treatment SCADA.
//!
//! The crate covers the controller-side protocol stack: DCP discovery, the
//! DCE/RPC connect engine with vendor-dialect fallback, the per-RTU AR
//! state machine, cyclic real-time exchange and the acyclic record
//! services. The `bridge` module is the only surface external collaborators
//! consume.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod ar;
pub mod bridge;
pub mod codec;
pub mod cyclic;
pub mod dcp;
pub mod error;
pub mod link;
pub mod record;
pub mod registry;
pub mod rpc;
pub mod uuid;

pub use crate::ar::{ArMachine, ArState};
pub use crate::bridge::{BridgeCore, BridgeHandle, Command, Event};
pub use crate::codec::Mac;
pub use crate::error::{CodecError, CommandError, ConfigError, RecordError, RpcError};
pub use crate::uuid::Uuid;
