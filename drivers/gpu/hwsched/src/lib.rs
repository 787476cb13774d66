//! # Helix Hardware-Scheduled GPU Dispatcher
//!
//! Privileged command scheduler for GPUs whose firmware owns the run
//! queues. User contexts submit draw objects; the scheduler orders them,
//! resolves dependencies, hands them to firmware, retires them when
//! firmware reports completion and recovers the device after faults.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                          Submitters                                │
//! │              queue_cmds()          queue_context()                 │
//! └───────────────┬──────────────────────────┬─────────────────────────┘
//!                 │ admission, timestamps    │ callbacks
//! ┌───────────────▼──────────────┐           │
//! │   Context queues (per ctx)   │           │
//! └───────────────┬──────────────┘           │
//!                 │ publish job              │
//! ┌───────────────▼──────────────────────────▼─────────────────────────┐
//! │           Job lists: 16 priorities × {requeue, fresh}              │
//! └───────────────┬────────────────────────────────────────────────────┘
//!                 │ run_worker()
//! ┌───────────────▼──────────┐  ┌───────────────┐  ┌──────────────────┐
//! │        Dispatcher        │─▶│    Sender     │─▶│  Firmware (trait)│
//! └───────────────┬──────────┘  └───────┬───────┘  └────────┬─────────┘
//!                 │                     │ in-flight list    │ retired ts
//! ┌───────────────▼──────────┐  ┌───────▼───────┐           │
//! │   Recovery (on fault)    │  │  Retirement   │◀──────────┘
//! └──────────────────────────┘  └───────────────┘
//! ```
//!
//! ## Draw Objects
//!
//! - **Command**: command buffers executed by the GPU
//! - **Marker**: a timestamp that retires once everything before it has
//! - **Sync**: waits on other contexts' timestamps or external fences
//! - **Bind**: asynchronous memory bind, retired by callback
//! - **Timeline**: ordering-only placeholder, never reaches firmware

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

pub mod config;
pub mod context;
mod dispatch;
pub mod drawobj;
pub mod error;
mod fence;
mod flags;
mod job;
pub mod ops;
mod power;
pub mod recovery;
mod retire;
pub mod scheduler;
mod sender;
mod submit;
pub mod timestamp;

#[cfg(test)]
mod testing;

// Re-exports
pub use config::Tunables;
pub use context::{Context, ContextFlags, ContextId, ContextPriv, ContextState};
pub use drawobj::{
    BindObj, BindRange, BindState, CmdPriv, CommandObj, DrawObjFlags, DrawObjKind, DrawObjType,
    DrawObject, IbDesc, SyncEvent, SyncFence, SyncObj,
};
pub use error::{Error, Result};
pub use fence::HwFenceEntry;
pub use ops::{FaultedCommand, Firmware, Platform, Snapshot, SsrEvent, TimestampKind};
pub use recovery::{BadCmdError, ContextBad, FaultCode, FaultSite, RecoveryState};
pub use scheduler::{Hwsched, SchedFlags, SchedStats};
pub use timestamp::{timestamp_cmp, timestamp_reached};
