//! `neo-core` is the command-submission core of the compute driver.
//!
//! It turns API-level operations into command buffers and coordinates their execution:
//! - [`command_list`]: regular and immediate command lists recording kernel launches, copies,
//!   fills, barriers and event operations, with dirty tracking of expensive hardware state
//!   (see [`stream_properties`]).
//! - [`command_container`]: command buffers (with chaining) plus indirect heaps and the
//!   residency/deallocation sets that back a command list.
//! - [`csr`]: the command stream receiver, which owns task counts, the completion tag, residency
//!   and the internal allocation storage, and exposes the blocking wait primitive.
//! - [`hw`]: per-hardware-family encoders selected once at device creation.
//!
//! Memory management, kernel compilation and OS submission are collaborators behind traits
//! ([`memory_manager::MemoryManager`], [`module`], [`backend::SubmissionBackend`]).

pub mod allocation;
pub mod allocation_storage;
pub mod backend;
pub mod builtins;
pub mod command_container;
pub mod command_list;
pub mod command_queue;
pub mod config;
pub mod csr;
pub mod debugger;
pub mod device;
pub mod error;
pub mod event;
pub mod hw;
pub mod indirect_heap;
pub mod linear_stream;
pub mod memory_manager;
pub mod module;
pub mod pause;
pub mod stats;
pub mod stream_properties;

pub use allocation::{
    release_with_proof, AllocationId, AllocationType, CompletionFence, CompletionProof,
    GraphicsAllocation, OsContextId, TaskCount,
};
pub use command_list::{CommandList, QueueMode};
pub use command_queue::CommandQueue;
pub use config::DriverConfig;
pub use csr::{CommandStreamReceiver, WaitParams, WaitStatus};
pub use device::{Device, DeviceDescriptor, EngineGroupType};
pub use error::{ResultCode, ZeError, ZeResult};
pub use hw::HwFamily;
