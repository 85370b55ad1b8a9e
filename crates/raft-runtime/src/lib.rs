//! # raft-runtime
//!
//! why: run raft-core nodes for real, with timers, rpcs and waiting clients
//! relations: drives raft-core's RaftNode; persists through any raft-core Storage,
//!            typically raft-storage's FileStorage
//! what: async Raft handle, scheduler facility, event bus, transport seam,
//!       in-process network for tests and the simulator

pub mod error;
pub mod event_bus;
pub mod network;
pub mod raft;
pub mod timer;
pub mod transport;

pub use error::TransportError;
pub use event_bus::EventBus;
pub use network::LocalNetwork;
pub use raft::Raft;
pub use timer::{Scheduler, TimerCallback, TimerHandle, TokioScheduler, VirtualScheduler};
pub use transport::{RpcHandler, Transport};
