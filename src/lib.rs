//! # MQTT RPC Policies for Embedded Systems
//!
//! `myrtio-mqtt-rpc` is a `no_std` framework for MQTT-connected devices. It chains
//! small hierarchical state machines, called policies, into an event pipeline between
//! an MQTT transport and the application, and ships the policies an IoT device
//! typically needs.
//!
//! ## Core Features
//!
//! - **`no_std` & `no_alloc`:** All storage is bounded and managed with `heapless`.
//! - **Hierarchical state machines:** States are plain enums with a static parent
//!   relation; unhandled events bubble toward the root ([`hfsm`]).
//! - **Event pipeline:** Run-to-completion dispatch under an `embassy-sync` mutex, with
//!   per-policy timers ([`pipeline`]).
//! - **Connection retries:** Exponential backoff with jitter and credential rotation
//!   ([`connection`]).
//! - **Command RPC:** Executor and invoker sides of correlated request/response over
//!   MQTT 5 properties ([`rpc`]).
//!
//! ## Architecture
//!
//! ```text
//! transport <-> connection <-> rpc server <-> rpc client <-> application
//! ```
//!
//! The transport and the platform (clock, randomness, timers) are traits the
//! integrator implements; [`runtime::EmbassyPlatform`] covers the platform on Embassy.
//!
//! ```ignore
//! let mut connection = ConnectionPolicy::new(ConnectionOptions::new(host, client_id, credential))?;
//! let mut server = RpcServer::new(RpcServerOptions::new("m", "car-1").with_command("unlock"), &COMMANDS)?;
//!
//! let pipeline = Pipeline::<CriticalSectionRawMutex>::new(&PLATFORM, &mut transport, &mut app)
//!     .with_policy(&mut connection)?
//!     .with_policy(&mut server)?;
//!
//! pipeline.connection_open()?;
//! pipeline.rpc_server_register(None)?;
//! ```

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod fmt;

pub mod connection;
pub mod error;
pub mod event;
pub mod hfsm;
pub mod packet;
pub mod pipeline;
pub mod platform;
pub mod rpc;
pub mod runtime;
pub mod topic;
pub mod transport;
pub mod util;

#[cfg(test)]
mod test_support;

// Re-export key types for easier access at the crate root.
pub use connection::{ConnectionOptions, ConnectionPolicy, RetryOptions};
pub use error::{Error, ProtocolError};
pub use event::Event;
pub use packet::QoS;
pub use pipeline::{Application, Pipeline, Policy, SyncPipeline};
pub use platform::Platform;
pub use rpc::{PendingRegistry, RpcClient, RpcServer, RpcStatus};
pub use transport::MqttTransport;
