//! modserve core - transport-agnostic module serving runtime
//!
//! This crate provides the core runtime for modserve: a front-end caller
//! enqueues analysis requests onto per-module queues, independently running
//! worker processes pull them over a long-poll protocol, and each posted
//! result is correlated back to the blocked caller. A supervisor owns the
//! worker process lifecycle (launch, crash detection, bounded auto-restart,
//! graceful stop).
//!
//! # Architecture
//!
//! The core is a pure library with ZERO transport dependencies (no axum,
//! no hyper). Transport crates depend on this one and adapt the broker and
//! supervisor to a wire protocol.
//!
//! - [`registry`] - validated, immutable module descriptors
//! - [`broker`] - FIFO queues + pending-response correlation
//! - [`supervisor`] - process lifecycle state machine
//! - [`orchestrator`] - composition root: startup ordering, bounded shutdown
//!
//! # Example
//!
//! ```ignore
//! use modserve_core::{Orchestrator, ServerConfig};
//! use modserve_core::payload::{QueuedRequest, RequestPayload};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let orchestrator = Orchestrator::from_config(ServerConfig::default())?;
//!     orchestrator.startup().await?;
//!
//!     let broker = orchestrator.broker();
//!     let request = QueuedRequest::new("detect", RequestPayload::new("detect"));
//!     let response = broker
//!         .enqueue("detect_queue", request, std::time::Duration::from_secs(30),
//!                  &CancellationToken::new())
//!         .await?;
//!     println!("{}", response.to_value());
//!
//!     orchestrator.shutdown().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod broker;
pub mod config;
pub mod orchestrator;
pub mod payload;
pub mod registry;
pub mod supervisor;

mod error;
pub use error::{Error, Result};

pub use broker::QueueBroker;
pub use config::ServerConfig;
pub use orchestrator::Orchestrator;
pub use registry::{ModuleDescriptor, ModuleRegistry};
pub use supervisor::{ModuleState, ModuleSupervisor, ProcessStatus};
