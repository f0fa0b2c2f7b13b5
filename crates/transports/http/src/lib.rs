//! HTTP transport for modserve queues
//!
//! Exposes the worker-facing wire contract over HTTP. The protocol is
//! deliberately minimal and language-agnostic so any worker runtime can
//! participate without a shared library:
//!
//! - **Poll for work**: `GET /v1/queue/{queueName}?moduleId={id}` - held
//!   open server-side up to the configured poll timeout; `200` with
//!   `{reqid, reqtype, payload}` when work is available, `204 No Content`
//!   on timeout. Workers loop immediately on `204`.
//! - **Post a result**: `POST /v1/queue/{reqid}` - body is the JSON
//!   response object; always `200`, even for an unknown or expired reqid
//!   (fire-and-forget from the worker's perspective).
//! - **Report status**: `POST /v1/queue/updatemodulestatus/{moduleId}` -
//!   free-form JSON stored against the module's process status.
//! - **Observe**: `GET /v1/status/modules`, `GET /health`.
//!
//! # Usage
//!
//! ```ignore
//! use modserve_http::HttpServer;
//!
//! let server = HttpServer::new(config, broker, supervisor, shutdown);
//! server.serve().await?;
//! ```

pub mod error;
pub mod server;

pub use error::{Error, Result};
pub use server::{HttpServer, ServerState};
