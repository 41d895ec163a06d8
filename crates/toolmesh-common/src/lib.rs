//! Toolmesh Common Types
//!
//! This crate provides the types shared by every toolmesh component: the error
//! taxonomy, the tool-call data model and the traits through which the
//! resilience layer talks to the outside world.
//!
//! # Overview
//!
//! Toolmesh is a client-side resilience layer for invoking tools hosted on
//! remote, possibly redundant, MCP servers. The layer itself never speaks the
//! wire protocol. It relies on three collaborators supplied by the embedding
//! application:
//!
//! - [`ConnectionFactory`]: opens a raw [`Connection`] to a named server
//! - [`Connection`]: the minimal liveness surface (`ping` and `close`)
//! - [`ToolExecutor`]: performs an actual tool call and returns a [`ToolResult`]
//!
//! # Components
//!
//! - [`error`] - [`ToolmeshError`] and the crate-wide [`Result`] alias
//! - [`tool`] - [`ToolExecution`], [`ToolResult`] and [`ToolContent`]
//! - [`connection`] - the collaborator traits
//!
//! # Example
//!
//! ```
//! use toolmesh_common::{ToolContent, ToolExecution, ToolResult};
//! use std::time::Duration;
//!
//! let execution = ToolExecution::new("echo", "s1").with_argument("x", "1");
//!
//! let result = ToolResult::success(
//!     &execution.tool_name,
//!     &execution.server_name,
//!     vec![ToolContent::text("1")],
//!     Duration::from_millis(12),
//! );
//! assert!(result.success);
//! ```

pub mod connection;
pub mod error;
pub mod tool;

pub use connection::{Connection, ConnectionFactory, ToolExecutor};
pub use error::{Result, ToolmeshError};
pub use tool::{ToolContent, ToolExecution, ToolResult};
