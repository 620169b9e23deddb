//! External tool-server (MCP) integration
//!
//! Approval cache, server registry, availability probing, and the gate the
//! scheduler consults before a stage may use a tool server.

mod approval;
mod manager;

pub use approval::{ApprovalMemory, McpApprovalCache, McpApprovalEntry};
pub use manager::{
    ApprovalDecision, ApprovalPrompter, Availability, McpClientManager, McpError, McpServerConfig,
};
