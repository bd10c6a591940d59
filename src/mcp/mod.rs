//! Model Context Protocol surface: tool definitions, JSON-RPC dispatch and
//! the HTTP/stdio transports.

pub mod registry;
pub mod server;
pub mod types;

pub use registry::ToolRegistry;
pub use server::McpServer;
