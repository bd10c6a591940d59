//! GA4 Gateway: OAuth2 credential lifecycle and property authorization for
//! Google Analytics 4, exposed as MCP tools.
//!
//! The binary is a thin shell over these modules; integration tests in
//! `tests/` drive them directly.

pub mod app;
pub mod auth;
pub mod cache;
pub mod cli;
pub mod config;
pub mod errors;
pub mod ga4;
pub mod gateway;
pub mod mcp;
pub mod retry;
