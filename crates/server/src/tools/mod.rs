//! MCP tool implementations.
//!
//! This module contains all tools exposed by the lumen-cache server.

pub mod cache;
