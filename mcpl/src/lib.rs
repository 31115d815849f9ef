//! The mcpl daemon: one subprocess per MCP server, multiplexed to any number
//! of editor sessions over a local Unix socket.

pub mod admin;
pub mod cli;
pub mod daemon;
pub mod error;
