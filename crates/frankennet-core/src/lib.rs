//! # frankennet-core
//!
//! Safe, syscall-free building blocks for FrankenNet channels.
//!
//! This crate holds the vocabulary shared by the channel implementation and
//! any selector that drives it: IO status sentinels, poll/readiness bits and
//! their translation rules, the channel state machine, address and backlog
//! policy, and runtime configuration. No `unsafe` code is permitted at the
//! crate level.

#![deny(unsafe_code)]

pub mod config;
pub mod io_status;
pub mod net;
pub mod poll;
pub mod state;
