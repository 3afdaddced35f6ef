//! Infrastructure layer for docloom.
//!
//! Implements the provider port defined in `docloom-core` (Anthropic Messages
//! API and a scripted double), loads `docloom.toml`, and wires every engine
//! service together in [`container::EngineContainer`].

pub mod config;
pub mod container;
pub mod llm;
