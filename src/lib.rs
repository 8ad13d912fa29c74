//! zajel-headless: a headless end-to-end-encrypted peer-to-peer messaging
//! daemon.
//!
//! The binary (`main.rs`) is a thin CLI wrapper; everything else lives here
//! as a library so the module boundaries — and their tests — stand on
//! their own, the way the teacher workspace splits a thin Tauri shell from
//! its library crates.

pub mod channel;
pub mod config;
pub mod crypto;
pub mod error;
pub mod event_bus;
pub mod file_transfer;
pub mod group;
pub mod ipc;
pub mod peer_manager;
pub mod peer_store;
pub mod signaling;
pub mod supervisor;
pub mod transport;
