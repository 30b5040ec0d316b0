//! NightOps - operations control for a robotic astronomical observatory.
//!
//! The daemon in this crate decides, on every loop tick, whether it is safe
//! for the observatory to be open, drives the dome and telescope through a
//! scripted nightly plan, and exposes a remote control surface to the thin
//! CLI client and to external pipeline processes.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      OperationsDaemon                        │
//! │                                                              │
//! │  tick ──► EnvironmentWatcher ──► DomeController ──► dome     │
//! │   │            (safe?)            (mode/window/    backend   │
//! │   │                                heartbeat)                │
//! │   └──────────► TelescopeController ◄── dome-open verdict     │
//! │                 (worker task drives the action queue)        │
//! │                                                              │
//! │  axum RPC ──► command try-lock ──► controllers               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Concrete dome backends and telescope actions are external collaborators:
//! they plug in through the registries in [`dome`] and
//! [`telescope::actions`], selected by name in the site config.

pub mod command;
pub mod config;
pub mod daemon;
pub mod dome;
pub mod environment;
pub mod logging;
pub mod schedule;
pub mod server;
pub mod sun;
pub mod telescope;
pub mod time;

/// Version shared by the library and the CLI, injected from the workspace
/// manifest at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
