//! # mimamori
//!
//! Single-child process supervisor for Rust hosts.
//!
//! Start a program with fresh arguments on every run, capture its combined
//! output, stop it with SIGTERM then SIGKILL after a grace period, and stop it
//! automatically when the host publishes on an exit signal.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use mimamori::{Supervisor, SupervisorConfig};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let (exit_tx, exit_rx) = tokio::sync::watch::channel(false);
//!
//! let sup = Supervisor::new(SupervisorConfig {
//!     program: "./target/debug/server".into(),
//!     args: Some(Arc::new(|| vec!["--port".into(), "8080".into()])),
//!     working_dir: None,
//!     exit_signal: exit_rx,
//!     forward: Some(Box::new(std::io::stdout())),
//!     kill_all_on_stop: false,
//! });
//!
//! sup.start().await.unwrap();
//! assert!(sup.is_running().await);
//!
//! // Either stop directly, or let the host's exit signal do it.
//! exit_tx.send(true).unwrap();
//! # }
//! ```

pub mod config;
pub mod error;
pub mod output;
pub mod supervisor;

mod latch;
mod sweep;
mod terminate;

pub use config::ProgramFile;
pub use error::{Error, Result};
pub use output::{Forward, OutputSink};
pub use supervisor::{ArgsProvider, Supervisor, SupervisorConfig, GRACE_PERIOD};
