//! wgcheck - End-to-end check of HTTP over a userspace WireGuard network
//!
//! Provisions a throwaway Docker network with an nginx origin and a
//! WireGuard gateway, renders a client configuration pointing at the
//! gateway's published port, and fetches `http://web/` through a
//! userspace tunnel built with the `wgnet` crate.
//!
//! # Flow
//!
//! network → services (concurrently) → gateway endpoint → workspace →
//! rendered config → virtual network → HTTP GET. Every acquired resource is
//! pushed onto a [`ReleaseStack`] and released in reverse order at the end
//! of the run, whether it passed or not.

pub mod config;
pub mod context;
pub mod error;
pub mod provision;
pub mod render;
pub mod run;
pub mod teardown;
pub mod verify;

pub use config::CheckConfig;
pub use context::RunContext;
pub use error::{Error, Result};
pub use run::run;
pub use teardown::{ReleaseStack, TeardownError};
pub use verify::Verification;
