//! Shared data model, `Store` contract, Dirty Tracker, and Renderer for Keymaster.
//!
//! Every other workspace crate depends on this one; it has no knowledge of SQLite, SSH, or
//! thread pools — those live in `keymaster-store-sqlite`, `keymaster-ssh`, and
//! `keymaster-runner` respectively.

pub mod dirty;
pub mod error;
pub mod hostname;
pub mod keygen;
pub mod model;
pub mod render;
pub mod store;

pub use error::{KeymasterError, Result};
