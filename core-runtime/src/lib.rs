//! # Core Runtime Module
//!
//! Provides foundational runtime infrastructure for the Messenger File Core:
//! - Logging and tracing infrastructure
//! - Event bus system
//!
//! ## Overview
//!
//! This crate contains the runtime utilities the file manager depends on. It
//! establishes the logging conventions and the broadcast mechanism used to
//! push user-visible file updates out of the manager without coupling it to
//! any UI layer.

pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
