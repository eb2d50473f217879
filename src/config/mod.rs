//! Configuration
//!
//! Session configuration, JSON loading, and validation.

pub mod loader;
pub mod types;
pub mod validator;
