//! Interpreter runtime

pub mod isolate;
