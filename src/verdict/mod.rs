//! Output normalization and verdict comparison
//!
//! Both are pure functions over a finished run.

pub mod normalize;
pub mod verdict;
