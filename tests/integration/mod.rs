//! Integration tests for cafs
//!
//! These build small `docker save` archives on the fly and run them through
//! the whole conversion: pool, metadata, materialized root and lazifier.

pub mod common;
pub mod conversion;
pub mod lazifier;
