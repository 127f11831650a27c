//! Common components shared by the entity crates.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod cache;
pub mod sync;
pub mod task;
