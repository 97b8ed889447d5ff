//! Foundational and often-reused types.

pub(crate) mod enr;
pub(crate) mod id;
pub mod message;
pub mod traits;
