//! Internal implementation modules
//!
//! These modules are implementation details and not part of the public API
//! surface, though selected types are re-exported from the crate root.

pub mod tokens;
