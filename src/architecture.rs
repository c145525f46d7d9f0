//! Target architecture support.

pub mod mips;
