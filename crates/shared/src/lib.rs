//! veilbox shared library: IDs, key-directory wire types, and errors shared
//! between the crypto core, its tooling, and directory implementations.

pub mod api;
pub mod constants;
pub mod error;
pub mod ids;
