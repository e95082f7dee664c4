//! ERC-4337 (EntryPoint v0.7) user operation client.
//!
//! Resolves a counterfactual sender, packs operations into the v0.7 wire
//! format, estimates gas through a bundler, collects verifying-paymaster
//! approval and submits the signed result.

pub mod builder;
pub mod bundler;
pub mod config;
pub mod contracts;
pub mod encoding;
pub mod error;
pub mod gas;
pub mod paymaster;
pub mod sender;
pub mod types;

pub use builder::{BuilderConfig, GasMode, OperationBuilder, PlaceholderGas, SignedOperation};
pub use error::{Result, UserOpError};
pub use types::{PackedUserOperation, SimpleUserOperation, UserOperation};
