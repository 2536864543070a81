pub mod applicator;
pub mod baseline;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod enforcer;
pub mod error;
pub mod exec;
pub mod fetch;
pub mod fleet;
pub mod git;
pub mod io;
pub mod paths;
pub mod probe;
pub mod registry;
pub mod release;
pub mod runtime;
pub mod validate;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{FleetError, Result};
