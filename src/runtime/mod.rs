//! # Runtime
//!
//! Controller runtime shared by every reconciliation loop.
//!
//! ## Module Structure
//!
//! - `driver.rs` - watch-plus-resync reconciliation driver
//! - `backoff.rs` - exponential backoff for failed keys
//! - `error_policy.rs` - reconciliation and watch error handling
//! - `steady.rs` - consecutive no-op pass tracking

pub mod backoff;
pub mod driver;
pub mod error_policy;
pub mod steady;

pub use driver::{Driver, DriverConfig, Outcome, Reconcile};
pub use steady::SteadyState;
