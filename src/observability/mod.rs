//! Logging/tracing bring-up (§10 AMBIENT STACK).

mod tracing;

pub use tracing::{init, OtelGuard};
