//! # Operation Context and Query Descriptors
//!
//! The caller-supplied surfaces the builder consumes but does not own:
//! the operation context (interruption), the canonical query (collation,
//! tailable flag), the yield policy handed through to scan stages, the
//! lock-acquisition callback injected into scans that must re-check read
//! availability, and the shard-filterer factory.
//!
//! The builder performs no locking itself; catalog reads are assumed to
//! happen under the caller's lock or lock-free view.

use crate::error::BuildError;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Per-operation context. The builder only polls it for interruption
/// while performing catalog lookups.
#[derive(Debug, Default)]
pub struct OperationContext {
    killed: AtomicBool,
}

impl OperationContext {
    /// Create a live operation context
    pub fn new() -> Self {
        OperationContext {
            killed: AtomicBool::new(false),
        }
    }

    /// Mark the operation as killed; the next interruption poll fails
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
    }

    /// Fail with [`BuildError::Interrupted`] if the operation was killed
    pub fn check_for_interrupt(&self) -> Result<(), BuildError> {
        if self.killed.load(Ordering::Acquire) {
            return Err(BuildError::Interrupted);
        }
        Ok(())
    }
}

/// Collation descriptor. The builder never interprets it; it installs a
/// handle in the runtime environment and threads it into comparison
/// expressions and hash joins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collation {
    /// ICU-style locale tag, e.g. `"en_US"`
    pub locale: String,
}

/// Time zone database handle. Installed in the runtime environment as an
/// unowned global; the builder never reads it.
#[derive(Debug, Default)]
pub struct TimeZoneDb;

/// When execution may yield locks between storage reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum YieldPolicy {
    /// Yield periodically at storage boundaries
    #[default]
    YieldAuto,
    /// Never yield; the caller holds locks for the operation's lifetime
    Interrupt,
}

/// Callback injected into scan stages when the query solution requests a
/// read-availability check. Invoked at execution time on every path that
/// opens the collection; must release anything it acquires on every exit
/// path, including error.
#[derive(Clone)]
pub struct LockAcquisitionCallback(
    Arc<dyn Fn(&OperationContext, &str) -> Result<(), BuildError> + Send + Sync>,
);

impl LockAcquisitionCallback {
    /// Wrap a callback
    pub fn new(
        callback: impl Fn(&OperationContext, &str) -> Result<(), BuildError> + Send + Sync + 'static,
    ) -> Self {
        LockAcquisitionCallback(Arc::new(callback))
    }

    /// Run the callback against a namespace
    pub fn invoke(&self, op_ctx: &OperationContext, namespace: &str) -> Result<(), BuildError> {
        (self.0)(op_ctx, namespace)
    }
}

impl fmt::Debug for LockAcquisitionCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LockAcquisitionCallback")
    }
}

/// The parsed, normalized query the solution tree was planned from.
/// Carries only what lowering consults: namespace, collation, tailable.
#[derive(Debug, Clone)]
pub struct CanonicalQuery {
    /// Target namespace (`"db.collection"`)
    pub namespace: String,
    /// Collation, if the query specified one
    pub collation: Option<Collation>,
    /// Whether the cursor is tailable
    pub is_tailable: bool,
}

impl CanonicalQuery {
    /// A plain, non-tailable query without collation
    pub fn simple(namespace: impl Into<String>) -> Self {
        CanonicalQuery {
            namespace: namespace.into(),
            collation: None,
            is_tailable: false,
        }
    }
}

/// Runtime shard-ownership predicate. Opaque to the builder: it is
/// embedded as a compile-time constant into `shardFilter` expressions and
/// consulted only at execution time.
pub trait ShardFilterer: fmt::Debug + Send + Sync {}

/// Factory for [`ShardFilterer`] handles, supplied by the caller when the
/// solution tree contains a sharding-filter node.
pub trait ShardFiltererFactory {
    /// Materialize the filterer for the current operation
    fn make_filterer(&self) -> Arc<dyn ShardFilterer>;
}

/// Trivial filterer for unsharded test fixtures
#[derive(Debug, Default)]
pub struct AlwaysOwnedFilterer;

impl ShardFilterer for AlwaysOwnedFilterer {}

impl ShardFiltererFactory for AlwaysOwnedFilterer {
    fn make_filterer(&self) -> Arc<dyn ShardFilterer> {
        Arc::new(AlwaysOwnedFilterer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_check() {
        let op_ctx = OperationContext::new();
        assert!(op_ctx.check_for_interrupt().is_ok());

        op_ctx.kill();
        assert!(matches!(
            op_ctx.check_for_interrupt(),
            Err(BuildError::Interrupted)
        ));
    }
}
