use crate::error::ContextError;
use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Per-call propagation handle.
///
/// A `Context` is an immutable node in a parent→child chain. Deriving a
/// child (`with_value`, `with_cancel`, `with_timeout`) never mutates the
/// parent; cloning a handle is an `Arc` bump and both clones resolve to the
/// same chain.
///
/// Attached values are keyed by their type (the `TypeId` of `T` is the
/// lookup key), so two crates can never collide on a key unless they share
/// the value type itself. Resolution walks child→parent and returns the
/// nearest match.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

struct Inner {
    parent: Option<Arc<Inner>>,
    entry: Option<Entry>,
    // Nearest enclosing cancellation scope. Value-only children share their
    // parent's scope; `derive_scope` children get their own.
    scope: Option<Arc<CancelScope>>,
}

struct Entry {
    key: TypeId,
    value: Arc<dyn Any + Send + Sync>,
}

struct CancelScope {
    token: CancellationToken,
    deadline: Option<Instant>,
    cause: Mutex<Option<ContextError>>,
}

impl CancelScope {
    fn error(&self) -> Option<ContextError> {
        if let Some(cause) = *self.cause.lock() {
            return Some(cause);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Some(ContextError::DeadlineExceeded);
            }
        }
        if self.token.is_cancelled() {
            // Canceled through an ancestor scope.
            return Some(ContextError::Canceled);
        }
        None
    }

    fn cancel(&self, cause: ContextError) {
        let mut slot = self.cause.lock();
        if slot.is_none() {
            *slot = Some(cause);
        }
        drop(slot);
        self.token.cancel();
    }
}

impl Context {
    /// The root handle: carries no values, is never done, has no deadline.
    pub fn background() -> Self {
        Self {
            inner: Arc::new(Inner {
                parent: None,
                entry: None,
                scope: None,
            }),
        }
    }

    /// Derive a child handle with `value` attached under `T`'s type key.
    ///
    /// An attachment of the same type closer to the leaf shadows one
    /// further up the chain.
    pub fn with_value<T: Send + Sync + 'static>(&self, value: T) -> Context {
        Context {
            inner: Arc::new(Inner {
                parent: Some(Arc::clone(&self.inner)),
                entry: Some(Entry {
                    key: TypeId::of::<T>(),
                    value: Arc::new(value),
                }),
                scope: self.inner.scope.clone(),
            }),
        }
    }

    /// Resolve the nearest attached value of type `T`, if any.
    pub fn value<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        let key = TypeId::of::<T>();
        let mut node = Some(&self.inner);
        while let Some(inner) = node {
            if let Some(entry) = &inner.entry {
                if entry.key == key {
                    // A matching key whose payload is not a `T` resolves as
                    // absent rather than failing the caller.
                    return Arc::clone(&entry.value).downcast::<T>().ok();
                }
            }
            node = inner.parent.as_ref();
        }
        None
    }

    /// Derive a child with its own cancellation scope.
    ///
    /// Canceling the returned guard cancels the child and everything
    /// derived from it; the parent is untouched.
    pub fn with_cancel(&self) -> (Context, CancelGuard) {
        self.derive_scope(None)
    }

    /// Derive a child that is canceled automatically once `timeout` has
    /// elapsed.
    pub fn with_timeout(&self, timeout: Duration) -> (Context, CancelGuard) {
        self.derive_scope(Some(Instant::now() + timeout))
    }

    /// Derive a child that is canceled automatically at `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> (Context, CancelGuard) {
        self.derive_scope(Some(deadline))
    }

    fn derive_scope(&self, deadline: Option<Instant>) -> (Context, CancelGuard) {
        let parent_scope = self.inner.scope.as_deref();
        let token = match parent_scope {
            Some(scope) => scope.token.child_token(),
            None => CancellationToken::new(),
        };

        // A child never outlives an ancestor's deadline.
        let inherited = parent_scope.and_then(|scope| scope.deadline);
        let deadline = match (deadline, inherited) {
            (Some(own), Some(parent)) => Some(own.min(parent)),
            (own, parent) => own.or(parent),
        };

        let scope = Arc::new(CancelScope {
            token,
            deadline,
            cause: Mutex::new(None),
        });
        tracing::debug!(?deadline, "derived cancellation scope");

        let ctx = Context {
            inner: Arc::new(Inner {
                parent: Some(Arc::clone(&self.inner)),
                entry: None,
                scope: Some(Arc::clone(&scope)),
            }),
        };
        (ctx, CancelGuard { scope })
    }

    /// The effective deadline of the nearest enclosing scope, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.scope.as_ref().and_then(|scope| scope.deadline)
    }

    /// `None` while the handle is live; the terminal cause once it is not.
    ///
    /// Whichever happened first wins: an explicit cancel before the
    /// deadline reports [`ContextError::Canceled`], a deadline that passed
    /// first reports [`ContextError::DeadlineExceeded`].
    pub fn error(&self) -> Option<ContextError> {
        self.inner.scope.as_ref().and_then(|scope| scope.error())
    }

    /// Whether the handle has been canceled or its deadline has passed.
    pub fn is_done(&self) -> bool {
        self.error().is_some()
    }

    /// Resolves when the handle is canceled or its deadline passes.
    ///
    /// A handle with no cancellation scope (e.g. [`Context::background`])
    /// pends forever.
    pub async fn done(&self) {
        match self.inner.scope.clone() {
            None => std::future::pending::<()>().await,
            Some(scope) => match scope.deadline {
                Some(deadline) => tokio::select! {
                    _ = scope.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                },
                None => scope.token.cancelled().await,
            },
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("deadline", &self.deadline())
            .field("error", &self.error())
            .finish_non_exhaustive()
    }
}

/// Cancellation capability for a derived scope.
///
/// Call [`cancel`](CancelGuard::cancel) to release the scope explicitly.
/// Dropping the guard cancels too, so a scope cannot outlive the code that
/// created it.
pub struct CancelGuard {
    scope: Arc<CancelScope>,
}

impl CancelGuard {
    /// Cancel the scope and everything derived from it.
    pub fn cancel(&self) {
        let cause = match self.scope.deadline {
            Some(deadline) if Instant::now() >= deadline => ContextError::DeadlineExceeded,
            _ => ContextError::Canceled,
        };
        self.scope.cancel(cause);
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for CancelGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelGuard")
            .field("deadline", &self.scope.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[derive(Debug, PartialEq)]
    struct ServiceName(&'static str);

    #[derive(Debug, PartialEq)]
    struct Attempt(u32);

    #[test]
    fn test_value_lookup_walks_to_parent() {
        let root = Context::background().with_value(ServiceName("billing"));
        let child = root.with_value(Attempt(2));

        assert_eq!(child.value::<ServiceName>().unwrap().0, "billing");
        assert_eq!(child.value::<Attempt>().unwrap().0, 2);
        assert!(root.value::<Attempt>().is_none());
    }

    #[test]
    fn test_nearer_attachment_shadows() {
        let ctx = Context::background()
            .with_value(Attempt(1))
            .with_value(Attempt(2));

        assert_eq!(ctx.value::<Attempt>().unwrap().0, 2);
    }

    #[test]
    fn test_mismatched_payload_resolves_as_absent() {
        // Forge an entry whose key and payload types disagree. Not reachable
        // through `with_value`, but the resolution path must stay benign.
        let forged = Context {
            inner: Arc::new(Inner {
                parent: Some(Arc::clone(&Context::background().inner)),
                entry: Some(Entry {
                    key: TypeId::of::<ServiceName>(),
                    value: Arc::new(Attempt(7)),
                }),
                scope: None,
            }),
        };

        assert!(forged.value::<ServiceName>().is_none());
    }

    #[test]
    fn test_background_has_no_scope() {
        let ctx = Context::background();
        assert!(ctx.deadline().is_none());
        assert!(ctx.error().is_none());
        assert!(!ctx.is_done());
    }

    #[tokio::test]
    async fn test_explicit_cancel_reports_canceled() {
        let (ctx, guard) = Context::background().with_cancel();
        assert!(ctx.error().is_none());

        guard.cancel();
        assert_eq!(ctx.error(), Some(ContextError::Canceled));
    }

    #[tokio::test]
    async fn test_cancel_reaches_descendants_only() {
        let (parent, parent_guard) = Context::background().with_cancel();
        let (child, _child_guard) = parent.with_cancel();
        let (sibling, _sibling_guard) = Context::background().with_cancel();

        parent_guard.cancel();

        assert_eq!(parent.error(), Some(ContextError::Canceled));
        assert_eq!(child.error(), Some(ContextError::Canceled));
        assert!(sibling.error().is_none());
    }

    #[tokio::test]
    async fn test_child_cancel_leaves_parent_live() {
        let (parent, _parent_guard) = Context::background().with_cancel();
        let (child, child_guard) = parent.with_cancel();

        child_guard.cancel();

        assert_eq!(child.error(), Some(ContextError::Canceled));
        assert!(parent.error().is_none());
    }

    #[tokio::test]
    async fn test_deadline_expiry_reports_deadline_exceeded() {
        let (ctx, _guard) = Context::background().with_timeout(Duration::from_millis(20));
        assert!(ctx.error().is_none());

        sleep(Duration::from_millis(40)).await;
        assert_eq!(ctx.error(), Some(ContextError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_with_deadline_uses_requested_instant() {
        let deadline = Instant::now() + Duration::from_secs(5);
        let (ctx, _guard) = Context::background().with_deadline(deadline);
        assert_eq!(ctx.deadline(), Some(deadline));
    }

    #[tokio::test]
    async fn test_child_deadline_capped_by_parent() {
        let (parent, _parent_guard) =
            Context::background().with_timeout(Duration::from_millis(10));
        let (child, _child_guard) = parent.with_timeout(Duration::from_secs(60));

        assert_eq!(child.deadline(), parent.deadline());
    }

    #[tokio::test]
    async fn test_cancel_scope_inherits_parent_deadline() {
        let (parent, _parent_guard) =
            Context::background().with_timeout(Duration::from_millis(10));
        let (child, _child_guard) = parent.with_cancel();

        assert_eq!(child.deadline(), parent.deadline());
    }

    #[tokio::test]
    async fn test_value_child_shares_scope() {
        let (ctx, guard) = Context::background().with_cancel();
        let child = ctx.with_value(Attempt(1));

        guard.cancel();
        assert_eq!(child.error(), Some(ContextError::Canceled));
    }

    #[tokio::test]
    async fn test_values_survive_scope_derivation() {
        let ctx = Context::background().with_value(ServiceName("billing"));
        let (bounded, _guard) = ctx.with_timeout(Duration::from_secs(1));

        assert_eq!(bounded.value::<ServiceName>().unwrap().0, "billing");
    }

    #[tokio::test]
    async fn test_done_resolves_on_cancel() {
        let (ctx, guard) = Context::background().with_cancel();

        let mut done = tokio_test::task::spawn(ctx.done());
        tokio_test::assert_pending!(done.poll());

        guard.cancel();
        tokio_test::assert_ready!(done.poll());
    }

    #[tokio::test]
    async fn test_done_resolves_on_deadline() {
        let (ctx, _guard) = Context::background().with_timeout(Duration::from_millis(20));
        ctx.done().await;
        assert_eq!(ctx.error(), Some(ContextError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_guard_cancels_on_drop() {
        let (ctx, guard) = Context::background().with_cancel();
        drop(guard);
        assert_eq!(ctx.error(), Some(ContextError::Canceled));
    }

    #[tokio::test]
    async fn test_cancel_after_deadline_keeps_deadline_cause() {
        let (ctx, guard) = Context::background().with_timeout(Duration::from_millis(10));
        sleep(Duration::from_millis(30)).await;

        guard.cancel();
        assert_eq!(ctx.error(), Some(ContextError::DeadlineExceeded));
    }
}
