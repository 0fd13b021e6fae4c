use crate::context::{CancelGuard, Context};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Field values carried on behalf of a single request.
#[derive(Debug, Default)]
struct RequestValues {
    device_id: String,
    trace_id: String,
    // more fields as needed
}

/// The chain entry holding [`RequestValues`].
///
/// The type itself is the lookup key and it is private to this module, so
/// no attachment made outside this crate can resolve to it. Cloning is an
/// `Arc` bump: every handle that resolves to the same entry shares one
/// holder, and a write through any of them is visible through all of them.
#[derive(Clone)]
struct SharedValues(Arc<RwLock<RequestValues>>);

impl SharedValues {
    fn new() -> Self {
        SharedValues(Arc::new(RwLock::new(RequestValues::default())))
    }
}

fn shared(ctx: &Context) -> Option<SharedValues> {
    ctx.value::<SharedValues>().map(|holder| (*holder).clone())
}

fn set_field(ctx: &Context, value: String, assign: fn(&mut RequestValues, String)) -> Context {
    let holder = shared(ctx).unwrap_or_else(SharedValues::new);
    assign(&mut holder.0.write(), value);
    ctx.with_value(holder)
}

fn get_field(ctx: &Context, project: fn(&RequestValues) -> String) -> String {
    match shared(ctx) {
        Some(holder) => project(&holder.0.read()),
        None => String::new(),
    }
}

/// Record the device ID on `ctx`, returning the handle to pass downstream.
///
/// If a holder already exists anywhere up the chain it is updated in place,
/// so handles that already resolve to it observe the new value too;
/// otherwise a fresh holder is allocated. Setting an empty string clears a
/// previously recorded ID.
pub fn set_device_id(ctx: &Context, device_id: impl Into<String>) -> Context {
    set_field(ctx, device_id.into(), |values, id| values.device_id = id)
}

/// The device ID recorded on `ctx`, or `""` if none was set.
pub fn device_id(ctx: &Context) -> String {
    get_field(ctx, |values| values.device_id.clone())
}

/// Record the trace ID on `ctx`, returning the handle to pass downstream.
pub fn set_trace_id(ctx: &Context, trace_id: impl Into<String>) -> Context {
    set_field(ctx, trace_id.into(), |values, id| values.trace_id = id)
}

/// The trace ID recorded on `ctx`, or `""` if none was set.
pub fn trace_id(ctx: &Context) -> String {
    get_field(ctx, |values| values.trace_id.clone())
}

/// Ensure `ctx` carries a trace ID, minting a fresh UUIDv4 if it does not.
///
/// Returns the input handle unchanged when a non-empty trace ID is already
/// recorded.
pub fn ensure_trace_id(ctx: &Context) -> Context {
    if !trace_id(ctx).is_empty() {
        return ctx.clone();
    }
    let id = Uuid::new_v4().to_string();
    tracing::debug!(trace_id = %id, "assigned generated trace ID");
    set_trace_id(ctx, id)
}

/// Rebase the request values onto a fresh handle bounded by `timeout`.
///
/// The returned handle is rooted outside the caller's chain: it does not
/// inherit the source handle's cancellation or deadline, and canceling it
/// never affects the source. If the source carries a holder, the same
/// holder instance is attached (shared, not cloned), so writes through
/// either handle remain visible through the other. A source with no holder
/// yields a handle with no holder.
///
/// The returned [`CancelGuard`] releases the new scope when dropped.
pub fn extend_timeout(ctx: &Context, timeout: Duration) -> (Context, CancelGuard) {
    let (fresh, guard) = Context::background().with_timeout(timeout);
    match shared(ctx) {
        Some(holder) => (fresh.with_value(holder), guard),
        None => (fresh, guard),
    }
}

/// Serializable copy of the values visible from a handle.
///
/// Detached from the live holder: later writes do not alter a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValuesSnapshot {
    pub device_id: String,
    pub trace_id: String,
}

/// Snapshot the values visible from `ctx` for logging or export.
pub fn snapshot(ctx: &Context) -> ValuesSnapshot {
    match shared(ctx) {
        Some(holder) => {
            let values = holder.0.read();
            ValuesSnapshot {
                device_id: values.device_id.clone(),
                trace_id: values.trace_id.clone(),
            }
        }
        None => ValuesSnapshot::default(),
    }
}
