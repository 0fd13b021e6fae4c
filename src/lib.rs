/*!
# Baton

Request-scoped context propagation for async Rust services: a per-call
handle that carries typed values (device ID, trace ID) down a call chain,
together with cancellation, deadlines, and a timeout-extension operation
that hands work a fresh slice of time while keeping the values attached.

## Features

- **Immutable handle chain**: deriving a child never mutates the parent;
  values resolve child→parent with type-keyed lookup
- **Never-fail accessors**: a missing holder reads as empty strings, so
  callers never branch on lookup errors
- **Shared holder**: every handle derived after a value was attached reads
  and writes the same holder, including across `extend_timeout`
- **RAII cancellation**: scopes are released by guard, explicitly or on
  drop; canceling a scope never reaches its parent or siblings

## Example

```rust,no_run
use baton::{device_id, extend_timeout, set_device_id, set_trace_id, Context};
use std::time::Duration;

#[tokio::main]
async fn main() {
    let ctx = Context::background();
    let ctx = set_device_id(&ctx, "device-123");
    let ctx = set_trace_id(&ctx, "trace-456");

    // Hand the flush a bounded slice of time, detached from the caller's
    // own cancellation, with the request values carried along.
    let (bounded, _guard) = extend_timeout(&ctx, Duration::from_millis(250));
    assert_eq!(device_id(&bounded), "device-123");

    tokio::select! {
        _ = bounded.done() => { /* out of time */ }
        _ = flush(&bounded) => { /* finished */ }
    }
}

async fn flush(_ctx: &baton::Context) {}
```
*/

mod context;
mod error;
mod values;

pub use context::{CancelGuard, Context};
pub use error::ContextError;
pub use values::{
    device_id, ensure_trace_id, extend_timeout, set_device_id, set_trace_id, snapshot, trace_id,
    ValuesSnapshot,
};
