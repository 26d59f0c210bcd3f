use std::future::Future;

use signalpipe_core::{Baggage, Fields};

tokio::task_local! {
    static AMBIENT_FIELDS: Fields;
    static AMBIENT_BAGGAGE: Baggage;
}

/// Runs `f` with `fields` merged into the ambient scope (merge-last-wins:
/// `fields` overrides any same-named key from an enclosing `with_context`
/// call). The merged scope is carried via `tokio::task_local!`, so it
/// survives `.await` suspension points within `f`'s future but is not
/// automatically inherited by tasks spawned from inside it — a spawned task
/// that wants the same baggage must capture and re-apply it explicitly,
/// matching the "ambient context carried explicitly by the caller" design
/// note rather than relying on implicit async-local propagation.
pub async fn with_context<F, Fut, T>(fields: Fields, f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let merged = merge_with_current(&fields);
    AMBIENT_FIELDS.scope(merged, f()).await
}

/// Same propagation model as [`with_context`], but for the typed
/// trace-id/span-id/request-id/user-id baggage (spec §3: "request-scope
/// baggage ... merged at log time from ambient context"), merged
/// last-wins via [`Baggage::merged_with`].
pub async fn with_baggage<F, Fut, T>(baggage: Baggage, f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let merged = current_baggage().merged_with(&baggage);
    AMBIENT_BAGGAGE.scope(merged, f()).await
}

/// Snapshot of the fields merged in by every enclosing `with_context` call
/// active on the current task, outermost first.
pub fn current_fields() -> Fields {
    AMBIENT_FIELDS.try_with(|f| f.clone()).unwrap_or_default()
}

/// Snapshot of the baggage merged in by every enclosing `with_baggage` call
/// active on the current task, outermost first.
pub fn current_baggage() -> Baggage {
    AMBIENT_BAGGAGE.try_with(|b| b.clone()).unwrap_or_default()
}

fn merge_with_current(new_fields: &Fields) -> Fields {
    let mut merged = current_fields();
    for (k, v) in new_fields {
        merged.insert(k.clone(), v.clone());
    }
    merged
}
