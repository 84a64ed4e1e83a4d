//! Metrics and observability infrastructure.
//!
//! Counters are recorded through the `metrics` facade; whichever recorder
//! the embedding process installs receives them. Events live in [`events`]
//! and are emitted through the [`emit!`] macro.

pub mod events;

/// Macro for emitting metric events.
///
/// Calls `InternalEvent::emit()` on the given event, which records the
/// corresponding counter.
///
/// # Example
///
/// ```ignore
/// use floe::metrics::events::RowsIngested;
///
/// emit!(RowsIngested { count: 100, table: "bronze.orders".into() });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}

pub use emit;
