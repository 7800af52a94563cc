//! Internal event interface.
//!
//! Each event struct represents a measurable occurrence. Emitting an event
//! records its metric through the `metrics` facade, so the events are
//! recorded whether or not a Prometheus exporter is installed.

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Recorded<'a>(&'a Cell<u32>);

    impl InternalEvent for Recorded<'_> {
        fn emit(self) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn test_emit_macro_calls_event() {
        let count = Cell::new(0);
        crate::emit!(Recorded(&count));
        crate::emit!(Recorded(&count));
        assert_eq!(count.get(), 2);
    }
}
