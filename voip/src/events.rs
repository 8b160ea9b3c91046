use sip_core::LifecycleEvent;

/// Receives lifecycle events. Called synchronously from inside `tick`, so
/// implementations must not block.
pub trait EventSink {
    fn emit(&mut self, event: LifecycleEvent);
}

impl<F> EventSink for F
where
    F: FnMut(LifecycleEvent),
{
    fn emit(&mut self, event: LifecycleEvent) {
        self(event)
    }
}
