use crate::traits::error::Result;
use std::sync::Arc;

/// Callback invoked for every event delivered to a listener set
///
/// Listeners run on the connection driver and must return quickly. Both an
/// `Err` return and a panic count as a listener failure: the failure is
/// logged and counted, and the remaining listeners still run.
///
/// Any `Fn(&T) -> Result<()>` closure is a listener:
///
/// ```ignore
/// let on_sample: ListenerRef<Received> = Arc::new(|received: &Received| {
///     if let Envelope::Telemetry { tag_id, value, .. } = &received.envelope {
///         println!("{tag_id} = {value}");
///     }
///     Ok(())
/// });
/// client.on(EnvelopeKind::Telemetry, &on_sample);
/// ```
pub trait Listener<T>: Send + Sync + 'static {
    fn call(&self, event: &T) -> Result<()>;
}

impl<T, F> Listener<T> for F
where
    F: Fn(&T) -> Result<()> + Send + Sync + 'static,
{
    fn call(&self, event: &T) -> Result<()> {
        self(event)
    }
}

/// Shared listener handle; identity is the allocation, so keep the `Arc`
/// around to unregister it later
pub type ListenerRef<T> = Arc<dyn Listener<T>>;

/// Wrap an infallible closure as a listener
pub fn listener_fn<T, F>(f: F) -> ListenerRef<T>
where
    T: 'static,
    F: Fn(&T) + Send + Sync + 'static,
{
    Arc::new(move |event: &T| -> Result<()> {
        f(event);
        Ok(())
    })
}

/// Pointer identity of a listener, ignoring vtable metadata
pub(crate) fn same_listener<T>(a: &ListenerRef<T>, b: &ListenerRef<T>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
