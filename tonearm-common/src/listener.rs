//! Listener registry for fan-out event delivery
//!
//! Every listener owns an unbounded FIFO queue, so `send` never blocks the
//! emitter and each listener sees events in emission order. Dropping the
//! returned guard (or the receiving half) unregisters the listener.

use crate::events::{AudioEvent, PlaybackState};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};

type Senders<E> = HashMap<u64, mpsc::UnboundedSender<E>>;

/// Broadcasts events of type `E` to registered listeners
pub struct ListenerRegistry<E> {
    senders: Arc<Mutex<Senders<E>>>,
    next_id: AtomicU64,
}

impl<E> Default for ListenerRegistry<E> {
    fn default() -> Self {
        Self {
            senders: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<E> std::fmt::Debug for ListenerRegistry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &lock(&self.senders).len())
            .finish()
    }
}

fn lock<E>(senders: &Mutex<Senders<E>>) -> MutexGuard<'_, Senders<E>> {
    // A panicking listener must not take the registry down with it
    senders.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<E> ListenerRegistry<E>
where
    E: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self) -> (ListenerGuard, mpsc::UnboundedReceiver<E>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.senders).insert(id, tx);

        let weak: Weak<Mutex<Senders<E>>> = Arc::downgrade(&self.senders);
        let guard = ListenerGuard {
            unregister: Some(Box::new(move || {
                if let Some(senders) = weak.upgrade() {
                    lock(&senders).remove(&id);
                }
            })),
        };
        (guard, rx)
    }

    /// Subscribe a channel listener
    pub fn subscribe(&self) -> Subscription<E> {
        let (guard, rx) = self.add();
        Subscription { rx, _guard: guard }
    }

    /// Register a callback listener
    ///
    /// The handler runs on a tokio task when called inside a runtime, else
    /// on a dedicated thread. It stops once the guard is dropped.
    pub fn register<F>(&self, mut handler: F) -> ListenerGuard
    where
        F: FnMut(E) + Send + 'static,
    {
        let (guard, mut rx) = self.add();

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    while let Some(event) = rx.recv().await {
                        handler(event);
                    }
                });
            }
            Err(_) => {
                let spawned = std::thread::Builder::new()
                    .name("listener".to_string())
                    .spawn(move || {
                        while let Some(event) = rx.blocking_recv() {
                            handler(event);
                        }
                    });
                if let Err(e) = spawned {
                    warn!("Failed to spawn listener thread: {}", e);
                }
            }
        }

        guard
    }

    /// Deliver `event` to every registered listener
    ///
    /// Returns the number of listeners the event was queued for.
    pub fn send(&self, event: E) -> usize {
        let mut senders = lock(&self.senders);
        senders.retain(|id, tx| {
            let open = tx.send(event.clone()).is_ok();
            if !open {
                debug!("Pruning closed listener {}", id);
            }
            open
        });
        senders.len()
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.senders).len()
    }
}

/// Unregisters its listener when dropped
#[must_use = "dropping the guard unregisters the listener"]
pub struct ListenerGuard {
    unregister: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerGuard {
    /// Keep the listener registered for the life of the registry
    pub fn detach(mut self) {
        self.unregister = None;
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(unregister) = self.unregister.take() {
            unregister();
        }
    }
}

impl std::fmt::Debug for ListenerGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerGuard")
            .field("attached", &self.unregister.is_some())
            .finish()
    }
}

/// Channel listener returned by [`ListenerRegistry::subscribe`]
pub struct Subscription<E> {
    rx: mpsc::UnboundedReceiver<E>,
    _guard: ListenerGuard,
}

impl<E> Subscription<E> {
    /// Wait for the next event
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    /// Take the next queued event without waiting
    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }

    /// Take every queued event
    pub fn drain(&mut self) -> Vec<E> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Callback-style audio listener
///
/// Implement only the events of interest and register with
/// [`AudioListener::attach`].
pub trait AudioListener: Send + 'static {
    fn state_changed(
        &mut self,
        _old_state: PlaybackState,
        _new_state: PlaybackState,
        _target_state: Option<PlaybackState>,
    ) {
    }

    fn stream_changed(&mut self, _uri: Option<&str>) {}

    fn position_changed(&mut self, _position: u64) {}

    fn tags_changed(&mut self, _tags: &BTreeSet<String>) {}

    fn reached_end_of_stream(&mut self) {}

    /// Dispatch to the per-event method
    fn on_event(&mut self, event: AudioEvent) {
        match event {
            AudioEvent::StateChanged {
                old_state,
                new_state,
                target_state,
            } => self.state_changed(old_state, new_state, target_state),
            AudioEvent::StreamChanged { uri } => self.stream_changed(uri.as_deref()),
            AudioEvent::PositionChanged { position } => self.position_changed(position),
            AudioEvent::TagsChanged { tags } => self.tags_changed(&tags),
            AudioEvent::ReachedEndOfStream => self.reached_end_of_stream(),
        }
    }

    fn attach(mut self, registry: &ListenerRegistry<AudioEvent>) -> ListenerGuard
    where
        Self: Sized,
    {
        registry.register(move |event| self.on_event(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_send_preserves_order_per_listener() {
        let registry: ListenerRegistry<u32> = ListenerRegistry::new();
        let mut a = registry.subscribe();
        let mut b = registry.subscribe();

        for i in 0..5 {
            assert_eq!(registry.send(i), 2);
        }

        assert_eq!(a.drain(), vec![0, 1, 2, 3, 4]);
        assert_eq!(b.drain(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_dropped_subscription_is_pruned() {
        let registry: ListenerRegistry<u32> = ListenerRegistry::new();
        let keep = registry.subscribe();
        let gone = registry.subscribe();
        assert_eq!(registry.listener_count(), 2);

        drop(gone);
        assert_eq!(registry.listener_count(), 1);
        assert_eq!(registry.send(7), 1);
        drop(keep);
        assert_eq!(registry.send(8), 0);
    }

    #[test]
    fn test_try_recv_does_not_wait() {
        let registry: ListenerRegistry<u32> = ListenerRegistry::new();
        let mut sub = registry.subscribe();

        assert_eq!(sub.try_recv(), None);
        registry.send(3);
        registry.send(4);
        assert_eq!(sub.try_recv(), Some(3));
        assert_eq!(sub.try_recv(), Some(4));
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn test_detached_listener_stays_registered() {
        let registry: ListenerRegistry<u32> = ListenerRegistry::new();
        let (tx, rx) = std::sync::mpsc::channel();
        let guard = registry.register(move |n| {
            let _ = tx.send(n);
        });
        assert!(format!("{:?}", guard).contains("attached: true"));

        guard.detach();
        assert_eq!(registry.listener_count(), 1);
        assert_eq!(format!("{:?}", registry), "ListenerRegistry { listeners: 1 }");

        registry.send(9);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 9);
    }

    #[test]
    fn test_guard_outliving_registry_is_harmless() {
        let registry: ListenerRegistry<u32> = ListenerRegistry::new();
        let sub = registry.subscribe();
        drop(registry);
        drop(sub);
    }

    #[test]
    fn test_register_without_runtime_uses_thread() {
        let registry: ListenerRegistry<u32> = ListenerRegistry::new();
        let (tx, rx) = std::sync::mpsc::channel();
        let _guard = registry.register(move |n| {
            let _ = tx.send(n * 2);
        });

        registry.send(21);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 42);
    }

    #[tokio::test]
    async fn test_register_inside_runtime_uses_task() {
        let registry: ListenerRegistry<String> = ListenerRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _guard = registry.register(move |s: String| {
            let _ = tx.send(s.to_uppercase());
        });

        registry.send("hello".to_string());
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(got.as_deref(), Some("HELLO"));
    }

    #[tokio::test]
    async fn test_audio_listener_dispatch() {
        struct Recorder(mpsc::UnboundedSender<String>);

        impl AudioListener for Recorder {
            fn stream_changed(&mut self, uri: Option<&str>) {
                let _ = self.0.send(format!("stream:{}", uri.unwrap_or("-")));
            }

            fn reached_end_of_stream(&mut self) {
                let _ = self.0.send("eos".to_string());
            }
        }

        let registry = ListenerRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _guard = Recorder(tx).attach(&registry);

        registry.send(AudioEvent::StreamChanged {
            uri: Some("file:///a.ogg".to_string()),
        });
        registry.send(AudioEvent::PositionChanged { position: 10 });
        registry.send(AudioEvent::ReachedEndOfStream);

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(first.as_deref(), Some("stream:file:///a.ogg"));
        assert_eq!(second.as_deref(), Some("eos"));
    }
}
