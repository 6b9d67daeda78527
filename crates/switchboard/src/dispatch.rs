//! Keyed fan-out of incoming MIDI messages to handler subscriptions.
//!
//! The I/O thread calls [`MidiDispatcher::dispatch`]; handlers are invoked on
//! a snapshot of the registry so they may subscribe or unsubscribe reentrantly
//! without invalidating the pass. Subscriptions can carry an idle timeout; a
//! timer thread delivers a synthetic timeout message (see
//! [`MidiMessage::is_timeout_sentinel`]) exactly once per idle interval.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use tracing::trace;
use uuid::Uuid;

use crate::backend::MidiEndpoint;
use crate::message::MidiMessage;

/// Opaque key for one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerHandle(Uuid);

impl HandlerHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for HandlerHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Callback for complete messages.
pub type MidiCallback = Arc<dyn Fn(&MidiEndpoint, &MidiMessage) + Send + Sync>;
/// Callback for SysEx chunks that stream in before the message is complete.
/// Receives the bytes gathered so far.
pub type PartialMidiCallback = Arc<dyn Fn(&MidiEndpoint, &[u8]) + Send + Sync>;

struct HandlerEntry {
    callback: MidiCallback,
    timeout: Option<Duration>,
    last_activity: Instant,
    sentinel_pending: bool,
}

struct DispatchState {
    handlers: HashMap<HandlerHandle, HandlerEntry>,
    partial_handlers: HashMap<HandlerHandle, PartialMidiCallback>,
}

/// Subscription registry shared between the device manager and its clients.
pub struct MidiDispatcher {
    state: Mutex<DispatchState>,
    timer_running: AtomicBool,
}

impl MidiDispatcher {
    /// Create the dispatcher and start its idle-timeout timer thread. The
    /// thread stops when the last `Arc` to the dispatcher is dropped.
    pub fn new() -> Arc<Self> {
        let dispatcher = Arc::new(Self {
            state: Mutex::new(DispatchState {
                handlers: HashMap::new(),
                partial_handlers: HashMap::new(),
            }),
            timer_running: AtomicBool::new(true),
        });
        Self::start_timeout_timer(&dispatcher);
        dispatcher
    }

    fn start_timeout_timer(this: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(this);
        thread::Builder::new()
            .name("midi-timeout-timer".to_string())
            .spawn(move || loop {
                thread::sleep(Duration::from_millis(50));
                let Some(dispatcher) = weak.upgrade() else {
                    return;
                };
                if !dispatcher.timer_running.load(Ordering::Relaxed) {
                    return;
                }
                dispatcher.fire_expired_timeouts();
            })
            .expect("failed to spawn midi timeout timer");
    }

    /// Subscribe without an idle timeout.
    pub fn subscribe(&self, handle: HandlerHandle, callback: MidiCallback) {
        self.subscribe_with_timeout(handle, callback, None)
    }

    /// Subscribe with an optional idle timeout. With `Some(t)`, the handler
    /// receives the timeout sentinel once whenever it has seen no traffic for
    /// `t`; the idle clock restarts after each delivery.
    pub fn subscribe_with_timeout(
        &self,
        handle: HandlerHandle,
        callback: MidiCallback,
        timeout: Option<Duration>,
    ) {
        let mut state = self.state.lock().expect("dispatcher mutex poisoned");
        state.handlers.insert(
            handle,
            HandlerEntry {
                callback,
                timeout,
                last_activity: Instant::now(),
                sentinel_pending: false,
            },
        );
    }

    /// Remove a subscription. Returns false if the handle was unknown.
    pub fn unsubscribe(&self, handle: HandlerHandle) -> bool {
        let mut state = self.state.lock().expect("dispatcher mutex poisoned");
        state.handlers.remove(&handle).is_some()
    }

    pub fn subscribe_partial(&self, handle: HandlerHandle, callback: PartialMidiCallback) {
        let mut state = self.state.lock().expect("dispatcher mutex poisoned");
        state.partial_handlers.insert(handle, callback);
    }

    pub fn unsubscribe_partial(&self, handle: HandlerHandle) -> bool {
        let mut state = self.state.lock().expect("dispatcher mutex poisoned");
        state.partial_handlers.remove(&handle).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        let state = self.state.lock().expect("dispatcher mutex poisoned");
        state.handlers.len()
    }

    /// Fan a complete message out to every subscriber. Called from the MIDI
    /// I/O thread; the lock is held only to snapshot the callback list.
    pub fn dispatch(&self, source: &MidiEndpoint, message: &MidiMessage) {
        let callbacks: Vec<MidiCallback> = {
            let mut state = self.state.lock().expect("dispatcher mutex poisoned");
            let now = Instant::now();
            state
                .handlers
                .values_mut()
                .map(|entry| {
                    entry.last_activity = now;
                    entry.sentinel_pending = false;
                    Arc::clone(&entry.callback)
                })
                .collect()
        };
        trace!(
            subscribers = callbacks.len(),
            source = %source.name,
            "dispatching MIDI message"
        );
        for callback in callbacks {
            callback(source, message);
        }
    }

    /// Fan a partial SysEx chunk out to the partial subscribers. Chunk
    /// arrival also feeds the idle clock of every complete-message handler, so
    /// a slow bulk dump does not trip the timeout mid-transfer.
    pub fn dispatch_partial(&self, source: &MidiEndpoint, bytes_so_far: &[u8]) {
        let callbacks: Vec<PartialMidiCallback> = {
            let mut state = self.state.lock().expect("dispatcher mutex poisoned");
            let now = Instant::now();
            for entry in state.handlers.values_mut() {
                entry.last_activity = now;
            }
            state.partial_handlers.values().map(Arc::clone).collect()
        };
        for callback in callbacks {
            callback(source, bytes_so_far);
        }
    }

    fn fire_expired_timeouts(&self) {
        let expired: Vec<MidiCallback> = {
            let mut state = self.state.lock().expect("dispatcher mutex poisoned");
            let now = Instant::now();
            state
                .handlers
                .values_mut()
                .filter_map(|entry| {
                    let timeout = entry.timeout?;
                    if entry.sentinel_pending || now.duration_since(entry.last_activity) < timeout {
                        return None;
                    }
                    entry.sentinel_pending = true;
                    entry.last_activity = now;
                    Some(Arc::clone(&entry.callback))
                })
                .collect()
        };
        if expired.is_empty() {
            return;
        }
        let sentinel = MidiMessage::timeout_sentinel();
        let source = MidiEndpoint::invalid();
        for callback in expired {
            callback(&source, &sentinel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_callback(counter: Arc<AtomicUsize>) -> MidiCallback {
        Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_dispatch_reaches_all_subscribers() {
        let dispatcher = MidiDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        dispatcher.subscribe(HandlerHandle::new(), counting_callback(count.clone()));
        dispatcher.subscribe(HandlerHandle::new(), counting_callback(count.clone()));

        let source = MidiEndpoint::new("in", "In");
        dispatcher.dispatch(&source, &MidiMessage::sysex(&[0x01]));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let dispatcher = MidiDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let handle = HandlerHandle::new();
        dispatcher.subscribe(handle, counting_callback(count.clone()));
        assert!(dispatcher.unsubscribe(handle));
        assert!(!dispatcher.unsubscribe(handle));

        dispatcher.dispatch(&MidiEndpoint::new("in", "In"), &MidiMessage::sysex(&[0x01]));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reentrant_unsubscribe_during_dispatch() {
        let dispatcher = MidiDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let handle = HandlerHandle::new();
        let inner_dispatcher = Arc::clone(&dispatcher);
        let inner_count = count.clone();
        dispatcher.subscribe(
            handle,
            Arc::new(move |_, _| {
                inner_count.fetch_add(1, Ordering::SeqCst);
                inner_dispatcher.unsubscribe(handle);
            }),
        );

        let source = MidiEndpoint::new("in", "In");
        dispatcher.dispatch(&source, &MidiMessage::sysex(&[0x01]));
        dispatcher.dispatch(&source, &MidiMessage::sysex(&[0x02]));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_idle_timeout_delivers_sentinel_once_per_interval() {
        let dispatcher = MidiDispatcher::new();
        let sentinels = Arc::new(AtomicUsize::new(0));
        let seen = sentinels.clone();
        dispatcher.subscribe_with_timeout(
            HandlerHandle::new(),
            Arc::new(move |_, message| {
                if message.is_timeout_sentinel() {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            }),
            Some(Duration::from_millis(80)),
        );

        // One interval elapses, one sentinel arrives; without further traffic
        // the idle clock restarts and a second interval produces a second one.
        thread::sleep(Duration::from_millis(150));
        let after_first = sentinels.load(Ordering::SeqCst);
        assert!(after_first >= 1, "expected at least one sentinel");

        thread::sleep(Duration::from_millis(150));
        assert!(sentinels.load(Ordering::SeqCst) > after_first);
    }

    #[test]
    fn test_traffic_resets_idle_clock() {
        let dispatcher = MidiDispatcher::new();
        let sentinels = Arc::new(AtomicUsize::new(0));
        let seen = sentinels.clone();
        dispatcher.subscribe_with_timeout(
            HandlerHandle::new(),
            Arc::new(move |_, message| {
                if message.is_timeout_sentinel() {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            }),
            Some(Duration::from_millis(200)),
        );

        let source = MidiEndpoint::new("in", "In");
        for _ in 0..6 {
            thread::sleep(Duration::from_millis(50));
            dispatcher.dispatch(&source, &MidiMessage::sysex(&[0x01]));
        }
        assert_eq!(sentinels.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_partial_chunks_feed_idle_clock() {
        let dispatcher = MidiDispatcher::new();
        let sentinels = Arc::new(AtomicUsize::new(0));
        let seen = sentinels.clone();
        dispatcher.subscribe_with_timeout(
            HandlerHandle::new(),
            Arc::new(move |_, message| {
                if message.is_timeout_sentinel() {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            }),
            Some(Duration::from_millis(200)),
        );

        let source = MidiEndpoint::new("in", "In");
        for _ in 0..6 {
            thread::sleep(Duration::from_millis(50));
            dispatcher.dispatch_partial(&source, &[0xf0, 0x01]);
        }
        assert_eq!(sentinels.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_partial_handler_receives_chunks() {
        let dispatcher = MidiDispatcher::new();
        let chunks = Arc::new(AtomicUsize::new(0));
        let seen = chunks.clone();
        let handle = HandlerHandle::new();
        dispatcher.subscribe_partial(
            handle,
            Arc::new(move |_, bytes| {
                assert!(!bytes.is_empty());
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );

        dispatcher.dispatch_partial(&MidiEndpoint::new("in", "In"), &[0xf0, 0x41, 0x10]);
        assert_eq!(chunks.load(Ordering::SeqCst), 1);
        assert!(dispatcher.unsubscribe_partial(handle));
    }
}
