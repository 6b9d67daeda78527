//! Cooperative request/response conversations over the dispatcher.
//!
//! A protocol task is ordinary sequential code that sends a request and then
//! awaits the next incoming message, without ever blocking the MIDI I/O
//! thread: the dispatcher callback only enqueues into a channel, the task
//! thread blocks on the channel. Cancellation is an abort flag observed at
//! every await point. The backing subscription is removed when the context is
//! dropped, whichever way the task ends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::backend::MidiEndpoint;
use crate::devices::SafeOutput;
use crate::dispatch::{HandlerHandle, MidiDispatcher};
use crate::message::MidiMessage;

/// One incoming message together with the input it arrived on.
#[derive(Debug, Clone)]
pub struct MidiEvent {
    pub source: MidiEndpoint,
    pub message: MidiMessage,
}

/// Shared cancellation flag for long-running MIDI operations.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag {
    flag: Arc<AtomicBool>,
}

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// The task-side view of a protocol conversation.
pub struct ProtocolContext {
    dispatcher: Arc<MidiDispatcher>,
    handle: HandlerHandle,
    receiver: Receiver<MidiEvent>,
    abort: AbortFlag,
}

impl ProtocolContext {
    /// Attach a conversation to the dispatcher on the current thread. The
    /// subscription is live from this point until the context is dropped.
    pub fn attach(dispatcher: &Arc<MidiDispatcher>, abort: AbortFlag) -> Self {
        let (sender, receiver): (Sender<MidiEvent>, Receiver<MidiEvent>) = mpsc::channel();
        let handle = HandlerHandle::new();
        dispatcher.subscribe(
            handle,
            Arc::new(move |source: &MidiEndpoint, message: &MidiMessage| {
                // Runs on the I/O thread: enqueue only, never user logic.
                let _ = sender.send(MidiEvent {
                    source: source.clone(),
                    message: message.clone(),
                });
            }),
        );
        Self {
            dispatcher: Arc::clone(dispatcher),
            handle,
            receiver,
            abort,
        }
    }

    /// Attach with an idle timeout: when no message arrives for `timeout`,
    /// the dispatcher feeds the timeout sentinel through this context.
    pub fn attach_with_timeout(
        dispatcher: &Arc<MidiDispatcher>,
        abort: AbortFlag,
        timeout: Duration,
    ) -> Self {
        let (sender, receiver): (Sender<MidiEvent>, Receiver<MidiEvent>) = mpsc::channel();
        let handle = HandlerHandle::new();
        dispatcher.subscribe_with_timeout(
            handle,
            Arc::new(move |source: &MidiEndpoint, message: &MidiMessage| {
                let _ = sender.send(MidiEvent {
                    source: source.clone(),
                    message: message.clone(),
                });
            }),
            Some(timeout),
        );
        Self {
            dispatcher: Arc::clone(dispatcher),
            handle,
            receiver,
            abort,
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }

    pub fn abort_flag(&self) -> AbortFlag {
        self.abort.clone()
    }

    /// Await the next incoming message, up to `bound`. Returns `None` on
    /// timeout or when the task has been aborted. This is the only suspension
    /// point of a protocol task.
    pub fn next_message(&self, bound: Duration) -> Option<MidiEvent> {
        // Wake up periodically so an abort cuts a long bound short.
        const ABORT_POLL: Duration = Duration::from_millis(50);
        let deadline = Instant::now() + bound;
        loop {
            if self.abort.is_aborted() {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let slice = ABORT_POLL.min(deadline - now);
            match self.receiver.recv_timeout(slice) {
                Ok(event) => return Some(event),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    /// Drain anything already queued without waiting.
    pub fn drain(&self) {
        while self.receiver.try_recv().is_ok() {}
    }

    pub fn send(&self, output: &SafeOutput, message: &MidiMessage) {
        output.send_now(message);
    }

    pub fn send_block(&self, output: &SafeOutput, messages: &[MidiMessage]) {
        output.send_block_full_speed(messages);
    }
}

impl Drop for ProtocolContext {
    fn drop(&mut self) {
        self.dispatcher.unsubscribe(self.handle);
        trace!("protocol context detached");
    }
}

/// Handle to a protocol task running on its own worker thread.
pub struct ProtocolTask<R> {
    join: JoinHandle<R>,
    abort: AbortFlag,
}

impl<R> ProtocolTask<R> {
    pub fn abort_flag(&self) -> AbortFlag {
        self.abort.clone()
    }

    pub fn abort(&self) {
        self.abort.abort();
    }

    /// Block until the task signals completion with its typed return value.
    pub fn wait(self) -> R {
        self.join.join().expect("protocol task panicked")
    }
}

/// Spawn a protocol task on a dedicated worker thread. The context is created
/// before the thread starts, so no message sent after this call returns can be
/// missed.
pub fn run_protocol<R, F>(dispatcher: &Arc<MidiDispatcher>, task: F) -> ProtocolTask<R>
where
    R: Send + 'static,
    F: FnOnce(ProtocolContext) -> R + Send + 'static,
{
    let abort = AbortFlag::new();
    let context = ProtocolContext::attach(dispatcher, abort.clone());
    let join = thread::Builder::new()
        .name("midi-protocol".to_string())
        .spawn(move || task(context))
        .expect("failed to spawn protocol worker");
    ProtocolTask { join, abort }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::DeviceManager;
    use crate::sim::SimBackend;

    #[test]
    fn test_request_response_conversation() {
        let backend = SimBackend::new();
        let input = backend.add_input("In");
        let output = backend.add_output("Out");
        let manager = DeviceManager::new(backend.clone().as_backend());
        manager.enable_input(&input);

        // The device echoes any request with payload+1.
        let reply_input = input.clone();
        backend.set_responder(Arc::new(move |_, message| {
            let payload = message.sysex_payload().unwrap_or(&[]);
            let reply: Vec<u8> = payload.iter().map(|b| b + 1).collect();
            vec![(reply_input.clone(), MidiMessage::sysex(&reply))]
        }));

        let out = manager.open_output(&output);
        let task = run_protocol(manager.dispatcher(), move |ctx| {
            ctx.send(&out, &MidiMessage::sysex(&[0x10]));
            ctx.next_message(Duration::from_millis(500))
                .map(|event| event.message)
        });
        let reply = task.wait().expect("expected a reply");
        assert_eq!(reply.sysex_payload(), Some(&[0x11][..]));
    }

    #[test]
    fn test_next_message_times_out() {
        let backend = SimBackend::new();
        let manager = DeviceManager::new(backend.as_backend());
        let task = run_protocol(manager.dispatcher(), |ctx| {
            ctx.next_message(Duration::from_millis(50))
        });
        assert!(task.wait().is_none());
    }

    #[test]
    fn test_abort_cuts_wait_short() {
        let backend = SimBackend::new();
        let manager = DeviceManager::new(backend.as_backend());
        let task = run_protocol(manager.dispatcher(), |ctx| {
            let start = Instant::now();
            let event = ctx.next_message(Duration::from_secs(10));
            (event.is_none(), start.elapsed())
        });
        task.abort();
        let (none, waited) = task.wait();
        assert!(none);
        assert!(waited < Duration::from_secs(2));
    }

    #[test]
    fn test_subscription_removed_after_task() {
        let backend = SimBackend::new();
        let manager = DeviceManager::new(backend.as_backend());
        let before = manager.dispatcher().subscriber_count();
        let task = run_protocol(manager.dispatcher(), |_ctx| ());
        task.wait();
        assert_eq!(manager.dispatcher().subscriber_count(), before);
    }

    #[test]
    fn test_attached_context_with_timeout_gets_sentinel() {
        let backend = SimBackend::new();
        let manager = DeviceManager::new(backend.as_backend());
        let ctx = ProtocolContext::attach_with_timeout(
            manager.dispatcher(),
            AbortFlag::new(),
            Duration::from_millis(80),
        );
        let event = ctx
            .next_message(Duration::from_millis(500))
            .expect("sentinel expected");
        assert!(event.message.is_timeout_sentinel());
    }
}
