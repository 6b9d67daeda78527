//! Scheduled MIDI sending.
//!
//! Some workflows want "send this in 200 ms" without parking a thread per
//! message. The timed sender keeps one queue of (due time, output, message)
//! entries and a 50 ms timer thread that flushes whatever has become due.
//! Coarser than audio-rate scheduling, which is fine for librarian traffic.

use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::devices::SafeOutput;
use crate::message::MidiMessage;

struct QueuedMessage {
    due: Instant,
    output: SafeOutput,
    message: MidiMessage,
}

/// Sends messages at (approximately) a requested future time.
pub struct TimedSender {
    queue: Mutex<Vec<QueuedMessage>>,
}

impl TimedSender {
    /// Create the sender and its timer thread. The thread stops when the
    /// last strong reference is gone.
    pub fn new() -> Arc<Self> {
        let sender = Arc::new(Self {
            queue: Mutex::new(Vec::new()),
        });
        let weak: Weak<Self> = Arc::downgrade(&sender);
        thread::Builder::new()
            .name("midi-timed-sender".to_string())
            .spawn(move || loop {
                thread::sleep(Duration::from_millis(50));
                let Some(sender) = weak.upgrade() else {
                    return;
                };
                sender.flush_due(Instant::now());
            })
            .expect("failed to spawn timed sender thread");
        sender
    }

    /// Schedule a message for `delay` from now.
    pub fn schedule(&self, output: &SafeOutput, message: MidiMessage, delay: Duration) {
        let mut queue = self.queue.lock().expect("timed sender queue poisoned");
        queue.push(QueuedMessage {
            due: Instant::now() + delay,
            output: output.clone(),
            message,
        });
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().expect("timed sender queue poisoned").len()
    }

    /// Send everything due at `now`. The timer thread calls this; tests call
    /// it directly to avoid sleeping.
    pub fn flush_due(&self, now: Instant) {
        let due: Vec<QueuedMessage> = {
            let mut queue = self.queue.lock().expect("timed sender queue poisoned");
            let mut due: Vec<QueuedMessage> = Vec::new();
            let mut remaining = Vec::with_capacity(queue.len());
            for entry in queue.drain(..) {
                if entry.due <= now {
                    due.push(entry);
                } else {
                    remaining.push(entry);
                }
            }
            *queue = remaining;
            due
        };
        if due.is_empty() {
            return;
        }
        // Preserve scheduling order within the batch.
        let mut due = due;
        due.sort_by_key(|entry| entry.due);
        trace!(count = due.len(), "flushing scheduled MIDI messages");
        for entry in due {
            entry.output.send_now(&entry.message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::DeviceManager;
    use crate::sim::SimBackend;

    #[test]
    fn test_messages_sent_when_due() {
        let backend = SimBackend::new();
        let endpoint = backend.add_output("Out");
        let manager = DeviceManager::new(backend.clone().as_backend());
        let output = manager.open_output(&endpoint);

        let sender = TimedSender::new();
        sender.schedule(&output, MidiMessage::sysex(&[0x01]), Duration::from_millis(0));
        sender.schedule(&output, MidiMessage::sysex(&[0x02]), Duration::from_secs(60));
        assert_eq!(sender.pending(), 2);

        sender.flush_due(Instant::now());
        assert_eq!(backend.sent_to(&endpoint).len(), 1);
        assert_eq!(sender.pending(), 1);

        // Far-future flush drains the rest.
        sender.flush_due(Instant::now() + Duration::from_secs(120));
        assert_eq!(backend.sent_to(&endpoint).len(), 2);
        assert_eq!(sender.pending(), 0);
    }

    #[test]
    fn test_batch_keeps_due_order() {
        let backend = SimBackend::new();
        let endpoint = backend.add_output("Out");
        let manager = DeviceManager::new(backend.clone().as_backend());
        let output = manager.open_output(&endpoint);

        let sender = TimedSender::new();
        sender.schedule(&output, MidiMessage::sysex(&[0x02]), Duration::from_millis(20));
        sender.schedule(&output, MidiMessage::sysex(&[0x01]), Duration::from_millis(10));

        sender.flush_due(Instant::now() + Duration::from_secs(1));
        let sent = backend.sent_to(&endpoint);
        assert_eq!(sent[0].sysex_payload(), Some(&[0x01][..]));
        assert_eq!(sent[1].sysex_payload(), Some(&[0x02][..]));
    }

    #[test]
    fn test_timer_thread_flushes_eventually() {
        let backend = SimBackend::new();
        let endpoint = backend.add_output("Out");
        let manager = DeviceManager::new(backend.clone().as_backend());
        let output = manager.open_output(&endpoint);

        let sender = TimedSender::new();
        sender.schedule(&output, MidiMessage::sysex(&[0x03]), Duration::from_millis(10));
        // Two timer periods are plenty.
        thread::sleep(Duration::from_millis(150));
        assert_eq!(backend.sent_to(&endpoint).len(), 1);
    }
}
