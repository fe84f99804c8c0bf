use crate::error::AlertError;
use chrono::Local;
use log::{debug, error, info};
use std::io::Write;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

/// Destination for human-readable notifications
///
/// Called concurrently from every reporter and monitor thread, so
/// implementations must serialize delivery themselves.
#[cfg_attr(test, mockall::automock)]
pub trait Notifier: Send + Sync {
    fn notify(&self, text: &str) -> Result<(), AlertError>;
}

/// Notifier that queues messages for a single delivery thread
///
/// `notify` never blocks on the output; the queue is drained in order by
/// whoever owns the receiving end.
#[derive(Debug)]
pub struct QueuedNotifier {
    sender: Mutex<Sender<String>>,
}

impl QueuedNotifier {
    /// Create a notifier and the receiving end of its queue
    pub fn new() -> (Self, Receiver<String>) {
        let (sender, receiver) = mpsc::channel();
        (
            Self {
                sender: Mutex::new(sender),
            },
            receiver,
        )
    }

    /// Create a notifier whose messages are written to `out` by a dedicated thread
    ///
    /// The thread exits once every clone of the notifier has been dropped.
    pub fn spawn_writer<W>(mut out: W) -> (Self, JoinHandle<()>)
    where
        W: Write + Send + 'static,
    {
        let (notifier, receiver) = Self::new();

        let handle = thread::spawn(move || {
            info!("Notification thread started");

            for message in receiver {
                let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
                if let Err(e) = writeln!(out, "[{}] {}", stamp, message).and_then(|_| out.flush())
                {
                    error!("Failed to write notification: {}", e);
                }
            }

            info!("Notification thread stopped");
        });

        (notifier, handle)
    }
}

impl Notifier for QueuedNotifier {
    fn notify(&self, text: &str) -> Result<(), AlertError> {
        debug!("Queuing notification: {}", text);

        let sender = self
            .sender
            .lock()
            .map_err(|_| AlertError::NotificationFailed("notifier lock poisoned".to_string()))?;
        sender
            .send(text.to_string())
            .map_err(|_| AlertError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    /// Writer that appends into shared memory so the test can inspect it
    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<StdMutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_messages_are_queued_in_order() {
        let (notifier, receiver) = QueuedNotifier::new();
        notifier.notify("first").unwrap();
        notifier.notify("second").unwrap();

        assert_eq!(receiver.recv().unwrap(), "first");
        assert_eq!(receiver.recv().unwrap(), "second");
    }

    #[test]
    fn test_notify_fails_when_receiver_dropped() {
        let (notifier, receiver) = QueuedNotifier::new();
        drop(receiver);

        assert!(matches!(
            notifier.notify("lost"),
            Err(AlertError::ChannelClosed)
        ));
    }

    #[test]
    fn test_concurrent_notify_is_serialized() {
        let buffer = SharedBuffer::default();
        let (notifier, handle) = QueuedNotifier::spawn_writer(buffer.clone());
        let notifier = Arc::new(notifier);

        let workers: Vec<_> = (0..4)
            .map(|worker| {
                let notifier = Arc::clone(&notifier);
                thread::spawn(move || {
                    for i in 0..25 {
                        notifier.notify(&format!("worker {} message {}", worker, i)).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        drop(notifier);
        handle.join().unwrap();

        let output = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 100);
        assert!(lines.iter().all(|l| l.contains("worker ") && l.contains(" message ")));
    }
}
