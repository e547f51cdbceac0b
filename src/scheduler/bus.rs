//! Fan-out of monitoring commands to stream boxes.

use tokio::sync::mpsc;

/// Command broadcast to every stream box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
}

/// Registry of subscriber queues.
#[derive(Debug, Default)]
pub struct ControlBus {
    subscribers: Vec<mpsc::UnboundedSender<Command>>,
}

impl ControlBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<Command> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Send `cmd` to every live subscriber and forget closed ones.
    ///
    /// Returns the number of subscribers reached.
    pub fn broadcast(&mut self, cmd: Command) -> usize {
        self.subscribers.retain(|tx| tx.send(cmd).is_ok());
        self.subscribers.len()
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}
