use parking_lot::{Condvar, Mutex};
use shardex_kernels::Buffer;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
enum EventState {
    Pending,
    Complete,
    Failed(String),
}

/// Completion token of one enqueued command.
///
/// Cloning an event shares the underlying state.
#[derive(Clone)]
pub struct Event {
    state: Arc<(Mutex<EventState>, Condvar)>,
}

impl Event {
    pub fn new() -> Self {
        Self {
            state: Arc::new((Mutex::new(EventState::Pending), Condvar::new())),
        }
    }

    /// An event that has already failed, for commands that could not be queued.
    pub fn failed(message: impl Into<String>) -> Self {
        let event = Self::new();
        event.fail(message);
        event
    }

    pub fn complete(&self) {
        self.set(EventState::Complete);
    }

    pub fn fail(&self, message: impl Into<String>) {
        self.set(EventState::Failed(message.into()));
    }

    fn set(&self, new_state: EventState) {
        let (lock, cvar) = &*self.state;
        let mut state = lock.lock();
        if *state == EventState::Pending {
            *state = new_state;
            cvar.notify_all();
        }
    }

    pub fn is_done(&self) -> bool {
        *self.state.0.lock() != EventState::Pending
    }

    /// Blocks until the command has run; returns its failure message if any.
    pub fn wait(&self) -> Result<(), String> {
        let (lock, cvar) = &*self.state;
        let mut state = lock.lock();
        while *state == EventState::Pending {
            cvar.wait(&mut state);
        }
        match &*state {
            EventState::Failed(message) => Err(message.clone()),
            _ => Ok(()),
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Event").field(&*self.state.0.lock()).finish()
    }
}

/// Host-side landing slot for data read back from a device.
#[derive(Debug, Clone, Default)]
pub struct Staging(Arc<Mutex<Option<Buffer>>>);

impl Staging {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, data: Buffer) {
        *self.0.lock() = Some(data);
    }

    pub fn take(&self) -> Option<Buffer> {
        self.0.lock().take()
    }
}
