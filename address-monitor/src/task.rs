//! Per-transaction execution context.

use crate::state::{Checkpoint, TransactionalState, WorldState};
use crate::types::{Address, Incarnation, TxnIndex};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Hook into whatever is currently running code on behalf of a task, so an
/// abort can stop it without waiting for its next resource request.
pub trait Instrumentation: Send + Sync {
    fn set_abort_state(&self);
}

/// The part of a task shared with other threads: its index and abort flag.
///
/// The monitor keeps `Arc<TaskHandle>`s in its wait queues and uses them to
/// preempt lower-priority owners.
pub struct TaskHandle {
    index: TxnIndex,
    aborted: AtomicBool,
    instrumentation: Mutex<Option<Arc<dyn Instrumentation>>>,
}

impl TaskHandle {
    pub fn new(index: TxnIndex) -> Arc<Self> {
        Arc::new(Self {
            index,
            aborted: AtomicBool::new(false),
            instrumentation: Mutex::new(None),
        })
    }

    pub fn index(&self) -> TxnIndex {
        self.index
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Marks the current attempt as aborted. Idempotent; the flag stays set
    /// until the next attempt starts.
    pub fn set_abort_state(&self) {
        if !self.aborted.swap(true, Ordering::AcqRel) {
            if let Some(instrumentation) = self.instrumentation.lock().as_ref() {
                instrumentation.set_abort_state();
            }
        }
    }

    /// Binds an instrumentation hook. An abort that is already pending is
    /// forwarded to it right away.
    pub fn attach(&self, instrumentation: Arc<dyn Instrumentation>) {
        let mut slot = self.instrumentation.lock();
        if self.is_aborted() {
            instrumentation.set_abort_state();
        }
        *slot = Some(instrumentation);
    }

    pub fn detach(&self) -> Option<Arc<dyn Instrumentation>> {
        self.instrumentation.lock().take()
    }

    fn reset(&self) {
        self.aborted.store(false, Ordering::Release);
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("index", &self.index)
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

/// Event emitted by a contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub address: Address,
    pub indexed: Vec<Vec<u8>>,
    pub data: Vec<Vec<u8>>,
}

/// Effects of one call frame.
#[derive(Debug, Default)]
struct SideEffects {
    events: Vec<Event>,
    /// Overlay as it was when the frame was entered. `None` for the root frame.
    checkpoint: Option<Checkpoint>,
}

/// One external transaction of a batch, across all its attempts.
#[derive(Debug)]
pub struct TransactionTask {
    handle: Arc<TaskHandle>,
    world: Arc<WorldState>,
    attempts: usize,
    depth: usize,
    side_effects: Vec<SideEffects>,
    state: TransactionalState,
    output: String,
}

impl TransactionTask {
    pub fn new(index: TxnIndex, world: Arc<WorldState>) -> Self {
        Self {
            handle: TaskHandle::new(index),
            state: TransactionalState::new(world.clone()),
            world,
            attempts: 0,
            depth: 0,
            side_effects: vec![SideEffects::default()],
            output: String::new(),
        }
    }

    pub fn index(&self) -> TxnIndex {
        self.handle.index()
    }

    pub fn handle(&self) -> &Arc<TaskHandle> {
        &self.handle
    }

    /// Attempt number of the current attempt, starting at 0.
    pub fn incarnation(&self) -> Incarnation {
        self.attempts.saturating_sub(1)
    }

    pub fn is_aborted(&self) -> bool {
        self.handle.is_aborted()
    }

    pub fn set_abort_state(&self) {
        self.handle.set_abort_state();
    }

    /// Starts a fresh attempt: clears the abort flag, the call stack, the
    /// buffered output and the overlay.
    pub fn start_new_transaction(&mut self) {
        self.attempts += 1;
        self.handle.reset();
        self.depth = 0;
        self.side_effects.clear();
        self.side_effects.push(SideEffects::default());
        self.state = TransactionalState::new(self.world.clone());
        self.output.clear();
    }

    pub fn state(&self) -> &TransactionalState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut TransactionalState {
        &mut self.state
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Opens a nested call frame. Returns the new depth.
    pub fn enter_call(&mut self) -> usize {
        self.side_effects.push(SideEffects {
            events: Vec::new(),
            checkpoint: Some(self.state.checkpoint()),
        });
        self.depth += 1;
        self.depth
    }

    /// Closes the innermost call frame. On success its effects move into the
    /// enclosing frame; otherwise its events are dropped and its state writes
    /// rolled back.
    pub fn exit_call(&mut self, success: bool) {
        if self.side_effects.len() <= 1 {
            return;
        }
        if let Some(frame) = self.side_effects.pop() {
            if success {
                if let Some(parent) = self.side_effects.last_mut() {
                    parent.events.extend(frame.events);
                }
            } else if let Some(checkpoint) = frame.checkpoint {
                self.state.restore(checkpoint);
            }
        }
        self.depth = self.depth.saturating_sub(1);
    }

    pub fn emit_event(&mut self, event: Event) {
        if let Some(frame) = self.side_effects.last_mut() {
            frame.events.push(event);
        }
    }

    /// Events of the current attempt that reached the root frame.
    pub fn events(&self) -> &[Event] {
        self.side_effects
            .first()
            .map(|frame| frame.events.as_slice())
            .unwrap_or(&[])
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        self.side_effects
            .first_mut()
            .map(|frame| std::mem::take(&mut frame.events))
            .unwrap_or_default()
    }

    pub fn output_print(&mut self, text: &str) {
        self.output.push_str(text);
    }

    pub fn output_println(&mut self, text: &str) {
        self.output.push_str(text);
        self.output.push('\n');
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    /// Writes the buffered output to the log. Only called on commit.
    pub(crate) fn output_flush(&mut self) {
        if self.output.is_empty() {
            return;
        }
        for line in self.output.lines() {
            info!(index = self.index(), "{}", line);
        }
        self.output.clear();
    }

    pub(crate) fn commit_state(&mut self) -> usize {
        self.state.commit()
    }
}
