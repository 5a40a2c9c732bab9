//! Input flows and output consumers for driving a sync in tests.

use async_trait::async_trait;
use bulkload_engine::{InputFlow, OutputConsumer, SyncError, SyncResult};
use bulkload_protocol::{CheckpointMessage, InputMessage};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Input flow over a prepared list of messages.
#[derive(Debug, Default)]
pub struct VecInput {
    messages: VecDeque<InputMessage>,
    error: Option<String>,
}

impl VecInput {
    /// Creates an input that yields `messages` in order.
    pub fn new(messages: impl IntoIterator<Item = InputMessage>) -> Self {
        Self {
            messages: messages.into_iter().collect(),
            error: None,
        }
    }

    /// Fails with `message` after the prepared messages are consumed
    /// instead of signalling end of input.
    pub fn ending_with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }

    /// Messages not read yet.
    pub fn remaining(&self) -> usize {
        self.messages.len()
    }
}

#[async_trait]
impl InputFlow for VecInput {
    async fn next(&mut self) -> SyncResult<Option<InputMessage>> {
        if let Some(message) = self.messages.pop_front() {
            return Ok(Some(message));
        }
        match self.error.take() {
            Some(message) => Err(SyncError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                message,
            ))),
            None => Ok(None),
        }
    }
}

/// Output consumer that keeps every emitted checkpoint.
#[derive(Debug, Default)]
pub struct CollectingOutput {
    checkpoints: Mutex<Vec<CheckpointMessage>>,
    reject: AtomicBool,
}

impl CollectingOutput {
    /// Creates an empty output.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every later emission fail.
    pub fn reject_checkpoints(&self) {
        self.reject.store(true, Ordering::SeqCst);
    }

    /// Checkpoints emitted so far, in order.
    pub fn checkpoints(&self) -> Vec<CheckpointMessage> {
        self.checkpoints.lock().clone()
    }
}

impl OutputConsumer for CollectingOutput {
    fn accept_checkpoint(&self, checkpoint: CheckpointMessage) -> SyncResult<()> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(SyncError::destination("output closed"));
        }
        self.checkpoints.lock().push(checkpoint);
        Ok(())
    }
}
