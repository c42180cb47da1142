//! Scripted chat backend for testing.
//!
//! Provides a deterministic implementation of the ChatBackend trait that
//! replays queued replies and errors and captures every request, for use
//! in tests without a real LLM endpoint.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::backend::{BackendError, BackendResult, ChatBackend, ChatReply, ChatRequest};

/// Scripted chat backend.
///
/// Queued results are returned in order. Once the queue is empty the
/// fallback reply is returned, or an error if none is set.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    script: Arc<RwLock<VecDeque<BackendResult<ChatReply>>>>,
    fallback: Arc<RwLock<Option<ChatReply>>>,
    captured: Arc<RwLock<Vec<ChatRequest>>>,
    delay: Arc<RwLock<Option<Duration>>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply to use once the script runs out.
    pub fn with_fallback(self, reply: ChatReply) -> Self {
        *self.fallback.write() = Some(reply);
        self
    }

    /// Sleep before answering each call.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.write() = Some(delay);
        self
    }

    pub fn push_reply(&self, reply: ChatReply) {
        self.script.write().push_back(Ok(reply));
    }

    pub fn push_error(&self, error: BackendError) {
        self.script.write().push_back(Err(error));
    }

    /// All requests received so far.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.captured.read().clone()
    }

    pub fn call_count(&self) -> usize {
        self.captured.read().len()
    }

    /// Number of scripted results not yet consumed.
    pub fn remaining(&self) -> usize {
        self.script.read().len()
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn chat(&self, request: ChatRequest) -> BackendResult<ChatReply> {
        self.captured.write().push(request);

        let delay = *self.delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.script.write().pop_front();
        match next {
            Some(result) => result,
            None => self
                .fallback
                .read()
                .clone()
                .ok_or_else(|| BackendError::Other("scripted backend exhausted".to_string())),
        }
    }
}
