//! In-process bus transport
//!
//! Keeps a committed log per process. Clones share the log, so a test can
//! hand one handle to the publisher and keep another to inspect what landed.
//! Sends inside a transaction are staged and only appended on commit.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{BusMessage, BusTransport};
use crate::{ConnectorError, ConnectorResult};

#[derive(Debug, Default)]
struct Inner {
    connected: bool,
    unavailable: bool,
    log: Vec<BusMessage>,
    staged: Option<Vec<BusMessage>>,
    sends: u64,
    fail_at: Option<u64>,
    transactions_begun: u64,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryBus {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the `n`-th send from now on fail (1-based)
    pub fn fail_nth_send(&self, n: u64) {
        let mut inner = self.lock();
        inner.fail_at = Some(inner.sends + n.max(1));
    }

    /// Refuse connections until called again with `false`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Committed messages, in write order
    pub fn messages(&self) -> Vec<BusMessage> {
        self.lock().log.clone()
    }

    pub fn messages_on(&self, topic: &str) -> Vec<BusMessage> {
        self.lock()
            .log
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    pub fn transactions_begun(&self) -> u64 {
        self.lock().transactions_begun
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl BusTransport for InMemoryBus {
    async fn connect(&mut self) -> ConnectorResult<()> {
        let mut inner = self.lock();
        if inner.unavailable {
            return Err(ConnectorError::Transport("in-memory bus unavailable".into()));
        }
        inner.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> ConnectorResult<()> {
        let mut inner = self.lock();
        inner.connected = false;
        inner.staged = None;
        Ok(())
    }

    async fn send(&mut self, message: &BusMessage) -> ConnectorResult<()> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if !inner.connected {
            return Err(ConnectorError::NotConnected);
        }

        inner.sends += 1;
        if inner.fail_at == Some(inner.sends) {
            inner.fail_at = None;
            return Err(ConnectorError::Transport(format!(
                "injected failure on send {}",
                inner.sends
            )));
        }

        match inner.staged.as_mut() {
            Some(staged) => staged.push(message.clone()),
            None => inner.log.push(message.clone()),
        }
        Ok(())
    }

    async fn begin_transaction(&mut self) -> ConnectorResult<()> {
        let mut inner = self.lock();
        if inner.staged.is_some() {
            return Err(ConnectorError::Transport("transaction already open".into()));
        }
        inner.staged = Some(Vec::new());
        inner.transactions_begun += 1;
        Ok(())
    }

    async fn commit_transaction(&mut self) -> ConnectorResult<()> {
        let mut inner = self.lock();
        let staged = inner
            .staged
            .take()
            .ok_or_else(|| ConnectorError::Transport("no open transaction".into()))?;
        inner.log.extend(staged);
        Ok(())
    }

    async fn abort_transaction(&mut self) -> ConnectorResult<()> {
        self.lock().staged = None;
        Ok(())
    }
}
