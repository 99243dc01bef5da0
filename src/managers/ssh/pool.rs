use crate::errors::ExecError;
use crate::services::logger::Logger;
use std::collections::HashMap;

/// Transport handle kept by the pool. Clones share the underlying connection.
pub trait PooledTransport: Clone + Send {
    fn is_alive(&self) -> bool;
    fn shutdown(&self) {}
}

impl PooledTransport for ssh2::Session {
    fn is_alive(&self) -> bool {
        self.authenticated() && self.keepalive_send().is_ok()
    }

    fn shutdown(&self) {
        let _ = self.disconnect(None, "agentrun closing connection", None);
    }
}

/// At most one live transport per `user@host:port` key.
pub struct ConnectionPool<T: PooledTransport> {
    logger: Logger,
    entries: HashMap<String, T>,
}

impl<T: PooledTransport> ConnectionPool<T> {
    pub fn new(logger: Logger) -> Self {
        Self {
            logger: logger.child("pool"),
            entries: HashMap::new(),
        }
    }

    /// Returns the cached transport when it still answers a liveness probe;
    /// otherwise evicts it and stores a fresh one from `connect`.
    pub fn acquire<F>(&mut self, key: &str, connect: F) -> Result<T, ExecError>
    where
        F: FnOnce() -> Result<T, ExecError>,
    {
        if let Some(existing) = self.entries.get(key) {
            if existing.is_alive() {
                self.logger
                    .debug("reusing connection", Some(&serde_json::json!({"key": key})));
                return Ok(existing.clone());
            }
            self.logger
                .info("evicting stale connection", Some(&serde_json::json!({"key": key})));
            if let Some(stale) = self.entries.remove(key) {
                stale.shutdown();
            }
        }
        let fresh = connect()?;
        self.entries.insert(key.to_string(), fresh.clone());
        self.logger
            .debug("connection opened", Some(&serde_json::json!({"key": key})));
        Ok(fresh)
    }

    pub fn close(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(transport) => {
                transport.shutdown();
                true
            }
            None => false,
        }
    }

    pub fn close_all(&mut self) -> usize {
        let count = self.entries.len();
        for (_, transport) in self.entries.drain() {
            transport.shutdown();
        }
        count
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
