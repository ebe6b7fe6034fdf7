//! In-process hub for tests and `--hub-addr memory://` dry runs.

use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use super::{closed, HubConnection, HubDelivery, HubPublisher, HubTransport};
use crate::protocol::LifecycleEvent;

const WAIT_SLICE: Duration = Duration::from_millis(50);

#[derive(Default)]
struct HubState {
    /// Bumped whenever the current connection is torn down.
    generation: u64,
    available: bool,
    connects: usize,
    inbound: VecDeque<String>,
    published: Vec<String>,
}

#[derive(Default)]
struct HubInner {
    state: Mutex<HubState>,
    wake: Condvar,
}

/// Hub side of an in-memory connection. Clones share the same hub.
#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    pub fn new() -> Self {
        let hub = Self {
            inner: Arc::new(HubInner::default()),
        };
        hub.lock().available = true;
        hub
    }

    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport { hub: self.clone() }
    }

    /// Queue a lifecycle event for the agent.
    pub fn send(&self, event: &LifecycleEvent) -> Result<()> {
        self.send_raw(&event.to_json()?);
        Ok(())
    }

    pub fn send_raw(&self, text: &str) {
        self.lock().inbound.push_back(text.to_string());
        self.inner.wake.notify_all();
    }

    /// Everything the agent has published, oldest first.
    pub fn published(&self) -> Vec<String> {
        self.lock().published.clone()
    }

    pub fn published_events(&self) -> Vec<LifecycleEvent> {
        self.published()
            .iter()
            .filter_map(|text| LifecycleEvent::parse(text))
            .collect()
    }

    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    /// Tear down the current connection as if the network failed.
    pub fn drop_connection(&self) {
        self.lock().generation += 1;
        self.inner.wake.notify_all();
    }

    /// While unavailable, connection attempts fail.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MemoryTransport {
    hub: MemoryHub,
}

impl HubTransport for MemoryTransport {
    fn connect(&self) -> Result<(Box<dyn HubConnection>, Arc<dyn HubPublisher>)> {
        let generation = {
            let mut state = self.hub.lock();
            if !state.available {
                return Err(anyhow!("memory hub unavailable"));
            }
            state.generation += 1;
            state.connects += 1;
            state.generation
        };
        let connection = MemoryConnection {
            hub: self.hub.clone(),
            generation,
            announced: false,
        };
        let publisher = MemoryPublisher {
            hub: self.hub.clone(),
            generation,
        };
        Ok((Box::new(connection), Arc::new(publisher)))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

struct MemoryConnection {
    hub: MemoryHub,
    generation: u64,
    announced: bool,
}

impl HubConnection for MemoryConnection {
    fn recv(&mut self) -> Result<HubDelivery> {
        if !self.announced {
            self.announced = true;
            return Ok(HubDelivery::Connected);
        }
        let mut state = self.hub.lock();
        loop {
            if state.generation != self.generation {
                return Err(closed());
            }
            if let Some(text) = state.inbound.pop_front() {
                return Ok(HubDelivery::Payload(text));
            }
            state = match self.hub.inner.wake.wait_timeout(state, WAIT_SLICE) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

struct MemoryPublisher {
    hub: MemoryHub,
    generation: u64,
}

impl HubPublisher for MemoryPublisher {
    fn publish(&self, payload: &str) -> Result<()> {
        let mut state = self.hub.lock();
        if state.generation != self.generation {
            return Err(closed());
        }
        state.published.push(payload.to_string());
        Ok(())
    }

    fn close(&self) {
        let mut state = self.hub.lock();
        if state.generation == self.generation {
            state.generation += 1;
        }
        drop(state);
        self.hub.inner.wake.notify_all();
    }
}
