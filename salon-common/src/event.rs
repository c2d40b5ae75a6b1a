// Copyright 2025 salon Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{fmt::Debug, sync::Arc};

use parking_lot::RwLock;

/// Identifier returned by [`Emitter::on`]. Pass it to [`Emitter::off`] to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<E> {
    seq: u64,
    handlers: Vec<(u64, Handler<E>)>,
}

/// A handler set for one tagged event family.
///
/// Each cache entity carries its own [`Emitter`] for its event enum, so dispatch is
/// a match-free fan-out: one enumerated union of events, one handler set per entity.
///
/// Cloning an [`Emitter`] shares the handler set. Handlers may re-enter the emitter
/// (subscribe or unsubscribe) while an emission is in flight; the emission operates
/// on a snapshot.
pub struct Emitter<E> {
    inner: Arc<RwLock<Registry<E>>>,
}

impl<E> Debug for Emitter<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter").field("handlers", &self.len()).finish()
    }
}

impl<E> Default for Emitter<E> {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Registry {
                seq: 0,
                handlers: Vec::new(),
            })),
        }
    }
}

impl<E> Clone for Emitter<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E> Emitter<E> {
    /// Create an emitter with an empty handler set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `handler` to every event emitted through this emitter.
    pub fn on<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let mut registry = self.inner.write();
        registry.seq += 1;
        let id = registry.seq;
        registry.handlers.push((id, Arc::new(handler)));
        HandlerId(id)
    }

    /// Unsubscribe the handler registered under `id`.
    ///
    /// Returns `true` if the handler was still registered.
    pub fn off(&self, id: HandlerId) -> bool {
        let mut registry = self.inner.write();
        let before = registry.handlers.len();
        registry.handlers.retain(|(hid, _)| *hid != id.0);
        registry.handlers.len() != before
    }

    /// Emit `event` to every subscribed handler in subscription order.
    pub fn emit(&self, event: &E) {
        // Snapshot the handler set so handlers can re-enter the emitter.
        let handlers = self
            .inner
            .read()
            .handlers
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect::<Vec<_>>();
        for handler in handlers {
            handler(event);
        }
    }

    /// Drop every handler.
    pub fn clear(&self) {
        self.inner.write().handlers.clear();
    }

    /// Returns the number of subscribed handlers.
    pub fn len(&self) -> usize {
        self.inner.read().handlers.len()
    }

    /// Returns `true` if no handler is subscribed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum TestEvent {
        Ping,
        Pong,
    }

    #[test]
    fn test_on_emit_off() {
        let emitter = Emitter::<TestEvent>::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let id = emitter.on({
            let hits = hits.clone();
            move |event| {
                if matches!(event, TestEvent::Ping) {
                    hits.fetch_add(1, Ordering::Relaxed);
                }
            }
        });

        emitter.emit(&TestEvent::Ping);
        emitter.emit(&TestEvent::Pong);
        assert_eq!(hits.load(Ordering::Relaxed), 1);

        assert!(emitter.off(id));
        assert!(!emitter.off(id));

        emitter.emit(&TestEvent::Ping);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_clone_shares_handlers() {
        let emitter = Emitter::<TestEvent>::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let other = emitter.clone();
        other.on({
            let hits = hits.clone();
            move |_| {
                hits.fetch_add(1, Ordering::Relaxed);
            }
        });

        emitter.emit(&TestEvent::Ping);
        assert_eq!(hits.load(Ordering::Relaxed), 1);

        emitter.clear();
        assert!(other.is_empty());
    }

    #[test]
    fn test_reentrant_unsubscribe() {
        let emitter = Emitter::<TestEvent>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let slot = Arc::new(Mutex::new(None));

        let id = emitter.on({
            let emitter = emitter.clone();
            let hits = hits.clone();
            let slot = slot.clone();
            move |_| {
                hits.fetch_add(1, Ordering::Relaxed);
                if let Some(id) = slot.lock().take() {
                    emitter.off(id);
                }
            }
        });
        *slot.lock() = Some(id);

        emitter.emit(&TestEvent::Ping);
        emitter.emit(&TestEvent::Ping);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }
}
