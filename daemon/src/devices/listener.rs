// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Listener proxies.
//!
//! A proxy pairs a listener with the execution context it wants to be
//! called on and an opaque id assigned at construction. Sets of proxies are
//! keyed by that id, so registering a clone of the same proxy twice yields
//! one entry.

use crate::devices::id_factory::IdFactory;
use crate::dispatch::Executor;
use lazy_static::lazy_static;
use std::fmt;
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(pub u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

// Allocator for listener identifiers.
lazy_static! {
    static ref LISTENER_IDS: Mutex<IdFactory<u64>> = Mutex::new(IdFactory::new(1, 1));
}

fn next_listener_id() -> ListenerId {
    ListenerId(LISTENER_IDS.lock().unwrap_or_else(|e| e.into_inner()).next_id())
}

/// Told, exactly once, that an interface no longer exists.
pub trait InterfaceDestroyedListener: Send + Sync {
    fn on_destroyed(&self, iface_name: &str);
}

impl<F: Fn(&str) + Send + Sync> InterfaceDestroyedListener for F {
    fn on_destroyed(&self, iface_name: &str) {
        self(iface_name)
    }
}

/// Told, at most once, that a previously denied interface type can now
/// be requested.
pub trait InterfaceAvailableForRequestListener: Send + Sync {
    fn on_available_for_request(&self);
}

impl<F: Fn() + Send + Sync> InterfaceAvailableForRequestListener for F {
    fn on_available_for_request(&self) {
        self()
    }
}

/// Start/stop notifications of the device manager.
pub trait ManagerStatusCallback: Send + Sync {
    fn on_start(&self);
    fn on_stop(&self);
}

pub struct ListenerProxy<L: ?Sized + Send + Sync + 'static> {
    id: ListenerId,
    listener: Arc<L>,
    executor: Arc<dyn Executor>,
}

impl<L: ?Sized + Send + Sync + 'static> Clone for ListenerProxy<L> {
    fn clone(&self) -> Self {
        ListenerProxy {
            id: self.id,
            listener: self.listener.clone(),
            executor: self.executor.clone(),
        }
    }
}

impl<L: ?Sized + Send + Sync + 'static> ListenerProxy<L> {
    pub fn new(listener: Arc<L>, executor: Arc<dyn Executor>) -> Self {
        ListenerProxy { id: next_listener_id(), listener, executor }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Posts `action` to the listener's executor; never runs it inline.
    pub fn trigger<F>(&self, action: F)
    where
        F: FnOnce(&L) + Send + 'static,
    {
        let listener = self.listener.clone();
        self.executor.post(Box::new(move || action(&listener)));
    }
}

impl<L: ?Sized + Send + Sync + 'static> fmt::Debug for ListenerProxy<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ListenerProxy({})", self.id)
    }
}

pub type DestroyedListener = ListenerProxy<dyn InterfaceDestroyedListener>;
pub type AvailableListener = ListenerProxy<dyn InterfaceAvailableForRequestListener>;
pub type StatusCallback = ListenerProxy<dyn ManagerStatusCallback>;

/// Wraps a destroyed closure into a proxy bound to `executor`.
pub fn destroyed_listener<F>(executor: Arc<dyn Executor>, f: F) -> DestroyedListener
where
    F: Fn(&str) + Send + Sync + 'static,
{
    ListenerProxy::new(Arc::new(f) as Arc<dyn InterfaceDestroyedListener>, executor)
}

/// Wraps an availability closure into a proxy bound to `executor`.
pub fn available_listener<F>(executor: Arc<dyn Executor>, f: F) -> AvailableListener
where
    F: Fn() + Send + Sync + 'static,
{
    ListenerProxy::new(Arc::new(f) as Arc<dyn InterfaceAvailableForRequestListener>, executor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::QueuedExecutor;

    #[test]
    fn test_ids_are_unique_and_survive_clone() {
        let executor = QueuedExecutor::new();
        let a = destroyed_listener(executor.clone(), |_| {});
        let b = destroyed_listener(executor.clone(), |_| {});
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }

    #[test]
    fn test_trigger_is_posted() {
        let executor = QueuedExecutor::new();
        let names = Arc::new(Mutex::new(Vec::new()));
        let names_clone = names.clone();
        let proxy = destroyed_listener(executor.clone(), move |name| {
            names_clone.lock().unwrap().push(name.to_string())
        });
        proxy.trigger(|l| l.on_destroyed("wlan0"));
        assert!(names.lock().unwrap().is_empty());
        executor.run_pending();
        assert_eq!(*names.lock().unwrap(), vec!["wlan0".to_string()]);
    }
}
