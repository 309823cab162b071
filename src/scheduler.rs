// Copyright (c) 2018 Nuclear Furnace
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! The main-thread side of the runtime. `Scheduler` owns every live `Task`
//! and `Subscription`, keyed by invoke id, and is the only thing that ever
//! calls `SchedulerObject::step`. Ported from `ev::scheduler::Scheduler`
//! (`scheduler.cc`): `ids_to_object_map_`/`object_to_client_map_`/
//! `clients_to_objects_map_`/`detached_`/`zombies_` keep their names and
//! roles; `ReleaseObject`'s "zombie vs. detached vs. still attached" triage
//! is preserved exactly, just without manual `delete`.
//!
//! Every push kicks the object's first `step(None)` asynchronously by
//! round-tripping through the hub (a no-payload descriptor with
//! `mode = NotSet`, `target = NotSet`), the same way the original defers
//! the first `Step` off of the calling stack instead of running it inline.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::bridge::Bridge;
use crate::errors::SchedulerError;
use crate::hub::{HubHandle, Publication};
use crate::outcome::Outcome;
use crate::request::Request;

pub type ClientId = u64;

/// Which kind of scheduler object an invoke id refers to; carried as the
/// wire descriptor's `tag` field so the hub never needs to know about
/// `Task`/`Subscription` itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Task = 0,
    Subscription = 1,
}

impl ObjectKind {
    pub fn from_tag(tag: u8) -> Option<ObjectKind> {
        match tag {
            0 => Some(ObjectKind::Task),
            1 => Some(ObjectKind::Subscription),
            _ => None,
        }
    }
}

/// What a step produced: either the object has nothing left to do (release
/// it) or it wants another request dispatched before it can continue.
pub enum StepOutcome {
    Finished,
    Next(Request),
}

/// Implemented by `Task` and `Subscription`. The scheduler never inspects
/// anything about these objects beyond this trait.
pub trait SchedulerObject: Send {
    fn kind(&self) -> ObjectKind;

    /// Advances the state machine. `outcome` is `None` only for the very
    /// first call immediately after `Scheduler::push`.
    fn step(&mut self, outcome: Option<Outcome>) -> StepOutcome;

    /// Delivers a batch of unsolicited outcomes (pub/sub messages).
    /// Only `Subscription` overrides this; `Task` never receives any.
    fn publish(&mut self, _outcomes: Vec<Outcome>) {}

    /// Notified when the keep-alive device backing this object
    /// disconnected. Returns `true` if the object is done and should be
    /// released, `false` if it wants to stay registered (e.g. a
    /// subscription that intends to reconnect).
    fn disconnected(&mut self) -> bool { true }
}

struct Inner {
    clients_to_objects: HashMap<ClientId, Vec<u64>>,
    object_to_client: HashMap<u64, ClientId>,
    ids_to_object: HashMap<u64, Box<dyn SchedulerObject>>,
    detached: HashSet<u64>,
    zombies: Vec<Box<dyn SchedulerObject>>,
    pending_timeouts: HashSet<ClientId>,
    next_invoke_id: u64,
}

impl Inner {
    fn new() -> Self {
        Inner {
            clients_to_objects: HashMap::new(),
            object_to_client: HashMap::new(),
            ids_to_object: HashMap::new(),
            detached: HashSet::new(),
            zombies: Vec::new(),
            pending_timeouts: HashSet::new(),
            next_invoke_id: 1,
        }
    }
}

/// Handle shared between application code (registering clients, pushing
/// tasks) and the bridge pump (delivering hub publications). Cheap to
/// clone; all state lives behind the inner mutex.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Mutex<Inner>>,
    bridge: Bridge,
    hub: HubHandle,
}

impl Scheduler {
    pub fn new(hub: HubHandle, bridge: Bridge) -> Self {
        Scheduler { inner: Arc::new(Mutex::new(Inner::new())), bridge, hub }
    }

    /// Registers a new client (a connection, a job — whatever the
    /// embedding application considers the owner of its tasks). Safe to
    /// call more than once for the same id; a second call is a no-op,
    /// matching the original.
    pub fn register(&self, client: ClientId) {
        let mut inner = self.inner.lock().expect("scheduler poisoned");
        inner.clients_to_objects.entry(client).or_insert_with(Vec::new);
        Self::kill_zombies_locked(&mut inner);
    }

    /// Detaches every object still owned by `client`. They aren't dropped
    /// immediately: each is moved to `detached` so an in-flight `step`
    /// result arriving afterward is rejected (and the object released)
    /// instead of silently handed to something nobody owns anymore.
    pub fn unregister(&self, client: ClientId) {
        let mut inner = self.inner.lock().expect("scheduler poisoned");
        if let Some(ids) = inner.clients_to_objects.remove(&client) {
            for id in ids {
                inner.detached.insert(id);
            }
        }
        inner.object_to_client.retain(|_, c| *c != client);
        inner.pending_timeouts.remove(&client);
        Self::kill_zombies_locked(&mut inner);
    }

    /// Registers a new `Task`/`Subscription` under `client` and kicks off
    /// its first step asynchronously. Returns the invoke id the object was
    /// assigned.
    pub fn push(&self, client: ClientId, object: Box<dyn SchedulerObject>) -> Result<u64, SchedulerError> {
        let invoke_id = {
            let mut inner = self.inner.lock().expect("scheduler poisoned");
            if !inner.clients_to_objects.contains_key(&client) {
                return Err(SchedulerError::ShuttingDown);
            }

            let invoke_id = inner.next_invoke_id;
            inner.next_invoke_id += 1;

            let kind = object.kind();
            inner.clients_to_objects.get_mut(&client).expect("checked above").push(invoke_id);
            inner.object_to_client.insert(invoke_id, client);
            inner.ids_to_object.insert(invoke_id, object);
            drop(inner);

            self.send_kickoff(invoke_id, kind)?;
            invoke_id
        };

        Ok(invoke_id)
    }

    fn send_kickoff(&self, invoke_id: u64, kind: ObjectKind) -> Result<(), SchedulerError> {
        self.hub.push_kickoff(invoke_id, kind as u8).map_err(|_| SchedulerError::ShuttingDown)
    }

    /// Schedules `callback` to run on the main thread after `delay`,
    /// cancelled automatically if `client` is unregistered first.
    pub fn set_client_timeout(&self, client: ClientId, delay: Duration, callback: impl FnOnce() + Send + 'static) {
        let inner_arc = self.inner.clone();
        {
            let mut inner = self.inner.lock().expect("scheduler poisoned");
            inner.pending_timeouts.insert(client);
        }
        self.bridge.call_on_main_thread(delay, Box::new(move || {
            let still_pending = {
                let mut inner = inner_arc.lock().expect("scheduler poisoned");
                inner.pending_timeouts.remove(&client)
            };
            if still_pending {
                callback();
            }
        }));
    }

    /// Schedules `callback` to run on the main thread after `delay`, as
    /// long as `client` is still registered when the deadline arrives.
    pub fn call_on_main_thread(&self, client: ClientId, delay: Duration, callback: impl FnOnce() + Send + 'static) {
        let inner_arc = self.inner.clone();
        self.bridge.call_on_main_thread(delay, Box::new(move || {
            let still_registered = inner_arc.lock().expect("scheduler poisoned").clients_to_objects.contains_key(&client);
            if still_registered {
                callback();
            }
        }));
    }

    fn kill_zombies_locked(inner: &mut Inner) {
        inner.zombies.clear();
    }

    pub fn kill_zombies(&self) {
        let mut inner = self.inner.lock().expect("scheduler poisoned");
        Self::kill_zombies_locked(&mut inner);
    }

    /// Runs `object.step(outcome)` and applies the resulting
    /// finish/continue/release bookkeeping, re-dispatching a follow-up
    /// request through the hub if the step produced one.
    fn run_step(&self, invoke_id: u64, outcome: Option<Outcome>) {
        let (next, kind) = {
            let mut inner = self.inner.lock().expect("scheduler poisoned");

            if inner.detached.contains(&invoke_id) {
                Self::release_locked(&mut inner, invoke_id);
                return;
            }
            if !inner.object_to_client.contains_key(&invoke_id) {
                Self::release_locked(&mut inner, invoke_id);
                return;
            }

            let Some(object) = inner.ids_to_object.get_mut(&invoke_id) else { return };
            let kind = object.kind();
            let step_outcome = object.step(outcome);

            match step_outcome {
                StepOutcome::Finished => {
                    Self::release_locked(&mut inner, invoke_id);
                    return;
                }
                StepOutcome::Next(request) => (request, kind),
            }
        };

        let tag = kind as u8;
        if let Err(e) = self.hub.push(invoke_id, tag, next) {
            tracing::error!(invoke_id, error = %e, "failed to dispatch follow-up request to hub");
        }
    }

    fn release_locked(inner: &mut Inner, invoke_id: u64) {
        inner.detached.remove(&invoke_id);

        if let Some(client) = inner.object_to_client.remove(&invoke_id) {
            if let Some(ids) = inner.clients_to_objects.get_mut(&client) {
                ids.retain(|id| *id != invoke_id);
            }
        }

        if let Some(object) = inner.ids_to_object.remove(&invoke_id) {
            inner.zombies.push(object);
        }
    }

    /// Delivers a hub publication. Called from the bridge pump, which
    /// already runs on the main thread, so this can touch scheduler
    /// objects directly.
    pub fn handle_publication(&self, publication: Publication) {
        match publication {
            Publication::StepRequested { invoke_id, .. } => {
                self.run_step(invoke_id, None);
            }
            Publication::OneShotCompleted { invoke_id, outcome, .. } => {
                self.run_step(invoke_id, Some(outcome));
            }
            Publication::KeepAliveUnsolicited { invoke_id, outcome, .. } => {
                let mut inner = self.inner.lock().expect("scheduler poisoned");
                if let Some(object) = inner.ids_to_object.get_mut(&invoke_id) {
                    object.publish(vec![outcome]);
                }
            }
            Publication::KeepAliveDisconnected { invoke_id, .. } => {
                let should_release = {
                    let mut inner = self.inner.lock().expect("scheduler poisoned");
                    inner.ids_to_object.get_mut(&invoke_id).map(|o| o.disconnected()).unwrap_or(false)
                };
                if should_release {
                    let mut inner = self.inner.lock().expect("scheduler poisoned");
                    Self::release_locked(&mut inner, invoke_id);
                }
            }
        }
    }

    /// A step-request kickoff (the no-payload descriptor `push` sends)
    /// comes back through the hub as a bounce onto the main thread; this
    /// is the entry point bootstrap wiring should call from inside
    /// `Hub::spawn`'s publication closure whenever it observes one.
    pub fn run_initial_step(&self, invoke_id: u64) {
        self.run_step(invoke_id, None);
    }

    pub fn bridge(&self) -> &Bridge { &self.bridge }
    pub fn hub(&self) -> &HubHandle { &self.hub }
}
