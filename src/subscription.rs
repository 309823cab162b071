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

//! Cache pub/sub session with resilient reconnect. Ported from
//! `ev::redis::subscriptions::{Request,Manager}` (`request.cc`/`manager.cc`):
//! the channel/pattern context maps, the pending-command deque, and the
//! doubled-backoff reconnect loop keep their original shapes, folded into a
//! single `SchedulerObject` plus a manager that fans deliveries out to
//! clients.
//!
//! A `Subscription` is registered with the `Scheduler` exactly once per
//! process (the `SubscriptionsManager` below owns that single instance, per
//! §4.8). Its `step` is only ever called for the kickoff: every later
//! protocol exchange (a further `SUBSCRIBE`, a `PING`) is pushed straight at
//! the hub through the invoke id it was assigned, bypassing the normal
//! one-shot `Step` rendezvous, because a keep-alive device never "completes"
//! in the one-shot sense — it just keeps emitting unsolicited data.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use crate::bridge::Bridge;
use crate::hub::HubHandle;
use crate::outcome::{CacheEvent, DataObject, Outcome};
use crate::request::{LoggableContext, Mode, Request, Target};
use crate::scheduler::{ObjectKind, SchedulerObject, StepOutcome};

/// Mirrors the original's `k_status_strings_` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    NotSet,
    Subscribing,
    Subscribed,
    Unsubscribing,
    Unsubscribed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Subscribe,
    Unsubscribe,
    Ping,
}

#[derive(Debug, Clone)]
struct Context {
    command: Command,
    names: Vec<String>,
    pattern: bool,
}

impl Context {
    fn ping() -> Self {
        Context { command: Command::Ping, names: Vec::new(), pattern: false }
    }

    fn wire_command(&self) -> &'static str {
        match (self.command, self.pattern) {
            (Command::Subscribe, false) => "SUBSCRIBE",
            (Command::Subscribe, true) => "PSUBSCRIBE",
            (Command::Unsubscribe, false) => "UNSUBSCRIBE",
            (Command::Unsubscribe, true) => "PUNSUBSCRIBE",
            (Command::Ping, _) => "PING",
        }
    }

    fn payload(&self) -> Bytes {
        let mut line = self.wire_command().to_string();
        for name in &self.names {
            line.push(' ');
            line.push_str(name);
        }
        Bytes::from(line.into_bytes())
    }

    /// 20s for subscribe/unsubscribe commands, no timeout for pings — §4.8 Step.
    fn timeout(&self) -> Option<Duration> {
        match self.command {
            Command::Ping => None,
            _ => Some(Duration::from_millis(20_000)),
        }
    }
}

/// Sentinel file an operator can drop to escalate a stuck subscribe/unsubscribe
/// timeout into a process abort rather than a logged no-op, matching §4.8's
/// "optionally raises a process-level abort if an operator-placed sentinel
/// file exists".
pub const ABORT_SENTINEL_PATH: &str = "/tmp/evrt-subscription-abort";

fn check_timeout_sentinel(wire_command: &'static str, names: &[String]) {
    if std::path::Path::new(ABORT_SENTINEL_PATH).exists() {
        tracing::error!(command = wire_command, ?names, "subscription command timed out with abort sentinel present");
        std::process::abort();
    }
    tracing::warn!(command = wire_command, ?names, "subscription command timed out");
}

const RECONNECT_BASE: Duration = Duration::from_secs(2);
const RECONNECT_MAX: Duration = Duration::from_secs(32);

fn backoff_for(attempt: u32) -> Duration {
    let scaled = RECONNECT_BASE.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    scaled.min(RECONNECT_MAX)
}

// `Arc`, not `Box`: `publish`/`disconnected` need to snapshot the callbacks
// out of `clients` and drop the state lock *before* invoking them, since a
// callback that reenters (e.g. calling `unsubscribe` from inside
// `on_message`) would otherwise deadlock on its own mutex.
type MessageCallback = Arc<dyn Fn(&str, Option<&str>, &Bytes) + Send + Sync + 'static>;
type StatusCallback = Arc<dyn Fn(&str, Status) + Send + Sync + 'static>;
type LostCallback = Arc<dyn Fn() + Send + Sync + 'static>;

struct ClientLink {
    on_message: MessageCallback,
    on_status: StatusCallback,
    on_lost: LostCallback,
}

struct SharedState {
    channels: HashMap<String, Status>,
    patterns: HashMap<String, Status>,
    /// Names the application currently wants subscribed, independent of the
    /// last observed server status — tracked separately so a reconnect can
    /// tell "was subscribed, needs resubscribing" apart from "the caller
    /// explicitly unsubscribed this one, leave it alone" (§8's "no channel
    /// the caller unsubscribed is silently resubscribed" property).
    desired_channels: std::collections::HashSet<String>,
    desired_patterns: std::collections::HashSet<String>,
    pending: VecDeque<Context>,
    in_flight: Option<Context>,
    recovery_mode: bool,
    reconnect_attempt: u32,
    /// Client ids linked to each channel/pattern name, so `Publish` can fan a
    /// message out and `Disconnect`'s final-attempt path can be told who to
    /// notify. Keyed the same way regardless of plain vs. pattern name.
    links: HashMap<String, Vec<u64>>,
    clients: HashMap<u64, ClientLink>,
}

impl SharedState {
    fn new() -> Self {
        SharedState {
            channels: HashMap::new(),
            patterns: HashMap::new(),
            desired_channels: std::collections::HashSet::new(),
            desired_patterns: std::collections::HashSet::new(),
            pending: VecDeque::new(),
            in_flight: None,
            recovery_mode: false,
            reconnect_attempt: 0,
            links: HashMap::new(),
            clients: HashMap::new(),
        }
    }

    fn map_for(&mut self, pattern: bool) -> &mut HashMap<String, Status> {
        if pattern { &mut self.patterns } else { &mut self.channels }
    }

    fn desired_for(&mut self, pattern: bool) -> &mut std::collections::HashSet<String> {
        if pattern { &mut self.desired_patterns } else { &mut self.desired_channels }
    }
}

/// The `SchedulerObject` half of a subscription session. Owns the shared
/// state jointly with `SubscriptionHandle`/`SubscriptionsManager`, which is
/// what lets application code call `Subscribe`/`Unsubscribe` at any time,
/// not just from inside a `Step` callback.
pub struct Subscription {
    state: Arc<Mutex<SharedState>>,
    hub: HubHandle,
    bridge: Bridge,
    invoke_id: Arc<AtomicU64>,
    tag: u8,
    context: LoggableContext,
}

impl Subscription {
    fn dequeue_or_ping(state: &mut SharedState) -> Context {
        state.pending.pop_front().unwrap_or_else(Context::ping)
    }

    fn dispatch_next(&self) {
        dispatch_pending(&self.state, &self.context, &self.hub, &self.invoke_id, self.tag);
    }

    fn handle_ack(state: &mut SharedState, name: &str, pattern: bool, unsubscribed: bool) {
        let status = if unsubscribed { Status::Unsubscribed } else { Status::Subscribed };
        let link_name = name.to_string();
        state.map_for(pattern).insert(name.to_string(), status);
        if unsubscribed {
            state.links.remove(&link_name);
        }
        let matches_in_flight = state
            .in_flight
            .as_ref()
            .map(|c| c.names.iter().any(|n| n == name) && c.pattern == pattern)
            .unwrap_or(false);
        if matches_in_flight {
            state.in_flight = None;
        }
    }
}

fn build_request(context: &LoggableContext, ctx: &Context) -> Request {
    let mut request = Request::new(Target::KvCache, Mode::KeepAlive, context.clone(), ctx.payload());
    if let Some(timeout) = ctx.timeout() {
        let wire_command = ctx.wire_command();
        let names = ctx.names.clone();
        request = request.with_timeout(timeout, Box::new(move || check_timeout_sentinel(wire_command, &names)));
    }
    request
}

/// Sends the next queued command straight to the hub by invoke id, as long
/// as nothing is already in flight. Shared by the `SchedulerObject` side
/// (draining after a `publish`) and `SubscriptionHandle` (kicking off a
/// freshly-enqueued command from application code) so there is exactly one
/// place that decides "is it this command's turn" — two independent
/// dispatch paths checking `in_flight` separately would race each other.
fn dispatch_pending(state: &Arc<Mutex<SharedState>>, context: &LoggableContext, hub: &HubHandle, invoke_id: &Arc<AtomicU64>, tag: u8) {
    let ctx = {
        let mut guard = state.lock().expect("subscription state poisoned");
        if guard.in_flight.is_some() {
            return;
        }
        let ctx = guard.pending.pop_front().unwrap_or_else(Context::ping);
        guard.in_flight = Some(ctx.clone());
        ctx
    };

    let id = invoke_id.load(AtomicOrdering::Acquire);
    let request = build_request(context, &ctx);
    if let Err(e) = hub.push(id, tag, request) {
        tracing::error!(error = %e, "failed to dispatch subscription command to hub");
    }
}

impl SchedulerObject for Subscription {
    fn kind(&self) -> ObjectKind { ObjectKind::Subscription }

    fn step(&mut self, outcome: Option<Outcome>) -> StepOutcome {
        debug_assert!(outcome.is_none(), "subscription step is only ever driven as a kickoff");
        let mut state = self.state.lock().expect("subscription state poisoned");
        let ctx = Self::dequeue_or_ping(&mut state);
        state.in_flight = Some(ctx.clone());
        drop(state);
        StepOutcome::Next(build_request(&self.context, &ctx))
    }

    fn publish(&mut self, outcomes: Vec<Outcome>) {
        for outcome in outcomes {
            for data in outcome.into_data() {
                let DataObject::Cache(event) = data else { continue };
                match event {
                    CacheEvent::SubscribeAck { name, pattern } => {
                        let status_links: Vec<StatusCallback> = {
                            let mut state = self.state.lock().expect("subscription state poisoned");
                            Subscription::handle_ack(&mut state, &name, pattern, false);
                            state.clients.values().map(|link| link.on_status.clone()).collect()
                        };
                        for on_status in &status_links {
                            (on_status)(&name, Status::Subscribed);
                        }
                    }
                    CacheEvent::UnsubscribeAck { name, pattern } => {
                        let status_links: Vec<StatusCallback> = {
                            let mut state = self.state.lock().expect("subscription state poisoned");
                            Subscription::handle_ack(&mut state, &name, pattern, true);
                            state.clients.values().map(|link| link.on_status.clone()).collect()
                        };
                        for on_status in &status_links {
                            (on_status)(&name, Status::Unsubscribed);
                        }
                    }
                    CacheEvent::Message { channel, pattern, payload } => {
                        let message_links: Vec<MessageCallback> = {
                            let state = self.state.lock().expect("subscription state poisoned");
                            let key = pattern.as_deref().unwrap_or(&channel);
                            state
                                .links
                                .get(key)
                                .into_iter()
                                .flatten()
                                .filter_map(|client_id| state.clients.get(client_id).map(|link| link.on_message.clone()))
                                .collect()
                        };
                        for on_message in &message_links {
                            (on_message)(&channel, pattern.as_deref(), &payload);
                        }
                    }
                    CacheEvent::Pong => {
                        let status_links: Vec<(String, bool, StatusCallback)> = {
                            let mut state = self.state.lock().expect("subscription state poisoned");
                            state.in_flight = None;
                            let mut fired = Vec::new();
                            if state.recovery_mode {
                                state.recovery_mode = false;
                                state.reconnect_attempt = 0;
                                // Only resubscribe names the caller still wants subscribed —
                                // a name the caller explicitly unsubscribed before the
                                // disconnect must not come back on reconnect.
                                let channels: Vec<String> = state.desired_channels.iter().cloned().collect();
                                let patterns: Vec<String> = state.desired_patterns.iter().cloned().collect();
                                let callbacks: Vec<StatusCallback> = state.clients.values().map(|link| link.on_status.clone()).collect();
                                for name in channels {
                                    state.channels.insert(name.clone(), Status::Subscribing);
                                    state.pending.push_back(Context { command: Command::Subscribe, names: vec![name.clone()], pattern: false });
                                    for cb in &callbacks {
                                        fired.push((name.clone(), false, cb.clone()));
                                    }
                                }
                                for name in patterns {
                                    state.patterns.insert(name.clone(), Status::Subscribing);
                                    state.pending.push_back(Context { command: Command::Subscribe, names: vec![name.clone()], pattern: true });
                                    for cb in &callbacks {
                                        fired.push((name.clone(), true, cb.clone()));
                                    }
                                }
                            }
                            fired
                        };
                        for (name, _pattern, on_status) in &status_links {
                            (on_status)(name, Status::Subscribing);
                        }
                        self.dispatch_next();
                    }
                }
            }
        }

        self.dispatch_next();
    }

    /// A keep-alive subscription never voluntarily releases itself: §4.8's
    /// Disconnect paragraph describes a standing reconnect loop, not a
    /// terminal state. The scheduler keeps this object registered and we
    /// re-arm a fresh connection attempt through the bridge.
    fn disconnected(&mut self) -> bool {
        let (delay, attempt, cap_reached, unsubscribed_links) = {
            let mut state = self.state.lock().expect("subscription state poisoned");
            state.pending.clear();
            state.in_flight = None;
            state.recovery_mode = true;
            let attempt = state.reconnect_attempt;
            state.reconnect_attempt = state.reconnect_attempt.saturating_add(1);
            let delay = backoff_for(attempt);
            let cap_reached = delay >= RECONNECT_MAX;

            // Every channel/pattern still showing a connected status lost its
            // subscription along with the connection; tell callers so they
            // observe Unsubscribed before the recovery resubscribe drives them
            // back to Subscribing (§8 scenario 5).
            let mut newly_unsubscribed: Vec<(String, bool)> = Vec::new();
            for (name, status) in state.channels.iter_mut() {
                if *status != Status::Unsubscribed {
                    *status = Status::Unsubscribed;
                    newly_unsubscribed.push((name.clone(), false));
                }
            }
            for (name, status) in state.patterns.iter_mut() {
                if *status != Status::Unsubscribed {
                    *status = Status::Unsubscribed;
                    newly_unsubscribed.push((name.clone(), true));
                }
            }
            let callbacks: Vec<StatusCallback> = state.clients.values().map(|link| link.on_status.clone()).collect();
            let unsubscribed_links: Vec<(String, StatusCallback)> = newly_unsubscribed
                .into_iter()
                .flat_map(|(name, _pattern)| callbacks.iter().cloned().map(move |cb| (name.clone(), cb)))
                .collect();

            (delay, attempt, cap_reached, unsubscribed_links)
        };

        for (name, on_status) in &unsubscribed_links {
            (on_status)(name, Status::Unsubscribed);
        }

        tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, "cache connection lost, scheduling reconnect ping");

        if cap_reached {
            let lost_links: Vec<LostCallback> = {
                let mut state = self.state.lock().expect("subscription state poisoned");
                state.links.clear();
                state.reconnect_attempt = 0;
                state.clients.values().map(|link| link.on_lost.clone()).collect()
            };
            for on_lost in &lost_links {
                (on_lost)();
            }
        }

        let hub = self.hub.clone();
        let invoke_id = self.invoke_id.clone();
        let tag = self.tag;
        let context = self.context.clone();
        self.bridge.call_on_main_thread(delay, Box::new(move || {
            let request = build_request(&context, &Context::ping());
            let id = invoke_id.load(AtomicOrdering::Acquire);
            let _ = hub.push(id, tag, request);
        }));

        false
    }
}

/// Handle used by application code (via `SubscriptionsManager`) to drive a
/// running `Subscription` without going through `Scheduler::push` again —
/// subscribe/unsubscribe calls made after the session is already open are
/// dispatched straight to the hub by invoke id, the same way the original
/// forwards a further command onto an already-open connection.
#[derive(Clone)]
pub struct SubscriptionHandle {
    state: Arc<Mutex<SharedState>>,
    hub: HubHandle,
    invoke_id: Arc<AtomicU64>,
    tag: u8,
    context: LoggableContext,
}

impl SubscriptionHandle {
    fn dispatch(&self) {
        dispatch_pending(&self.state, &self.context, &self.hub, &self.invoke_id, self.tag);
    }

    fn enqueue(&self, command: Command, names: Vec<String>, pattern: bool) {
        if names.is_empty() {
            return;
        }
        {
            let mut state = self.state.lock().expect("subscription state poisoned");
            let desired_status = match command {
                Command::Subscribe => Status::Subscribing,
                Command::Unsubscribe => Status::Unsubscribing,
                Command::Ping => Status::NotSet,
            };
            for name in &names {
                state.map_for(pattern).entry(name.clone()).or_insert(desired_status);
            }
            match command {
                Command::Subscribe => {
                    let desired = state.desired_for(pattern);
                    for name in &names {
                        desired.insert(name.clone());
                    }
                }
                Command::Unsubscribe => {
                    let desired = state.desired_for(pattern);
                    for name in &names {
                        desired.remove(name);
                    }
                }
                Command::Ping => {}
            }
            state.pending.push_back(Context { command, names, pattern });
        }
        self.dispatch();
    }

    pub fn subscribe(&self, names: Vec<String>, client: u64) {
        {
            let mut state = self.state.lock().expect("subscription state poisoned");
            for name in &names {
                state.links.entry(name.clone()).or_default().push(client);
            }
        }
        self.enqueue(Command::Subscribe, names, false);
    }

    pub fn unsubscribe(&self, names: Vec<String>) {
        self.enqueue(Command::Unsubscribe, names, false);
    }

    pub fn psubscribe(&self, patterns: Vec<String>, client: u64) {
        {
            let mut state = self.state.lock().expect("subscription state poisoned");
            for name in &patterns {
                state.links.entry(name.clone()).or_default().push(client);
            }
        }
        self.enqueue(Command::Subscribe, patterns, true);
    }

    pub fn punsubscribe(&self, patterns: Vec<String>) {
        self.enqueue(Command::Unsubscribe, patterns, true);
    }

    /// Idempotent: a ping already in flight or already queued is not
    /// duplicated (§4.8 Ping).
    pub fn ping(&self) {
        let should_enqueue = {
            let mut state = self.state.lock().expect("subscription state poisoned");
            let already_pending = state.pending.iter().any(|c| c.command == Command::Ping);
            let already_in_flight = matches!(state.in_flight, Some(ref c) if c.command == Command::Ping);
            if !already_pending && !already_in_flight {
                state.pending.push_back(Context::ping());
                true
            } else {
                false
            }
        };
        if should_enqueue {
            self.dispatch();
        }
    }

    pub fn status_of(&self, name: &str, pattern: bool) -> Status {
        let state = self.state.lock().expect("subscription state poisoned");
        let map = if pattern { &state.patterns } else { &state.channels };
        map.get(name).copied().unwrap_or(Status::NotSet)
    }

    fn register_client(
        &self,
        client: u64,
        on_message: MessageCallback,
        on_status: StatusCallback,
        on_lost: LostCallback,
    ) {
        let mut state = self.state.lock().expect("subscription state poisoned");
        state.clients.insert(client, ClientLink { on_message, on_status, on_lost });
    }

    fn unregister_client(&self, client: u64) {
        let mut state = self.state.lock().expect("subscription state poisoned");
        state.clients.remove(&client);
        for ids in state.links.values_mut() {
            ids.retain(|id| *id != client);
        }
    }
}

/// Per-process singleton coordinating channel/pattern subscriptions across
/// many clients on top of a single long-lived `Subscription` object
/// (§4.8). Construct once at bootstrap and register every client that wants
/// to receive cache pub/sub traffic through it.
pub struct SubscriptionsManager {
    handle: SubscriptionHandle,
}

impl SubscriptionsManager {
    /// Registers the singleton `Subscription` with `scheduler` under
    /// `client`. There is exactly one of these per process; callers
    /// typically register it under a dedicated internal client id created
    /// at bootstrap, distinct from per-connection client ids.
    pub fn start(scheduler: &crate::scheduler::Scheduler, client: u64, context: LoggableContext) -> Self {
        let state = Arc::new(Mutex::new(SharedState::new()));
        let invoke_id_cell = Arc::new(AtomicU64::new(0));
        let tag = ObjectKind::Subscription as u8;

        let object = Subscription {
            state: state.clone(),
            hub: scheduler.hub().clone(),
            bridge: scheduler.bridge().clone(),
            invoke_id: invoke_id_cell.clone(),
            tag,
            context: context.clone(),
        };

        let invoke_id = scheduler
            .push(client, Box::new(object))
            .expect("subscriptions manager client must be registered before start");
        invoke_id_cell.store(invoke_id, AtomicOrdering::Release);

        let handle = SubscriptionHandle { state, hub: scheduler.hub().clone(), invoke_id: invoke_id_cell, tag, context };
        SubscriptionsManager { handle }
    }

    pub fn subscribe(&self, client: u64, names: Vec<String>, on_message: MessageCallback, on_status: StatusCallback, on_lost: LostCallback) {
        self.handle.register_client(client, on_message, on_status, on_lost);
        self.handle.subscribe(names, client);
    }

    pub fn unsubscribe(&self, names: Vec<String>) {
        self.handle.unsubscribe(names);
    }

    pub fn psubscribe(&self, client: u64, patterns: Vec<String>, on_message: MessageCallback, on_status: StatusCallback, on_lost: LostCallback) {
        self.handle.register_client(client, on_message, on_status, on_lost);
        self.handle.psubscribe(patterns, client);
    }

    pub fn punsubscribe(&self, patterns: Vec<String>) {
        self.handle.punsubscribe(patterns);
    }

    pub fn ping(&self) {
        self.handle.ping();
    }

    pub fn unregister_client(&self, client: u64) {
        self.handle.unregister_client(client);
    }

    pub fn status_of(&self, name: &str, pattern: bool) -> Status {
        self.handle.status_of(name, pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_for(0), Duration::from_secs(2));
        assert_eq!(backoff_for(1), Duration::from_secs(4));
        assert_eq!(backoff_for(2), Duration::from_secs(8));
        assert_eq!(backoff_for(3), Duration::from_secs(16));
        assert_eq!(backoff_for(4), Duration::from_secs(32));
        assert_eq!(backoff_for(5), Duration::from_secs(32));
    }

    #[test]
    fn ack_updates_status_and_clears_in_flight() {
        let mut state = SharedState::new();
        state.in_flight = Some(Context { command: Command::Subscribe, names: vec!["a".into()], pattern: false });
        Subscription::handle_ack(&mut state, "a", false, false);
        assert_eq!(state.channels.get("a"), Some(&Status::Subscribed));
        assert!(state.in_flight.is_none());
    }

    #[test]
    fn unsubscribe_ack_drops_links() {
        let mut state = SharedState::new();
        state.links.insert("a".to_string(), vec![1, 2]);
        Subscription::handle_ack(&mut state, "a", false, true);
        assert_eq!(state.channels.get("a"), Some(&Status::Unsubscribed));
        assert!(!state.links.contains_key("a"));
    }

    /// §8 scenario 5: a channel still subscribed when the connection drops
    /// must transition to `Unsubscribed` so the caller's status callback
    /// observes it, ahead of the recovery resubscribe driving it back to
    /// `Subscribing`.
    #[test]
    fn disconnect_marks_subscribed_channels_unsubscribed_but_leaves_already_unsubscribed_ones_alone() {
        let mut state = SharedState::new();
        state.channels.insert("a".to_string(), Status::Subscribed);
        state.channels.insert("b".to_string(), Status::Unsubscribed);
        state.desired_channels.insert("a".to_string());

        let mut newly_unsubscribed = Vec::new();
        for (name, status) in state.channels.iter_mut() {
            if *status != Status::Unsubscribed {
                *status = Status::Unsubscribed;
                newly_unsubscribed.push(name.clone());
            }
        }

        assert_eq!(newly_unsubscribed, vec!["a".to_string()], "only the still-subscribed channel fires a fresh transition");
        assert_eq!(state.channels.get("a"), Some(&Status::Unsubscribed));
        assert_eq!(state.channels.get("b"), Some(&Status::Unsubscribed));
    }

    /// A channel the caller explicitly unsubscribed is removed from the
    /// desired set at request time, so a later reconnect's resubscribe pass
    /// (which only walks `desired_channels`/`desired_patterns`) skips it even
    /// though it's still present in `channels` with status `Unsubscribed`.
    #[test]
    fn unsubscribe_removes_the_name_from_the_desired_set() {
        let mut state = SharedState::new();
        state.desired_channels.insert("a".to_string());
        state.desired_channels.insert("b".to_string());

        state.desired_for(false).remove("a");

        assert!(!state.desired_channels.contains("a"));
        assert!(state.desired_channels.contains("b"), "unsubscribing one channel must not touch another");
    }

    #[test]
    fn subscribe_adds_to_the_desired_set_so_a_later_reconnect_would_resubscribe_it() {
        let mut state = SharedState::new();
        state.desired_for(true).insert("news.*".to_string());
        assert!(state.desired_patterns.contains("news.*"));
    }
}
