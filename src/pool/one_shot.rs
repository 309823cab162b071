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

//! Request/reply device pooling. A device is checked out of `cached` (or
//! built fresh), bound to exactly one request, and returned to `cached`
//! (or killed) once that request settles. Ported from
//! `ev::hub::OneShotHandler` (`one_shot_handler.cc`): `pending`/`completed`/
//! `rejected` map to the same-named FIFOs there, and `SanityCheck` is kept
//! as a standing debug-only invariant check rather than just a tested
//! property.

use std::collections::{HashMap, VecDeque};

use fnv::FnvHashMap;
use tokio::sync::mpsc::UnboundedSender;

use crate::device::{Device, DeviceFactory, DeviceId};
use crate::pool::{limit_for, sample_reuse_cap, HubEvent, Limits, ReuseLimits};
use crate::request::{Request, Target};

struct PendingOneShot {
    invoke_id: u64,
    tag: u8,
    request: Request,
}

/// A request that has finished executing (successfully or not) and is
/// waiting for the hub to publish it back to the scheduler.
pub struct CompletedOneShot {
    pub invoke_id: u64,
    pub tag: u8,
    pub request: Request,
    pub outcome: crate::outcome::Outcome,
}

pub struct OneShotHandler {
    factories: HashMap<Target, Box<dyn DeviceFactory>>,
    limits: Limits,
    reuse_limits: ReuseLimits,

    pending: VecDeque<PendingOneShot>,
    completed: VecDeque<CompletedOneShot>,

    /// Each cached device carries the number of further checkouts it's
    /// allowed before `reuse_remaining` forces it to zombies instead —
    /// `None` means no cap (the common case when `max_queries_per_conn` is
    /// unset for the target).
    cached: HashMap<Target, Vec<(Box<dyn Device>, Option<u32>)>>,
    in_use_count: HashMap<Target, usize>,

    request_device: FnvHashMap<u64, DeviceId>,
    device_request: FnvHashMap<usize, u64>,
    /// Remaining-checkouts budget for the device currently bound to each
    /// invoke id, keyed by `DeviceId`. Populated in `start`, consumed in
    /// `dispose_device`.
    reuse_remaining: FnvHashMap<usize, Option<u32>>,
    next_device_id: usize,

    /// Bumped per-target by an `Invalidate` request. A device stamps the
    /// epoch current at the moment it's checked out in `in_use_epoch`; if
    /// that stamp is stale by the time the device completes, it's zombied
    /// instead of cached regardless of `Device::is_reusable`. This is what
    /// makes "no subsequent request on T reuses any device that existed
    /// before the invalidation" hold even though in-use devices live
    /// inside spawned tasks this handler no longer has a live reference
    /// into.
    invalidation_epoch: HashMap<Target, u64>,
    in_use_epoch: FnvHashMap<u64, u64>,

    zombies: Vec<Box<dyn Device>>,

    events_tx: UnboundedSender<HubEvent>,
}

impl OneShotHandler {
    pub fn new(
        factories: HashMap<Target, Box<dyn DeviceFactory>>,
        limits: Limits,
        reuse_limits: ReuseLimits,
        events_tx: UnboundedSender<HubEvent>,
    ) -> Self {
        OneShotHandler {
            factories,
            limits,
            reuse_limits,
            pending: VecDeque::new(),
            completed: VecDeque::new(),
            cached: HashMap::new(),
            in_use_count: HashMap::new(),
            request_device: FnvHashMap::default(),
            device_request: FnvHashMap::default(),
            reuse_remaining: FnvHashMap::default(),
            next_device_id: 0,
            invalidation_epoch: HashMap::new(),
            in_use_epoch: FnvHashMap::default(),
            zombies: Vec::new(),
            events_tx,
        }
    }

    /// Enqueues a new one-shot request. Does not itself start execution;
    /// the hub calls `drain` after every push and on every idle tick.
    pub fn push(&mut self, invoke_id: u64, tag: u8, request: Request) {
        self.pending.push_back(PendingOneShot { invoke_id, tag, request });
    }

    /// Attempts to start as many pending requests as capacity allows.
    /// Requests that can't start yet (target at capacity) stay in place so
    /// ordering within a target is preserved; requests behind them for a
    /// *different*, non-saturated target are still allowed through, just
    /// like the original's scan-don't-stall drain loop.
    pub fn drain(&mut self) {
        self.kill_zombies();

        let mut i = 0;
        while i < self.pending.len() {
            let target = self.pending[i].request.target();
            if target == Target::NotSet {
                // Malformed request; the hub treats this as fatal upstream,
                // but we don't have that many invariants to protect here so
                // just drop it out of the queue defensively.
                self.pending.remove(i);
                continue;
            }

            if self.pending[i].request.is_invalidating() && matches!(target, Target::KvCache | Target::Sql) {
                let PendingOneShot { invoke_id, tag, request } = self.pending.remove(i).expect("checked len above");
                self.invalidate_target(target);
                // Synthetic success: an invalidate request never touches a
                // device, it just salts the pool so nothing after it reuses
                // a pre-invalidation connection.
                self.completed.push_back(CompletedOneShot { invoke_id, tag, request, outcome: crate::outcome::Outcome::new(target) });
                continue;
            }

            let limit = limit_for(&self.limits, target);
            let in_use = self.in_use_count.get(&target).copied().unwrap_or(0);
            if in_use >= limit {
                i += 1;
                continue;
            }

            let PendingOneShot { invoke_id, tag, request } = self.pending.remove(i).expect("checked len above");
            self.start(invoke_id, tag, request, target);
        }

        self.sanity_check();
    }

    fn start(&mut self, invoke_id: u64, tag: u8, request: Request, target: Target) {
        let (mut device, reuse_remaining) = match self.cached.get_mut(&target).and_then(|v| v.pop()) {
            Some((device, remaining)) => (device, remaining),
            None => match self.factories.get(&target) {
                Some(factory) => (factory.create(request.context().clone()), sample_reuse_cap(&self.reuse_limits, target)),
                None => {
                    tracing::error!(?target, "no device factory registered, rejecting request");
                    let mut outcome = crate::outcome::Outcome::new(target);
                    outcome.attach(crate::outcome::DataObject::Error(crate::errors::BackendError::new(
                        "no device factory registered for target",
                    )));
                    self.completed.push_back(CompletedOneShot { invoke_id, tag, request, outcome });
                    return;
                }
            },
        };

        let device_id = DeviceId(self.next_device_id);
        self.next_device_id += 1;
        *self.in_use_count.entry(target).or_insert(0) += 1;
        self.request_device.insert(invoke_id, device_id);
        self.device_request.insert(device_id.0, invoke_id);
        self.reuse_remaining.insert(device_id.0, reuse_remaining);
        self.in_use_epoch.insert(device_id.0 as u64, self.invalidation_epoch.get(&target).copied().unwrap_or(0));

        let tx = self.events_tx.clone();
        tokio::task::spawn_local(async move {
            let connect_result = device.connect().await;
            if let Err(error) = connect_result {
                let _ = tx.send(HubEvent::OneShotConnectFailed { invoke_id, tag, device_id, request, error });
                return;
            }

            let outcome = device.execute(&request).await;
            let _ = tx.send(HubEvent::OneShotSettled { invoke_id, tag, device_id, device, request, outcome });
        });
    }

    /// Marks every cached-or-in-use device of `target` as ineligible for
    /// reuse (§4.2 Invalidate). Cached devices are purged outright;
    /// in-use devices can't be reached directly (they're owned by their
    /// spawned task), so they're fenced by epoch instead — see
    /// `invalidation_epoch`.
    fn invalidate_target(&mut self, target: Target) {
        *self.invalidation_epoch.entry(target).or_insert(0) += 1;
        self.cached.remove(&target);
    }

    /// Applies the result of a settled (or connect-failed) request:
    /// releases the device back to `cached` or `zombies`, and queues the
    /// outcome for publication.
    pub fn settle(&mut self, invoke_id: u64, tag: u8, device_id: DeviceId, mut device: Box<dyn Device>, request: Request, result: Result<crate::outcome::Outcome, crate::errors::DeviceError>) {
        let target = request.target();
        let reuse_remaining = self.reuse_remaining.get(&device_id.0).copied().flatten();
        let stale = self.release_device_slot(target, invoke_id, device_id);

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                let mut outcome = crate::outcome::Outcome::new(target);
                outcome.attach(crate::outcome::DataObject::Error((&e).into()));
                device.invalidate_reuse();
                outcome
            }
        };

        self.dispose_device(target, reuse_remaining, device, stale);
        self.completed.push_back(CompletedOneShot { invoke_id, tag, request, outcome });
    }

    pub fn connect_failed(&mut self, invoke_id: u64, tag: u8, device_id: DeviceId, request: Request, error: crate::errors::DeviceError) {
        let target = request.target();
        self.release_device_slot(target, invoke_id, device_id);

        let mut outcome = crate::outcome::Outcome::new(target);
        outcome.attach(crate::outcome::DataObject::Error((&error).into()));
        self.completed.push_back(CompletedOneShot { invoke_id, tag, request, outcome });
    }

    /// Returns `true` if the device being released was checked out before
    /// the target's current invalidation epoch, i.e. it must not go back
    /// to `cached` no matter what `Device::is_reusable` says.
    fn release_device_slot(&mut self, target: Target, invoke_id: u64, device_id: DeviceId) -> bool {
        self.request_device.remove(&invoke_id);
        self.device_request.remove(&device_id.0);
        self.reuse_remaining.remove(&device_id.0);
        if let Some(count) = self.in_use_count.get_mut(&target) {
            *count = count.saturating_sub(1);
        }
        let checkout_epoch = self.in_use_epoch.remove(&(device_id.0 as u64)).unwrap_or(0);
        let current_epoch = self.invalidation_epoch.get(&target).copied().unwrap_or(0);
        checkout_epoch < current_epoch
    }

    fn dispose_device(&mut self, target: Target, reuse_remaining: Option<u32>, device: Box<dyn Device>, stale: bool) {
        let reuse_remaining = reuse_remaining.map(|n| n.saturating_sub(1));
        let reuse_exhausted = matches!(reuse_remaining, Some(0));

        if !stale && !reuse_exhausted && device.is_reusable() {
            self.cached.entry(target).or_default().push((device, reuse_remaining));
        } else {
            tracing::debug!(?target, stale, reuse_exhausted, "device not reusable, moving to zombies");
            self.zombies.push(device);
        }
    }

    /// Drops every zombied device. Called once per idle tick; deferred
    /// rather than dropped inline so a device never disappears out from
    /// under a callback still referencing its id in this same tick.
    pub fn kill_zombies(&mut self) {
        self.zombies.clear();
    }

    /// Drains completed requests for publication back to the scheduler.
    pub fn drain_completed(&mut self) -> Vec<CompletedOneShot> {
        self.completed.drain(..).collect()
    }

    pub fn pending_len(&self) -> usize { self.pending.len() }

    fn sanity_check(&self) {
        debug_assert_eq!(
            self.request_device.len(),
            self.device_request.len(),
            "request<->device binding maps must have equal cardinality"
        );
        let total_bound: usize = self.in_use_count.values().sum();
        debug_assert_eq!(
            total_bound,
            self.request_device.len(),
            "in-use counts must match number of bound requests"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use async_trait::async_trait;
    use bytes::Bytes;

    use crate::device::{ConnectionStatus, FnDeviceFactory};
    use crate::errors::DeviceError;
    use crate::request::{Control, LoggableContext, Mode};

    struct CountingDevice {
        context: LoggableContext,
        reusable: bool,
    }

    #[async_trait(?Send)]
    impl Device for CountingDevice {
        fn context(&self) -> &LoggableContext { &self.context }

        async fn connect(&mut self) -> Result<ConnectionStatus, DeviceError> {
            Ok(ConnectionStatus::Connected)
        }

        async fn execute(&mut self, _request: &Request) -> Result<crate::outcome::Outcome, DeviceError> {
            Ok(crate::outcome::Outcome::single(Target::Sql, crate::outcome::DataObject::Reply(Bytes::from_static(b"1"))))
        }

        fn is_reusable(&self) -> bool { self.reusable }
        fn invalidate_reuse(&mut self) { self.reusable = false; }
        fn status(&self) -> ConnectionStatus { ConnectionStatus::Connected }
    }

    struct CountingFactory {
        created: Arc<AtomicUsize>,
    }

    impl DeviceFactory for CountingFactory {
        fn create(&self, context: LoggableContext) -> Box<dyn Device> {
            self.created.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Box::new(CountingDevice { context, reusable: true })
        }
    }

    struct StallingDevice {
        context: LoggableContext,
    }

    #[async_trait(?Send)]
    impl Device for StallingDevice {
        fn context(&self) -> &LoggableContext { &self.context }

        async fn connect(&mut self) -> Result<ConnectionStatus, DeviceError> {
            std::future::pending::<()>().await;
            unreachable!("test never lets this resolve")
        }

        async fn execute(&mut self, _request: &Request) -> Result<crate::outcome::Outcome, DeviceError> {
            unreachable!("connect never resolves, so execute is never reached")
        }

        fn is_reusable(&self) -> bool { true }
        fn invalidate_reuse(&mut self) {}
        fn status(&self) -> ConnectionStatus { ConnectionStatus::Connected }
    }

    struct FailingConnectDevice {
        context: LoggableContext,
    }

    #[async_trait(?Send)]
    impl Device for FailingConnectDevice {
        fn context(&self) -> &LoggableContext { &self.context }

        async fn connect(&mut self) -> Result<ConnectionStatus, DeviceError> {
            Err(DeviceError::ConnectionFailed(std::io::Error::new(std::io::ErrorKind::Other, "refused")))
        }

        async fn execute(&mut self, _request: &Request) -> Result<crate::outcome::Outcome, DeviceError> {
            unreachable!("connect fails before execute is ever called")
        }

        fn is_reusable(&self) -> bool { true }
        fn invalidate_reuse(&mut self) {}
        fn status(&self) -> ConnectionStatus { ConnectionStatus::Error }
    }

    fn sql_request() -> Request {
        Request::new(Target::Sql, Mode::OneShot, LoggableContext::default(), Bytes::new())
    }

    async fn settle_one(handler: &mut OneShotHandler, events_rx: &mut tokio::sync::mpsc::UnboundedReceiver<HubEvent>) {
        match events_rx.recv().await.expect("event") {
            HubEvent::OneShotSettled { invoke_id, tag, device_id, device, request, outcome } => {
                handler.settle(invoke_id, tag, device_id, device, request, outcome);
            }
            HubEvent::OneShotConnectFailed { invoke_id, tag, device_id, request, error } => {
                handler.connect_failed(invoke_id, tag, device_id, request, error);
            }
            _ => panic!("unexpected event for a one-shot request"),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn happy_path_reuses_a_single_device_across_sequential_requests() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let created = Arc::new(AtomicUsize::new(0));
                let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
                let mut factories: HashMap<Target, Box<dyn DeviceFactory>> = HashMap::new();
                factories.insert(Target::Sql, Box::new(CountingFactory { created: created.clone() }));
                let mut limits = Limits::new();
                limits.insert(Target::Sql, 1);
                let mut handler = OneShotHandler::new(factories, limits, ReuseLimits::new(), events_tx);

                for i in 0..3u64 {
                    handler.push(i, 0, sql_request());
                    handler.drain();
                    settle_one(&mut handler, &mut events_rx).await;

                    let completed = handler.drain_completed();
                    assert_eq!(completed.len(), 1);
                    assert!(!completed[0].outcome.is_error());
                }

                assert_eq!(created.load(std::sync::atomic::Ordering::SeqCst), 1, "one device must serve all three sequential requests");
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn pool_cap_limits_concurrent_checkouts_and_queues_the_rest() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (events_tx, _events_rx) = tokio::sync::mpsc::unbounded_channel();
                let mut factories: HashMap<Target, Box<dyn DeviceFactory>> = HashMap::new();
                factories.insert(
                    Target::Sql,
                    Box::new(FnDeviceFactory(|ctx| Box::new(StallingDevice { context: ctx }) as Box<dyn Device>)),
                );
                let mut limits = Limits::new();
                limits.insert(Target::Sql, 2);
                let mut handler = OneShotHandler::new(factories, limits, ReuseLimits::new(), events_tx);

                for i in 0..5u64 {
                    handler.push(i, 0, sql_request());
                }
                handler.drain();

                assert_eq!(handler.in_use_count.get(&Target::Sql).copied().unwrap_or(0), 2, "in-use must peak at the configured cap");
                assert_eq!(handler.pending_len(), 3, "requests beyond the cap stay queued");
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn zero_capacity_target_leaves_every_request_pending() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (events_tx, _events_rx) = tokio::sync::mpsc::unbounded_channel();
                let mut factories: HashMap<Target, Box<dyn DeviceFactory>> = HashMap::new();
                factories.insert(
                    Target::Sql,
                    Box::new(FnDeviceFactory(|ctx| Box::new(StallingDevice { context: ctx }) as Box<dyn Device>)),
                );
                let mut limits = Limits::new();
                limits.insert(Target::Sql, 0);
                let mut handler = OneShotHandler::new(factories, limits, ReuseLimits::new(), events_tx);

                handler.push(1, 0, sql_request());
                handler.drain();
                assert_eq!(handler.pending_len(), 1);
                assert_eq!(handler.in_use_count.get(&Target::Sql).copied().unwrap_or(0), 0);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn connect_failure_rejects_the_request_and_frees_its_slot() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
                let mut factories: HashMap<Target, Box<dyn DeviceFactory>> = HashMap::new();
                factories.insert(
                    Target::Sql,
                    Box::new(FnDeviceFactory(|ctx| Box::new(FailingConnectDevice { context: ctx }) as Box<dyn Device>)),
                );
                let mut limits = Limits::new();
                limits.insert(Target::Sql, 1);
                let mut handler = OneShotHandler::new(factories, limits, ReuseLimits::new(), events_tx);

                handler.push(1, 0, sql_request());
                handler.drain();
                settle_one(&mut handler, &mut events_rx).await;

                let completed = handler.drain_completed();
                assert_eq!(completed.len(), 1);
                assert!(completed[0].outcome.is_error());
                assert_eq!(handler.in_use_count.get(&Target::Sql).copied().unwrap_or(0), 0, "the slot must be freed after a connect failure");
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn reuse_cap_retires_a_device_after_its_fixed_checkout_budget() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let created = Arc::new(AtomicUsize::new(0));
                let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
                let mut factories: HashMap<Target, Box<dyn DeviceFactory>> = HashMap::new();
                factories.insert(Target::Sql, Box::new(CountingFactory { created: created.clone() }));
                let mut limits = Limits::new();
                limits.insert(Target::Sql, 1);
                let mut reuse_limits = ReuseLimits::new();
                reuse_limits.insert(Target::Sql, (2, 2));
                let mut handler = OneShotHandler::new(factories, limits, reuse_limits, events_tx);

                for i in 0..5u64 {
                    handler.push(i, 0, sql_request());
                    handler.drain();
                    settle_one(&mut handler, &mut events_rx).await;
                    handler.drain_completed();
                }

                assert_eq!(created.load(std::sync::atomic::Ordering::SeqCst), 3, "5 queries at cap 2 means device creations of 2+2+1");
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn invalidate_purges_the_cache_and_completes_synchronously() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let created = Arc::new(AtomicUsize::new(0));
                let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
                let mut factories: HashMap<Target, Box<dyn DeviceFactory>> = HashMap::new();
                factories.insert(Target::Sql, Box::new(CountingFactory { created: created.clone() }));
                let mut limits = Limits::new();
                limits.insert(Target::Sql, 2);
                let mut handler = OneShotHandler::new(factories, limits, ReuseLimits::new(), events_tx);

                handler.push(1, 0, sql_request());
                handler.drain();
                settle_one(&mut handler, &mut events_rx).await;
                handler.drain_completed();
                assert_eq!(handler.cached.get(&Target::Sql).map(Vec::len).unwrap_or(0), 1, "a reusable device goes back to cached");

                let invalidating = sql_request().with_control(Control::Invalidate);
                handler.push(2, 0, invalidating);
                handler.drain();
                let completed = handler.drain_completed();
                assert_eq!(completed.len(), 1, "an invalidate request completes without touching a device");
                assert!(!completed[0].outcome.is_error());
                assert!(handler.cached.get(&Target::Sql).map(Vec::is_empty).unwrap_or(true), "invalidate purges the cached pool");

                handler.push(3, 0, sql_request());
                handler.drain();
                settle_one(&mut handler, &mut events_rx).await;
                handler.drain_completed();

                assert_eq!(created.load(std::sync::atomic::Ordering::SeqCst), 2, "no request after Invalidate may reuse the pre-invalidation device");
            })
            .await;
    }
}
