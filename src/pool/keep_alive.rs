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

//! Long-lived device pooling for subscriptions. Unlike `OneShotHandler`, a
//! keep-alive device is bound to its request for the request's entire
//! life: one `Device::connect` + one `Device::execute` (to send the
//! SUBSCRIBE-equivalent payload) followed by an open-ended stream of
//! unsolicited messages. Reconnect policy (backoff, replay) is the
//! `Subscription` object's job on the main thread; this handler just
//! reports `KeepAliveDisconnected` and waits to be pushed a fresh request.
//! Ported from `ev::hub::KeepAliveHandler` (`keep_alive_handler.cc`).

use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

use fnv::FnvHashMap;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::device::{Device, DeviceFactory, DeviceId};
use crate::errors::DeviceError;
use crate::pool::HubEvent;
use crate::request::{Request, Target, TimeoutCallback};

struct Entry {
    device_id: DeviceId,
    target: Target,
    tag: u8,
    cancelled: Rc<Cell<bool>>,
    connected: bool,
    /// Forwards a later command (e.g. a second `SUBSCRIBE`/`UNSUBSCRIBE`)
    /// into the task already holding this entry's device, instead of
    /// tearing the connection down to send it. A subscribe-mode
    /// connection never correlates replies to the command that produced
    /// them, so the only thing the sender needs back is "did the write
    /// make it onto the wire" — everything else surfaces later through
    /// the same unsolicited-data stream.
    commands: UnboundedSender<Request>,
    /// Deadline/callback pulled out of the most recent command this entry
    /// was pushed (§4.3 Idle: `request.CheckForTimeout(now)`), since the
    /// `Request` itself is moved into the device's `execute` and isn't
    /// available to call back into once that's in flight.
    timeout: Option<(Instant, TimeoutCallback)>,
    timeout_fired: bool,
}

pub struct KeepAliveHandler {
    factories: std::collections::HashMap<Target, Box<dyn DeviceFactory>>,
    running: FnvHashMap<u64, Entry>,
    disconnected: FnvHashMap<u64, Entry>,
    next_device_id: usize,
    events_tx: UnboundedSender<HubEvent>,
}

impl KeepAliveHandler {
    pub fn new(factories: std::collections::HashMap<Target, Box<dyn DeviceFactory>>, events_tx: UnboundedSender<HubEvent>) -> Self {
        KeepAliveHandler {
            factories,
            running: FnvHashMap::default(),
            disconnected: FnvHashMap::default(),
            next_device_id: 0,
            events_tx,
        }
    }

    /// Binds a request to this invoke id's device. If one is already
    /// connected, the request is forwarded into its running task as a
    /// further command on the same connection (§4.3: "if a device is
    /// already mapped to this request, reuse it"), which is what lets a
    /// `Subscription` add channels to an already-open session instead of
    /// reconnecting for every `Subscribe`/`Unsubscribe` call. Only when
    /// there's no live entry does this build a fresh device.
    pub fn push(&mut self, invoke_id: u64, tag: u8, mut request: Request) {
        if let Some(entry) = self.running.get_mut(&invoke_id) {
            let timeout = request.take_timeout(Instant::now());
            match entry.commands.send(request) {
                Ok(()) => {
                    entry.timeout = timeout;
                    entry.timeout_fired = false;
                    return;
                }
                Err(_) => {
                    // Send channel is closed: the task already exited (it
                    // will also have reported a disconnect), so fall
                    // through and rebuild a fresh connection for this
                    // request instead of silently dropping it.
                }
            }
        }
        if let Some(old) = self.running.remove(&invoke_id) {
            old.cancelled.set(true);
        }
        self.disconnected.remove(&invoke_id);

        let timeout = request.take_timeout(Instant::now());
        let target = request.target();
        let device = match self.cached_or_new(target, &request) {
            Some(device) => device,
            None => {
                let error = DeviceError::Backend("no device factory registered for target".into());
                let _ = self.events_tx.send(HubEvent::KeepAliveConnectFailed { invoke_id, tag, error });
                return;
            }
        };

        let device_id = DeviceId(self.next_device_id);
        self.next_device_id += 1;
        let cancelled = Rc::new(Cell::new(false));
        let (commands_tx, commands_rx) = tokio::sync::mpsc::unbounded_channel();

        self.running.insert(
            invoke_id,
            Entry { device_id, target, tag, cancelled: cancelled.clone(), connected: false, commands: commands_tx, timeout, timeout_fired: false },
        );

        let tx = self.events_tx.clone();
        tokio::task::spawn_local(async move {
            let mut device = device;
            let mut commands_rx: UnboundedReceiver<Request> = commands_rx;

            if let Err(error) = device.connect().await {
                let _ = tx.send(HubEvent::KeepAliveConnectFailed { invoke_id, tag, error });
                return;
            }

            if let Err(error) = device.execute(&request).await {
                let _ = tx.send(HubEvent::KeepAliveConnectFailed { invoke_id, tag, error });
                return;
            }

            let _ = tx.send(HubEvent::KeepAliveConnected { invoke_id, tag, device_id });

            loop {
                if cancelled.get() {
                    return;
                }

                tokio::select! {
                    biased;

                    command = commands_rx.recv() => {
                        let Some(command) = command else { continue };
                        match device.execute(&command).await {
                            // A subscribe-mode connection never correlates a
                            // reply to the request that produced it, so
                            // whatever this command's ack looks like rides
                            // the same unsolicited-outcome path as a pub/sub
                            // message rather than settling the command the
                            // way a one-shot request would.
                            Ok(outcome) => {
                                let _ = tx.send(HubEvent::KeepAliveUnsolicited { invoke_id, tag, device_id, outcome });
                            }
                            Err(error) => {
                                let _ = tx.send(HubEvent::KeepAliveDisconnected { invoke_id, tag, device_id, error: Some(error) });
                                return;
                            }
                        }
                    }

                    unsolicited = device.recv_unsolicited() => match unsolicited {
                        Ok(Some(outcome)) => {
                            let _ = tx.send(HubEvent::KeepAliveUnsolicited { invoke_id, tag, device_id, outcome });
                        }
                        Ok(None) => {
                            let _ = tx.send(HubEvent::KeepAliveDisconnected { invoke_id, tag, device_id, error: None });
                            return;
                        }
                        Err(error) => {
                            let _ = tx.send(HubEvent::KeepAliveDisconnected { invoke_id, tag, device_id, error: Some(error) });
                            return;
                        }
                    },
                }
            }
        });
    }

    fn cached_or_new(&self, target: Target, request: &Request) -> Option<Box<dyn Device>> {
        self.factories.get(&target).map(|f| f.create(request.context().clone()))
    }

    pub fn mark_connected(&mut self, invoke_id: u64) {
        if let Some(entry) = self.running.get_mut(&invoke_id) {
            entry.connected = true;
        }
    }

    /// §4.3 Idle: walks every running entry and fires its command's timeout
    /// callback once if the deadline has passed. Called from the hub's idle
    /// tick alongside `OneShotHandler::drain`.
    pub fn idle(&mut self, now: Instant) {
        for entry in self.running.values_mut() {
            if entry.timeout_fired {
                continue;
            }
            let fire = matches!(&entry.timeout, Some((deadline, _)) if now >= *deadline);
            if fire {
                entry.timeout_fired = true;
                if let Some((_, callback)) = entry.timeout.take() {
                    callback();
                }
            }
        }
    }

    /// Removes a request's entry entirely, cancelling any in-flight
    /// background read loop. Used when a subscription unregisters for
    /// good rather than reconnecting.
    pub fn remove(&mut self, invoke_id: u64) {
        if let Some(entry) = self.running.remove(&invoke_id) {
            entry.cancelled.set(true);
        }
        self.disconnected.remove(&invoke_id);
    }

    /// Moves a request's entry from `running` to `disconnected` after its
    /// device reports a disconnect. The caller (hub) is expected to
    /// publish a disconnection notice so the owning `Subscription` can
    /// decide whether and when to reconnect.
    pub fn mark_disconnected(&mut self, invoke_id: u64) {
        if let Some(entry) = self.running.remove(&invoke_id) {
            self.disconnected.insert(invoke_id, entry);
        }
    }

    pub fn is_running(&self, invoke_id: u64) -> bool {
        self.running.contains_key(&invoke_id)
    }

    pub fn running_count(&self) -> usize { self.running.len() }
    pub fn disconnected_count(&self) -> usize { self.disconnected.len() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque as StdVecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::sync::Notify;

    use crate::device::ConnectionStatus;
    use crate::outcome::{CacheEvent, DataObject, Outcome};
    use crate::request::{LoggableContext, Mode};

    struct MockPubSubDevice {
        context: LoggableContext,
        messages: Arc<Mutex<StdVecDeque<Outcome>>>,
        notify: Arc<Notify>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait(?Send)]
    impl Device for MockPubSubDevice {
        fn context(&self) -> &LoggableContext { &self.context }

        async fn connect(&mut self) -> Result<ConnectionStatus, DeviceError> {
            Ok(ConnectionStatus::Connected)
        }

        async fn execute(&mut self, _request: &Request) -> Result<Outcome, DeviceError> {
            Ok(Outcome::new(Target::KvCache))
        }

        async fn recv_unsolicited(&mut self) -> Result<Option<Outcome>, DeviceError> {
            loop {
                {
                    let mut q = self.messages.lock().expect("mock messages lock poisoned");
                    if let Some(next) = q.pop_front() {
                        return Ok(Some(next));
                    }
                    if self.closed.load(Ordering::SeqCst) {
                        return Ok(None);
                    }
                }
                self.notify.notified().await;
            }
        }

        fn is_reusable(&self) -> bool { true }
        fn invalidate_reuse(&mut self) {}
        fn status(&self) -> ConnectionStatus { ConnectionStatus::Connected }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn push_connects_delivers_unsolicited_data_then_reports_disconnect() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
                let messages = Arc::new(Mutex::new(StdVecDeque::new()));
                let notify = Arc::new(Notify::new());
                let closed = Arc::new(AtomicBool::new(false));

                let (messages_f, notify_f, closed_f) = (messages.clone(), notify.clone(), closed.clone());
                let mut factories: std::collections::HashMap<Target, Box<dyn DeviceFactory>> = std::collections::HashMap::new();
                factories.insert(
                    Target::KvCache,
                    Box::new(crate::device::FnDeviceFactory(move |ctx| {
                        Box::new(MockPubSubDevice {
                            context: ctx,
                            messages: messages_f.clone(),
                            notify: notify_f.clone(),
                            closed: closed_f.clone(),
                        }) as Box<dyn Device>
                    })),
                );

                let mut handler = KeepAliveHandler::new(factories, events_tx);

                let req = Request::new(Target::KvCache, Mode::KeepAlive, LoggableContext::default(), Bytes::from_static(b"SUBSCRIBE a"));
                handler.push(1, 0, req);

                match events_rx.recv().await.expect("connected event") {
                    HubEvent::KeepAliveConnected { invoke_id, .. } => {
                        assert_eq!(invoke_id, 1);
                        handler.mark_connected(invoke_id);
                    }
                    other => panic!("expected KeepAliveConnected, got a different event: {:?}", std::mem::discriminant(&other)),
                }
                assert_eq!(handler.running_count(), 1);
                assert_eq!(handler.disconnected_count(), 0);

                messages.lock().unwrap().push_back(Outcome::single(
                    Target::KvCache,
                    DataObject::Cache(CacheEvent::Message { channel: "a".into(), pattern: None, payload: Bytes::from_static(b"hi") }),
                ));
                notify.notify_one();

                match events_rx.recv().await.expect("unsolicited event") {
                    HubEvent::KeepAliveUnsolicited { invoke_id, outcome, .. } => {
                        assert_eq!(invoke_id, 1);
                        assert!(!outcome.is_error());
                    }
                    other => panic!("expected KeepAliveUnsolicited, got a different event: {:?}", std::mem::discriminant(&other)),
                }

                closed.store(true, Ordering::SeqCst);
                notify.notify_one();

                match events_rx.recv().await.expect("disconnected event") {
                    HubEvent::KeepAliveDisconnected { invoke_id, error, .. } => {
                        assert_eq!(invoke_id, 1);
                        assert!(error.is_none(), "a clean stream close carries no device error");
                        handler.mark_disconnected(invoke_id);
                    }
                    other => panic!("expected KeepAliveDisconnected, got a different event: {:?}", std::mem::discriminant(&other)),
                }
                assert_eq!(handler.running_count(), 0);
                assert_eq!(handler.disconnected_count(), 1);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn connect_failure_reports_without_registering_a_running_entry() {
        struct FailingDevice {
            context: LoggableContext,
        }

        #[async_trait(?Send)]
        impl Device for FailingDevice {
            fn context(&self) -> &LoggableContext { &self.context }
            async fn connect(&mut self) -> Result<ConnectionStatus, DeviceError> {
                Err(DeviceError::Backend("refused".into()))
            }
            async fn execute(&mut self, _request: &Request) -> Result<Outcome, DeviceError> {
                unreachable!("connect fails before execute runs")
            }
            fn is_reusable(&self) -> bool { true }
            fn invalidate_reuse(&mut self) {}
            fn status(&self) -> ConnectionStatus { ConnectionStatus::Error }
        }

        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
                let mut factories: std::collections::HashMap<Target, Box<dyn DeviceFactory>> = std::collections::HashMap::new();
                factories.insert(
                    Target::KvCache,
                    Box::new(crate::device::FnDeviceFactory(|ctx| Box::new(FailingDevice { context: ctx }) as Box<dyn Device>)),
                );
                let mut handler = KeepAliveHandler::new(factories, events_tx);

                let req = Request::new(Target::KvCache, Mode::KeepAlive, LoggableContext::default(), Bytes::from_static(b"SUBSCRIBE a"));
                handler.push(1, 0, req);

                match events_rx.recv().await.expect("connect-failed event") {
                    HubEvent::KeepAliveConnectFailed { invoke_id, .. } => assert_eq!(invoke_id, 1),
                    other => panic!("expected KeepAliveConnectFailed, got a different event: {:?}", std::mem::discriminant(&other)),
                }
                assert_eq!(handler.running_count(), 1, "the entry is registered on push, before the connect outcome is known");
            })
            .await;
    }

    #[test]
    fn remove_cancels_a_running_entry_and_clears_disconnected_state() {
        let (events_tx, _events_rx) = tokio::sync::mpsc::unbounded_channel();
        let factories: std::collections::HashMap<Target, Box<dyn DeviceFactory>> = std::collections::HashMap::new();
        let mut handler = KeepAliveHandler::new(factories, events_tx);

        let cancelled = Rc::new(Cell::new(false));
        let (commands_tx, _commands_rx) = tokio::sync::mpsc::unbounded_channel();
        handler.running.insert(
            1,
            Entry {
                device_id: DeviceId(0),
                target: Target::KvCache,
                tag: 0,
                cancelled: cancelled.clone(),
                connected: true,
                commands: commands_tx,
                timeout: None,
                timeout_fired: false,
            },
        );

        handler.remove(1);
        assert!(cancelled.get(), "remove must cancel the background read loop");
        assert!(!handler.is_running(1));
        assert_eq!(handler.running_count(), 0);
        assert_eq!(handler.disconnected_count(), 0);
    }

    #[test]
    fn idle_fires_an_expired_entrys_timeout_exactly_once() {
        let (events_tx, _events_rx) = tokio::sync::mpsc::unbounded_channel();
        let factories: std::collections::HashMap<Target, Box<dyn DeviceFactory>> = std::collections::HashMap::new();
        let mut handler = KeepAliveHandler::new(factories, events_tx);

        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let (commands_tx, _commands_rx) = tokio::sync::mpsc::unbounded_channel();
        let now = Instant::now();
        handler.running.insert(
            1,
            Entry {
                device_id: DeviceId(0),
                target: Target::KvCache,
                tag: 0,
                cancelled: Rc::new(Cell::new(false)),
                connected: true,
                commands: commands_tx,
                timeout: Some((now - Duration::from_millis(1), Box::new(move || fired2.store(true, Ordering::SeqCst)))),
                timeout_fired: false,
            },
        );

        handler.idle(now);
        assert!(fired.load(Ordering::SeqCst), "an expired deadline must fire on the next idle tick");

        fired.store(false, Ordering::SeqCst);
        handler.idle(now);
        assert!(!fired.load(Ordering::SeqCst), "a fired timeout must never fire a second time");
    }

    #[test]
    fn idle_leaves_an_unexpired_entry_untouched() {
        let (events_tx, _events_rx) = tokio::sync::mpsc::unbounded_channel();
        let factories: std::collections::HashMap<Target, Box<dyn DeviceFactory>> = std::collections::HashMap::new();
        let mut handler = KeepAliveHandler::new(factories, events_tx);

        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let (commands_tx, _commands_rx) = tokio::sync::mpsc::unbounded_channel();
        let now = Instant::now();
        handler.running.insert(
            1,
            Entry {
                device_id: DeviceId(0),
                target: Target::KvCache,
                tag: 0,
                cancelled: Rc::new(Cell::new(false)),
                connected: true,
                commands: commands_tx,
                timeout: Some((now + Duration::from_secs(20), Box::new(move || fired2.store(true, Ordering::SeqCst)))),
                timeout_fired: false,
            },
        );

        handler.idle(now);
        assert!(!fired.load(Ordering::SeqCst), "a deadline in the future must not fire yet");
    }
}
