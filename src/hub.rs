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

//! The hub: one dedicated OS thread owning a `tokio` current-thread runtime,
//! the inbox socket, and both pool handlers. Ported from `ev::hub::Hub`
//! (`hub.cc`/`hub.h`): `event_base_`/`hack_event_`/`watchdog_event_` become a
//! `tokio::select!` loop, `socket_event_` becomes a real `UnixDatagram`, and
//! the handler set stays exactly `{OneShotHandler, KeepAliveHandler}`.
//!
//! The inbox message format is unchanged from the spec: fixed-width ASCII
//! descriptors, `<invoke_id:19>:<mode:3>:<target:3>:<tag:3>[:<slot_hex>]`,
//! minimum 31 bytes. The trailing field carries a registry slot (the
//! request was handed to the hub through a shared, mutex-guarded table
//! rather than a raw pointer cast across threads) formatted as hex for wire
//! compatibility with the original's pointer-carrying variant.

use std::collections::HashMap;
use std::os::unix::net::UnixDatagram as StdUnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fnv::FnvHashMap;
use tokio::net::UnixDatagram;
use tokio::sync::mpsc;

use crate::bridge::Bridge;
use crate::device::DeviceFactory;
use crate::errors::FatalError;
use crate::pool::{HubEvent, KeepAliveHandler, Limits, OneShotHandler, ReuseLimits};
use crate::request::{Mode, Request, Target};

pub const INBOX_MIN_LEN: usize = 31;

/// Shared table the main thread inserts requests into before sending their
/// slot id over the inbox socket; the hub thread removes them on receipt.
pub type RequestRegistry = Arc<Mutex<FnvHashMap<u64, Request>>>;

pub fn new_request_registry() -> RequestRegistry {
    Arc::new(Mutex::new(FnvHashMap::default()))
}

#[derive(Debug)]
pub struct Descriptor {
    pub invoke_id: u64,
    pub mode: Mode,
    pub target: Target,
    pub tag: u8,
    pub slot: Option<u64>,
}

/// Encodes a descriptor exactly as the main thread writes it to the socket.
pub fn encode_descriptor(d: &Descriptor) -> String {
    let mut s = format!(
        "{:019}:{}:{}:{:03}",
        d.invoke_id,
        d.mode.as_wire_tag(),
        d.target.as_wire_tag(),
        d.tag,
    );
    if let Some(slot) = d.slot {
        s.push(':');
        s.push_str(&format!("{:x}", slot));
    }
    s
}

/// Parses a raw inbox datagram. Anything shorter than `INBOX_MIN_LEN` or
/// with malformed fields is a protocol violation: the hub treats it as
/// fatal rather than silently dropping it, matching the original's
/// `k_msg_min_length_` guard.
pub fn decode_descriptor(buf: &[u8]) -> Result<Descriptor, FatalError> {
    if buf.len() < INBOX_MIN_LEN {
        return Err(FatalError::new(format!(
            "inbox message too short: {} bytes (minimum {})",
            buf.len(),
            INBOX_MIN_LEN
        )));
    }

    let text = std::str::from_utf8(buf).map_err(|e| FatalError::new(format!("inbox message not utf8: {e}")))?;
    let mut parts = text.split(':');

    let invoke_id_raw = parts.next().ok_or_else(|| FatalError::new("inbox message missing invoke id"))?;
    let mode_raw = parts.next().ok_or_else(|| FatalError::new("inbox message missing mode"))?;
    let target_raw = parts.next().ok_or_else(|| FatalError::new("inbox message missing target"))?;
    let tag_raw = parts.next().ok_or_else(|| FatalError::new("inbox message missing tag"))?;
    let slot_raw = parts.next();

    let invoke_id: u64 = invoke_id_raw
        .parse()
        .map_err(|_| FatalError::new(format!("inbox message has invalid invoke id: {invoke_id_raw}")))?;
    let mode = Mode::from_wire_tag(mode_raw).ok_or_else(|| FatalError::new(format!("inbox message has invalid mode: {mode_raw}")))?;
    let target = Target::from_wire_tag(target_raw).ok_or_else(|| FatalError::new(format!("inbox message has invalid target: {target_raw}")))?;
    let tag: u8 = tag_raw.parse().map_err(|_| FatalError::new(format!("inbox message has invalid tag: {tag_raw}")))?;
    let slot = match slot_raw {
        Some(s) if !s.is_empty() => Some(
            u64::from_str_radix(s, 16).map_err(|_| FatalError::new(format!("inbox message has invalid slot: {s}")))?,
        ),
        _ => None,
    };

    Ok(Descriptor { invoke_id, mode, target, tag, slot })
}

/// Outcome published back to the scheduler once a one-shot request settles
/// or a keep-alive entry changes state.
pub enum Publication {
    /// A no-payload kickoff descriptor (`mode = NotSet`, `target = NotSet`)
    /// arrived: the scheduler object named by `invoke_id` should run its
    /// next step with no prior outcome.
    StepRequested { invoke_id: u64, tag: u8 },
    OneShotCompleted { invoke_id: u64, tag: u8, outcome: crate::outcome::Outcome },
    KeepAliveUnsolicited { invoke_id: u64, tag: u8, outcome: crate::outcome::Outcome },
    KeepAliveDisconnected { invoke_id: u64, tag: u8, error: Option<crate::errors::DeviceError> },
}

/// Handle used by the main thread (and the `Scheduler`) to talk to a
/// running hub.
#[derive(Clone)]
pub struct HubHandle {
    registry: RequestRegistry,
    socket_path: PathBuf,
    next_slot: Arc<std::sync::atomic::AtomicU64>,
    abort: Arc<AtomicBool>,
}

impl HubHandle {
    /// Writes a request into the shared registry and signals the hub over
    /// the inbox socket. This is a single blocking `sendto` of a small,
    /// fixed-size datagram — the same cost the original pays sending a
    /// descriptor over a unix socket from the main thread.
    pub fn push(&self, invoke_id: u64, tag: u8, request: Request) -> std::io::Result<()> {
        let mode = request.mode();
        let target = request.target();
        let slot = self.next_slot.fetch_add(1, AtomicOrdering::Relaxed);

        self.registry.lock().expect("request registry poisoned").insert(slot, request);

        let descriptor = encode_descriptor(&Descriptor { invoke_id, mode, target, tag, slot: Some(slot) });
        let client = StdUnixDatagram::unbound()?;
        client.send_to(descriptor.as_bytes(), &self.socket_path)?;
        Ok(())
    }

    /// Sends a no-payload kickoff descriptor for `invoke_id`, asking the
    /// hub to bounce a `Publication::StepRequested` back to the main
    /// thread instead of dispatching anything to a device pool.
    pub fn push_kickoff(&self, invoke_id: u64, tag: u8) -> std::io::Result<()> {
        let descriptor = encode_descriptor(&Descriptor { invoke_id, mode: Mode::NotSet, target: Target::NotSet, tag, slot: None });
        let client = StdUnixDatagram::unbound()?;
        client.send_to(descriptor.as_bytes(), &self.socket_path)?;
        Ok(())
    }

    pub fn shutdown(&self) {
        self.abort.store(true, AtomicOrdering::SeqCst);
    }
}

pub struct Hub {
    socket_path: PathBuf,
    registry: RequestRegistry,
    next_slot: Arc<std::sync::atomic::AtomicU64>,
    abort: Arc<AtomicBool>,
    one_shot_factories: HashMap<Target, Box<dyn DeviceFactory>>,
    keep_alive_factories: HashMap<Target, Box<dyn DeviceFactory>>,
    limits: Limits,
    reuse_limits: ReuseLimits,
    bridge: Bridge,
    idle_period: Duration,
}

impl Hub {
    pub fn new(
        socket_path: impl AsRef<Path>,
        one_shot_factories: HashMap<Target, Box<dyn DeviceFactory>>,
        keep_alive_factories: HashMap<Target, Box<dyn DeviceFactory>>,
        limits: Limits,
        reuse_limits: ReuseLimits,
        bridge: Bridge,
    ) -> Self {
        Hub {
            socket_path: socket_path.as_ref().to_path_buf(),
            registry: new_request_registry(),
            next_slot: Arc::new(std::sync::atomic::AtomicU64::new(0)),
            abort: Arc::new(AtomicBool::new(false)),
            one_shot_factories,
            keep_alive_factories,
            limits,
            reuse_limits,
            bridge,
            idle_period: Duration::from_millis(50),
        }
    }

    pub fn handle(&self) -> HubHandle {
        HubHandle {
            registry: self.registry.clone(),
            socket_path: self.socket_path.clone(),
            next_slot: self.next_slot.clone(),
            abort: self.abort.clone(),
        }
    }

    /// Spawns the dedicated hub thread. `on_publication` is invoked on the
    /// hub thread itself for every publication; callers that need main
    /// thread delivery should bounce through `Bridge::call_on_main_thread`
    /// inside that closure, exactly like `PublishStepCallback` does in the
    /// original.
    pub fn spawn<F>(self, on_publication: F) -> std::thread::JoinHandle<()>
    where
        F: Fn(Publication) + 'static,
    {
        std::thread::Builder::new()
            .name("evrt-hub".into())
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build hub runtime");
                let local = tokio::task::LocalSet::new();
                local.block_on(&rt, self.run(on_publication));
            })
            .expect("failed to spawn hub thread")
    }

    async fn run<F>(self, on_publication: F)
    where
        F: Fn(Publication) + 'static,
    {
        let _ = std::fs::remove_file(&self.socket_path);
        let socket = match UnixDatagram::bind(&self.socket_path) {
            Ok(s) => s,
            Err(e) => {
                self.bridge.throw_fatal_exception(format!("failed to bind inbox socket: {e}"));
                return;
            }
        };

        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<HubEvent>();

        let mut one_shot = OneShotHandler::new(self.one_shot_factories, self.limits.clone(), self.reuse_limits.clone(), events_tx.clone());
        let mut keep_alive = KeepAliveHandler::new(self.keep_alive_factories, events_tx);

        let mut idle = tokio::time::interval(self.idle_period);
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            if self.abort.load(AtomicOrdering::SeqCst) {
                tracing::info!("hub received shutdown signal, exiting loop");
                return;
            }

            tokio::select! {
                biased;

                recv = socket.recv(&mut buf) => {
                    match recv {
                        Ok(n) => self.handle_inbound(&buf[..n], &mut one_shot, &mut keep_alive, &on_publication),
                        Err(e) => {
                            self.bridge.throw_fatal_exception(format!("inbox socket read failed: {e}"));
                            return;
                        }
                    }
                }

                Some(event) = events_rx.recv() => {
                    self.handle_event(event, &mut one_shot, &mut keep_alive, &on_publication);
                }

                _ = idle.tick() => {
                    one_shot.drain();
                    one_shot.kill_zombies();
                    for c in one_shot.drain_completed() {
                        on_publication(Publication::OneShotCompleted { invoke_id: c.invoke_id, tag: c.tag, outcome: c.outcome });
                    }
                    keep_alive.idle(std::time::Instant::now());
                }
            }
        }
    }

    fn handle_inbound(&self, buf: &[u8], one_shot: &mut OneShotHandler, keep_alive: &mut KeepAliveHandler, on_publication: &dyn Fn(Publication)) {
        let descriptor = match decode_descriptor(buf) {
            Ok(d) => d,
            Err(e) => {
                self.bridge.throw_fatal_exception(e.to_string());
                return;
            }
        };

        if matches!(descriptor.mode, Mode::NotSet) {
            // Kickoff descriptor: no device dispatch, just ask the
            // scheduler (on the main thread) to run the object's first
            // step. It carries no request payload, so there's nothing to
            // pull out of the registry.
            on_publication(Publication::StepRequested { invoke_id: descriptor.invoke_id, tag: descriptor.tag });
            return;
        }

        let request = match descriptor.slot {
            Some(slot) => self.registry.lock().expect("request registry poisoned").remove(&slot),
            None => None,
        };
        let Some(request) = request else {
            self.bridge.throw_fatal_exception("inbox descriptor referenced an unknown request slot");
            return;
        };

        match descriptor.mode {
            Mode::OneShot => one_shot.push(descriptor.invoke_id, descriptor.tag, request),
            Mode::KeepAlive => keep_alive.push(descriptor.invoke_id, descriptor.tag, request),
            Mode::NotSet => unreachable!("handled above"),
        }

        if matches!(descriptor.mode, Mode::OneShot) {
            one_shot.drain();
            for c in one_shot.drain_completed() {
                on_publication(Publication::OneShotCompleted { invoke_id: c.invoke_id, tag: c.tag, outcome: c.outcome });
            }
        }
    }

    fn handle_event(&self, event: HubEvent, one_shot: &mut OneShotHandler, keep_alive: &mut KeepAliveHandler, on_publication: &dyn Fn(Publication)) {
        match event {
            HubEvent::OneShotSettled { invoke_id, tag, device_id, device, request, outcome } => {
                one_shot.settle(invoke_id, tag, device_id, device, request, outcome);
                for c in one_shot.drain_completed() {
                    on_publication(Publication::OneShotCompleted { invoke_id: c.invoke_id, tag: c.tag, outcome: c.outcome });
                }
            }
            HubEvent::OneShotConnectFailed { invoke_id, tag, device_id, request, error } => {
                one_shot.connect_failed(invoke_id, tag, device_id, request, error);
                for c in one_shot.drain_completed() {
                    on_publication(Publication::OneShotCompleted { invoke_id: c.invoke_id, tag: c.tag, outcome: c.outcome });
                }
            }
            HubEvent::KeepAliveConnected { invoke_id, .. } => {
                keep_alive.mark_connected(invoke_id);
            }
            HubEvent::KeepAliveConnectFailed { invoke_id, tag, error } => {
                on_publication(Publication::KeepAliveDisconnected { invoke_id, tag, error: Some(error) });
            }
            HubEvent::KeepAliveUnsolicited { invoke_id, tag, outcome, .. } => {
                on_publication(Publication::KeepAliveUnsolicited { invoke_id, tag, outcome });
            }
            HubEvent::KeepAliveDisconnected { invoke_id, tag, error, .. } => {
                keep_alive.mark_disconnected(invoke_id);
                on_publication(Publication::KeepAliveDisconnected { invoke_id, tag, error });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips_with_a_slot() {
        let d = Descriptor { invoke_id: 42, mode: Mode::OneShot, target: Target::Sql, tag: 1, slot: Some(7) };
        let encoded = encode_descriptor(&d);
        let decoded = decode_descriptor(encoded.as_bytes()).expect("valid descriptor");
        assert_eq!(decoded.invoke_id, 42);
        assert_eq!(decoded.mode, Mode::OneShot);
        assert_eq!(decoded.target, Target::Sql);
        assert_eq!(decoded.tag, 1);
        assert_eq!(decoded.slot, Some(7));
    }

    #[test]
    fn kickoff_descriptor_is_exactly_the_minimum_length() {
        let d = Descriptor { invoke_id: 1, mode: Mode::NotSet, target: Target::NotSet, tag: 0, slot: None };
        let encoded = encode_descriptor(&d);
        assert_eq!(encoded.len(), INBOX_MIN_LEN);

        let decoded = decode_descriptor(encoded.as_bytes()).expect("31-byte NotSet descriptor is valid");
        assert_eq!(decoded.target, Target::NotSet);
        assert!(decoded.slot.is_none());
    }

    #[test]
    fn one_byte_short_of_the_minimum_is_rejected() {
        let encoded = encode_descriptor(&Descriptor { invoke_id: 1, mode: Mode::NotSet, target: Target::NotSet, tag: 0, slot: None });
        let truncated = &encoded.as_bytes()[..encoded.len() - 1];
        assert!(decode_descriptor(truncated).is_err());
    }

    #[test]
    fn malformed_target_field_is_rejected() {
        let good = encode_descriptor(&Descriptor { invoke_id: 1, mode: Mode::OneShot, target: Target::Sql, tag: 0, slot: None });
        let bad = good.replacen("sql", "xyz", 1);
        assert!(decode_descriptor(bad.as_bytes()).is_err());
    }

    #[test]
    fn malformed_mode_field_is_rejected() {
        let good = encode_descriptor(&Descriptor { invoke_id: 1, mode: Mode::OneShot, target: Target::Sql, tag: 0, slot: None });
        let bad = good.replacen("one", "zzz", 1);
        assert!(decode_descriptor(bad.as_bytes()).is_err());
    }

    #[test]
    fn non_utf8_bytes_are_rejected() {
        let mut bytes = encode_descriptor(&Descriptor { invoke_id: 1, mode: Mode::NotSet, target: Target::NotSet, tag: 0, slot: None }).into_bytes();
        bytes[0] = 0xff;
        assert!(decode_descriptor(&bytes).is_err());
    }

    #[test]
    fn slot_is_absent_for_not_set_target_and_present_otherwise() {
        let kickoff = encode_descriptor(&Descriptor { invoke_id: 5, mode: Mode::NotSet, target: Target::NotSet, tag: 0, slot: None });
        assert!(decode_descriptor(kickoff.as_bytes()).unwrap().slot.is_none());

        let dispatch = encode_descriptor(&Descriptor { invoke_id: 5, mode: Mode::OneShot, target: Target::Http, tag: 0, slot: Some(0) });
        assert_eq!(decode_descriptor(dispatch.as_bytes()).unwrap().slot, Some(0));
    }
}
