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

//! The `Device` trait: one live connection to a backend, owned exclusively
//! by the hub thread for its whole life. Everything above it (the pool
//! handlers, the hub loop) only ever touches a device through this trait,
//! so the three concrete backends in `backend::{redis,postgres,http}` are
//! interchangeable from the pool's point of view.

use async_trait::async_trait;

use crate::errors::DeviceError;
use crate::outcome::Outcome;
use crate::request::{LoggableContext, Request};

/// Connection lifecycle state, reported to a `Listener` whenever it changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Error,
}

/// Identifies a live device inside a handler's bookkeeping tables. Backed by
/// a slab index rather than a pointer; devices never leave the hub thread so
/// a plain integer handle is all the identity tracking needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub usize);

/// One connection to a backend. Connect and execute are both async so a
/// device can model either an instantaneous local answer or a round trip
/// over the network with the same interface; callers simply await.
#[async_trait(?Send)]
pub trait Device {
    /// Context used to tag tracing spans raised while this device runs.
    fn context(&self) -> &LoggableContext;

    /// Establishes (or re-establishes) the underlying connection.
    async fn connect(&mut self) -> Result<ConnectionStatus, DeviceError>;

    /// Runs a single request against this device's live connection.
    async fn execute(&mut self, request: &Request) -> Result<Outcome, DeviceError>;

    /// For keep-alive devices: waits for the next unsolicited message (a
    /// pub/sub publish, a server-initiated push). Returns `Ok(None)` if the
    /// connection closed cleanly.
    async fn recv_unsolicited(&mut self) -> Result<Option<Outcome>, DeviceError> {
        // OneShot backends never receive unsolicited data; the default impl
        // simply never resolves so a `select!` against it is inert.
        std::future::pending().await
    }

    /// Returns and clears the last error recorded internally by the device,
    /// if the backend driver tracks one separately from the `Result` it
    /// already returned (mirrors `DetachLastError` in the device contract).
    fn detach_last_error(&mut self) -> Option<DeviceError> { None }

    /// Whether this device may be returned to the cached pool after its
    /// current request completes.
    fn is_reusable(&self) -> bool;

    /// Marks this device as no longer reusable; it will be torn down
    /// (zombied) instead of cached once its current request completes.
    fn invalidate_reuse(&mut self);

    /// Current connection status, as last observed by this device itself.
    fn status(&self) -> ConnectionStatus;
}

/// Notified whenever a device's connection status changes outside of a
/// direct `connect`/`execute` call (e.g. an idle keep-alive socket drops).
pub trait Listener {
    fn on_connection_status_changed(&mut self, device_id: DeviceId, status: ConnectionStatus);
}

/// Notified when a keep-alive device receives data that wasn't a direct
/// reply to an in-flight request (a pub/sub message).
pub trait UnhandledDataHandler {
    /// Returns `true` if the data was consumed; `false` routes it back as
    /// an error (the hub treats unconsumed unhandled data as a protocol
    /// violation, matching the original's `OnUnhandledDataObjectReceived`
    /// contract).
    fn on_unhandled_data(&mut self, device_id: DeviceId, outcome: Outcome) -> bool;
}

/// Builds devices for a given target. Implemented once per backend family
/// and threaded into the hub at construction time, mirroring
/// `DeviceFactoryStepCallback` from the original hub wiring.
pub trait DeviceFactory {
    fn create(&self, context: LoggableContext) -> Box<dyn Device>;
}

/// A factory built from a plain closure, for tests and simple wiring.
pub struct FnDeviceFactory<F>(pub F)
where
    F: Fn(LoggableContext) -> Box<dyn Device>;

impl<F> DeviceFactory for FnDeviceFactory<F>
where
    F: Fn(LoggableContext) -> Box<dyn Device>,
{
    fn create(&self, context: LoggableContext) -> Box<dyn Device> {
        (self.0)(context)
    }
}
