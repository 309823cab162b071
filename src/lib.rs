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

//! `evrt`: a two-thread connector runtime. A main thread runs application
//! logic against `Task`/`Subscription` objects registered with a
//! `Scheduler`; a dedicated hub thread owns every backend connection and
//! talks back to the main thread only through the `Bridge`. Nothing crosses
//! threads except requests (handed over by value through a registry slot)
//! and outcomes (handed back the same way).
//!
//! Module map:
//! - [`request`] / [`outcome`] / [`errors`]: the wire types every other
//!   module is built from.
//! - [`device`]: the `Device` trait one connection implements; [`backend`]
//!   supplies the concrete cache/SQL/HTTP implementations.
//! - [`pool`]: the hub-thread-only bookkeeping that binds requests to
//!   devices (`one_shot`) or keeps a device open across many commands
//!   (`keep_alive`).
//! - [`hub`]: the dedicated OS thread, its inbox socket, and the glue
//!   between pool events and scheduler publications.
//! - [`bridge`]: the hub's only channel back onto the main thread.
//! - [`scheduler`] / [`task`] / [`subscription`]: the main-thread object
//!   model application code actually drives.
//! - [`queue`]: a beanstalkd work-queue consumer feeding tasks into the
//!   scheduler from outside the request/reply path.
//! - [`gatekeeper`]: request-level authorization.
//! - [`json_sql`]: a helper for SQL backends that return a single JSON
//!   column per row.
//! - [`config`] / [`logging`] / [`bootstrap`]: ambient process concerns.

pub mod backend;
pub mod bootstrap;
pub mod bridge;
pub mod cli;
pub mod config;
pub mod device;
pub mod errors;
pub mod gatekeeper;
pub mod hub;
pub mod json_sql;
pub mod logging;
pub mod outcome;
pub mod pool;
pub mod queue;
pub mod request;
pub mod scheduler;
pub mod subscription;
pub mod task;

pub use bridge::Bridge;
pub use device::Device;
pub use errors::{BackendError, DeviceError, FatalError};
pub use hub::{Hub, HubHandle};
pub use outcome::{DataObject, Outcome};
pub use request::{Control, LoggableContext, Mode, Request, Target};
pub use scheduler::{ObjectKind, Scheduler, SchedulerObject, StepOutcome};
pub use subscription::{SubscriptionHandle, SubscriptionsManager};
pub use task::{Task, TaskBuilder};
