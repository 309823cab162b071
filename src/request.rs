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

use std::time::{Duration, Instant};

use bytes::Bytes;

/// Which backend family a request is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    NotSet,
    KvCache,
    Sql,
    Http,
}

impl Target {
    pub fn as_wire_tag(self) -> &'static str {
        match self {
            Target::NotSet => "nst",
            Target::KvCache => "kvc",
            Target::Sql => "sql",
            Target::Http => "htt",
        }
    }

    pub fn from_wire_tag(tag: &str) -> Option<Target> {
        match tag {
            "nst" => Some(Target::NotSet),
            "kvc" => Some(Target::KvCache),
            "sql" => Some(Target::Sql),
            "htt" => Some(Target::Http),
            _ => None,
        }
    }
}

/// Whether the device servicing this request is returned to the pool after a
/// single exchange, or held open for the lifetime of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    NotSet,
    OneShot,
    KeepAlive,
}

impl Mode {
    pub fn as_wire_tag(self) -> &'static str {
        match self {
            Mode::NotSet => "nst",
            Mode::OneShot => "one",
            Mode::KeepAlive => "kee",
        }
    }

    pub fn from_wire_tag(tag: &str) -> Option<Mode> {
        match tag {
            "nst" => Some(Mode::NotSet),
            "one" => Some(Mode::OneShot),
            "kee" => Some(Mode::KeepAlive),
            _ => None,
        }
    }
}

/// Out-of-band control signal carried alongside a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Control {
    None,
    /// The device currently bound to this request must not be reused once
    /// the request completes, even if it would otherwise be eligible.
    Invalidate,
}

/// The "loggable" context every request and device carries: enough to tag a
/// tracing span without the core caring about what an "owner" actually is.
#[derive(Debug, Clone, Default)]
pub struct LoggableContext {
    /// Opaque identifier of whatever object on the main thread issued this
    /// request (a connection, a job, a task). Not dereferenced by the core.
    pub owner: u64,
    pub ip_address: Option<String>,
    pub module: String,
    pub instance: String,
}

impl LoggableContext {
    pub fn new(module: impl Into<String>, instance: impl Into<String>) -> Self {
        LoggableContext {
            owner: 0,
            ip_address: None,
            module: module.into(),
            instance: instance.into(),
        }
    }

    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "request",
            owner = self.owner,
            ip = self.ip_address.as_deref().unwrap_or("-"),
            module = %self.module,
            instance = %self.instance,
        )
    }
}

pub type TimeoutCallback = Box<dyn FnOnce() + Send>;

/// A unit of work addressed to a backend device.
///
/// Built on the main thread, handed to the scheduler, and executed on the
/// hub thread against whichever `Device` the pool binds it to.
pub struct Request {
    target: Target,
    mode: Mode,
    control: Control,
    context: LoggableContext,
    payload: Bytes,
    timeout: Option<Duration>,
    timeout_fired: bool,
    timeout_callback: Option<TimeoutCallback>,
    deadline: Option<Instant>,
}

impl Request {
    pub fn new(target: Target, mode: Mode, context: LoggableContext, payload: Bytes) -> Self {
        Request {
            target,
            mode,
            control: Control::None,
            context,
            payload,
            timeout: None,
            timeout_fired: false,
            timeout_callback: None,
            deadline: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration, callback: TimeoutCallback) -> Self {
        self.timeout = Some(timeout);
        self.timeout_callback = Some(callback);
        self
    }

    pub fn with_control(mut self, control: Control) -> Self {
        self.control = control;
        self
    }

    pub fn target(&self) -> Target { self.target }
    pub fn mode(&self) -> Mode { self.mode }
    pub fn control(&self) -> Control { self.control }
    pub fn is_invalidating(&self) -> bool { self.control == Control::Invalidate }
    pub fn context(&self) -> &LoggableContext { &self.context }
    pub fn payload(&self) -> &Bytes { &self.payload }

    /// Arms the timeout clock relative to `now`. Called once a device binds
    /// to this request and begins executing it.
    pub fn arm_timeout(&mut self, now: Instant) {
        if let Some(timeout) = self.timeout {
            self.deadline = Some(now + timeout);
        }
    }

    /// Checks whether the timeout has elapsed and, if so, fires the
    /// callback exactly once. Returns `true` the first time the deadline is
    /// crossed.
    pub fn check_timeout(&mut self, now: Instant) -> bool {
        if self.timeout_fired {
            return false;
        }
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.timeout_fired = true;
                if let Some(cb) = self.timeout_callback.take() {
                    cb();
                }
                true
            }
            _ => false,
        }
    }

    pub fn has_timed_out(&self) -> bool { self.timeout_fired }

    /// Pulls the timeout duration and fire-once callback out of this
    /// request, arming them relative to `now`. Used by `KeepAliveHandler`,
    /// which tracks a running entry's deadline itself (§4.3 Idle) rather
    /// than calling back into a `Request` that's since been consumed by the
    /// device's `execute`.
    pub fn take_timeout(&mut self, now: Instant) -> Option<(Instant, TimeoutCallback)> {
        let timeout = self.timeout.take()?;
        let callback = self.timeout_callback.take()?;
        Some((now + timeout, callback))
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("target", &self.target)
            .field("mode", &self.mode)
            .field("control", &self.control)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn target_wire_tags_round_trip() {
        for target in [Target::NotSet, Target::KvCache, Target::Sql, Target::Http] {
            assert_eq!(Target::from_wire_tag(target.as_wire_tag()), Some(target));
        }
    }

    #[test]
    fn mode_wire_tags_round_trip() {
        for mode in [Mode::NotSet, Mode::OneShot, Mode::KeepAlive] {
            assert_eq!(Mode::from_wire_tag(mode.as_wire_tag()), Some(mode));
        }
    }

    #[test]
    fn unknown_wire_tags_are_rejected() {
        assert_eq!(Target::from_wire_tag("xyz"), None);
        assert_eq!(Mode::from_wire_tag("xyz"), None);
    }

    #[test]
    fn timeout_fires_exactly_once_past_the_deadline() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let mut req = Request::new(Target::Sql, Mode::OneShot, LoggableContext::default(), Bytes::new())
            .with_timeout(Duration::from_millis(10), Box::new(move || fired2.store(true, Ordering::SeqCst)));

        let start = Instant::now();
        req.arm_timeout(start);

        assert!(!req.check_timeout(start));
        assert!(!fired.load(Ordering::SeqCst));

        let past_deadline = start + Duration::from_millis(20);
        assert!(req.check_timeout(past_deadline));
        assert!(fired.load(Ordering::SeqCst));

        fired.store(false, Ordering::SeqCst);
        assert!(!req.check_timeout(past_deadline));
        assert!(!fired.load(Ordering::SeqCst), "timeout callback must not fire a second time");
    }

    #[test]
    fn request_with_no_timeout_never_fires() {
        let mut req = Request::new(Target::Sql, Mode::OneShot, LoggableContext::default(), Bytes::new());
        req.arm_timeout(Instant::now());
        assert!(!req.check_timeout(Instant::now() + Duration::from_secs(3600)));
        assert!(!req.has_timed_out());
    }

    #[test]
    fn take_timeout_extracts_a_deadline_and_the_callback_fires_exactly_once() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let mut req = Request::new(Target::KvCache, Mode::KeepAlive, LoggableContext::default(), Bytes::new())
            .with_timeout(Duration::from_millis(20_000), Box::new(move || fired2.store(true, Ordering::SeqCst)));

        let now = Instant::now();
        let (deadline, callback) = req.take_timeout(now).expect("timeout was armed");
        assert_eq!(deadline, now + Duration::from_millis(20_000));

        assert!(req.take_timeout(now).is_none(), "a second take must find nothing left to extract");

        callback();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn take_timeout_on_a_request_with_no_timeout_is_none() {
        let mut req = Request::new(Target::Sql, Mode::OneShot, LoggableContext::default(), Bytes::new());
        assert!(req.take_timeout(Instant::now()).is_none());
    }

    #[test]
    fn invalidate_control_flag_is_surfaced() {
        let plain = Request::new(Target::Sql, Mode::OneShot, LoggableContext::default(), Bytes::new());
        assert!(!plain.is_invalidating());

        let invalidating =
            Request::new(Target::Sql, Mode::OneShot, LoggableContext::default(), Bytes::new()).with_control(Control::Invalidate);
        assert!(invalidating.is_invalidating());
    }
}
