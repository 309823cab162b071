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

//! Device pool handlers: `OneShotHandler` for request/reply traffic,
//! `KeepAliveHandler` for long-lived subscription traffic. Both live on the
//! hub thread only and are driven by `Hub`'s select loop.

pub mod keep_alive;
pub mod one_shot;

pub use keep_alive::KeepAliveHandler;
pub use one_shot::OneShotHandler;

use std::collections::HashMap;

use rand::Rng;

use crate::device::{Device, DeviceId};
use crate::errors::DeviceError;
use crate::outcome::Outcome;
use crate::request::{Request, Target};

/// Per-target connection caps, supplied at hub construction time.
/// Mirrors `DeviceLimitsStepCallback` in the original hub wiring.
pub type Limits = HashMap<Target, usize>;

pub fn limit_for(limits: &Limits, target: Target) -> usize {
    limits.get(&target).copied().unwrap_or(1)
}

/// Per-target `(min_queries_per_conn, max_queries_per_conn)`, straight out
/// of `PostgresConfig`/`RedisConfig`. Either side being negative means
/// "unlimited" — a one-shot device is never recycled early just because it
/// served a lot of requests.
pub type ReuseLimits = HashMap<Target, (i64, i64)>;

/// Picks how many more times a freshly created device may be checked out
/// before `OneShotHandler` retires it, regardless of what
/// `Device::is_reusable` says. A fresh random draw per device (rather than
/// a fixed cap) is what keeps every pooled connection from expiring in the
/// same instant under steady load.
pub fn sample_reuse_cap(limits: &ReuseLimits, target: Target) -> Option<u32> {
    let (min, max) = limits.get(&target).copied().unwrap_or((-1, -1));
    if min < 0 || max < 0 {
        return None;
    }
    let (min, max) = (min as u32, max as u32);
    if max <= min {
        return Some(max.max(1));
    }
    Some(rand::thread_rng().gen_range(min..=max))
}

/// Events fed back into the hub's select loop by work spawned on its
/// `LocalSet` (a device connecting, executing, or pushing unsolicited
/// data). The hub loop is the only place allowed to touch handler state,
/// so every outcome of async device work comes back through here instead
/// of being applied directly from the spawned task.
pub enum HubEvent {
    OneShotSettled {
        invoke_id: u64,
        tag: u8,
        device_id: DeviceId,
        device: Box<dyn Device>,
        request: Request,
        outcome: Result<Outcome, DeviceError>,
    },
    OneShotConnectFailed {
        invoke_id: u64,
        tag: u8,
        device_id: DeviceId,
        request: Request,
        error: DeviceError,
    },
    KeepAliveConnected {
        invoke_id: u64,
        tag: u8,
        device_id: DeviceId,
    },
    KeepAliveConnectFailed {
        invoke_id: u64,
        tag: u8,
        error: DeviceError,
    },
    KeepAliveUnsolicited {
        invoke_id: u64,
        tag: u8,
        device_id: DeviceId,
        outcome: Outcome,
    },
    KeepAliveDisconnected {
        invoke_id: u64,
        tag: u8,
        device_id: DeviceId,
        error: Option<DeviceError>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Target;

    #[test]
    fn sample_reuse_cap_is_unbounded_for_an_unconfigured_target() {
        let limits = ReuseLimits::new();
        assert_eq!(sample_reuse_cap(&limits, Target::Sql), None);
    }

    #[test]
    fn sample_reuse_cap_is_unbounded_when_either_side_is_negative() {
        let mut limits = ReuseLimits::new();
        limits.insert(Target::Sql, (-1, 5));
        assert_eq!(sample_reuse_cap(&limits, Target::Sql), None);
        limits.insert(Target::Sql, (2, -1));
        assert_eq!(sample_reuse_cap(&limits, Target::Sql), None);
    }

    #[test]
    fn sample_reuse_cap_stays_within_the_configured_range() {
        let mut limits = ReuseLimits::new();
        limits.insert(Target::Sql, (2, 5));
        for _ in 0..200 {
            let n = sample_reuse_cap(&limits, Target::Sql).expect("bounded cap");
            assert!((2..=5).contains(&n));
        }
    }

    #[test]
    fn sample_reuse_cap_is_fixed_when_min_equals_max() {
        let mut limits = ReuseLimits::new();
        limits.insert(Target::Sql, (3, 3));
        for _ in 0..20 {
            assert_eq!(sample_reuse_cap(&limits, Target::Sql), Some(3));
        }
    }

    #[test]
    fn limit_for_defaults_to_one_for_an_unconfigured_target() {
        let limits = Limits::new();
        assert_eq!(limit_for(&limits, Target::Http), 1);
    }

    #[test]
    fn limit_for_honors_a_configured_cap_of_zero() {
        let mut limits = Limits::new();
        limits.insert(Target::Http, 0);
        assert_eq!(limit_for(&limits, Target::Http), 0);
    }
}
