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

//! The `Bridge` is the only channel the hub thread has back onto the main
//! thread. It owns a small pump task on the main thread's runtime that
//! drains a heap of pending closures in `(deadline, submission order)`,
//! which is what gives `call_on_main_thread` its "equal delays preserve
//! submission order" guarantee: two calls submitted with the same delay
//! race on a real timer otherwise, but here they're ordered by a monotonic
//! sequence number before the deadline is even compared.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::sleep_until;

use crate::errors::FatalError;

pub type BoxedCall = Box<dyn FnOnce() + Send + 'static>;

struct PendingCall {
    deadline: Instant,
    seq: u64,
    func: BoxedCall,
}

impl PartialEq for PendingCall {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for PendingCall {}

impl PartialOrd for PendingCall {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

impl Ord for PendingCall {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; we want the earliest deadline (and, for
        // ties, the lowest sequence number) to sort first, so reverse both.
        other.deadline.cmp(&self.deadline).then_with(|| other.seq.cmp(&self.seq))
    }
}

enum BridgeMessage {
    Call(PendingCall),
    Fatal(FatalError),
}

/// Handle held by the hub thread (and anything else that needs to schedule
/// work back onto the main thread).
#[derive(Clone)]
pub struct Bridge {
    tx: mpsc::UnboundedSender<BridgeMessage>,
    seq: Arc<AtomicU64>,
}

impl Bridge {
    /// Spawns the pump task onto `main_runtime` and returns a handle to it.
    /// Must be called from a context where `main_runtime` is the runtime
    /// the application intends to keep driving Task/Subscription objects
    /// on (conventionally the process's primary multi-threaded runtime).
    pub fn new(main_runtime: &Handle) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        main_runtime.spawn(Self::pump(rx));
        Bridge { tx, seq: Arc::new(AtomicU64::new(0)) }
    }

    async fn pump(mut rx: mpsc::UnboundedReceiver<BridgeMessage>) {
        let mut heap: BinaryHeap<PendingCall> = BinaryHeap::new();

        loop {
            let next_wake = heap.peek().map(|pc| pc.deadline);

            tokio::select! {
                biased;

                msg = rx.recv() => {
                    match msg {
                        Some(BridgeMessage::Call(pc)) => heap.push(pc),
                        Some(BridgeMessage::Fatal(err)) => {
                            tracing::error!(error = %err, "fatal exception rethrown on main thread");
                            std::process::exit(70);
                        }
                        None => return,
                    }
                }

                _ = async {
                    match next_wake {
                        Some(deadline) => sleep_until(deadline.into()).await,
                        None => std::future::pending().await,
                    }
                } => {}
            }

            let now = Instant::now();
            while matches!(heap.peek(), Some(pc) if pc.deadline <= now) {
                if let Some(pc) = heap.pop() {
                    (pc.func)();
                }
            }
        }
    }

    /// Schedules `func` to run on the main thread after `delay`. A zero
    /// delay still goes through the pump (rather than running inline) so
    /// ordering relative to other pending calls is preserved.
    pub fn call_on_main_thread(&self, delay: Duration, func: BoxedCall) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        let pc = PendingCall { deadline: Instant::now() + delay, seq, func };
        let _ = self.tx.send(BridgeMessage::Call(pc));
    }

    /// Routes a fatal condition to the main thread's pump, which logs it
    /// and ends the process. There is no recovery path: this mirrors the
    /// original's uncaught-exception-terminates-process contract.
    pub fn throw_fatal_exception(&self, reason: impl Into<String>) {
        let _ = self.tx.send(BridgeMessage::Fatal(FatalError::new(reason.into())));
    }
}
