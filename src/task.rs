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

//! A promise-style chain of request/reply steps. Ported from
//! `ev::scheduler::Task` (`task.cc`): `step_` starts at `-1` (meaning "not
//! yet started"), each `Then` call appends a continuation, and `Catch`
//! builds the task — it's the only way to get a runnable `Task` out of a
//! `TaskBuilder`, matching the original's "Catch is the pipeline's sole
//! entry point" contract.

use crate::errors::BackendError;
use crate::outcome::Outcome;
use crate::request::Request;
use crate::scheduler::{ObjectKind, SchedulerObject, StepOutcome as SchedulerStep};

/// What a `Then`/`Catch` step produced.
pub enum StepResult {
    /// Dispatch this request and resume the chain once it replies.
    Request(Request),
    /// No I/O needed; feed this outcome straight into the next step
    /// without a hub round trip.
    Value(Outcome),
    /// The chain is finished.
    Done,
}

type ThenFn = Box<dyn FnMut(Outcome) -> StepResult + Send>;
type CatchFn = Box<dyn FnMut(BackendError) -> StepResult + Send>;
type FinallyFn = Box<dyn FnMut(Result<Outcome, BackendError>) + Send>;

/// Builds a `Task`. Not runnable until `.catch(...)` is called.
pub struct TaskBuilder {
    initial: Request,
    steps: Vec<ThenFn>,
    finally: Vec<FinallyFn>,
}

impl TaskBuilder {
    pub fn new(initial: Request) -> Self {
        TaskBuilder { initial, steps: Vec::new(), finally: Vec::new() }
    }

    /// Appends a continuation run when the previous step (or the initial
    /// request) succeeds.
    pub fn then(mut self, f: impl FnMut(Outcome) -> StepResult + Send + 'static) -> Self {
        self.steps.push(Box::new(f));
        self
    }

    /// Appends a cleanup step that always runs once the chain settles,
    /// regardless of whether it ended in success or in `Catch`.
    pub fn finally(mut self, f: impl FnMut(Result<Outcome, BackendError>) + Send + 'static) -> Self {
        self.finally.push(Box::new(f));
        self
    }

    /// Installs the error handler and finalizes the task into something
    /// `Scheduler::push` can run. A task with no explicit error handling
    /// still has to call this — pass a handler that forwards the error to
    /// `finally` (or a closure returning `StepResult::Done`) if nothing
    /// more specific is needed.
    pub fn catch(self, f: impl FnMut(BackendError) -> StepResult + Send + 'static) -> Task {
        Task {
            initial: Some(self.initial),
            steps: self.steps,
            catch: Box::new(f),
            finally: self.finally,
            step: -1,
        }
    }
}

/// A runnable promise chain. Scheduled via `Scheduler::push`; the
/// scheduler drives it by calling `step` exactly once per hub round trip.
pub struct Task {
    initial: Option<Request>,
    steps: Vec<ThenFn>,
    catch: CatchFn,
    finally: Vec<FinallyFn>,
    step: i64,
}

impl Task {
    fn run_finally(&mut self, result: Result<Outcome, BackendError>) {
        for f in self.finally.iter_mut() {
            let cloned = match &result {
                Ok(o) => Ok(o.clone()),
                Err(e) => Err(e.clone()),
            };
            f(cloned);
        }
    }

    /// Feeds `input` through as many synchronous (`StepResult::Value`)
    /// transitions as the chain wants to take before it either needs to
    /// suspend on a new request or finishes outright.
    fn advance(&mut self, mut input: StepResult) -> SchedulerStep {
        loop {
            match input {
                StepResult::Request(request) => return SchedulerStep::Next(request),
                StepResult::Done => {
                    self.run_finally(Ok(Outcome::new(crate::request::Target::NotSet)));
                    return SchedulerStep::Finished;
                }
                StepResult::Value(outcome) => {
                    if outcome.is_error() {
                        let error = outcome.first_error().cloned().unwrap_or_else(|| BackendError::new("unknown error"));
                        input = (self.catch)(error);
                        continue;
                    }

                    self.step += 1;
                    match self.steps.get_mut(self.step as usize) {
                        Some(step_fn) => {
                            input = step_fn(outcome);
                        }
                        None => {
                            self.run_finally(Ok(outcome));
                            return SchedulerStep::Finished;
                        }
                    }
                }
            }
        }
    }
}

impl SchedulerObject for Task {
    fn kind(&self) -> ObjectKind { ObjectKind::Task }

    fn step(&mut self, outcome: Option<Outcome>) -> SchedulerStep {
        match outcome {
            None => {
                debug_assert_eq!(self.step, -1, "task's first step must run exactly once");
                let request = self.initial.take().expect("task started twice");
                SchedulerStep::Next(request)
            }
            Some(outcome) => {
                if outcome.is_error() {
                    let error = outcome.first_error().cloned().unwrap_or_else(|| BackendError::new("unknown error"));
                    let result = (self.catch)(error);
                    self.advance(result)
                } else {
                    self.advance(StepResult::Value(outcome))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{LoggableContext, Mode, Target};
    use crate::outcome::DataObject;
    use bytes::Bytes;
    use std::sync::{Arc, Mutex};

    fn dummy_request() -> Request {
        Request::new(Target::Sql, Mode::OneShot, LoggableContext::default(), Bytes::new())
    }

    #[test]
    fn round_trip_delivers_the_backend_result_to_finally() {
        let received = Arc::new(Mutex::new(None));
        let received2 = received.clone();

        let mut task = TaskBuilder::new(dummy_request())
            .finally(move |result| *received2.lock().unwrap() = Some(result))
            .catch(|_err| StepResult::Done);

        match task.step(None) {
            SchedulerStep::Next(_req) => {}
            _ => panic!("expected the initial request to be dispatched"),
        }

        let reply = Outcome::single(Target::Sql, DataObject::Reply(Bytes::from_static(b"1")));
        match task.step(Some(reply)) {
            SchedulerStep::Finished => {}
            _ => panic!("task with no further Then steps must finish on the first reply"),
        }

        let got = received.lock().unwrap().take().expect("finally ran exactly once");
        let got_outcome = got.expect("backend result was success");
        assert_eq!(got_outcome.data().len(), 1);
        assert!(!got_outcome.is_error());
    }

    #[test]
    fn chained_then_runs_with_the_previous_steps_outcome() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();

        let mut task = TaskBuilder::new(dummy_request())
            .then(move |outcome| {
                seen2.lock().unwrap().push(outcome.data().len());
                StepResult::Value(outcome)
            })
            .finally(|_| {})
            .catch(|_err| StepResult::Done);

        task.step(None);
        let reply = Outcome::single(Target::Sql, DataObject::Reply(Bytes::from_static(b"x")));
        let outcome = task.step(Some(reply));
        assert!(matches!(outcome, SchedulerStep::Finished));
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[test]
    fn error_outcome_routes_to_catch_instead_of_then() {
        let caught = Arc::new(Mutex::new(None));
        let caught2 = caught.clone();

        let mut task = TaskBuilder::new(dummy_request())
            .then(|_outcome| panic!("then must not run when the backend returned an error"))
            .catch(move |err| {
                *caught2.lock().unwrap() = Some(err.message.clone());
                StepResult::Done
            });

        task.step(None);
        let error_outcome = Outcome::single(Target::Sql, DataObject::Error(BackendError::new("nope")));
        let result = task.step(Some(error_outcome));
        assert!(matches!(result, SchedulerStep::Finished));
        assert_eq!(caught.lock().unwrap().as_deref(), Some("nope"));
    }

    #[test]
    fn then_can_suspend_the_chain_on_a_new_request() {
        let mut task = TaskBuilder::new(dummy_request())
            .then(|_outcome| StepResult::Request(dummy_request()))
            .finally(|_| {})
            .catch(|_err| StepResult::Done);

        task.step(None);
        let first_reply = Outcome::new(Target::Sql);
        match task.step(Some(first_reply)) {
            SchedulerStep::Next(_req) => {}
            _ => panic!("a Then step returning a request must suspend the chain, not finish it"),
        }
    }

    #[test]
    fn done_result_runs_finally_with_a_synthetic_success() {
        let ran = Arc::new(Mutex::new(false));
        let ran2 = ran.clone();

        let mut task = TaskBuilder::new(dummy_request())
            .then(|_outcome| StepResult::Done)
            .finally(move |result| {
                assert!(result.is_ok());
                *ran2.lock().unwrap() = true;
            })
            .catch(|_err| StepResult::Done);

        task.step(None);
        task.step(Some(Outcome::new(Target::Sql)));
        assert!(*ran.lock().unwrap());
    }
}
