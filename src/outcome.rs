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

//! `Outcome` is the crate's name for what the spec calls a "result" object:
//! renamed so it doesn't fight with `std::result::Result` at every call site.

use bytes::Bytes;

use crate::errors::BackendError;
use crate::request::Target;

/// A cache pub/sub event, as decoded by the `redis` device out of its
/// multiplexed subscribe-mode stream. Kept as a typed variant rather than
/// opaque bytes because `Subscription` (§4.8) has to branch on exactly
/// these four shapes and nothing else ever flows through a keep-alive
/// cache device.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    SubscribeAck { name: String, pattern: bool },
    UnsubscribeAck { name: String, pattern: bool },
    Message { channel: String, pattern: Option<String>, payload: Bytes },
    Pong,
}

/// A single piece of data a device produced while executing a request.
#[derive(Debug, Clone)]
pub enum DataObject {
    Reply(Bytes),
    Cache(CacheEvent),
    Error(BackendError),
}

impl DataObject {
    pub fn is_error(&self) -> bool {
        matches!(self, DataObject::Error(_))
    }
}

/// The ordered list of data objects a device produced for a request.
///
/// A one-shot request usually carries a single data object; a SQL backend
/// executing a multi-statement batch, or a keep-alive device replaying
/// buffered pub/sub messages, may attach several before the outcome is
/// delivered.
#[derive(Debug, Clone)]
pub struct Outcome {
    target: Target,
    data: Vec<DataObject>,
}

impl Outcome {
    pub fn new(target: Target) -> Self {
        Outcome { target, data: Vec::new() }
    }

    pub fn single(target: Target, object: DataObject) -> Self {
        let mut outcome = Outcome::new(target);
        outcome.attach(object);
        outcome
    }

    pub fn attach(&mut self, object: DataObject) {
        self.data.push(object);
    }

    pub fn target(&self) -> Target { self.target }

    pub fn data(&self) -> &[DataObject] { &self.data }

    pub fn into_data(self) -> Vec<DataObject> { self.data }

    pub fn is_error(&self) -> bool {
        self.data.iter().any(DataObject::is_error)
    }

    pub fn first_error(&self) -> Option<&BackendError> {
        self.data.iter().find_map(|d| match d {
            DataObject::Error(e) => Some(e),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_with_no_error_objects_is_not_an_error() {
        let mut outcome = Outcome::new(Target::Sql);
        outcome.attach(DataObject::Reply(Bytes::from_static(b"ok")));
        assert!(!outcome.is_error());
        assert!(outcome.first_error().is_none());
    }

    #[test]
    fn first_error_finds_the_error_among_several_data_objects() {
        let mut outcome = Outcome::new(Target::Sql);
        outcome.attach(DataObject::Reply(Bytes::from_static(b"partial")));
        outcome.attach(DataObject::Error(BackendError::new("boom")));
        assert!(outcome.is_error());
        assert_eq!(outcome.first_error().unwrap().message, "boom");
    }

    #[test]
    fn single_constructs_a_one_element_outcome() {
        let outcome = Outcome::single(Target::Http, DataObject::Reply(Bytes::from_static(b"x")));
        assert_eq!(outcome.data().len(), 1);
        assert_eq!(outcome.target(), Target::Http);
    }

    #[test]
    fn into_data_consumes_the_outcome() {
        let outcome = Outcome::single(Target::KvCache, DataObject::Error(BackendError::new("nope")));
        let data = outcome.into_data();
        assert_eq!(data.len(), 1);
        assert!(data[0].is_error());
    }
}
