// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A factory for generating monotonically increasing typed identifiers.
//!
//! Used for listener ids and for interface ids handed out by the
//! simulated chip. Identifiers are never reused.

use std::ops::Add;

pub struct IdFactory<T>
where
    T: Add<Output = T> + Copy,
{
    next_id: T,
    increment: T,
    issued: usize,
}

impl<T> IdFactory<T>
where
    T: Add<Output = T> + Copy,
{
    pub fn new(start_id: T, increment: T) -> Self {
        Self { next_id: start_id, increment, issued: 0 }
    }

    pub fn next_id(&mut self) -> T {
        let id = self.next_id;
        self.next_id = self.next_id + self.increment;
        self.issued += 1;
        id
    }

    /// Number of identifiers handed out so far.
    pub fn issued(&self) -> usize {
        self.issued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::RwLock;
    type ListenerIdentifier = u64;

    #[test]
    fn test_listener_id_factory() {
        let ids: RwLock<IdFactory<ListenerIdentifier>> = RwLock::new(IdFactory::new(1, 1));
        assert_eq!(ids.write().unwrap().next_id(), 1);
        assert_eq!(ids.write().unwrap().next_id(), 2);
        assert_eq!(ids.write().unwrap().next_id(), 3);
        assert_eq!(ids.read().unwrap().issued(), 3);
    }

    #[test]
    fn test_stride() {
        let mut ids = IdFactory::new(100u32, 10);
        assert_eq!(ids.next_id(), 100);
        assert_eq!(ids.next_id(), 110);
    }
}
