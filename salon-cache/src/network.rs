// Copyright 2025 salon Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;

use salon_common::queue::UniqueQueue;

use crate::{image::ImageId, loader::Loader};

/// Bookkeeping for the bounded loader pool.
///
/// Insertion order into the queue defines dispatch order; the in-flight set has no
/// order. The dispatch cycle itself lives in the controller, which owns the memory
/// state the cycle is gated on.
pub struct Network {
    queue: UniqueQueue<ImageId>,
    inflight: HashMap<ImageId, Loader>,
    loaders_max: usize,

    /// Monotonic count of loads that completed.
    loaded: u64,
    /// Monotonic count of loads that failed or timed out.
    errored: u64,
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("queued", &self.queue.len())
            .field("inflight", &self.inflight.len())
            .field("loaders_max", &self.loaders_max)
            .finish()
    }
}

impl Network {
    /// Create a pool dispatching at most `loaders_max` concurrent loaders.
    pub fn new(loaders_max: usize) -> Self {
        Self {
            queue: UniqueQueue::new(),
            inflight: HashMap::new(),
            loaders_max,
            loaded: 0,
            errored: 0,
        }
    }

    /// Enqueue an image for loading, deduplicated against both the queue and the
    /// in-flight set.
    ///
    /// Returns `false` if the image is already tracked.
    pub fn add(&mut self, image: ImageId) -> bool {
        if self.inflight.contains_key(&image) {
            return false;
        }
        self.queue.push(image)
    }

    /// Drop an image from the pool: dequeue it if pending, detach its loader if in
    /// flight.
    ///
    /// The returned loader must be aborted by the caller (outside any lock held
    /// around this pool).
    pub fn remove(&mut self, image: ImageId) -> Option<Loader> {
        self.queue.remove(&image);
        self.inflight.remove(&image)
    }

    /// Returns `true` while another loader may be dispatched.
    pub fn has_capacity(&self) -> bool {
        self.inflight.len() < self.loaders_max
    }

    /// Pop the next image to dispatch, respecting the concurrency cap.
    pub fn pop_ready(&mut self) -> Option<ImageId> {
        if !self.has_capacity() {
            return None;
        }
        self.queue.pop()
    }

    /// Track a dispatched loader in the in-flight set.
    pub fn launch(&mut self, image: ImageId, loader: Loader) {
        let old = self.inflight.insert(image, loader);
        debug_assert!(old.is_none(), "image dispatched twice");
    }

    /// Settle a completed load. Returns the loader if it was still tracked.
    pub fn on_loaded(&mut self, image: ImageId) -> Option<Loader> {
        self.inflight.remove(&image).inspect(|_| self.loaded += 1)
    }

    /// Settle a failed load. Returns the loader if it was still tracked.
    pub fn on_errored(&mut self, image: ImageId) -> Option<Loader> {
        self.inflight.remove(&image).inspect(|_| self.errored += 1)
    }

    /// Settle an aborted load. No counter changes.
    pub fn on_aborted(&mut self, image: ImageId) -> Option<Loader> {
        self.inflight.remove(&image)
    }

    /// Returns `true` if the image is queued or in flight.
    pub fn is_tracked(&self, image: ImageId) -> bool {
        self.queue.contains(&image) || self.inflight.contains_key(&image)
    }

    /// Number of queued images.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Number of in-flight loaders.
    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    /// Monotonic count of completed loads.
    pub fn loaded(&self) -> u64 {
        self.loaded
    }

    /// Monotonic count of failed loads.
    pub fn errored(&self) -> u64 {
        self.errored
    }

    /// Empty the pool, returning the in-flight loaders for the caller to abort.
    pub fn drain(&mut self) -> Vec<Loader> {
        self.queue.clear();
        self.inflight.drain().map(|(_, loader)| loader).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FetchJob;

    fn loader() -> Loader {
        Loader::new(FetchJob::new("http://localhost/x.png"))
    }

    #[test]
    fn test_dedup_against_queue_and_inflight() {
        let mut network = Network::new(2);

        assert!(network.add(ImageId(1)));
        assert!(!network.add(ImageId(1)));

        let popped = network.pop_ready().unwrap();
        assert_eq!(popped, ImageId(1));
        network.launch(popped, loader());

        // In flight, still deduplicated.
        assert!(!network.add(ImageId(1)));
        assert!(network.is_tracked(ImageId(1)));
    }

    #[test]
    fn test_concurrency_cap() {
        let mut network = Network::new(2);
        for i in 0..5 {
            network.add(ImageId(i));
        }

        while let Some(image) = network.pop_ready() {
            network.launch(image, loader());
        }
        assert_eq!(network.inflight_len(), 2);
        assert_eq!(network.queue_len(), 3);

        // A settled load frees a slot.
        assert!(network.on_loaded(ImageId(0)).is_some());
        assert_eq!(network.pop_ready(), Some(ImageId(2)));
        assert_eq!(network.loaded(), 1);
    }

    #[test]
    fn test_counters() {
        let mut network = Network::new(4);
        for i in 0..3 {
            network.add(ImageId(i));
            let image = network.pop_ready().unwrap();
            network.launch(image, loader());
        }

        network.on_loaded(ImageId(0));
        network.on_errored(ImageId(1));
        network.on_aborted(ImageId(2));

        assert_eq!(network.loaded(), 1);
        assert_eq!(network.errored(), 1);
        assert_eq!(network.inflight_len(), 0);

        // Settling an untracked image changes nothing.
        assert!(network.on_loaded(ImageId(0)).is_none());
        assert_eq!(network.loaded(), 1);
    }

    #[test]
    fn test_drain() {
        let mut network = Network::new(1);
        network.add(ImageId(1));
        network.add(ImageId(2));
        let image = network.pop_ready().unwrap();
        network.launch(image, loader());

        let loaders = network.drain();
        assert_eq!(loaders.len(), 1);
        assert_eq!(network.queue_len(), 0);
        assert_eq!(network.inflight_len(), 0);
    }
}
