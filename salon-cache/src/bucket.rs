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

use std::{collections::BTreeSet, sync::Arc};

use salon_common::event::{Emitter, HandlerId};

use crate::{
    controller::{ControllerShared, RequestOptions},
    loader::LoadError,
    request::{Extent, RenderRequest, RequestId},
};

/// Stable identifier of a bucket within its controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketId(pub(crate) u64);

/// Events of one bucket.
#[derive(Debug, Clone)]
pub enum BucketEvent {
    /// Aggregate load progress across the bucket's images changed.
    Progress {
        /// `Σ bytes loaded / Σ bytes total`, each image counted once.
        fraction: f64,
    },
    /// Every image referenced by the bucket finished loading.
    LoadEnd,
    /// An image referenced by the bucket failed to load or decode.
    Error {
        /// The failing source URL.
        url: Arc<str>,
        /// The failure.
        error: LoadError,
    },
    /// Every render request in the bucket reported it painted.
    Rendered,
    /// The bucket was cleared of all render requests.
    Clear,
}

/// A named group of render requests, owned by the controller registry.
pub(crate) struct BucketEntry {
    pub(crate) name: Arc<str>,
    pub(crate) locked: bool,
    pub(crate) requests: BTreeSet<RequestId>,
    pub(crate) emitter: Emitter<BucketEvent>,
}

impl BucketEntry {
    pub(crate) fn new(name: Arc<str>, locked: bool) -> Self {
        Self {
            name,
            locked,
            requests: BTreeSet::new(),
            emitter: Emitter::new(),
        }
    }
}

/// A handle to one named group of render requests sharing a lifecycle.
///
/// Locking a bucket pins every request in it (and through them, their images)
/// against eviction; unlocking restores the per-request pins only.
pub struct Bucket {
    pub(crate) shared: Arc<ControllerShared>,
    pub(crate) id: BucketId,
    pub(crate) name: Arc<str>,
    pub(crate) emitter: Emitter<BucketEvent>,
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket").field("name", &self.name).finish()
    }
}

impl Clone for Bucket {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            id: self.id,
            name: self.name.clone(),
            emitter: self.emitter.clone(),
        }
    }
}

impl Bucket {
    /// The bucket name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribe to this bucket's events.
    pub fn on<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&BucketEvent) + Send + Sync + 'static,
    {
        self.emitter.on(handler)
    }

    /// Unsubscribe a handler.
    pub fn off(&self, id: HandlerId) -> bool {
        self.emitter.off(id)
    }

    /// Request to display `url` at `size` within this bucket.
    pub fn request(&self, url: impl Into<String>, size: Extent) -> RenderRequest {
        ControllerShared::request(
            &self.shared,
            RequestOptions::new(url, size, self.name.to_string()),
        )
    }

    /// Pin every request in this bucket against eviction.
    pub fn lock(&self) {
        ControllerShared::set_bucket_locked(&self.shared, self.id, true);
    }

    /// Release the bucket lock, restoring per-request pins only.
    pub fn unlock(&self) {
        ControllerShared::set_bucket_locked(&self.shared, self.id, false);
    }

    /// Returns `true` while the bucket is locked.
    pub fn is_locked(&self) -> bool {
        self.shared
            .inner
            .lock()
            .buckets
            .get(&self.id)
            .map(|bucket| bucket.locked)
            .unwrap_or(false)
    }

    /// Aggregate load progress in `[0, 1]`, each image counted once.
    pub fn progress(&self) -> f64 {
        self.shared.inner.lock().bucket_progress(self.id)
    }

    /// Fraction of requests that have painted, in `[0, 1]`.
    pub fn rendered_fraction(&self) -> f64 {
        self.shared.inner.lock().bucket_rendered_fraction(self.id)
    }

    /// Number of render requests in the bucket.
    pub fn len(&self) -> usize {
        self.shared
            .inner
            .lock()
            .buckets
            .get(&self.id)
            .map(|bucket| bucket.requests.len())
            .unwrap_or(0)
    }

    /// Returns `true` if the bucket holds no render requests.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unregister every render request in the bucket.
    ///
    /// Images left without requests are evicted; in-flight loads are aborted. The
    /// bucket itself survives, empty. Idempotent.
    pub fn clear(&self) {
        ControllerShared::clear_bucket(&self.shared, self.id);
    }
}
