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

//! Utilities for testing.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use salon_common::error::{Error, Result};

use crate::{
    config::ControllerBuilder,
    controller::Controller,
    decode::Decoder,
    fetch::{FetchJob, Fetcher},
    loader::{LoadError, LoaderHandle},
};

/// A [`Fetcher`] that records jobs for the test to drive by hand.
///
/// Nothing happens until the test resolves a job through its [`LoaderHandle`], so
/// any interleaving of loads, failures, and cancellations can be scripted
/// deterministically.
pub struct MockFetcher {
    jobs: Arc<Mutex<Vec<(FetchJob, LoaderHandle)>>>,
}

impl Default for MockFetcher {
    fn default() -> Self {
        Self {
            jobs: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Clone for MockFetcher {
    fn clone(&self) -> Self {
        Self {
            jobs: self.jobs.clone(),
        }
    }
}

impl std::fmt::Debug for MockFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockFetcher").field("jobs", &self.jobs.lock().len()).finish()
    }
}

impl Fetcher for MockFetcher {
    fn fetch(&self, job: FetchJob, loader: LoaderHandle) {
        self.jobs.lock().push((job, loader));
    }
}

impl MockFetcher {
    /// Total number of jobs ever dispatched to this fetcher.
    pub fn dispatched(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Number of dispatched jobs that have not reached a terminal state.
    pub fn pending(&self) -> usize {
        self.jobs.lock().iter().filter(|(_, loader)| !loader.is_terminal()).count()
    }

    /// The recorded job at `index`.
    pub fn job(&self, index: usize) -> FetchJob {
        self.jobs.lock()[index].0.clone()
    }

    /// URLs of dispatched jobs that have not reached a terminal state.
    pub fn pending_urls(&self) -> Vec<String> {
        self.jobs
            .lock()
            .iter()
            .filter(|(_, loader)| !loader.is_terminal())
            .map(|(job, _)| job.url.to_string())
            .collect()
    }

    /// The latest non-terminal handle for `url`.
    pub fn handle(&self, url: &str) -> Option<LoaderHandle> {
        self.jobs
            .lock()
            .iter()
            .rev()
            .find(|(job, loader)| job.url.as_ref() == url && !loader.is_terminal())
            .map(|(_, loader)| loader.clone())
    }

    /// Complete the in-flight load for `url` with `payload`.
    ///
    /// Panics if no load for `url` is in flight.
    pub fn complete(&self, url: &str, payload: &[u8]) {
        let handle = self.handle(url).expect("no load in flight for url");
        handle.started(Some(payload.len() as u64));
        handle.loaded(Bytes::copy_from_slice(payload));
    }

    /// Fail the in-flight load for `url`.
    ///
    /// Panics if no load for `url` is in flight.
    pub fn fail(&self, url: &str, error: LoadError) {
        let handle = self.handle(url).expect("no load in flight for url");
        handle.started(None);
        handle.failed(error);
    }
}

/// A [`Decoder`] that reads dimensions from a `"WxH"` text prefix.
///
/// [`payload`] builds matching blobs of arbitrary compressed size. Any other
/// payload fails to decode, which is how tests exercise the blob-error path.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockDecoder;

impl Decoder for MockDecoder {
    fn dimensions(&self, blob: &[u8]) -> Result<(u32, u32)> {
        let text: String = blob
            .iter()
            .take_while(|b| b.is_ascii_digit() || **b == b'x')
            .map(|b| *b as char)
            .collect();
        let (w, h) = text
            .split_once('x')
            .ok_or_else(|| Error::decode("payload is not a mock bitmap"))?;
        let width = w
            .parse::<u32>()
            .map_err(|e| Error::decode("bad mock width").caused_by(e))?;
        let height = h
            .parse::<u32>()
            .map_err(|e| Error::decode("bad mock height").caused_by(e))?;
        Ok((width, height))
    }
}

/// Build a mock payload decoding to `width`×`height`, padded to `len` bytes.
pub fn payload(width: u32, height: u32, len: usize) -> Vec<u8> {
    let mut bytes = format!("{width}x{height}").into_bytes();
    bytes.push(b'|');
    if bytes.len() < len {
        bytes.resize(len, 0);
    }
    bytes
}

/// A controller wired to a [`MockFetcher`] and [`MockDecoder`].
pub fn controller_for_test(ram_bytes_budget: u64, video_bytes_budget: u64, loaders_max: usize) -> (Controller, MockFetcher) {
    let fetcher = MockFetcher::default();
    let controller = ControllerBuilder::new()
        .with_ram_bytes_budget(ram_bytes_budget)
        .with_video_bytes_budget(video_bytes_budget)
        .with_loaders_max(loaders_max)
        .with_fetcher(Arc::new(fetcher.clone()))
        .with_decoder(Arc::new(MockDecoder))
        .build()
        .expect("test controller config must be valid");
    (controller, fetcher)
}
