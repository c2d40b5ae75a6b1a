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

use std::{sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use salon_common::error::{Error, Result};

use crate::loader::{LoadError, LoaderHandle};

/// Default loader deadline.
pub const DEFAULT_LOADER_TIMEOUT: Duration = Duration::from_secs(30);

/// One fetch order: a URL plus the request headers and deadline to apply.
#[derive(Debug, Clone)]
pub struct FetchJob {
    /// The source URL.
    pub url: Arc<str>,
    /// HTTP headers passed to the transport.
    pub headers: Vec<(String, String)>,
    /// Overall deadline for the fetch.
    pub timeout: Duration,
}

impl FetchJob {
    /// Create a job for `url` with no extra headers and the default deadline.
    pub fn new(url: impl Into<Arc<str>>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            timeout: DEFAULT_LOADER_TIMEOUT,
        }
    }

    /// Attach a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Override the deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// The byte transport behind the loader pool.
///
/// Implementations must not block: `fetch` is called from within the cache's
/// dispatch cycle and is expected to hand the work off (a spawned task, a queue, a
/// test double) and return. All reporting goes through the [`LoaderHandle`], which
/// keeps the loader event contract intact no matter how the transport behaves.
pub trait Fetcher: Send + Sync + 'static {
    /// Start fetching `job`, reporting through `loader`.
    fn fetch(&self, job: FetchJob, loader: LoaderHandle);
}

/// [`Fetcher`] over HTTP, streaming response bodies with progress reports.
///
/// Non-2xx statuses and transport failures map to [`LoadError::Network`]; an
/// elapsed deadline maps to [`LoadError::Timeout`]; cooperative cancellation is
/// observed between chunks.
pub struct HttpFetcher {
    client: reqwest::Client,
    handle: tokio::runtime::Handle,
}

impl std::fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFetcher").finish()
    }
}

impl HttpFetcher {
    /// Create a fetcher bound to the current tokio runtime.
    pub fn new() -> Result<Self> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::config("HttpFetcher must be created within a tokio runtime").caused_by(e))?;
        Ok(Self {
            client: reqwest::Client::new(),
            handle,
        })
    }

    /// Create a fetcher with a custom client and runtime handle.
    pub fn with_client(client: reqwest::Client, handle: tokio::runtime::Handle) -> Self {
        Self { client, handle }
    }

    async fn run(client: reqwest::Client, job: &FetchJob, loader: &LoaderHandle) -> std::result::Result<Bytes, LoadError> {
        let mut request = client.get(job.url.as_ref());
        for (name, value) in &job.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| LoadError::Network { reason: e.to_string() })?;

        let status = response.status();
        if !status.is_success() {
            return Err(LoadError::Network {
                reason: format!("unexpected status {status}"),
            });
        }

        let total = response.content_length();
        loader.started(total);

        let mut buf = BytesMut::with_capacity(total.unwrap_or(8 << 10) as usize);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| LoadError::Network { reason: e.to_string() })?;
            buf.extend_from_slice(&chunk);
            loader.progress(buf.len() as u64, total);
        }

        Ok(buf.freeze())
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, job: FetchJob, loader: LoaderHandle) {
        let client = self.client.clone();
        self.handle.spawn(async move {
            let res = tokio::select! {
                // The loader emits `Abort` itself; the task just stops reading.
                _ = loader.cancelled() => return,
                res = tokio::time::timeout(job.timeout, Self::run(client, &job, &loader)) => res,
            };
            match res {
                Err(_elapsed) => loader.failed(LoadError::Timeout),
                Ok(Ok(bytes)) => loader.loaded(bytes),
                Ok(Err(error)) => loader.failed(error),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use salon_common::error::ErrorKind;

    use super::*;

    #[test]
    fn test_fetch_job_builder() {
        let job = FetchJob::new("http://localhost/a.png")
            .with_header("authorization", "Bearer t")
            .with_timeout(Duration::from_secs(5));

        assert_eq!(job.url.as_ref(), "http://localhost/a.png");
        assert_eq!(job.headers.len(), 1);
        assert_eq!(job.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_http_fetcher_requires_runtime() {
        let err = HttpFetcher::new().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[tokio::test]
    async fn test_http_fetcher_within_runtime() {
        assert!(HttpFetcher::new().is_ok());
    }
}
