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

use salon_common::error::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::{
    controller::Controller,
    decode::{BitmapProbe, Decoder},
    fetch::{Fetcher, HttpFetcher, DEFAULT_LOADER_TIMEOUT},
};

/// Configuration of a [`Controller`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Soft ceiling for compressed plus decoded bytes.
    pub ram_bytes_budget: u64,
    /// Soft ceiling for decoded bytes across all requested extents.
    pub video_bytes_budget: u64,
    /// Maximum concurrent loaders.
    pub loaders_max: usize,
    /// Overall deadline applied to each loader.
    pub loader_timeout: Duration,
    /// HTTP headers applied to every fetch, before per-request headers.
    pub headers: Vec<(String, String)>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            ram_bytes_budget: 256 << 20,
            video_bytes_budget: 512 << 20,
            loaders_max: 16,
            loader_timeout: DEFAULT_LOADER_TIMEOUT,
            headers: Vec::new(),
        }
    }
}

/// Builder of a [`Controller`].
///
/// ```rust,ignore
/// let controller = ControllerBuilder::new()
///     .with_ram_bytes_budget(64 << 20)
///     .with_video_bytes_budget(128 << 20)
///     .with_loaders_max(8)
///     .build()?;
/// ```
pub struct ControllerBuilder {
    config: ControllerConfig,
    fetcher: Option<Arc<dyn Fetcher>>,
    decoder: Option<Arc<dyn Decoder>>,
}

impl Default for ControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ControllerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerBuilder").field("config", &self.config).finish()
    }
}

impl ControllerBuilder {
    /// Create a builder with the default configuration.
    pub fn new() -> Self {
        Self {
            config: ControllerConfig::default(),
            fetcher: None,
            decoder: None,
        }
    }

    /// Start from an existing configuration.
    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the soft ceiling for compressed plus decoded bytes.
    pub fn with_ram_bytes_budget(mut self, bytes: u64) -> Self {
        self.config.ram_bytes_budget = bytes;
        self
    }

    /// Set the soft ceiling for decoded bytes across all requested extents.
    pub fn with_video_bytes_budget(mut self, bytes: u64) -> Self {
        self.config.video_bytes_budget = bytes;
        self
    }

    /// Set the maximum number of concurrent loaders.
    pub fn with_loaders_max(mut self, loaders_max: usize) -> Self {
        self.config.loaders_max = loaders_max;
        self
    }

    /// Set the overall deadline applied to each loader.
    pub fn with_loader_timeout(mut self, timeout: Duration) -> Self {
        self.config.loader_timeout = timeout;
        self
    }

    /// Append an HTTP header applied to every fetch.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.headers.push((name.into(), value.into()));
        self
    }

    /// Replace the byte transport. Defaults to [`HttpFetcher`].
    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Replace the dimension probe. Defaults to [`BitmapProbe`].
    pub fn with_decoder(mut self, decoder: Arc<dyn Decoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Build the controller.
    pub fn build(self) -> Result<Controller> {
        if self.config.loaders_max == 0 {
            return Err(Error::config("loaders_max must be greater than zero")
                .with_detail("loaders_max", self.config.loaders_max));
        }
        if self.config.ram_bytes_budget == 0 || self.config.video_bytes_budget == 0 {
            return Err(Error::config("memory budgets must be greater than zero")
                .with_detail("ram_bytes_budget", self.config.ram_bytes_budget)
                .with_detail("video_bytes_budget", self.config.video_bytes_budget));
        }

        let fetcher = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpFetcher::new()?),
        };
        let decoder = self.decoder.unwrap_or_else(|| Arc::new(BitmapProbe));

        Ok(Controller::new(self.config, fetcher, decoder))
    }
}
