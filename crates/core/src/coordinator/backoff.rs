// Copyright © 2026 Kirky.X
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

use crate::config::BackoffConfig;
use crate::types::{CoreError, Result};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// 指数退避
///
/// Each [`Backoff::wait`] sleeps for the current delay and then multiplies
/// it, capped at the configured maximum.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    next_wait: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let next_wait = config.initial_delay();
        Self { config, next_wait }
    }

    /// The delay the next [`Backoff::wait`] will sleep for.
    pub fn next_wait(&self) -> Duration {
        self.next_wait
    }

    pub fn reset(&mut self) {
        self.next_wait = self.config.initial_delay();
    }

    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => return Err(CoreError::Cancelled),
            _ = tokio::time::sleep(self.next_wait) => {}
        }

        self.next_wait = self
            .next_wait
            .saturating_mul(self.config.multiplier.max(1))
            .min(self.config.max_delay());
        Ok(())
    }
}
