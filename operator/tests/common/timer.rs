// SPDX-FileCopyrightText: The etcd-operator Authors
//
// SPDX-License-Identifier: MIT

use log::debug;
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, sleep};

/// Retries an async check at a fixed interval until it succeeds or the
/// timeout runs out.
pub struct Poller {
    timeout: Duration,
    interval: Duration,
    error_message: String,
}

impl Poller {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            interval: Duration::from_secs(1),
            error_message: "condition not met".to_string(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = message.into();
        self
    }

    pub async fn poll_async<F, Fut, T, E>(&self, mut check: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Debug,
    {
        let deadline = Instant::now() + self.timeout;
        loop {
            match check().await {
                Ok(value) => return Ok(value),
                Err(e) if Instant::now() + self.interval > deadline => {
                    return Err(anyhow::anyhow!("{}: {e:?}", self.error_message));
                }
                Err(e) => debug!("{e:?}, retrying"),
            }
            sleep(self.interval).await;
        }
    }
}
