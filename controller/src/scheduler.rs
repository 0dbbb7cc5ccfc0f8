/*
Copyright 2024 The Kubernetes Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! The tick loop driving the reconciler.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::reconciler::Controller;

/// Runs `sync()` at a fixed interval until shut down. A sync in flight when
/// shutdown arrives is allowed to finish.
pub struct Scheduler {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Scheduler {
    pub fn start(controller: Arc<Controller>, interval: Duration) -> Scheduler {
        let token = CancellationToken::new();
        let loop_token = token.clone();

        let handle = tokio::spawn(async move {
            info!("controller started");

            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let ctrl = controller.clone();
                let start = Instant::now();
                debug!("started syncing");

                // sync() blocks on driver calls, keep it off the runtime
                // workers.
                if let Err(e) = tokio::task::spawn_blocking(move || ctrl.sync()).await {
                    error!(error = %e, "sync task panicked");
                }

                debug!(elapsed = ?start.elapsed(), "finished syncing");
            }

            info!("controller stopped");
        });

        Scheduler { token, handle }
    }

    /// Signal the loop to exit and wait for it, letting a running sync
    /// complete.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            error!(error = %e, "controller loop panicked");
        }
    }
}
