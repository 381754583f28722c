/*
 * SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
 * SPDX-License-Identifier: MIT
 *
 * Permission is hereby granted, free of charge, to any person obtaining a
 * copy of this software and associated documentation files (the "Software"),
 * to deal in the Software without restriction, including without limitation
 * the rights to use, copy, modify, merge, publish, distribute, sublicense,
 * and/or sell copies of the Software, and to permit persons to whom the
 * Software is furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL
 * THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
 * DEALINGS IN THE SOFTWARE.
 */
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::Pacer;
use crate::FirmwareError;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// An asynchronous controller-side task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub percent_complete: u8,
    /// Controller's own status string, e.g. "Completed" or "Failed"
    pub state: String,
}

impl Job {
    pub fn is_complete(&self) -> bool {
        self.percent_complete >= 100
    }

    pub fn is_failed(&self) -> bool {
        let state = self.state.to_ascii_lowercase();
        state.contains("fail") || state.contains("error")
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}% {}", self.id, self.percent_complete, self.state)
    }
}

pub trait JobSource {
    /// Every job the controller currently knows about.
    fn jobs(&self) -> Result<Vec<Job>, FirmwareError>;
}

/// Blocks until every job in `ids` reports 100%, polling every `interval`.
///
/// Jobs outside `ids` are ignored. There is no timeout; cancel through the
/// pacer. Returns the final state of each watched job in `ids` order.
pub fn wait_for_jobs(
    source: &dyn JobSource,
    ids: &[String],
    pacer: &Pacer,
    interval: Duration,
) -> Result<Vec<Job>, FirmwareError> {
    let mut outstanding: Vec<&String> = ids.iter().collect();
    let mut finished: BTreeMap<&str, Job> = BTreeMap::new();

    while !outstanding.is_empty() {
        pacer.checkpoint()?;
        for job in source.jobs()? {
            let Some(pos) = outstanding.iter().position(|id| **id == job.id) else {
                continue;
            };
            if job.is_complete() {
                info!("Job {job} finished");
                let id = outstanding.remove(pos);
                finished.insert(id.as_str(), job);
            } else {
                debug!("Job {job}");
            }
        }
        if !outstanding.is_empty() {
            pacer.wait(interval)?;
        }
    }

    Ok(ids
        .iter()
        .filter_map(|id| finished.remove(id.as_str()))
        .collect())
}
