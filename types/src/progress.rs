// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

use crate::Stage;

/// Progress reports streamed back to the submitting client while a job
/// runs. `Done` and `Failed` are terminal: nothing follows them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Progress {
    Start,
    WorkerStart {
        peer_url: String,
        worker_url: String,
    },
    ThreadEndedOnWorker {
        worker_url: String,
        stage: Stage,
        remaining: usize,
    },
    StageEndedOnWorker {
        worker_url: String,
        stage: Stage,
    },
    StageEnded {
        stage: Stage,
    },
    Result {
        url: String,
    },
    Done,
    Failed {
        reason: String,
    },
}

impl Progress {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Progress::Done | Progress::Failed { .. })
    }
}
