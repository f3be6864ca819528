use std::sync::Mutex;

use futures::future::BoxFuture;

use strand_core::error::{Result, StrandError};
use strand_core::traits::RunRecorder;
use strand_core::types::{NodeRecord, RunRecord};

/// Recorder that keeps everything in memory, or fails every write.
#[derive(Default)]
pub struct MemoryRecorder {
    pub runs: Mutex<Vec<RunRecord>>,
    pub nodes: Mutex<Vec<NodeRecord>>,
    broken: bool,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A recorder whose every write fails.
    pub fn broken() -> Self {
        Self {
            broken: true,
            ..Self::default()
        }
    }
}

impl RunRecorder for MemoryRecorder {
    fn record_run(&self, record: RunRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.broken {
                return Err(StrandError::Io(std::io::Error::other("disk full")));
            }
            self.runs.lock().unwrap().push(record);
            Ok(())
        })
    }

    fn record_node(&self, record: NodeRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.broken {
                return Err(StrandError::Io(std::io::Error::other("disk full")));
            }
            self.nodes.lock().unwrap().push(record);
            Ok(())
        })
    }
}
