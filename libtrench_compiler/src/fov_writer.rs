use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread::JoinHandle;

use super::error::SinkError;
use super::stack_sink::{CroppedStack, LaneAttributes, StackSink};

/// Number of cropped frames allowed to wait on a writer before senders block
const QUEUE_DEPTH: usize = 16;

/// One lane of one source frame, ready to commit
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub source: PathBuf,
    pub fov: u32,
    pub lane_id: u32,
    pub stack: CroppedStack,
    pub attributes: LaneAttributes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaneFailure {
    pub lane_id: u32,
    pub reason: String,
}

/// What happened to the lanes of one source frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteOutcome {
    pub lanes_written: usize,
    pub failures: Vec<LaneFailure>,
}

pub type WrittenFiles = BTreeMap<PathBuf, WriteOutcome>;

/// The single writer of one FOV's output.
///
/// The sink lives on a dedicated thread and is only reachable through the request
/// channel, so commits for the FOV are applied one at a time in arrival order no
/// matter how many threads submit them. A failed commit is recorded against its
/// source frame and the writer moves on to the next request.
#[derive(Debug)]
pub struct FovWriter {
    fov: u32,
    tx: SyncSender<WriteRequest>,
    handle: JoinHandle<(WrittenFiles, Box<dyn StackSink>)>,
}

impl FovWriter {
    pub fn spawn(fov: u32, sink: Box<dyn StackSink>) -> Self {
        let (tx, rx) = sync_channel::<WriteRequest>(QUEUE_DEPTH);
        let handle = std::thread::spawn(move || run_writer(fov, sink, rx));
        Self { fov, tx, handle }
    }

    /// A handle for submitting from another thread. Every clone must be dropped
    /// before the writer can be finished.
    #[cfg(test)]
    pub fn sender(&self) -> SyncSender<WriteRequest> {
        self.tx.clone()
    }

    pub fn submit(&self, request: WriteRequest) -> Result<(), SinkError> {
        self.tx
            .send(request)
            .map_err(|_| SinkError::WriterGone(self.fov))
    }

    /// Close the queue, wait for every pending commit, and finish the sink
    pub fn finish(self) -> Result<WrittenFiles, SinkError> {
        let (written, sink) = self.drain()?;
        sink.finish()?;
        Ok(written)
    }

    /// Like [`FovWriter::finish`], but the output is left marked as incomplete
    pub fn abandon(self) -> Result<WrittenFiles, SinkError> {
        let (written, sink) = self.drain()?;
        sink.abandon()?;
        Ok(written)
    }

    fn drain(self) -> Result<(WrittenFiles, Box<dyn StackSink>), SinkError> {
        let Self { fov, tx, handle } = self;
        drop(tx);
        handle.join().map_err(|_| SinkError::WriterGone(fov))
    }
}

fn run_writer(
    fov: u32,
    mut sink: Box<dyn StackSink>,
    rx: Receiver<WriteRequest>,
) -> (WrittenFiles, Box<dyn StackSink>) {
    let mut written = WrittenFiles::new();
    for request in rx {
        let outcome = written.entry(request.source.clone()).or_default();
        match sink.commit(
            request.fov,
            request.lane_id,
            &request.stack,
            &request.attributes,
        ) {
            Ok(()) => outcome.lanes_written += 1,
            Err(e) => {
                spdlog::error!(
                    "FOV {} lane {}: failed to write {}: {}",
                    fov,
                    request.lane_id,
                    request.source.display(),
                    e
                );
                outcome.failures.push(LaneFailure {
                    lane_id: request.lane_id,
                    reason: e.to_string(),
                });
            }
        }
    }
    (written, sink)
}
