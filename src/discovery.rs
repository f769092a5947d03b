//! Batch discovery: walk batch numbers `1, 2, ...` until the remote says "not found".

use std::iter::FusedIterator;

use tracing::debug;

use crate::constants::naming::FIRST_BATCH_NUMBER;
use crate::errors::MaterializeError;
use crate::layout::{BatchLocator, DatasetLayout};
use crate::partition::PartitionKey;
use crate::transport::{ProbeOutcome, RemoteStore};

/// Lazy probe sequence over one partition's batches.
///
/// Each call to `next` issues exactly one existence probe. The sequence ends
/// at the first `NotFound`; a probe failure or the batch cap yields one error
/// and then ends. Callers interleave fetches between items, so batch `n + 1`
/// is only probed after batch `n` has been handled.
pub struct ProbeSequence<'a> {
    remote: &'a dyn RemoteStore,
    layout: &'a DatasetLayout,
    partition: PartitionKey,
    max_batches: u32,
    next_batch: u32,
    probes_issued: u32,
    done: bool,
}

impl<'a> ProbeSequence<'a> {
    /// Start discovery for `partition`, allowing at most `max_batches` batches.
    pub fn new(
        remote: &'a dyn RemoteStore,
        layout: &'a DatasetLayout,
        partition: PartitionKey,
        max_batches: u32,
    ) -> Self {
        Self {
            remote,
            layout,
            partition,
            max_batches,
            next_batch: FIRST_BATCH_NUMBER,
            probes_issued: 0,
            done: false,
        }
    }

    /// Probes sent so far.
    pub fn probes_issued(&self) -> u32 {
        self.probes_issued
    }

    /// Batch number the next probe would target.
    pub fn next_batch(&self) -> u32 {
        self.next_batch
    }
}

impl Iterator for ProbeSequence<'_> {
    type Item = Result<BatchLocator, MaterializeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let locator = self.layout.locator(self.partition, self.next_batch);
        let url = self.layout.remote_url(&locator);
        self.probes_issued += 1;
        let outcome = self.remote.probe(&url);
        debug!(partition = %self.partition, batch = self.next_batch, ?outcome, "probe");

        match outcome {
            Ok(ProbeOutcome::NotFound) => {
                self.done = true;
                None
            }
            Ok(ProbeOutcome::Exists) if self.next_batch > self.max_batches => {
                self.done = true;
                Some(Err(MaterializeError::SafetyLimitExceeded {
                    partition: self.partition,
                    limit: self.max_batches,
                }))
            }
            Ok(ProbeOutcome::Exists) => {
                self.next_batch += 1;
                Some(Ok(locator))
            }
            Err(err) => {
                self.done = true;
                Some(Err(MaterializeError::Probe {
                    url,
                    reason: err.reason().to_string(),
                }))
            }
        }
    }
}

impl FusedIterator for ProbeSequence<'_> {}
