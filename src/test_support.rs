//! Shared unit-test doubles: a scripted in-memory remote and parquet fixtures.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use parquet::data_type::{ByteArray, ByteArrayType, Int64Type};
use parquet::file::properties::WriterProperties;
use parquet::file::writer::SerializedFileWriter;
use parquet::schema::parser::parse_message_type;

use crate::layout::DatasetLayout;
use crate::partition::PartitionKey;
use crate::transport::{ProbeOutcome, RemoteStore, TransferError};

/// One scripted `fetch` reply consumed before the stored body is served.
pub enum FetchStep {
    /// Write `prefix` bytes of the body, then fail.
    Fail { prefix: usize, error: TransferError },
    /// Serve these bytes instead of the stored body.
    Serve(Vec<u8>),
}

/// In-memory remote keyed by URL, with scripted faults and call accounting.
#[derive(Default)]
pub struct ScriptedRemote {
    objects: HashMap<String, Vec<u8>>,
    probe_faults: HashMap<String, TransferError>,
    fetch_script: Mutex<HashMap<String, VecDeque<FetchStep>>>,
    stalls: HashMap<String, Duration>,
    latency: Duration,
    probes: Mutex<Vec<String>>,
    fetches: Mutex<Vec<String>>,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

impl ScriptedRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `bodies` as batches `1..=bodies.len()` of `partition`.
    pub fn with_partition(
        mut self,
        layout: &DatasetLayout,
        partition: PartitionKey,
        bodies: Vec<Vec<u8>>,
    ) -> Self {
        for (idx, body) in bodies.into_iter().enumerate() {
            let locator = layout.locator(partition, idx as u32 + 1);
            self.objects.insert(layout.remote_url(&locator), body);
        }
        self
    }

    pub fn with_probe_fault(mut self, url: impl Into<String>, error: TransferError) -> Self {
        self.probe_faults.insert(url.into(), error);
        self
    }

    pub fn with_fetch_script(self, url: impl Into<String>, steps: Vec<FetchStep>) -> Self {
        self.fetch_script
            .lock()
            .expect("fetch script poisoned")
            .insert(url.into(), steps.into_iter().collect());
        self
    }

    /// Every call sleeps for `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Probes of `url` block for `duration`.
    pub fn with_stall(mut self, url: impl Into<String>, duration: Duration) -> Self {
        self.stalls.insert(url.into(), duration);
        self
    }

    pub fn probe_log(&self) -> Vec<String> {
        self.probes.lock().expect("probe log poisoned").clone()
    }

    pub fn fetch_log(&self) -> Vec<String> {
        self.fetches.lock().expect("fetch log poisoned").clone()
    }

    pub fn peak_active(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }

    fn enter(&self) -> ActiveGuard<'_> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        ActiveGuard {
            active: &self.active,
        }
    }
}

struct ActiveGuard<'a> {
    active: &'a AtomicUsize,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RemoteStore for ScriptedRemote {
    fn probe(&self, url: &str) -> Result<ProbeOutcome, TransferError> {
        let _guard = self.enter();
        self.probes
            .lock()
            .expect("probe log poisoned")
            .push(url.to_string());
        if let Some(duration) = self.stalls.get(url) {
            thread::sleep(*duration);
        }
        if let Some(error) = self.probe_faults.get(url) {
            return Err(error.clone());
        }
        if self.objects.contains_key(url) {
            Ok(ProbeOutcome::Exists)
        } else {
            Ok(ProbeOutcome::NotFound)
        }
    }

    fn fetch(&self, url: &str, sink: &mut dyn Write) -> Result<u64, TransferError> {
        let _guard = self.enter();
        self.fetches
            .lock()
            .expect("fetch log poisoned")
            .push(url.to_string());
        let body = self
            .objects
            .get(url)
            .ok_or_else(|| TransferError::Permanent(format!("HTTP 404 for {url}")))?;
        let step = self
            .fetch_script
            .lock()
            .expect("fetch script poisoned")
            .get_mut(url)
            .and_then(VecDeque::pop_front);
        let payload = match step {
            Some(FetchStep::Fail { prefix, error }) => {
                let prefix = prefix.min(body.len());
                sink.write_all(&body[..prefix])
                    .map_err(|err| TransferError::Permanent(err.to_string()))?;
                return Err(error);
            }
            Some(FetchStep::Serve(bytes)) => bytes,
            None => body.clone(),
        };
        sink.write_all(&payload)
            .map_err(|err| TransferError::Permanent(err.to_string()))?;
        Ok(payload.len() as u64)
    }
}

/// Parquet bytes with an `id` INT64 column and a `label` UTF8 column.
pub fn parquet_bytes(rows: &[(i64, &str)]) -> Vec<u8> {
    let temp = tempfile::NamedTempFile::new().unwrap();
    write_parquet_fixture(temp.path(), rows);
    std::fs::read(temp.path()).unwrap()
}

/// `count` parquet bodies whose ids start at `first_id`, two rows each.
pub fn parquet_batches(first_id: i64, count: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|idx| {
            let base = first_id + (idx as i64) * 2;
            parquet_bytes(&[(base, "even"), (base + 1, "odd")])
        })
        .collect()
}

pub fn write_parquet_fixture(path: &Path, rows: &[(i64, &str)]) {
    let schema = Arc::new(
        parse_message_type(
            "message batch_schema {
                REQUIRED INT64 id;
                REQUIRED BINARY label (UTF8);
            }",
        )
        .unwrap(),
    );
    let props = Arc::new(WriterProperties::builder().build());
    let file = File::create(path).unwrap();
    let mut writer = SerializedFileWriter::new(file, schema, props).unwrap();
    let mut row_group = writer.next_row_group().unwrap();

    if let Some(mut col_writer) = row_group.next_column().unwrap() {
        let values = rows.iter().map(|(id, _)| *id).collect::<Vec<_>>();
        col_writer
            .typed::<Int64Type>()
            .write_batch(&values, None, None)
            .unwrap();
        col_writer.close().unwrap();
    }

    if let Some(mut col_writer) = row_group.next_column().unwrap() {
        let values = rows
            .iter()
            .map(|(_, label)| ByteArray::from(*label))
            .collect::<Vec<_>>();
        col_writer
            .typed::<ByteArrayType>()
            .write_batch(&values, None, None)
            .unwrap();
        col_writer.close().unwrap();
    }

    assert!(row_group.next_column().unwrap().is_none());
    row_group.close().unwrap();
    writer.close().unwrap();
}
