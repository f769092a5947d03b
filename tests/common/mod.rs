#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use lakefetch::{DatasetLayout, PartitionKey, ProbeOutcome, RemoteStore, TransferError};
use parquet::data_type::{ByteArray, ByteArrayType, Int64Type};
use parquet::file::properties::WriterProperties;
use parquet::file::writer::SerializedFileWriter;
use parquet::schema::parser::parse_message_type;

pub fn month(year: u32, month: u32) -> PartitionKey {
    PartitionKey::new(year, month).expect("valid month")
}

pub fn write_parquet_fixture(path: &Path, rows: &[(i64, &str)]) {
    let schema = Arc::new(
        parse_message_type(
            "message trips {
                REQUIRED INT64 trip_id;
                REQUIRED BINARY station (UTF8);
            }",
        )
        .expect("valid schema"),
    );
    let props = Arc::new(WriterProperties::builder().build());
    let file = File::create(path).expect("failed creating parquet fixture");
    let mut writer = SerializedFileWriter::new(file, schema, props).expect("parquet writer");
    let mut row_group = writer.next_row_group().expect("row group");

    if let Some(mut col_writer) = row_group.next_column().expect("trip_id column") {
        let values = rows.iter().map(|(id, _)| *id).collect::<Vec<_>>();
        col_writer
            .typed::<Int64Type>()
            .write_batch(&values, None, None)
            .expect("write trip_id");
        col_writer.close().expect("close trip_id");
    }
    if let Some(mut col_writer) = row_group.next_column().expect("station column") {
        let values = rows
            .iter()
            .map(|(_, station)| ByteArray::from(*station))
            .collect::<Vec<_>>();
        col_writer
            .typed::<ByteArrayType>()
            .write_batch(&values, None, None)
            .expect("write station");
        col_writer.close().expect("close station");
    }
    row_group.close().expect("close row group");
    writer.close().expect("close parquet writer");
}

pub fn parquet_bytes(rows: &[(i64, &str)]) -> Vec<u8> {
    let temp = tempfile::NamedTempFile::new().expect("temp file");
    write_parquet_fixture(temp.path(), rows);
    fs::read(temp.path()).expect("read parquet fixture")
}

/// Remote objects keyed by URL path (`/<dataset>/year=.../<file>`).
#[derive(Clone, Default)]
pub struct RemoteTree {
    objects: HashMap<String, Vec<u8>>,
}

impl RemoteTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `batches` parquet files for `partition`; batch `n` holds ids `base + n*10 ..`.
    pub fn with_batches(mut self, layout: &DatasetLayout, partition: PartitionKey, batches: u32) -> Self {
        for batch in 1..=batches {
            let base = i64::from(partition.year() * 100 + partition.month()) * 1000 + i64::from(batch) * 10;
            let body = parquet_bytes(&[(base, "north"), (base + 1, "south")]);
            self.insert(layout, partition, batch, body);
        }
        self
    }

    pub fn insert(&mut self, layout: &DatasetLayout, partition: PartitionKey, batch: u32, body: Vec<u8>) {
        let url = layout.remote_url(&layout.locator(partition, batch));
        self.objects.insert(url_path(&url), body);
    }

    fn get(&self, url: &str) -> Option<&Vec<u8>> {
        self.objects.get(&url_path(url))
    }
}

fn url_path(url: &str) -> String {
    match url.find("://") {
        Some(scheme) => {
            let rest = &url[scheme + 3..];
            rest.find('/').map(|idx| rest[idx..].to_string()).unwrap_or_default()
        }
        None => url.to_string(),
    }
}

/// In-process remote with call accounting and optional per-call latency.
pub struct MemoryRemote {
    tree: RemoteTree,
    latency: Duration,
    corrupt: HashSet<String>,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    probes: Mutex<Vec<String>>,
}

impl MemoryRemote {
    pub fn new(tree: RemoteTree) -> Self {
        Self {
            tree,
            latency: Duration::ZERO,
            corrupt: HashSet::new(),
            active: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
            probes: Mutex::new(Vec::new()),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Every GET of `url` returns bytes that are not parquet.
    pub fn with_corrupt(mut self, url: String) -> Self {
        self.corrupt.insert(url_path(&url));
        self
    }

    pub fn peak_active(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }

    pub fn probe_count(&self) -> usize {
        self.probes.lock().expect("probe log poisoned").len()
    }

    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RemoteStore for MemoryRemote {
    fn probe(&self, url: &str) -> Result<ProbeOutcome, TransferError> {
        self.enter();
        self.probes
            .lock()
            .expect("probe log poisoned")
            .push(url.to_string());
        let outcome = if self.tree.get(url).is_some() {
            ProbeOutcome::Exists
        } else {
            ProbeOutcome::NotFound
        };
        self.leave();
        Ok(outcome)
    }

    fn fetch(&self, url: &str, sink: &mut dyn Write) -> Result<u64, TransferError> {
        self.enter();
        let result = match self.tree.get(url) {
            None => Err(TransferError::Permanent(format!("HTTP 404 for {url}"))),
            Some(_) if self.corrupt.contains(&url_path(url)) => sink
                .write_all(b"<html>maintenance</html>")
                .map(|()| 24)
                .map_err(|err| TransferError::Permanent(err.to_string())),
            Some(body) => sink
                .write_all(body)
                .map(|()| body.len() as u64)
                .map_err(|err| TransferError::Permanent(err.to_string())),
        };
        self.leave();
        result
    }
}

/// Serve `tree` over loopback HTTP until the test process exits. Returns the base URL.
pub fn serve_http(tree: RemoteTree) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
    let addr = listener.local_addr().expect("listener addr");
    let tree = Arc::new(tree);
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { continue };
            let tree = Arc::clone(&tree);
            thread::spawn(move || handle_connection(stream, &tree));
        }
    });
    format!("http://{addr}")
}

fn handle_connection(mut stream: TcpStream, tree: &RemoteTree) {
    let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).is_err() {
        return;
    }
    loop {
        let mut header = String::new();
        match reader.read_line(&mut header) {
            Ok(0) | Err(_) => break,
            Ok(_) if header == "\r\n" || header == "\n" => break,
            Ok(_) => {}
        }
    }
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let path = parts.next().unwrap_or_default();

    let (status, body) = match tree.objects.get(path) {
        Some(body) => ("200 OK", body.as_slice()),
        None => ("404 Not Found", &[][..]),
    };
    let head = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let _ = stream.write_all(head.as_bytes());
    if method == "GET" {
        let _ = stream.write_all(body);
    }
    let _ = stream.flush();
}

/// Every regular file under `dir` with its bytes, sorted by path.
pub fn snapshot_tree(dir: &Path) -> Vec<(PathBuf, Vec<u8>)> {
    let mut files: Vec<(PathBuf, Vec<u8>)> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| {
            let bytes = fs::read(entry.path()).expect("read materialized file");
            let relative = entry
                .path()
                .strip_prefix(dir)
                .expect("file under dir")
                .to_path_buf();
            (relative, bytes)
        })
        .collect();
    files.sort();
    files
}
