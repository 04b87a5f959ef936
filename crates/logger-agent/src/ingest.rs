// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ingestion and rotation tracking.
//!
//! On every tick each source is examined in turn:
//!
//! - **Command sources** are always drained. Their stdout is forwarded by a
//!   background task into a bounded channel sized from the queue budget, so
//!   draining never blocks and a chatty command stalls on its own pipe.
//! - **File sources** are stat'ed first. A missing file closes the
//!   descriptor; a changed device/inode pair (rotation) or a missing
//!   descriptor triggers a reopen at offset 0; a regular file whose
//!   modification time and length are unchanged is skipped entirely.
//!
//! Newly read bytes are split on newlines and appended to the source's queue.
//! Failures only affect the source they happen on and are retried on the
//! next tick.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::process::Stdio;
use std::time::SystemTime;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, error, info, trace, warn};

use crate::constants::{MAX_RECORD_BYTES, READ_BUFFER_SIZE};
use crate::source::{DescriptorState, FileIdentity, LogSource, Locator, SourceTable};

/// What one tick did, summed over all sources.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub records: usize,
    pub bytes: u64,
    pub reopened: usize,
    pub failed: usize,
}

struct FileHandle {
    file: File,
    offset: u64,
}

struct CommandHandle {
    child: Child,
    rx: mpsc::Receiver<Vec<u8>>,
    /// Most chunks the forwarding task may have in flight.
    capacity: usize,
}

enum Handle {
    File(FileHandle),
    Command(CommandHandle),
}

#[derive(Default)]
struct SourceReader {
    handle: Option<Handle>,
    partial: Vec<u8>,
    modified: Option<SystemTime>,
}

/// Per-source reader state, parallel to the source table.
pub struct Tracker {
    readers: Vec<SourceReader>,
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("sources", &self.readers.len())
            .finish_non_exhaustive()
    }
}

impl Tracker {
    pub fn new(sources: &SourceTable) -> Self {
        Self {
            readers: sources.iter().map(|_| SourceReader::default()).collect(),
        }
    }

    /// Runs one ingestion pass over every source.
    pub fn poll(&mut self, sources: &mut SourceTable) -> TickReport {
        let mut report = TickReport::default();
        let now = SystemTime::now();

        for (source, reader) in sources.iter_mut().zip(self.readers.iter_mut()) {
            match source.locator().clone() {
                Locator::File(path) => reader.poll_file(source, &path, now, &mut report),
                Locator::Command(command) => {
                    reader.poll_command(source, &command, now, &mut report)
                }
            }
        }

        if report.records > 0 {
            debug!(
                "Ingested {} records ({} bytes) from {} sources",
                report.records,
                report.bytes,
                sources.len()
            );
        } else {
            trace!("Tick complete, nothing new");
        }
        report
    }
}

impl SourceReader {
    fn poll_file(
        &mut self,
        source: &mut LogSource,
        path: &Path,
        now: SystemTime,
        report: &mut TickReport,
    ) {
        let was_error = source.state() == DescriptorState::Error;
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) => {
                if self.handle.is_some() {
                    info!("Log source {} ({}) is gone: {}", source.name(), path.display(), e);
                }
                self.close(source, now, report);
                source.mark_closed();
                return;
            }
        };

        let identity = FileIdentity::of(&metadata);
        source.set_size(metadata.len());

        if self.handle.is_none() || source.identity() != Some(identity) {
            if self.handle.is_some() {
                info!("Log source {} ({}) was rotated", source.name(), path.display());
                self.close(source, now, report);
            }
            match open_nonblocking(path) {
                Ok(file) => {
                    self.handle = Some(Handle::File(FileHandle { file, offset: 0 }));
                    source.mark_open(Some(identity));
                    report.reopened += 1;
                }
                Err(e) => {
                    if source.state() != DescriptorState::Error {
                        error!("open: {} - {}", path.display(), e);
                    }
                    source.mark_error();
                    report.failed += 1;
                    return;
                }
            }
        } else if metadata.is_file() && self.unchanged(&metadata) {
            return;
        }
        self.modified = metadata.modified().ok();

        match self.read_file(source, &metadata, now, report) {
            Ok(()) => {
                if was_error {
                    info!("Reopened log source {} ({})", source.name(), path.display());
                }
            }
            Err(e) => {
                if !was_error {
                    warn!("read: {} - {}", path.display(), e);
                }
                self.close(source, now, report);
                source.mark_error();
                report.failed += 1;
            }
        }
    }

    /// Reads everything available on the open file descriptor.
    fn read_file(
        &mut self,
        source: &mut LogSource,
        metadata: &fs::Metadata,
        now: SystemTime,
        report: &mut TickReport,
    ) -> io::Result<()> {
        let SourceReader {
            handle, partial, ..
        } = &mut *self;
        let Some(Handle::File(handle)) = handle else {
            return Ok(());
        };

        if metadata.is_file() && metadata.len() < handle.offset {
            info!(
                "Log source {} was truncated, reading from the start",
                source.name()
            );
            handle.file.seek(SeekFrom::Start(0))?;
            handle.offset = 0;
            partial.clear();
        }

        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            match handle.file.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => {
                    handle.offset += n as u64;
                    for record in split_records(partial, &buf[..n]) {
                        ingest(source, record, now, report);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    fn poll_command(
        &mut self,
        source: &mut LogSource,
        command: &str,
        now: SystemTime,
        report: &mut TickReport,
    ) {
        if self.handle.is_none() {
            match spawn_command(command, source.queue().budget()) {
                Ok(handle) => {
                    debug!("Started command for log source {}: {}", source.name(), command);
                    self.handle = Some(Handle::Command(handle));
                    source.mark_open(None);
                    report.reopened += 1;
                }
                Err(e) => {
                    if source.state() != DescriptorState::Error {
                        error!("spawn: {} - {}", command, e);
                    }
                    source.mark_error();
                    report.failed += 1;
                    return;
                }
            }
        }

        let SourceReader {
            handle, partial, ..
        } = &mut *self;
        let Some(Handle::Command(handle)) = handle else {
            return;
        };

        let mut finished = false;
        for _ in 0..handle.capacity {
            match handle.rx.try_recv() {
                Ok(chunk) => {
                    for record in split_records(partial, &chunk) {
                        ingest(source, record, now, report);
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    finished = true;
                    break;
                }
            }
        }

        if finished {
            match handle.child.try_wait() {
                Ok(Some(status)) => info!(
                    "Command for log source {} exited ({}), restarting next tick",
                    source.name(),
                    status
                ),
                _ => info!(
                    "Command for log source {} closed its output, restarting next tick",
                    source.name()
                ),
            }
            self.close(source, now, report);
            source.mark_closed();
        }
    }

    /// Same modification time and nothing beyond what was already read.
    fn unchanged(&self, metadata: &fs::Metadata) -> bool {
        match &self.handle {
            Some(Handle::File(handle)) => {
                self.modified.is_some()
                    && self.modified == metadata.modified().ok()
                    && metadata.len() == handle.offset
            }
            _ => false,
        }
    }

    /// Drops the descriptor, emitting any unterminated trailing line first.
    fn close(&mut self, source: &mut LogSource, now: SystemTime, report: &mut TickReport) {
        if !self.partial.is_empty() {
            let record = std::mem::take(&mut self.partial);
            ingest(source, record, now, report);
        }
        self.handle = None;
        self.modified = None;
    }
}

fn ingest(source: &mut LogSource, payload: Vec<u8>, now: SystemTime, report: &mut TickReport) {
    report.records += 1;
    report.bytes += payload.len() as u64;
    source.ingest(payload, now);
}

/// Appends `chunk` to the pending fragment and returns every complete line,
/// without its terminator. Empty lines are dropped, and a fragment that grows
/// to [`MAX_RECORD_BYTES`] is returned as a record of its own.
pub(crate) fn split_records(partial: &mut Vec<u8>, chunk: &[u8]) -> Vec<Vec<u8>> {
    partial.extend_from_slice(chunk);

    let mut records = Vec::new();
    let mut start = 0;
    while let Some(pos) = partial[start..].iter().position(|&b| b == b'\n') {
        let end = start + pos;
        let mut line = &partial[start..end];
        if let Some(stripped) = line.strip_suffix(b"\r") {
            line = stripped;
        }
        if !line.is_empty() {
            records.push(line.to_vec());
        }
        start = end + 1;
    }
    partial.drain(..start);

    while partial.len() >= MAX_RECORD_BYTES {
        records.push(partial.drain(..MAX_RECORD_BYTES).collect());
    }
    records
}

fn open_nonblocking(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.custom_flags(nix::fcntl::OFlag::O_NONBLOCK.bits());
    }
    options.open(path)
}

/// Chunks of command output held between ticks, enough to cover the queue
/// budget once. When the channel is full the forwarding task stops reading and
/// the command blocks on its own pipe.
fn command_channel_capacity(budget: u64) -> usize {
    usize::try_from(budget)
        .unwrap_or(usize::MAX)
        .div_ceil(READ_BUFFER_SIZE)
        .max(1)
}

fn spawn_command(command: &str, budget: u64) -> io::Result<CommandHandle> {
    if tokio::runtime::Handle::try_current().is_err() {
        return Err(io::Error::other("command sources need a tokio runtime"));
    }

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("command stdout was not captured"))?;

    let capacity = command_channel_capacity(budget);
    let (tx, rx) = mpsc::channel(capacity);
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Command output read failed: {}", e);
                    break;
                }
            }
        }
    });

    Ok(CommandHandle {
        child,
        rx,
        capacity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{SourceId, SourceSpec};
    use std::io::Write;
    use tracing_test::traced_test;

    const ID: SourceId = SourceId::new(0);

    fn table_for(path: &Path) -> SourceTable {
        SourceTable::new(vec![SourceSpec::file("app", path)], 4096).unwrap()
    }

    fn append(path: &Path, data: &str) {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(data.as_bytes()).unwrap();
    }

    fn payloads(table: &SourceTable) -> Vec<String> {
        table
            .get(ID)
            .unwrap()
            .queue()
            .records_after(0)
            .iter()
            .map(|r| String::from_utf8_lossy(&r.payload).into_owned())
            .collect()
    }

    #[test]
    fn test_split_records() {
        let mut partial = Vec::new();
        assert_eq!(
            split_records(&mut partial, b"one\ntwo\r\n\nthr"),
            vec![b"one".to_vec(), b"two".to_vec()]
        );
        assert_eq!(partial, b"thr".to_vec());
        assert_eq!(split_records(&mut partial, b"ee\n"), vec![b"three".to_vec()]);
        assert!(partial.is_empty());
    }

    #[test]
    fn test_split_records_caps_fragments() {
        let mut partial = Vec::new();
        let chunk = vec![b'x'; MAX_RECORD_BYTES + 10];
        let records = split_records(&mut partial, &chunk);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].len(), MAX_RECORD_BYTES);
        assert_eq!(partial.len(), 10);
    }

    #[test]
    fn test_reads_new_lines_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "first\nsecond\n");

        let mut table = table_for(&path);
        let mut tracker = Tracker::new(&table);

        let report = tracker.poll(&mut table);
        assert_eq!(report.records, 2);
        assert_eq!(report.reopened, 1);
        assert_eq!(table.get(ID).unwrap().state(), DescriptorState::Open);
        assert_eq!(table.get(ID).unwrap().size(), 13);

        append(&path, "third\n");
        tracker.poll(&mut table);

        let source = table.get(ID).unwrap();
        assert_eq!(source.count(), 3);
        assert_eq!(source.bytes(), 16);
        assert_eq!(payloads(&table), vec!["first", "second", "third"]);

        assert_eq!(tracker.poll(&mut table).records, 0);
    }

    #[test]
    fn test_partial_line_completed_later() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "hal");

        let mut table = table_for(&path);
        let mut tracker = Tracker::new(&table);
        tracker.poll(&mut table);
        assert_eq!(table.get(ID).unwrap().count(), 0);

        append(&path, "f done\n");
        tracker.poll(&mut table);
        assert_eq!(payloads(&table), vec!["half done"]);
    }

    #[test]
    fn test_rotation_keeps_counters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "a1\na2\n");

        let mut table = table_for(&path);
        let mut tracker = Tracker::new(&table);
        tracker.poll(&mut table);
        let before = table.get(ID).unwrap().identity();

        fs::rename(&path, dir.path().join("app.log.1")).unwrap();
        append(&path, "b1\n");
        let report = tracker.poll(&mut table);

        let source = table.get(ID).unwrap();
        assert_eq!(report.records, 1);
        assert_eq!(report.reopened, 1);
        assert_ne!(source.identity(), before);
        assert_eq!(source.count(), 3);
        assert_eq!(source.bytes(), 6);
        assert_eq!(payloads(&table), vec!["a1", "a2", "b1"]);
    }

    #[test]
    fn test_truncation_rereads_from_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "a long first line\n");

        let mut table = table_for(&path);
        let mut tracker = Tracker::new(&table);
        tracker.poll(&mut table);

        fs::write(&path, "short\n").unwrap();
        tracker.poll(&mut table);

        assert_eq!(payloads(&table), vec!["a long first line", "short"]);
        assert_eq!(table.get(ID).unwrap().size(), 6);
    }

    #[traced_test]
    #[test]
    fn test_removed_file_closes_and_logs_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "x\n");

        let mut table = table_for(&path);
        let mut tracker = Tracker::new(&table);
        tracker.poll(&mut table);

        fs::remove_file(&path).unwrap();
        tracker.poll(&mut table);
        tracker.poll(&mut table);

        let source = table.get(ID).unwrap();
        assert_eq!(source.state(), DescriptorState::Closed);
        assert_eq!(source.identity(), None);
        assert_eq!(source.size(), 0);
        assert_eq!(source.count(), 1);
        logs_assert(|lines: &[&str]| {
            match lines.iter().filter(|l| l.contains("is gone")).count() {
                1 => Ok(()),
                n => Err(format!("expected one 'is gone' line, saw {n}")),
            }
        });

        append(&path, "y\n");
        tracker.poll(&mut table);
        assert_eq!(table.get(ID).unwrap().state(), DescriptorState::Open);
        assert_eq!(payloads(&table), vec!["x", "y"]);
    }

    #[test]
    fn test_unchanged_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "a\n");

        let mut table = table_for(&path);
        let mut tracker = Tracker::new(&table);
        tracker.poll(&mut table);
        assert!(tracker.readers[0].unchanged(&fs::metadata(&path).unwrap()));

        // same length, new modification time
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000))
            .unwrap();
        assert!(!tracker.readers[0].unchanged(&fs::metadata(&path).unwrap()));
        assert_eq!(tracker.poll(&mut table).records, 0);
        assert!(tracker.readers[0].unchanged(&fs::metadata(&path).unwrap()));

        append(&path, "b\n");
        assert!(!tracker.readers[0].unchanged(&fs::metadata(&path).unwrap()));
        assert_eq!(tracker.poll(&mut table).records, 1);
    }

    #[cfg(unix)]
    #[traced_test]
    #[test]
    fn test_read_failure_marks_error_and_logs_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adir");
        fs::create_dir(&path).unwrap();

        let mut table = table_for(&path);
        let mut tracker = Tracker::new(&table);
        let failed: usize = (0..5).map(|_| tracker.poll(&mut table).failed).sum();

        assert_eq!(failed, 5);
        assert_eq!(table.get(ID).unwrap().state(), DescriptorState::Error);
        assert_eq!(table.get(ID).unwrap().count(), 0);
        logs_assert(|lines: &[&str]| {
            let reads = lines.iter().filter(|l| l.contains("read:")).count();
            let reopens = lines.iter().filter(|l| l.contains("Reopened")).count();
            match (reads, reopens) {
                (1, 0) => Ok(()),
                _ => Err(format!("saw {reads} read warnings and {reopens} reopens")),
            }
        });
    }

    #[cfg(unix)]
    #[traced_test]
    #[test]
    fn test_open_failure_logs_once_then_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        // a socket can be stat'ed but never opened, whoever runs the test
        let listener = std::os::unix::net::UnixListener::bind(&path).unwrap();

        let mut table = table_for(&path);
        let mut tracker = Tracker::new(&table);
        for _ in 0..3 {
            assert_eq!(tracker.poll(&mut table).failed, 1);
        }
        assert_eq!(table.get(ID).unwrap().state(), DescriptorState::Error);

        drop(listener);
        fs::remove_file(&path).unwrap();
        append(&path, "back\n");
        let report = tracker.poll(&mut table);

        assert_eq!(report.failed, 0);
        assert_eq!(report.records, 1);
        assert_eq!(table.get(ID).unwrap().state(), DescriptorState::Open);
        logs_assert(|lines: &[&str]| {
            let opens = lines.iter().filter(|l| l.contains("open:")).count();
            let reopens = lines.iter().filter(|l| l.contains("Reopened")).count();
            match (opens, reopens) {
                (1, 1) => Ok(()),
                _ => Err(format!("saw {opens} open errors and {reopens} reopens")),
            }
        });
    }

    #[test]
    fn test_missing_file_never_opened() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = table_for(&dir.path().join("absent.log"));
        let mut tracker = Tracker::new(&table);

        let report = tracker.poll(&mut table);
        assert_eq!(report, TickReport::default());
        assert_eq!(table.get(ID).unwrap().state(), DescriptorState::Closed);
    }

    #[test]
    fn test_command_without_runtime_is_an_error() {
        let mut table =
            SourceTable::new(vec![SourceSpec::command("cmd", "echo hi")], 4096).unwrap();
        let mut tracker = Tracker::new(&table);

        let report = tracker.poll(&mut table);
        assert_eq!(report.failed, 1);
        assert_eq!(table.get(ID).unwrap().state(), DescriptorState::Error);
    }

    #[tokio::test]
    async fn test_command_source_is_drained_until_exit() {
        let mut table =
            SourceTable::new(vec![SourceSpec::command("cmd", "printf 'one\\ntwo\\n'")], 4096)
                .unwrap();
        let mut tracker = Tracker::new(&table);

        tracker.poll(&mut table);
        assert_ne!(table.get(ID).unwrap().state(), DescriptorState::Error);

        for _ in 0..200 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            tracker.poll(&mut table);
            if table.get(ID).unwrap().state() == DescriptorState::Closed {
                break;
            }
        }

        let source = table.get(ID).unwrap();
        assert_eq!(source.state(), DescriptorState::Closed);
        assert_eq!(source.count(), 2);
        assert_eq!(payloads(&table), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_chatty_command_stays_bounded() {
        let budget = 4096;
        let mut table = SourceTable::new(
            vec![SourceSpec::command("yes", "yes abcdefghijklmnopqrstuvwxyz")],
            budget,
        )
        .unwrap();
        let mut tracker = Tracker::new(&table);
        let capacity = command_channel_capacity(budget);

        tracker.poll(&mut table);
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let report = tracker.poll(&mut table);
        assert!(report.bytes <= (capacity * READ_BUFFER_SIZE) as u64);
        assert!(table.get(ID).unwrap().queue_memory() <= budget);
        assert_eq!(table.get(ID).unwrap().state(), DescriptorState::Open);

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let Some(Handle::Command(handle)) = &mut tracker.readers[0].handle else {
            panic!("command is not running");
        };
        let mut buffered = 0;
        while handle.rx.try_recv().is_ok() {
            buffered += 1;
        }
        assert!(buffered <= capacity, "{buffered} chunks buffered");
    }

    #[test]
    fn test_command_channel_capacity() {
        assert_eq!(command_channel_capacity(4096), 1);
        assert_eq!(command_channel_capacity(2 * 1024 * 1024), 256);
        assert_eq!(command_channel_capacity(READ_BUFFER_SIZE as u64 + 1), 2);
    }
}
