use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// Largest payload in either direction. The writer refuses anything bigger,
/// so replay can treat a larger length prefix as corruption.
const MAX_RECORD_LEN: usize = 1 << 20;

/// Length prefix plus trailing CRC.
const FRAME_OVERHEAD: u64 = 8;

/// Encode a single event to `[len][bincode][crc32]`. Returns the bytes written.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_RECORD_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("event of {} bytes exceeds the {MAX_RECORD_LEN} byte record limit", payload.len()),
        ));
    }
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(FRAME_OVERHEAD + payload.len() as u64)
}

enum Record {
    /// A valid event and the size of its frame on disk.
    Event(Event, u64),
    /// Clean end of file.
    End,
    /// Torn or corrupt tail. Everything from here on is discarded.
    Damaged(&'static str),
}

/// Read one framed record. I/O errors other than EOF propagate.
fn read_record(reader: &mut impl Read) -> io::Result<Record> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(Record::End),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_LEN {
        return Ok(Record::Damaged("length prefix out of range"));
    }

    let mut payload = vec![0u8; len];
    let mut crc_buf = [0u8; 4];
    for buf in [payload.as_mut_slice(), crc_buf.as_mut_slice()] {
        match reader.read_exact(buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(Record::Damaged("truncated record"));
            }
            Err(e) => return Err(e),
        }
    }

    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Record::Damaged("checksum mismatch"));
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Record::Event(event, FRAME_OVERHEAD + len as u64)),
        Err(_) => Ok(Record::Damaged("undecodable payload")),
    }
}

/// Append-only write-ahead log of booking events.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`, little endian.
/// A torn last entry (crash mid-write) is dropped on replay via the length
/// prefix and CRC check.
///
/// Bytes past `durable_len` belong to a batch that has not been acknowledged
/// yet. `rollback` cuts the file back to `durable_len` when that batch fails.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    durable_len: u64,
    pending_len: u64,
    pending_appends: u64,
    /// Set when a rollback could not restore the file. Appends are refused
    /// until compaction rewrites the log from memory.
    poisoned: bool,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let durable_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            durable_len,
            pending_len: 0,
            pending_appends: 0,
            poisoned: false,
        })
    }

    /// Replay the log, cut off any damaged tail, and open it for appending.
    /// New records then follow the last valid one instead of the garbage.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (events, valid_len) = Self::scan(path)?;
        let wal = Self::open(path)?;
        if wal.durable_len > valid_len {
            warn!(
                "wal {}: truncating {} damaged bytes",
                path.display(),
                wal.durable_len - valid_len
            );
            wal.writer.get_ref().set_len(valid_len)?;
            wal.writer.get_ref().sync_all()?;
        }
        Ok((
            Self {
                durable_len: valid_len,
                ..wal
            },
            events,
        ))
    }

    /// Append and fsync one event. Production code batches through
    /// `append_buffered` + `flush_sync` instead.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event without flushing. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("wal is poisoned by a failed rollback"));
        }
        self.pending_len += encode_event(&mut self.writer, event)?;
        self.pending_appends += 1;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.durable_len += self.pending_len;
        self.pending_len = 0;
        self.pending_appends = 0;
        Ok(())
    }

    /// Throw away everything written since the last successful `flush_sync`,
    /// buffered or already on disk. On failure the log is poisoned.
    pub fn rollback(&mut self) -> io::Result<()> {
        self.appends_since_compact = self.appends_since_compact.saturating_sub(self.pending_appends);
        self.pending_len = 0;
        self.pending_appends = 0;
        let result = self.truncate_to_durable();
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    fn truncate_to_durable(&mut self) -> io::Result<()> {
        let file = self.writer.get_ref().try_clone()?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back the unflushed bytes instead of writing them on drop
        let _ = stale.into_parts();
        self.writer.get_ref().set_len(self.durable_len)?;
        self.writer.get_ref().sync_all()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write the compacted event set to a temp file next to the WAL and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let file = File::create(Self::compact_tmp_path(path))?;
        let mut writer = BufWriter::new(file);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the temp file over the WAL and reopen it for appending.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.durable_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.pending_len = 0;
        self.pending_appends = 0;
        self.poisoned = false;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning all valid events up to the first
    /// damaged record. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Self::scan(path).map(|(events, _)| events)
    }

    /// Valid events and the byte length they occupy.
    fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut valid_len = 0;

        loop {
            match read_record(&mut reader)? {
                Record::Event(event, frame_len) => {
                    events.push(event);
                    valid_len += frame_len;
                }
                Record::End => break,
                Record::Damaged(reason) => {
                    warn!(
                        "wal {}: {reason} after {} records, discarding tail",
                        path.display(),
                        events.len()
                    );
                    break;
                }
            }
        }

        Ok((events, valid_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Property, Reservation, Span};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("staybook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn listed(id: Ulid) -> Event {
        Event::PropertyListed {
            property: Property {
                id,
                owner_id: Ulid::new(),
                title: "Harbour loft".into(),
                description: None,
                location: "Bergen".into(),
                price_per_night: 12_000,
                cleaning_fee: 3_500,
                max_guests: 2,
                active: true,
                listed_at: 1_700_000_000_000,
            },
        }
    }

    fn window(property_id: Ulid, start: i64, end: i64) -> Event {
        Event::WindowAdded {
            id: Ulid::new(),
            property_id,
            span: Span::new(start, end),
            available: true,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let pid = Ulid::new();
        let events = vec![
            listed(pid),
            window(pid, 1000, 2000),
            Event::ReservationCreated {
                reservation: Reservation {
                    id: Ulid::new(),
                    property_id: pid,
                    guest_id: Ulid::new(),
                    check_in: 1200,
                    check_out: 1500,
                    guest_count: 2,
                    total_price: 27_500,
                    created_at: 1100,
                },
            },
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_drops_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        let event = listed(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap(); // length says 9, only 2 bytes follow
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("bad_crc.wal");
        let good = listed(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&Event::PropertyDelisted { id: Ulid::new() }).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_rejects_huge_length_prefix() {
        let path = tmp_path("huge_len.wal");
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
            f.write_all(&[0u8; 16]).unwrap();
        }
        assert!(Wal::replay(&path).unwrap().is_empty());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let pid = Ulid::new();
        let snapshot = vec![listed(pid)];
        let later = window(pid, 5000, 9000);

        let before;
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&snapshot[0]).unwrap();
            for _ in 0..10 {
                let churn = Ulid::new();
                wal.append(&Event::WindowAdded {
                    id: churn,
                    property_id: pid,
                    span: Span::new(0, 500),
                    available: false,
                })
                .unwrap();
                wal.append(&Event::WindowRemoved { id: churn, property_id: pid }).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 21);
            before = fs::metadata(&path).unwrap().len();

            wal.compact(&snapshot).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            wal.append(&later).unwrap();
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");
        assert_eq!(Wal::replay(&path).unwrap(), vec![snapshot[0].clone(), later]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn buffered_appends_become_durable_on_flush() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (0..5).map(|_| listed(Ulid::new())).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            wal.flush_sync().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn oversized_event_is_refused_before_writing() {
        let path = tmp_path("oversized.wal");
        let mut huge = listed(Ulid::new());
        if let Event::PropertyListed { property } = &mut huge {
            property.description = Some("x".repeat(MAX_RECORD_LEN + 1));
        }
        let small = listed(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            let err = wal.append(&huge).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
            assert_eq!(wal.appends_since_compact(), 0);
            assert_eq!(fs::metadata(&path).unwrap().len(), 0);
            wal.append(&small).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![small]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rollback_cuts_unacknowledged_bytes() {
        let path = tmp_path("rollback.wal");
        let pid = Ulid::new();
        let kept = listed(pid);
        let later = window(pid, 5000, 9000);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&kept).unwrap();
            let durable = fs::metadata(&path).unwrap().len();

            // Half a batch already reached the file before the failure
            wal.append_buffered(&window(pid, 1000, 2000)).unwrap();
            wal.writer.flush().unwrap();
            wal.append_buffered(&window(pid, 3000, 4000)).unwrap();
            assert!(fs::metadata(&path).unwrap().len() > durable);

            wal.rollback().unwrap();
            assert!(!wal.is_poisoned());
            assert_eq!(wal.appends_since_compact(), 1);
            assert_eq!(fs::metadata(&path).unwrap().len(), durable);

            wal.append(&later).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![kept, later]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_truncates_damaged_tail() {
        let path = tmp_path("recover.wal");
        let pid = Ulid::new();
        let first = listed(pid);
        let later = window(pid, 5000, 9000);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }
        {
            let (mut wal, events) = Wal::recover(&path).unwrap();
            assert_eq!(events, vec![first.clone()]);
            wal.append(&later).unwrap();
        }
        // Without the truncation, `later` would sit behind the torn record and be lost
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, later]);
        let _ = fs::remove_file(&path);
    }
}
