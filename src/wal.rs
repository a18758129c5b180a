use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// Frame one event as `[u32 len][bincode payload][u32 crc32]`, little endian.
fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Outcome of reading one frame.
enum Frame {
    /// A decoded event and the frame's size on disk.
    Event(Event, u64),
    /// Clean end of file.
    End,
    /// Truncated or corrupt frame; nothing after it is trusted.
    Torn(&'static str),
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Largest payload a frame may claim. Events are a few hundred bytes.
const MAX_FRAME_LEN: u64 = 1 << 20;

/// `remaining` is how many bytes of the file follow the frame start; a length
/// prefix pointing past it is a torn write, not an allocation request.
fn read_frame(reader: &mut impl Read, remaining: u64) -> io::Result<Frame> {
    let mut len_buf = [0u8; 4];
    if !read_exact_or_eof(reader, &mut len_buf)? {
        return Ok(Frame::End);
    }
    let len = u64::from(u32::from_le_bytes(len_buf));
    if len > MAX_FRAME_LEN {
        return Ok(Frame::Torn("oversized frame length"));
    }
    if len + 8 > remaining {
        return Ok(Frame::Torn("truncated payload"));
    }
    let mut payload = vec![0u8; len as usize];
    if !read_exact_or_eof(reader, &mut payload)? {
        return Ok(Frame::Torn("truncated payload"));
    }
    let mut crc_buf = [0u8; 4];
    if !read_exact_or_eof(reader, &mut crc_buf)? {
        return Ok(Frame::Torn("truncated checksum"));
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Frame::Torn("checksum mismatch"));
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Frame::Event(event, 8 + payload.len() as u64)),
        Err(_) => Ok(Frame::Torn("undecodable payload")),
    }
}

/// Append-only log of booking store events.
///
/// A crash mid-append leaves at most one torn frame at the tail; replay stops
/// there and everything before it is kept.
///
/// `durable_len` is the file length as of the last successful `flush_sync`.
/// A failed batch is rolled back to it, so frames whose callers were told
/// "failed" never reach disk with a later batch.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    pending: u64,
    durable_len: u64,
    /// Set when a rollback itself failed; the file tail is unknown from here.
    poisoned: bool,
    #[cfg(test)]
    fail_flushes: Option<std::sync::Arc<std::sync::atomic::AtomicBool>>,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let durable_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            pending: 0,
            durable_len,
            poisoned: false,
            #[cfg(test)]
            fail_flushes: None,
        })
    }

    /// While `flag` is set, `flush_sync` fails and leaves the buffer full,
    /// which is what a disk error mid-flush looks like.
    #[cfg(test)]
    pub(crate) fn fail_flushes_while(&mut self, flag: std::sync::Arc<std::sync::atomic::AtomicBool>) {
        self.fail_flushes = Some(flag);
    }

    /// Append one event and fsync. Tests only; the engine's writer task uses
    /// `append_buffered` + `flush_sync` for group commit.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event. Not durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL unusable after a failed rollback"));
        }
        write_frame(&mut self.writer, event)?;
        self.pending += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        #[cfg(test)]
        {
            if let Some(flag) = &self.fail_flushes
                && flag.load(std::sync::atomic::Ordering::SeqCst)
            {
                return Err(io::Error::other("injected flush failure"));
            }
        }
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.durable_len = self.writer.get_ref().metadata()?.len();
        self.appends_since_compact += self.pending;
        self.pending = 0;
        Ok(())
    }

    /// Throw away everything appended since the last successful
    /// `flush_sync`: the unflushed buffer and any bytes that reached the file.
    /// If this fails too the log refuses further appends.
    pub fn rollback(&mut self) -> io::Result<()> {
        self.pending = 0;
        let result = self.truncate_to_durable();
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    fn truncate_to_durable(&mut self) -> io::Result<()> {
        let fresh = BufWriter::new(self.writer.get_ref().try_clone()?);
        // into_parts hands back the buffered bytes instead of writing them.
        let (file, _discarded) = std::mem::replace(&mut self.writer, fresh).into_parts();
        file.set_len(self.durable_len)?;
        file.sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write compacted events to a temp file and fsync.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_tmp_path(path))?);
        for event in events {
            write_frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the temp file over the WAL and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.durable_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.pending = 0;
        Ok(())
    }

    /// Both compaction phases in one call. Tests only.
    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Read every intact event. A missing file is an empty log. A torn tail
    /// is cut off so later appends don't land behind it.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut intact_len = 0u64;
        loop {
            match read_frame(&mut reader, file_len - intact_len)? {
                Frame::Event(event, size) => {
                    events.push(event);
                    intact_len += size;
                }
                Frame::End => break,
                Frame::Torn(reason) => {
                    warn!(
                        path = %path.display(),
                        kept = events.len(),
                        "discarding WAL tail: {reason}"
                    );
                    OpenOptions::new().write(true).open(path)?.set_len(intact_len)?;
                    break;
                }
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::*;
    use crate::model::Event;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("roombook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn sample_events() -> Vec<Event> {
        let r = room("Aurora");
        let b = booking(r.id, 600, 660);
        vec![
            Event::RoomCreated { room: r.clone() },
            Event::BookingCreated { booking: b.clone() },
            Event::BookingCancelled {
                id: b.id,
                room_id: r.id,
                cancelled_at: at(30),
                cancelled_by: b.requester_id,
            },
        ]
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = sample_events();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_drops_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        let events = sample_events();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&events[0]).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0x40, 0, 0, 0, 1, 2]).unwrap(); // length says 64, only 2 bytes follow
        }
        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![events[0].clone()]);

        // the torn bytes are gone, so new appends are reachable
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&events[1]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), events[..2].to_vec());
    }

    #[test]
    fn replay_stops_at_bad_checksum() {
        let path = tmp_path("bad_crc.wal");
        let good = Event::RoomDeleted { id: Ulid::new() };
        let bad = Event::RoomDeleted { id: Ulid::new() };
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&bad).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
    }

    #[test]
    fn compact_shrinks_and_accepts_appends() {
        let path = tmp_path("compact.wal");
        let r = room("Aurora");
        let created = Event::RoomCreated { room: r.clone() };
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&created).unwrap();
            for _ in 0..20 {
                let mut renamed = r.clone();
                renamed.name = format!("Aurora {}", Ulid::new());
                wal.append(&Event::RoomUpdated { room: renamed }).unwrap();
            }
        }
        let before = fs::metadata(&path).unwrap().len();

        let later = Event::BookingCreated {
            booking: booking(r.id, 0, 30),
        };
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(std::slice::from_ref(&created)).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            wal.append(&later).unwrap();
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");
        assert_eq!(Wal::replay(&path).unwrap(), vec![created, later]);
    }

    #[test]
    fn buffered_appends_durable_after_flush() {
        let path = tmp_path("buffered.wal");
        let events = sample_events();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            wal.flush_sync().unwrap();
            assert_eq!(wal.appends_since_compact(), 3);
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn rollback_discards_failed_batch() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        let path = tmp_path("rollback.wal");
        let events = sample_events();
        let failing = Arc::new(AtomicBool::new(false));
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.fail_flushes_while(failing.clone());
            wal.append(&events[0]).unwrap();

            failing.store(true, Ordering::SeqCst);
            wal.append_buffered(&events[1]).unwrap();
            assert!(wal.flush_sync().is_err());
            wal.rollback().unwrap();

            failing.store(false, Ordering::SeqCst);
            wal.append(&events[2]).unwrap();
            assert_eq!(wal.appends_since_compact(), 2);
        }
        assert_eq!(
            Wal::replay(&path).unwrap(),
            vec![events[0].clone(), events[2].clone()]
        );
    }

    #[test]
    fn rollback_cuts_bytes_already_on_disk() {
        let path = tmp_path("rollback_partial.wal");
        let events = sample_events();
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&events[0]).unwrap();
        let durable = fs::metadata(&path).unwrap().len();

        // part of a batch reached the file before the failure
        wal.append_buffered(&events[1]).unwrap();
        wal.writer.flush().unwrap();
        assert!(fs::metadata(&path).unwrap().len() > durable);

        wal.rollback().unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), durable);
        drop(wal);
        assert_eq!(Wal::replay(&path).unwrap(), vec![events[0].clone()]);
    }

    #[test]
    fn oversized_length_prefix_is_torn() {
        let path = tmp_path("oversized.wal");
        let good = Event::RoomDeleted { id: Ulid::new() };
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&0xFFFF_FFF0u32.to_le_bytes()).unwrap();
            f.write_all(&[7u8; 16]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![good.clone()]);

        // a plausible length that runs past the end of the file
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&512u32.to_le_bytes()).unwrap();
            f.write_all(&[7u8; 16]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
    }
}
