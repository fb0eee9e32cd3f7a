use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Append-only journal of tenant events.
///
/// Record layout: `[u32 le: len][bincode: Event][u32 le: crc32(payload)]`.
/// A short or corrupt tail (crash mid-write) ends replay at the last good
/// record.
pub struct Journal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

fn write_record(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// The next record and its size on disk. `Ok(None)` at a clean end, a
/// truncated tail, or the first bad record.
fn read_record(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let Some(len) = read_u32(reader)? else {
        return Ok(None);
    };
    let mut payload = vec![0u8; len as usize];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }
    let Some(stored_crc) = read_u32(reader)? else {
        return Ok(None);
    };
    if stored_crc != crc32fast::hash(&payload) {
        return Ok(None);
    }
    let size = 8 + payload.len() as u64;
    Ok(bincode::deserialize(&payload).ok().map(|event| (event, size)))
}

fn read_u32(reader: &mut impl Read) -> io::Result<Option<u32>> {
    let mut buf = [0u8; 4];
    Ok(read_full(reader, &mut buf)?.then(|| u32::from_le_bytes(buf)))
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn open_append(path: &Path) -> io::Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

impl Journal {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            writer: open_append(path)?,
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append and fsync one record.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer a record; durable only after [`flush_sync`](Self::flush_sync).
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_record(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Write `events` to the side file `<journal>.tmp` and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(compact_path(path))?);
        for event in events {
            write_record(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the side file over the journal and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(compact_path(&self.path), &self.path)?;
        self.writer = open_append(&self.path)?;
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Every intact record, in order. A missing file is an empty journal.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(scan(path)?.0)
    }

    /// Replay, then cut the file back to its last intact record so new
    /// appends land where the next replay can reach them.
    pub fn recover(path: &Path) -> io::Result<Vec<Event>> {
        let (events, intact_len) = scan(path)?;
        let file_len = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(events),
            Err(e) => return Err(e),
        };
        if file_len > intact_len {
            tracing::warn!(
                "journal {}: dropping {} bytes after the last intact record",
                path.display(),
                file_len - intact_len
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(intact_len)?;
            file.sync_all()?;
        }
        Ok(events)
    }
}

/// Intact records plus the byte length they cover.
fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut intact_len = 0;
    while let Some((event, size)) = read_record(&mut reader)? {
        events.push(event);
        intact_len += size;
    }
    Ok((events, intact_len))
}

fn compact_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("orcdesk_test_journal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn quote(seq: u32) -> Event {
        Event::DocumentIssued {
            document: Document {
                id: Ulid::new(),
                kind: DocumentKind::Quote,
                number: DocumentNumber::new("ORC", 2026, seq),
                client: Some("Clínica Sorriso".into()),
                created_at: 1_760_000_000_000 + seq as Ms,
                deleted: false,
            },
        }
    }

    fn meeting(start: &str) -> Event {
        Event::CalendarEventUpserted {
            event: CalendarEvent::timed(Ulid::new(), start),
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.journal");
        let events = vec![quote(1), meeting("2025-03-10T14:30:00-03:00"), quote(2)];
        {
            let mut journal = Journal::open(&path).unwrap();
            for e in &events {
                journal.append(e).unwrap();
            }
        }
        assert_eq!(Journal::replay(&path).unwrap(), events);
    }

    #[test]
    fn truncated_tail_is_dropped() {
        let path = tmp_path("truncated.journal");
        let event = quote(1);
        {
            let mut journal = Journal::open(&path).unwrap();
            journal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }
        assert_eq!(Journal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn recover_cuts_torn_tail_so_appends_stay_reachable() {
        let path = tmp_path("recover.journal");
        let first = quote(1);
        {
            let mut journal = Journal::open(&path).unwrap();
            journal.append(&first).unwrap();
        }
        let intact = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[40u8, 0, 0, 0, 1, 2]).unwrap();
        }

        assert_eq!(Journal::recover(&path).unwrap(), vec![first.clone()]);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact);

        let second = quote(2);
        {
            let mut journal = Journal::open(&path).unwrap();
            journal.append(&second).unwrap();
        }
        assert_eq!(Journal::replay(&path).unwrap(), vec![first, second]);
    }

    #[test]
    fn recover_leaves_clean_journal_alone() {
        let path = tmp_path("recover_clean.journal");
        {
            let mut journal = Journal::open(&path).unwrap();
            journal.append(&quote(1)).unwrap();
        }
        let len = fs::metadata(&path).unwrap().len();
        assert_eq!(Journal::recover(&path).unwrap().len(), 1);
        assert_eq!(fs::metadata(&path).unwrap().len(), len);

        let missing = tmp_path("recover_missing.journal");
        assert!(Journal::recover(&missing).unwrap().is_empty());
        assert!(!missing.exists());
    }

    #[test]
    fn missing_file_is_empty() {
        let path = tmp_path("never_written.journal");
        assert!(Journal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn bad_crc_stops_replay() {
        let path = tmp_path("bad_crc.journal");
        let good = quote(1);
        {
            let mut journal = Journal::open(&path).unwrap();
            journal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&quote(2)).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        assert_eq!(Journal::replay(&path).unwrap(), vec![good]);
    }

    #[test]
    fn compaction_shrinks_and_keeps_appending() {
        let path = tmp_path("compaction.journal");
        let keep = quote(1);
        {
            let mut journal = Journal::open(&path).unwrap();
            journal.append(&keep).unwrap();
            for _ in 0..20 {
                let id = Ulid::new();
                journal
                    .append(&Event::CalendarEventUpserted {
                        event: CalendarEvent::all_day(id, "2025-03-10"),
                    })
                    .unwrap();
                journal.append(&Event::CalendarEventRemoved { id }).unwrap();
            }
        }
        let before = fs::metadata(&path).unwrap().len();

        let later = quote(2);
        {
            let mut journal = Journal::open(&path).unwrap();
            journal.compact(std::slice::from_ref(&keep)).unwrap();
            assert_eq!(journal.appends_since_compact(), 0);
            journal.append(&later).unwrap();
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted journal should be smaller: {after} < {before}");
        assert_eq!(Journal::replay(&path).unwrap(), vec![keep, later]);
    }

    #[test]
    fn buffered_appends_count_until_compaction() {
        let path = tmp_path("buffered.journal");
        let events: Vec<Event> = (1..=5).map(quote).collect();
        {
            let mut journal = Journal::open(&path).unwrap();
            for e in &events {
                journal.append_buffered(e).unwrap();
            }
            assert_eq!(journal.appends_since_compact(), 5);
            journal.flush_sync().unwrap();
        }
        assert_eq!(Journal::replay(&path).unwrap(), events);
    }
}
