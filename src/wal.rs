use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Record;

/// Largest frame `decode_record` will allocate for; anything bigger is corruption.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Encode a single record to [len][bincode][crc32] format.
fn encode_record(writer: &mut impl Write, record: &Record) -> io::Result<()> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "record too large"));
    }
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Read one frame. `Ok(None)` means a clean end, a torn tail, or a corrupt frame.
fn decode_record(reader: &mut impl Read) -> io::Result<Option<(Record, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(None);
    }

    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }

    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }

    match bincode::deserialize::<Record>(&payload) {
        Ok(record) => Ok(Some((record, (len + 8) as u64))),
        Err(_) => Ok(None),
    }
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Append-only write-ahead log of booking records.
///
/// Format per entry: `[u32: len][bincode: Record][u32: crc32]`, little-endian.
/// A torn or corrupt tail ends replay; `open` cuts the file back to the last good
/// frame so later appends are never hidden behind garbage.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the log at `path`, returning it with every valid record.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Record>)> {
        let (records, valid_len) = Self::scan(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if file.metadata()?.len() > valid_len {
            tracing::warn!(path = %path.display(), valid_len, "discarding torn WAL tail");
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        let wal = Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: records.len() as u64,
        };
        Ok((wal, records))
    }

    /// Append and fsync. Production code batches through `append_buffered` + `flush_sync`.
    #[cfg(test)]
    pub fn append(&mut self, record: &Record) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    pub fn append_buffered(&mut self, record: &Record) -> io::Result<()> {
        encode_record(&mut self.writer, record)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
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

    /// Replace the log with `records` (a minimal rebuild of the current state).
    /// Written to a temp file, fsynced, then renamed over the live file.
    pub fn compact(&mut self, records: &[Record]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for record in records {
                encode_record(&mut writer, record)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        // Anything still buffered belongs to the old file.
        self.writer.flush()?;
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Read every valid record without touching the file.
    pub fn replay(path: &Path) -> io::Result<Vec<Record>> {
        Self::scan(path).map(|(records, _)| records)
    }

    /// Valid records plus the byte length they occupy.
    fn scan(path: &Path) -> io::Result<(Vec<Record>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut valid_len = 0u64;
        while let Some((record, frame_len)) = decode_record(&mut reader)? {
            records.push(record);
            valid_len += frame_len;
        }
        Ok((records, valid_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ItemStatus, Txn};
    use ulid::Ulid;

    fn registered() -> Record {
        Record::ItemRegistered {
            id: Ulid::new(),
            owner_id: Ulid::new(),
            status: ItemStatus::Active,
        }
    }

    #[test]
    fn append_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bookings.wal");
        let records = vec![
            registered(),
            Record::ItemStatusSet {
                id: Ulid::new(),
                status: ItemStatus::Archived,
            },
            Record::Committed(Txn::new(Ulid::new())),
        ];

        {
            let (mut wal, existing) = Wal::open(&path).unwrap();
            assert!(existing.is_empty());
            for r in &records {
                wal.append(r).unwrap();
            }
        }

        assert_eq!(Wal::replay(&path).unwrap(), records);
    }

    #[test]
    fn replay_nonexistent_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Wal::replay(&dir.path().join("missing.wal")).unwrap().is_empty());
    }

    #[test]
    fn torn_tail_is_cut_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("torn.wal");
        let first = registered();
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        let good_len = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8; 6]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first.clone()]);

        let second = registered();
        {
            let (mut wal, existing) = Wal::open(&path).unwrap();
            assert_eq!(existing, vec![first.clone()]);
            assert_eq!(fs::metadata(&path).unwrap().len(), good_len);
            wal.append(&second).unwrap();
        }
        // Without the repair the second record would sit behind the garbage.
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
    }

    #[test]
    fn corrupt_crc_stops_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.wal");
        let record = registered();
        {
            let payload = bincode::serialize(&record).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn compact_shrinks_and_accepts_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("compact.wal");
        let keep = registered();
        let id = keep.item_id();

        let (mut wal, _) = Wal::open(&path).unwrap();
        wal.append(&keep).unwrap();
        for _ in 0..20 {
            wal.append(&Record::ItemStatusSet {
                id,
                status: ItemStatus::InUse,
            })
            .unwrap();
            wal.append(&Record::ItemStatusSet {
                id,
                status: ItemStatus::Active,
            })
            .unwrap();
        }
        assert_eq!(wal.appends_since_compact(), 41);
        let before = fs::metadata(&path).unwrap().len();

        wal.compact(std::slice::from_ref(&keep)).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");

        let next = Record::ItemStatusSet {
            id,
            status: ItemStatus::Archived,
        };
        wal.append(&next).unwrap();
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap(), vec![keep, next]);
        assert!(!path.with_extension("wal.tmp").exists());
    }

    #[test]
    fn buffered_appends_land_after_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffered.wal");
        let records: Vec<Record> = (0..5).map(|_| registered()).collect();
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            for r in &records {
                wal.append_buffered(r).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }
        let (wal, replayed) = Wal::open(&path).unwrap();
        assert_eq!(replayed, records);
        assert_eq!(wal.appends_since_compact(), 5);
    }
}
