use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Mutation;

/// Frames longer than this are treated as corruption rather than allocated.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Bytes of framing around each payload: length prefix plus checksum.
const FRAME_OVERHEAD: u64 = 8;

fn write_frame(writer: &mut impl Write, mutation: &Mutation) -> io::Result<()> {
    let payload =
        bincode::serialize(mutation).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// `read_exact` that reports a short read as `false` instead of an error.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next intact payload, or `None` at end of log or at a torn/corrupt frame.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut word = [0u8; 4];
    if !fill(reader, &mut word)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    if !fill(reader, &mut payload)? || !fill(reader, &mut word)? {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(Some(payload))
}

/// Decode frames until the first bad one. Returns the mutations and the
/// byte length of the intact prefix they were read from.
fn read_log(reader: &mut impl Read) -> io::Result<(Vec<Mutation>, u64)> {
    let mut mutations = Vec::new();
    let mut intact = 0u64;
    while let Some(payload) = read_frame(reader)? {
        let Ok(mutation) = bincode::deserialize::<Mutation>(&payload) else {
            break;
        };
        intact += FRAME_OVERHEAD + payload.len() as u64;
        mutations.push(mutation);
    }
    Ok((mutations, intact))
}

fn open_for_append(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
}

/// Append-only log of committed schedule mutations, one file per tenant.
///
/// Each entry is `[u32 len][bincode Mutation][u32 crc32]`, little endian,
/// with `len` covering the payload only.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the log at `path` and return it with every intact
    /// mutation already on disk. A torn or corrupt tail left by a crash is
    /// cut off so new entries land directly after the last good one.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Mutation>)> {
        let file = open_for_append(path)?;
        let (mutations, intact) = read_log(&mut BufReader::new(&file))?;
        let on_disk = file.metadata()?.len();
        if on_disk > intact {
            warn!(
                path = %path.display(),
                dropped = on_disk - intact,
                "truncating torn WAL tail"
            );
            file.set_len(intact)?;
            file.sync_all()?;
        }
        let wal = Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        };
        Ok((wal, mutations))
    }

    /// Durably append a batch: one flush and one fsync for all of it.
    ///
    /// The buffer is flushed even when encoding fails part way, so no
    /// half-written batch lingers in memory to prefix the next one.
    pub fn commit<'a>(&mut self, batch: impl IntoIterator<Item = &'a Mutation>) -> io::Result<()> {
        let mut appended = Ok(());
        for mutation in batch {
            appended = write_frame(&mut self.writer, mutation);
            if appended.is_err() {
                break;
            }
            self.appends_since_compact += 1;
        }
        let flushed = self
            .writer
            .flush()
            .and_then(|()| self.writer.get_ref().sync_all());
        appended.and(flushed)
    }

    /// Replace the log with `snapshot`. The snapshot is written and synced
    /// next to the log, then renamed over it, so a crash leaves either the
    /// old log or the new one.
    pub fn rewrite(&mut self, snapshot: &[Mutation]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            for mutation in snapshot {
                write_frame(&mut tmp, mutation)?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        self.writer = BufWriter::new(open_for_append(&self.path)?);
        self.appends_since_compact = 0;
        Ok(())
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Read-only replay. A missing file replays as empty.
    pub fn replay(path: &Path) -> io::Result<Vec<Mutation>> {
        match File::open(path) {
            Ok(file) => Ok(read_log(&mut BufReader::new(file))?.0),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}
