use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Batch;

/// Bytes of framing around each payload: length prefix plus CRC.
const FRAME_OVERHEAD: u64 = 8;

fn write_frame(writer: &mut impl Write, batch: &Batch) -> io::Result<()> {
    let payload =
        bincode::serialize(batch).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// Fills `buf`, or reports `false` if the file ends first.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Why a replay stopped before the end of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Torn {
    Truncated,
    BadChecksum,
    Undecodable,
}

/// Next complete frame, `Ok(Err(_))` for a damaged tail, `Ok(Ok(None))` at a
/// clean end of file.
fn read_frame(reader: &mut impl Read) -> io::Result<Result<Option<(Batch, u64)>, Torn>> {
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(Ok(None)),
        Err(e) => return Err(e),
    }
    let mut payload = vec![0u8; u32::from_le_bytes(len) as usize];
    let mut crc = [0u8; 4];
    if !fill(reader, &mut payload)? || !fill(reader, &mut crc)? {
        return Ok(Err(Torn::Truncated));
    }
    if u32::from_le_bytes(crc) != crc32fast::hash(&payload) {
        return Ok(Err(Torn::BadChecksum));
    }
    let size = payload.len() as u64 + FRAME_OVERHEAD;
    Ok(bincode::deserialize(&payload)
        .map(|batch| Some((batch, size)))
        .map_err(|_| Torn::Undecodable))
}

/// Append-only log of batches.
///
/// Each batch is one frame, `[u32 len][bincode Batch][u32 crc32]`, written
/// and fsynced before the batch touches memory. Replay stops at the first
/// damaged frame, so a batch interrupted by a crash disappears whole, and
/// [`Wal::open`] cuts the damaged tail off before anything is appended.
pub struct Wal {
    file: File,
    path: PathBuf,
    /// Length of the intact prefix; everything past it is rolled back.
    len: u64,
    /// A failed append could not be rolled back; retried before the next write.
    dirty: bool,
    appends_since_compact: u64,
}

impl Wal {
    /// Replay the log at `path`, truncate it to its last intact frame and
    /// open it for appending. Returns the replayed batches.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Batch>)> {
        let (batches, intact) = scan(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > intact {
            warn!(path = %path.display(), intact, discarded = on_disk - intact, "truncating damaged log tail");
            file.set_len(intact)?;
            file.sync_all()?;
        }
        let wal = Self {
            file,
            path: path.to_path_buf(),
            len: intact,
            dirty: false,
            appends_since_compact: 0,
        };
        Ok((wal, batches))
    }

    /// Write one batch and fsync. On failure the file is cut back to its
    /// previous length, so no partial frame is left behind.
    pub fn append(&mut self, batch: &Batch) -> io::Result<()> {
        if self.dirty {
            self.roll_back()?;
        }
        let mut frame = Vec::new();
        write_frame(&mut frame, batch)?;
        let written = self
            .file
            .write_all(&frame)
            .and_then(|()| self.file.sync_all());
        if let Err(e) = written {
            if let Err(cut) = self.roll_back() {
                warn!(path = %self.path.display(), error = %cut, "could not cut a failed append");
            }
            return Err(e);
        }
        self.len += frame.len() as u64;
        self.appends_since_compact += 1;
        Ok(())
    }

    fn roll_back(&mut self) -> io::Result<()> {
        self.dirty = true;
        self.file.set_len(self.len)?;
        self.file.sync_all()?;
        self.dirty = false;
        Ok(())
    }

    /// Replace the log with `batches`: written beside it, fsynced, then
    /// renamed over it.
    pub fn compact(&mut self, batches: &[Batch]) -> io::Result<()> {
        let staging = self.path.with_extension("compact");
        {
            let mut writer = BufWriter::new(File::create(&staging)?);
            for batch in batches {
                write_frame(&mut writer, batch)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&staging, &self.path)?;
        self.file = OpenOptions::new().append(true).open(&self.path)?;
        self.len = self.file.metadata()?.len();
        self.dirty = false;
        self.appends_since_compact = 0;
        Ok(())
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Every intact batch in the log, oldest first. A missing file is an
    /// empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Batch>> {
        Ok(scan(path)?.0)
    }
}

/// Intact batches and the byte length they occupy.
fn scan(path: &Path) -> io::Result<(Vec<Batch>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut batches = Vec::new();
    let mut offset = 0u64;
    loop {
        match read_frame(&mut reader)? {
            Ok(Some((batch, size))) => {
                batches.push(batch);
                offset += size;
            }
            Ok(None) => break,
            Err(reason) => {
                warn!(path = %path.display(), offset, ?reason, "damaged log tail");
                break;
            }
        }
    }
    Ok((batches, offset))
}
