use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// File header: magic + little-endian format version.
const MAGIC: &[u8; 8] = b"SLOTDWAL";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: u64 = 12;
/// Larger length prefixes can only come from a corrupt tail.
const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

fn write_header(writer: &mut impl Write) -> io::Result<()> {
    writer.write_all(MAGIC)?;
    writer.write_all(&FORMAT_VERSION.to_le_bytes())
}

fn check_header(reader: &mut impl Read) -> io::Result<()> {
    let mut header = [0u8; HEADER_LEN as usize];
    reader.read_exact(&mut header)?;
    if &header[..8] != MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "not a slotd WAL file"));
    }
    let version = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
    if version != FORMAT_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported WAL format version {version}"),
        ));
    }
    Ok(())
}

/// Encode one record as `[u32 len][bincode payload][u32 crc32]`.
fn encode_record<T: Serialize>(writer: &mut impl Write, record: &T) -> io::Result<()> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// Read one record and its framed size. `Ok(None)` marks the usable end of
/// the log: clean EOF, a torn tail from a crash, or a CRC/decoding mismatch.
fn decode_record<T: DeserializeOwned>(reader: &mut impl Read) -> io::Result<Option<(T, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_LEN {
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
    Ok(bincode::deserialize(&payload)
        .ok()
        .map(|record| (record, len as u64 + 8)))
}

/// Intact records plus the byte length they span, header included. `None`
/// for a missing or empty file.
fn read_intact<T: DeserializeOwned>(path: &Path) -> io::Result<(Vec<T>, Option<u64>)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), None)),
        Err(e) => return Err(e),
    };
    if file.metadata()?.len() == 0 {
        return Ok((Vec::new(), None));
    }
    let mut reader = BufReader::new(file);
    check_header(&mut reader)?;

    let mut records = Vec::new();
    let mut valid_len = HEADER_LEN;
    while let Some((record, framed)) = decode_record(&mut reader)? {
        records.push(record);
        valid_len += framed;
    }
    Ok((records, Some(valid_len)))
}

/// `read_exact` that maps EOF to `false`.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Append-only write-ahead log.
///
/// The file starts with a 12-byte header, then one framed record per state
/// change. A torn or corrupt tail is dropped on replay; everything before it
/// is kept.
///
/// Buffered records live in memory until `flush_sync`. A failed flush cuts
/// the file back to its last durable length so a later batch never lands
/// behind half a record.
pub struct Wal {
    file: File,
    buf: Vec<u8>,
    /// Bytes known to be on disk.
    durable_len: u64,
    pending: u64,
    /// Set when a failed flush could not be rolled back. Every later flush
    /// fails until compaction rewrites the file.
    poisoned: bool,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the log at `path`, writing the header into a new file.
    pub fn open(path: &Path) -> io::Result<Self> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut durable_len = file.metadata()?.len();
        if durable_len == 0 {
            write_header(&mut file)?;
            file.sync_all()?;
            durable_len = HEADER_LEN;
        }
        Ok(Self {
            file,
            buf: Vec::new(),
            durable_len,
            pending: 0,
            poisoned: false,
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append and fsync a single record. Production code batches through
    /// `append_buffered` + `flush_sync` instead.
    #[cfg(test)]
    pub fn append<T: Serialize>(&mut self, record: &T) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    /// Buffer a record without flushing; durable after the next `flush_sync`.
    pub fn append_buffered<T: Serialize>(&mut self, record: &T) -> io::Result<()> {
        encode_record(&mut self.buf, record)?;
        self.pending += 1;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Write and fsync the buffered records. On error none of them count as
    /// written: the buffer is dropped and the file truncated to its durable
    /// length.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        if self.poisoned {
            self.discard_buffered();
            return Err(io::Error::other("WAL has an unrecoverable tail; compaction required"));
        }
        if self.buf.is_empty() {
            return Ok(());
        }
        let written = self.file.write_all(&self.buf).and_then(|()| self.file.sync_all());
        match written {
            Ok(()) => {
                self.durable_len += self.buf.len() as u64;
                self.buf.clear();
                self.pending = 0;
                Ok(())
            }
            Err(e) => {
                self.discard_buffered();
                if let Err(rollback) = self.truncate_to_durable() {
                    tracing::error!(
                        path = %self.path.display(),
                        durable_len = self.durable_len,
                        "WAL rollback failed: {rollback}"
                    );
                    self.poisoned = true;
                }
                Err(e)
            }
        }
    }

    /// Drop records buffered since the last flush.
    pub fn discard_buffered(&mut self) {
        self.appends_since_compact = self.appends_since_compact.saturating_sub(self.pending);
        self.pending = 0;
        self.buf.clear();
    }

    fn truncate_to_durable(&mut self) -> io::Result<()> {
        self.file.set_len(self.durable_len)?;
        self.file.sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replace the log with `records`: write a sibling temp file, fsync it,
    /// rename it over the log, reopen for appending.
    pub fn compact<T: Serialize>(&mut self, records: &[T]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            write_header(&mut writer)?;
            for record in records {
                encode_record(&mut writer, record)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.durable_len = file.metadata()?.len();
        self.file = file;
        self.buf.clear();
        self.pending = 0;
        self.poisoned = false;
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Read every intact record. A missing or empty file is an empty log; a
    /// foreign header is an error.
    pub fn replay<T: DeserializeOwned>(path: &Path) -> io::Result<Vec<T>> {
        read_intact(path).map(|(records, _)| records)
    }

    /// Replay the log and open it for appending. A torn tail is cut off so
    /// new records follow the last intact one.
    pub fn recover<T: DeserializeOwned>(path: &Path) -> io::Result<(Self, Vec<T>)> {
        let (records, valid_len) = read_intact(path)?;
        let mut wal = Self::open(path)?;
        if let Some(valid_len) = valid_len
            && valid_len < wal.durable_len
        {
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = wal.durable_len - valid_len,
                "truncating torn WAL tail"
            );
            wal.durable_len = valid_len;
            wal.truncate_to_durable()?;
        }
        Ok((wal, records))
    }
}
