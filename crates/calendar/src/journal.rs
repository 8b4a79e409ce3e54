//! Append-only record journal.
//!
//! Single file of length-framed, checksummed records at strictly
//! increasing byte offsets. One writer, any number of readers; readers
//! only ever see offsets that `append` has already returned, so they need
//! no coordination with the writer.
//!
//! Record layout (little-endian):
//!
//! ```text
//! [seq: u64][payload_len: u32][checksum: u64][payload bytes]
//! ```
//!
//! The checksum is CRC-64 over the seq bytes, length bytes and payload.

use crate::error::{CalendarError, Result};
use crc64fast::Digest as Crc64;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const HEADER_SIZE: usize = 8 + 4 + 8;

fn record_checksum(seq: u64, payload: &[u8]) -> u64 {
    let mut crc = Crc64::new();
    crc.write(&seq.to_le_bytes());
    crc.write(&(payload.len() as u32).to_le_bytes());
    crc.write(payload);
    crc.sum64()
}

fn encode_header(seq: u64, payload: &[u8]) -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];
    buf[0..8].copy_from_slice(&seq.to_le_bytes());
    buf[8..12].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    buf[12..20].copy_from_slice(&record_checksum(seq, payload).to_le_bytes());
    buf
}

/// What a forward scan found at one offset.
enum Scanned {
    Record { seq: u64, payload: Vec<u8>, next: u64 },
    /// Clean end of file at a record boundary.
    End,
    /// Incomplete or checksum-failing bytes reaching EOF.
    TornTail,
    /// Checksum failure with more data after the frame.
    Corrupt,
}

fn scan_one<R: Read>(reader: &mut R, offset: u64, file_len: u64) -> Result<Scanned> {
    if offset == file_len {
        return Ok(Scanned::End);
    }
    if file_len - offset < HEADER_SIZE as u64 {
        return Ok(Scanned::TornTail);
    }
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header)?;

    let seq = u64::from_le_bytes(header[0..8].try_into().unwrap());
    let payload_len = u32::from_le_bytes(header[8..12].try_into().unwrap()) as u64;
    let checksum = u64::from_le_bytes(header[12..20].try_into().unwrap());

    let next = offset + HEADER_SIZE as u64 + payload_len;
    if next > file_len {
        return Ok(Scanned::TornTail);
    }

    let mut payload = vec![0u8; payload_len as usize];
    reader.read_exact(&mut payload)?;

    if record_checksum(seq, &payload) != checksum {
        return Ok(if next == file_len {
            Scanned::TornTail
        } else {
            Scanned::Corrupt
        });
    }

    Ok(Scanned::Record { seq, payload, next })
}

/// The journal's single writer. Owns the append handle; every `append`
/// is fsync'd before the offset is returned.
pub struct Journal {
    path: PathBuf,
    file: File,
    len: u64,
    next_seq: u64,
}

impl Journal {
    /// Opens (or creates) the journal, recovering from a torn tail by
    /// truncating to the last complete record. A bad record that is *not*
    /// the tail is unrecoverable and reported as a checksum mismatch.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let file_len = file.metadata()?.len();

        let mut offset = 0u64;
        let mut records = 0u64;
        let mut torn = false;
        {
            let mut reader = io::BufReader::new(&mut file);
            reader.seek(SeekFrom::Start(0))?;
            loop {
                match scan_one(&mut reader, offset, file_len)? {
                    Scanned::Record { next, .. } => {
                        offset = next;
                        records += 1;
                    }
                    Scanned::End => break,
                    Scanned::TornTail => {
                        torn = true;
                        break;
                    }
                    Scanned::Corrupt => {
                        return Err(CalendarError::ChecksumMismatch { offset });
                    }
                }
            }
        }

        if torn {
            tracing::warn!(
                offset,
                file_len,
                "torn journal tail, truncating to last complete record"
            );
            file.set_len(offset)?;
            file.sync_data()?;
        }

        file.seek(SeekFrom::Start(offset))?;
        tracing::info!(records, bytes = offset, path = %path.display(), "journal open");

        Ok(Self {
            path,
            file,
            len: offset,
            next_seq: records,
        })
    }

    /// Appends one record and returns its starting offset. Durable on
    /// return: the write is fsync'd first.
    pub fn append(&mut self, payload: &[u8]) -> Result<u64> {
        let offset = self.len;
        let header = encode_header(self.next_seq, payload);
        self.file.write_all(&header)?;
        self.file.write_all(payload)?;
        self.file.sync_data()?;
        self.len = offset + HEADER_SIZE as u64 + payload.len() as u64;
        self.next_seq += 1;
        Ok(offset)
    }

    /// Current journal length in bytes. Also the offset of the next record.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn record_count(&self) -> u64 {
        self.next_seq
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the record written at `offset`. Opens its own read handle so
    /// it never contends with the writer.
    pub fn read_at(&self, offset: u64) -> Result<Vec<u8>> {
        read_record(&self.path, offset, self.len)
    }

    /// Iterates records in file order starting at `offset`. The iterator
    /// snapshots the journal length at creation; appends that land later
    /// may or may not be observed by a fresh iterator, never by this one.
    pub fn iter_from(&self, offset: u64) -> Result<JournalIter> {
        if offset > self.len {
            return Err(CalendarError::BadRecordBoundary { offset });
        }
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(JournalIter {
            reader: io::BufReader::new(file),
            offset,
            end: self.len,
        })
    }

    /// Raw journal bytes from `offset` to the current end, exactly as
    /// framed on disk. `offset` must be a record boundary; the first frame
    /// is re-verified to catch callers handing in arbitrary positions.
    pub fn raw_from(&self, offset: u64) -> Result<Vec<u8>> {
        if offset == self.len {
            return Ok(Vec::new());
        }
        if offset > self.len {
            return Err(CalendarError::BadRecordBoundary { offset });
        }
        // Boundary check: the frame at `offset` must parse.
        self.read_at(offset)?;

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity((self.len - offset) as usize);
        file.take(self.len - offset).read_to_end(&mut buf)?;
        Ok(buf)
    }
}

fn read_record(path: &Path, offset: u64, journal_len: u64) -> Result<Vec<u8>> {
    if offset >= journal_len {
        return Err(CalendarError::BadRecordBoundary { offset });
    }
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    match scan_one(&mut file, offset, journal_len)? {
        Scanned::Record { payload, .. } => Ok(payload),
        _ => Err(CalendarError::ChecksumMismatch { offset }),
    }
}

pub struct JournalIter {
    reader: io::BufReader<File>,
    offset: u64,
    end: u64,
}

impl Iterator for JournalIter {
    type Item = Result<(u64, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.end {
            return None;
        }
        match scan_one(&mut self.reader, self.offset, self.end) {
            Ok(Scanned::Record { payload, next, .. }) => {
                let at = self.offset;
                self.offset = next;
                Some(Ok((at, payload)))
            }
            Ok(Scanned::End) | Ok(Scanned::TornTail) => None,
            Ok(Scanned::Corrupt) => {
                let offset = self.offset;
                self.offset = self.end;
                Some(Err(CalendarError::ChecksumMismatch { offset }))
            }
            Err(e) => {
                self.offset = self.end;
                Some(Err(e))
            }
        }
    }
}
