//! Digest → journal-offset index.
//!
//! Durable form is a flat append-only file of fixed 40-byte entries
//! `[digest: 32][offset: u64 le]`, loaded into an ordered in-memory map at
//! open. Re-inserting a digest appends a new entry; on load the latest
//! entry wins, which is how an upgrade record takes over a commitment's
//! mapping without ever deleting anything.

use crate::error::{CalendarError, Result};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use tidemark_proofs::Digest;

pub const ENTRY_SIZE: usize = Digest::LEN + 8;

pub struct Index {
    path: PathBuf,
    writer: BufWriter<File>,
    map: BTreeMap<Digest, u64>,
}

impl Index {
    /// Opens the index, dropping a torn trailing entry. Every loaded
    /// offset must fall inside the recovered journal; one that does not
    /// means the index and journal disagree, which is fatal.
    pub fn open(path: impl AsRef<Path>, journal_len: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let mut bytes = Vec::new();
        (&file).read_to_end(&mut bytes)?;

        let whole = bytes.len() - bytes.len() % ENTRY_SIZE;
        if whole != bytes.len() {
            tracing::warn!(
                excess = bytes.len() - whole,
                "torn index tail, truncating to entry boundary"
            );
            file.set_len(whole as u64)?;
            file.sync_data()?;
        }

        let mut map = BTreeMap::new();
        for entry in bytes[..whole].chunks_exact(ENTRY_SIZE) {
            let digest = Digest::from_slice(&entry[..Digest::LEN])?;
            let offset = u64::from_le_bytes(entry[Digest::LEN..].try_into().unwrap());
            if offset >= journal_len {
                return Err(CalendarError::IndexBeyondJournal {
                    digest,
                    offset,
                    journal_len,
                });
            }
            map.insert(digest, offset);
        }

        tracing::info!(entries = map.len(), path = %path.display(), "index open");
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            map,
        })
    }

    /// Stages one mapping. Buffered; call `sync` once the batch is done.
    pub fn insert(&mut self, digest: Digest, offset: u64) -> Result<()> {
        let mut entry = [0u8; ENTRY_SIZE];
        entry[..Digest::LEN].copy_from_slice(digest.as_bytes());
        entry[Digest::LEN..].copy_from_slice(&offset.to_le_bytes());
        self.writer.write_all(&entry)?;
        self.map.insert(digest, offset);
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    pub fn get(&self, digest: &Digest) -> Option<u64> {
        self.map.get(digest).copied()
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.map.contains_key(digest)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Highest journal offset any entry points at. The store replays the
    /// journal from here on startup to catch index writes lost in a crash.
    pub fn highest_offset(&self) -> Option<u64> {
        self.map.values().max().copied()
    }

    /// Digests starting with `prefix`, in digest order.
    pub fn scan_prefix<'a>(
        &'a self,
        prefix: &'a [u8],
    ) -> impl Iterator<Item = (&'a Digest, u64)> + 'a {
        let lower = {
            let mut b = [0u8; Digest::LEN];
            b[..prefix.len()].copy_from_slice(prefix);
            Digest(b)
        };
        self.map
            .range((Bound::Included(lower), Bound::Unbounded))
            .take_while(move |(d, _)| d.as_bytes().starts_with(prefix))
            .map(|(d, off)| (d, *off))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
