//! On-disk sorted-string-table files.
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! [DATA]   per entry: u32 key_len | key | u32 value_len | value
//! [INDEX]  per entry: u32 key_len | key | u64 data_offset
//! [FOOTER] u64 index_offset | u64 entry_count | u64 crc64 | u32 version | u32 magic
//! ```
//!
//! The crc64 covers the data and index sections. Writers stage into a
//! `.tmp` sibling and atomically rename on finish, so a finalized file is
//! either complete or absent.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc64fast_nvme::Digest;

use super::{EngineResult, Status};

const SST_MAGIC: u32 = 0x3154_5353; // "SST1"
const SST_VERSION: u32 = 1;
const FOOTER_LEN: u64 = 32;

/// Reject index/data entries larger than these before allocating.
const MAX_KEY_BYTES: usize = 64 * 1024;
const MAX_VALUE_BYTES: usize = 16 * 1024 * 1024;

/// Fsyncs the parent directory of `path` so a rename is durable.
fn fsync_dir(path: &Path) -> EngineResult<()> {
    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

struct WriterState {
    path: PathBuf,
    tmp_path: PathBuf,
    file: BufWriter<File>,
    index: Vec<(Vec<u8>, u64)>,
    offset: u64,
    last_key: Option<Vec<u8>>,
    digest: Digest,
    entries: u64,
}

/// Streaming writer for a single SST file.
///
/// Single-use and single-threaded: `open` once, `put` keys in strictly
/// ascending order, then `finish` (or `discard` to abandon the output).
pub struct SstFileWriter {
    state: Option<WriterState>,
}

impl Default for SstFileWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl SstFileWriter {
    pub fn new() -> Self {
        Self { state: None }
    }

    /// Creates the staging file for `path`. Nothing appears at `path` itself
    /// until `finish` succeeds.
    pub fn open(&mut self, path: impl AsRef<Path>) -> EngineResult<()> {
        if self.state.is_some() {
            return Err(Status::invalid_argument("sst writer already open"));
        }
        let path = path.as_ref().to_path_buf();
        let tmp_path = tmp_sibling(&path);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        self.state = Some(WriterState {
            path,
            tmp_path,
            file: BufWriter::new(file),
            index: Vec::new(),
            offset: 0,
            last_key: None,
            digest: Digest::new(),
            entries: 0,
        });
        Ok(())
    }

    /// Appends one key/value pair. Keys must arrive in strictly ascending
    /// byte order.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> EngineResult<()> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| Status::invalid_argument("sst writer not open"))?;
        if let Some(last) = &state.last_key {
            if key <= last.as_slice() {
                return Err(Status::invalid_argument(format!(
                    "keys must be strictly ascending: {:?} after {:?}",
                    key.escape_ascii().to_string(),
                    last.escape_ascii().to_string(),
                )));
            }
        }
        if key.len() > MAX_KEY_BYTES {
            return Err(Status::invalid_argument("key too large"));
        }
        if value.len() > MAX_VALUE_BYTES {
            return Err(Status::invalid_argument("value too large"));
        }

        let mut entry = Vec::with_capacity(8 + key.len() + value.len());
        entry.write_u32::<LittleEndian>(key.len() as u32).expect("vec write");
        entry.extend_from_slice(key);
        entry.write_u32::<LittleEndian>(value.len() as u32).expect("vec write");
        entry.extend_from_slice(value);

        state.file.write_all(&entry)?;
        state.digest.write(&entry);
        state.index.push((key.to_vec(), state.offset));
        state.offset += entry.len() as u64;
        state.last_key = Some(key.to_vec());
        state.entries += 1;
        Ok(())
    }

    /// Number of entries appended so far.
    pub fn entries(&self) -> u64 {
        self.state.as_ref().map(|s| s.entries).unwrap_or(0)
    }

    /// Writes the index and footer, fsyncs, and renames the file into place.
    ///
    /// Refuses to finalize with zero entries; use `discard` for that case.
    pub fn finish(&mut self) -> EngineResult<()> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| Status::invalid_argument("sst writer not open"))?;
        if state.entries == 0 {
            return Err(Status::invalid_argument(
                "cannot finalize an sst file with no entries",
            ));
        }
        let mut state = self.state.take().expect("checked above");

        let index_offset = state.offset;
        for (key, offset) in &state.index {
            let mut entry = Vec::with_capacity(12 + key.len());
            entry.write_u32::<LittleEndian>(key.len() as u32).expect("vec write");
            entry.extend_from_slice(key);
            entry.write_u64::<LittleEndian>(*offset).expect("vec write");
            state.file.write_all(&entry)?;
            state.digest.write(&entry);
        }

        state.file.write_u64::<LittleEndian>(index_offset)?;
        state.file.write_u64::<LittleEndian>(state.entries)?;
        state.file.write_u64::<LittleEndian>(state.digest.sum64())?;
        state.file.write_u32::<LittleEndian>(SST_VERSION)?;
        state.file.write_u32::<LittleEndian>(SST_MAGIC)?;

        state.file.flush()?;
        state.file.get_ref().sync_all()?;
        drop(state.file);
        std::fs::rename(&state.tmp_path, &state.path)?;
        fsync_dir(&state.path)?;
        Ok(())
    }

    /// Abandons the output, removing the staging file. Idempotent.
    pub fn discard(&mut self) -> EngineResult<()> {
        if let Some(state) = self.state.take() {
            drop(state.file);
            match std::fs::remove_file(&state.tmp_path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

impl Drop for SstFileWriter {
    fn drop(&mut self) {
        let _ = self.discard();
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// An immutable, finalized SST file with its index resident in memory.
#[derive(Debug)]
pub struct SstFile {
    path: PathBuf,
    index: Vec<(Vec<u8>, u64)>,
    index_offset: u64,
    entry_count: u64,
    crc64: u64,
    file_len: u64,
}

impl SstFile {
    /// Opens `path`, validating the footer and loading the index.
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let file_len = file.metadata()?.len();
        if file_len < FOOTER_LEN {
            return Err(Status::corruption(format!(
                "sst file too small: {file_len} bytes"
            )));
        }

        file.seek(SeekFrom::Start(file_len - FOOTER_LEN))?;
        let index_offset = file.read_u64::<LittleEndian>()?;
        let entry_count = file.read_u64::<LittleEndian>()?;
        let crc64 = file.read_u64::<LittleEndian>()?;
        let version = file.read_u32::<LittleEndian>()?;
        let magic = file.read_u32::<LittleEndian>()?;
        if magic != SST_MAGIC {
            return Err(Status::corruption(format!("bad sst magic: {magic:#010x}")));
        }
        if version != SST_VERSION {
            return Err(Status::corruption(format!(
                "unsupported sst version: {version}"
            )));
        }
        if index_offset > file_len - FOOTER_LEN {
            return Err(Status::corruption("sst index offset beyond file"));
        }

        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(index_offset))?;
        let index_end = file_len - FOOTER_LEN;
        let mut pos = index_offset;
        let mut index = Vec::with_capacity(entry_count as usize);
        while pos < index_end {
            let key_len = reader.read_u32::<LittleEndian>()? as usize;
            if key_len > MAX_KEY_BYTES {
                return Err(Status::corruption("sst index key too large"));
            }
            let mut key = vec![0u8; key_len];
            reader.read_exact(&mut key)?;
            let offset = reader.read_u64::<LittleEndian>()?;
            index.push((key, offset));
            pos += 12 + key_len as u64;
        }
        if index.len() as u64 != entry_count {
            return Err(Status::corruption(format!(
                "sst index entry count mismatch: footer says {entry_count}, index has {}",
                index.len()
            )));
        }

        Ok(Self {
            path,
            index,
            index_offset,
            entry_count,
            crc64,
            file_len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    pub fn smallest_key(&self) -> Option<&[u8]> {
        self.index.first().map(|(k, _)| k.as_slice())
    }

    pub fn largest_key(&self) -> Option<&[u8]> {
        self.index.last().map(|(k, _)| k.as_slice())
    }

    /// Recomputes the data+index checksum and compares it to the footer.
    pub fn verify_checksum(&self) -> EngineResult<()> {
        let mut file = File::open(&self.path)?;
        let mut remaining = self.file_len - FOOTER_LEN;
        let mut digest = Digest::new();
        let mut buf = vec![0u8; 64 * 1024];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            file.read_exact(&mut buf[..want])?;
            digest.write(&buf[..want]);
            remaining -= want as u64;
        }
        if digest.sum64() != self.crc64 {
            return Err(Status::corruption(format!(
                "sst checksum mismatch in {}",
                self.path.display()
            )));
        }
        Ok(())
    }

    /// Point lookup for a single key.
    pub fn get(&self, key: &[u8]) -> EngineResult<Option<Vec<u8>>> {
        let idx = match self
            .index
            .binary_search_by(|(k, _)| k.as_slice().cmp(key))
        {
            Ok(idx) => idx,
            Err(_) => return Ok(None),
        };
        let mut file = BufReader::new(File::open(&self.path)?);
        file.seek(SeekFrom::Start(self.index[idx].1))?;
        let (found, value) = read_data_entry(&mut file)?;
        if found != key {
            return Err(Status::corruption("sst index points at mismatching key"));
        }
        Ok(Some(value))
    }

    /// Sequential iterator over the data section. Position with
    /// [`SstFileIter::seek`] or [`SstFileIter::seek_to_first`] before use.
    pub fn iter(self: &Arc<Self>) -> EngineResult<SstFileIter> {
        let file = BufReader::new(File::open(&self.path)?);
        Ok(SstFileIter {
            sst: Arc::clone(self),
            file,
            pos: 0,
            current: None,
        })
    }
}

fn read_data_entry(file: &mut BufReader<File>) -> EngineResult<(Vec<u8>, Vec<u8>)> {
    let key_len = file.read_u32::<LittleEndian>()? as usize;
    if key_len > MAX_KEY_BYTES {
        return Err(Status::corruption("sst data key too large"));
    }
    let mut key = vec![0u8; key_len];
    file.read_exact(&mut key)?;
    let value_len = file.read_u32::<LittleEndian>()? as usize;
    if value_len > MAX_VALUE_BYTES {
        return Err(Status::corruption("sst data value too large"));
    }
    let mut value = vec![0u8; value_len];
    file.read_exact(&mut value)?;
    Ok((key, value))
}

/// Forward iterator over one SST file's entries.
pub struct SstFileIter {
    sst: Arc<SstFile>,
    file: BufReader<File>,
    pos: u64,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl SstFileIter {
    /// Positions at the first entry whose key is `>= target`.
    pub fn seek(&mut self, target: &[u8]) -> EngineResult<()> {
        let idx = self
            .sst
            .index
            .partition_point(|(k, _)| k.as_slice() < target);
        match self.sst.index.get(idx) {
            Some((_, offset)) => {
                self.file.seek(SeekFrom::Start(*offset))?;
                self.pos = *offset;
                self.read_current()
            }
            None => {
                self.pos = self.sst.index_offset;
                self.current = None;
                Ok(())
            }
        }
    }

    pub fn seek_to_first(&mut self) -> EngineResult<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.pos = 0;
        self.read_current()
    }

    /// Advances past the current entry.
    pub fn advance(&mut self) -> EngineResult<()> {
        if self.current.is_none() {
            return Ok(());
        }
        self.read_current()
    }

    pub fn current(&self) -> Option<(&[u8], &[u8])> {
        self.current
            .as_ref()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    fn read_current(&mut self) -> EngineResult<()> {
        if self.pos >= self.sst.index_offset {
            self.current = None;
            return Ok(());
        }
        let (key, value) = read_data_entry(&mut self.file)?;
        self.pos += 8 + key.len() as u64 + value.len() as u64;
        self.current = Some((key, value));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::StatusCode;
    use super::*;
    use tempfile::TempDir;

    fn write_sst(path: &Path, pairs: &[(&[u8], &[u8])]) {
        let mut writer = SstFileWriter::new();
        writer.open(path).unwrap();
        for (k, v) in pairs {
            writer.put(k, v).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn write_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("000001.sst");
        write_sst(
            &path,
            &[(b"apple", b"1"), (b"banana", b"2"), (b"cherry", b"3")],
        );

        let sst = Arc::new(SstFile::open(&path).unwrap());
        assert_eq!(sst.entry_count(), 3);
        assert_eq!(sst.smallest_key(), Some(&b"apple"[..]));
        assert_eq!(sst.largest_key(), Some(&b"cherry"[..]));
        sst.verify_checksum().unwrap();

        assert_eq!(sst.get(b"banana").unwrap(), Some(b"2".to_vec()));
        assert_eq!(sst.get(b"durian").unwrap(), None);

        let mut iter = sst.iter().unwrap();
        iter.seek_to_first().unwrap();
        let mut seen = Vec::new();
        while let Some((k, v)) = iter.current() {
            seen.push((k.to_vec(), v.to_vec()));
            iter.advance().unwrap();
        }
        assert_eq!(
            seen,
            vec![
                (b"apple".to_vec(), b"1".to_vec()),
                (b"banana".to_vec(), b"2".to_vec()),
                (b"cherry".to_vec(), b"3".to_vec()),
            ]
        );
    }

    #[test]
    fn seek_positions_at_first_key_at_or_after_target() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seek.sst");
        write_sst(&path, &[(b"b", b"1"), (b"m", b"9"), (b"x", b"5")]);

        let sst = Arc::new(SstFile::open(&path).unwrap());
        let mut iter = sst.iter().unwrap();

        iter.seek(b"c").unwrap();
        assert_eq!(iter.current().unwrap().0, b"m");

        iter.seek(b"m").unwrap();
        assert_eq!(iter.current().unwrap().0, b"m");

        iter.seek(b"y").unwrap();
        assert!(iter.current().is_none());
    }

    #[test]
    fn put_rejects_out_of_order_keys() {
        let dir = TempDir::new().unwrap();
        let mut writer = SstFileWriter::new();
        writer.open(dir.path().join("bad.sst")).unwrap();
        writer.put(b"m", b"1").unwrap();
        let err = writer.put(b"c", b"2").unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
        let err = writer.put(b"m", b"dup").unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
    }

    #[test]
    fn finish_refuses_empty_file_and_discard_cleans_up() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.sst");
        let mut writer = SstFileWriter::new();
        writer.open(&path).unwrap();
        let err = writer.finish().unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
        writer.discard().unwrap();

        assert!(!path.exists());
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn nothing_visible_at_target_path_until_finish() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("staged.sst");
        let mut writer = SstFileWriter::new();
        writer.open(&path).unwrap();
        writer.put(b"k", b"v").unwrap();
        assert!(!path.exists());
        writer.finish().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn open_rejects_truncated_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trunc.sst");
        std::fs::write(&path, b"short").unwrap();
        let err = SstFile::open(&path).unwrap_err();
        assert_eq!(err.code(), StatusCode::Corruption);
    }

    #[test]
    fn checksum_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("corrupt.sst");
        write_sst(&path, &[(b"k", b"vvvvvvvv")]);

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[6] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let sst = SstFile::open(&path).unwrap();
        let err = sst.verify_checksum().unwrap_err();
        assert_eq!(err.code(), StatusCode::Corruption);
    }
}
