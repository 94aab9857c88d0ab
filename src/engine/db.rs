//! A database instance: a directory holding a versioned manifest, one log
//! file per column family for direct writes, and the SST files imported into
//! each column family.
//!
//! The manifest is the source of truth for which column families exist and
//! which SST files belong to them. It is rewritten atomically (staging file,
//! fsync, rename) on every mutation, so a crash mid-import leaves the
//! previous manifest intact and the half-copied files unreferenced.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use super::iter::DbIterator;
use super::sst::{SstFile, SstFileIter};
use super::{
    ColumnFamilyOptions, EngineResult, ExportImportFilesMetaData, ImportColumnFamilyOptions,
    Options, ReadOptions, Status, WriteOptions, BYTEWISE_COMPARATOR,
};

/// Name of the implicit column family every database has.
pub const DEFAULT_CF: &str = "default";

const MANIFEST_FILE: &str = "MANIFEST";
const MANIFEST_MAGIC: u32 = 0x4653_4D44; // "DMSF"
const MANIFEST_VERSION: u16 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CfManifest {
    name: String,
    /// SST file names relative to the database directory, oldest first.
    sst_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestData {
    comparator: String,
    next_file_number: u64,
    column_families: Vec<CfManifest>,
}

impl ManifestData {
    fn fresh() -> Self {
        Self {
            comparator: BYTEWISE_COMPARATOR.to_string(),
            next_file_number: 1,
            column_families: vec![CfManifest {
                name: DEFAULT_CF.to_string(),
                sst_files: Vec::new(),
            }],
        }
    }
}

fn manifest_path(db_path: &Path) -> PathBuf {
    db_path.join(MANIFEST_FILE)
}

fn read_manifest(db_path: &Path) -> EngineResult<ManifestData> {
    let mut bytes = Vec::new();
    File::open(manifest_path(db_path))?.read_to_end(&mut bytes)?;
    if bytes.len() < 6 {
        return Err(Status::corruption("manifest truncated"));
    }
    let magic = LittleEndian::read_u32(&bytes[0..4]);
    if magic != MANIFEST_MAGIC {
        return Err(Status::corruption(format!("bad manifest magic: {magic:#010x}")));
    }
    let version = LittleEndian::read_u16(&bytes[4..6]);
    if version != MANIFEST_VERSION {
        return Err(Status::corruption(format!(
            "unsupported manifest version: {version}"
        )));
    }
    let (manifest, _) =
        bincode::serde::decode_from_slice(&bytes[6..], bincode::config::standard())
            .map_err(|err| Status::corruption(format!("manifest decode: {err}")))?;
    Ok(manifest)
}

fn write_manifest(db_path: &Path, manifest: &ManifestData) -> EngineResult<()> {
    let mut bytes = Vec::new();
    bytes.write_u32::<LittleEndian>(MANIFEST_MAGIC).expect("vec write");
    bytes.write_u16::<LittleEndian>(MANIFEST_VERSION).expect("vec write");
    let body = bincode::serde::encode_to_vec(manifest, bincode::config::standard())
        .map_err(|err| Status::corruption(format!("manifest encode: {err}")))?;
    bytes.extend_from_slice(&body);

    let target = manifest_path(db_path);
    let staging = db_path.join(format!("{MANIFEST_FILE}.tmp"));
    let mut file = File::create(&staging)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&staging, &target)?;
    File::open(db_path)?.sync_all()?;
    Ok(())
}

#[derive(Debug)]
struct CfState {
    name: String,
    ssts: Vec<Arc<SstFile>>,
    /// Direct-write overlay, replayed from the log on open.
    mem: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    log_path: PathBuf,
    log: Mutex<Option<File>>,
}

impl CfState {
    fn load(db_path: &Path, manifest: &CfManifest) -> EngineResult<Self> {
        let mut ssts = Vec::with_capacity(manifest.sst_files.len());
        for file_name in &manifest.sst_files {
            ssts.push(Arc::new(SstFile::open(db_path.join(file_name))?));
        }
        let log_path = db_path.join(format!("{}.log", manifest.name));
        let mem = replay_log(&log_path)?;
        Ok(Self {
            name: manifest.name.clone(),
            ssts,
            mem: RwLock::new(mem),
            log_path,
            log: Mutex::new(None),
        })
    }
}

fn replay_log(path: &Path) -> EngineResult<BTreeMap<Vec<u8>, Vec<u8>>> {
    let mut mem = BTreeMap::new();
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(mem),
        Err(err) => return Err(err.into()),
    };
    // A short read means a torn tail record; everything before it stands.
    loop {
        let key_len = match file.read_u32::<LittleEndian>() {
            Ok(len) => len as usize,
            Err(_) => break,
        };
        let mut key = vec![0u8; key_len];
        if file.read_exact(&mut key).is_err() {
            break;
        }
        let value_len = match file.read_u32::<LittleEndian>() {
            Ok(len) => len as usize,
            Err(_) => break,
        };
        let mut value = vec![0u8; value_len];
        if file.read_exact(&mut value).is_err() {
            break;
        }
        mem.insert(key, value);
    }
    Ok(mem)
}

/// Cloneable handle to one column family of an open database.
#[derive(Clone)]
pub struct ColumnFamily {
    inner: Arc<CfState>,
}

impl ColumnFamily {
    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

impl std::fmt::Debug for ColumnFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnFamily")
            .field("name", &self.inner.name)
            .finish()
    }
}

/// Column family named at open time.
#[derive(Debug, Clone, Default)]
pub struct ColumnFamilyDescriptor {
    pub name: String,
    pub options: ColumnFamilyOptions,
}

impl ColumnFamilyDescriptor {
    pub fn new(name: impl Into<String>, options: ColumnFamilyOptions) -> Self {
        Self {
            name: name.into(),
            options,
        }
    }
}

#[derive(Debug)]
struct DbState {
    manifest: ManifestData,
    cfs: HashMap<String, Arc<CfState>>,
}

/// An open database instance rooted at one directory.
#[derive(Debug)]
pub struct Db {
    path: PathBuf,
    read_only: bool,
    state: Mutex<DbState>,
}

impl Db {
    /// Lists the column families recorded in the manifest at `path` without
    /// opening the database.
    pub fn list_column_families(path: impl AsRef<Path>) -> EngineResult<Vec<String>> {
        let manifest = read_manifest(path.as_ref())?;
        Ok(manifest
            .column_families
            .iter()
            .map(|cf| cf.name.clone())
            .collect())
    }

    /// Opens the database read-write, creating the directory, manifest, and
    /// any missing descriptor column families when `create_if_missing`.
    pub fn open(
        options: &Options,
        path: impl AsRef<Path>,
        descriptors: &[ColumnFamilyDescriptor],
    ) -> EngineResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut manifest = match read_manifest(&path) {
            Ok(manifest) => manifest,
            Err(_) if options.create_if_missing => {
                std::fs::create_dir_all(&path)?;
                let manifest = ManifestData::fresh();
                write_manifest(&path, &manifest)?;
                manifest
            }
            Err(status) => return Err(status),
        };

        let mut created = false;
        for descriptor in descriptors {
            if !manifest
                .column_families
                .iter()
                .any(|cf| cf.name == descriptor.name)
            {
                manifest.column_families.push(CfManifest {
                    name: descriptor.name.clone(),
                    sst_files: Vec::new(),
                });
                created = true;
            }
        }
        if created {
            write_manifest(&path, &manifest)?;
        }

        let cfs = load_column_families(&path, &manifest)?;
        Ok(Self {
            path,
            read_only: false,
            state: Mutex::new(DbState { manifest, cfs }),
        })
    }

    /// Opens the database read-only. Every descriptor must name an existing
    /// column family.
    pub fn open_for_read_only(
        _options: &Options,
        path: impl AsRef<Path>,
        descriptors: &[ColumnFamilyDescriptor],
    ) -> EngineResult<Self> {
        let path = path.as_ref().to_path_buf();
        let manifest = read_manifest(&path)?;
        for descriptor in descriptors {
            if !manifest
                .column_families
                .iter()
                .any(|cf| cf.name == descriptor.name)
            {
                return Err(Status::invalid_argument(format!(
                    "column family not found: {}",
                    descriptor.name
                )));
            }
        }
        let cfs = load_column_families(&path, &manifest)?;
        Ok(Self {
            path,
            read_only: true,
            state: Mutex::new(DbState { manifest, cfs }),
        })
    }

    /// Destroys the database at `path`, removing the directory tree.
    pub fn destroy(path: impl AsRef<Path>) -> EngineResult<()> {
        match std::fs::remove_dir_all(path.as_ref()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The engine's clock, used to anchor read deadlines.
    pub fn now(&self) -> std::time::Instant {
        std::time::Instant::now()
    }

    /// Handle to a column family by name.
    pub fn cf_handle(&self, name: &str) -> Option<ColumnFamily> {
        let state = self.state.lock();
        state.cfs.get(name).map(|inner| ColumnFamily {
            inner: Arc::clone(inner),
        })
    }

    /// Handle to the implicit default column family.
    pub fn default_cf(&self) -> ColumnFamily {
        self.cf_handle(DEFAULT_CF)
            .expect("default column family always exists")
    }

    /// Creates a new column family populated by importing externally
    /// produced SST files described by `metadata`.
    ///
    /// With `move_files == false` the sources are copied, so the originals
    /// survive and a failed import can simply be retried after destroying
    /// the target. Each copied file's checksum is verified before the
    /// manifest references it.
    pub fn create_column_family_with_import(
        &self,
        _options: ColumnFamilyOptions,
        name: &str,
        import_options: &ImportColumnFamilyOptions,
        metadata: &ExportImportFilesMetaData,
    ) -> EngineResult<ColumnFamily> {
        if self.read_only {
            return Err(Status::invalid_argument("database is read-only"));
        }
        if metadata.db_comparator_name != BYTEWISE_COMPARATOR {
            return Err(Status::invalid_argument(format!(
                "comparator mismatch: {}",
                metadata.db_comparator_name
            )));
        }

        let mut state = self.state.lock();
        if state.cfs.contains_key(name) {
            return Err(Status::invalid_argument(format!(
                "column family already exists: {name}"
            )));
        }

        let mut file_names = Vec::with_capacity(metadata.files.len());
        let mut ssts = Vec::with_capacity(metadata.files.len());
        for file in &metadata.files {
            let source = source_file_path(&file.db_path, &file.name);
            let local_name = format!("{:06}.sst", state.manifest.next_file_number);
            state.manifest.next_file_number += 1;
            let target = self.path.join(&local_name);
            if import_options.move_files {
                std::fs::rename(&source, &target)?;
            } else {
                std::fs::copy(&source, &target)?;
            }
            let sst = Arc::new(SstFile::open(&target)?);
            sst.verify_checksum()?;
            file_names.push(local_name);
            ssts.push(sst);
        }

        state.manifest.column_families.push(CfManifest {
            name: name.to_string(),
            sst_files: file_names,
        });
        write_manifest(&self.path, &state.manifest)?;

        let cf = Arc::new(CfState {
            name: name.to_string(),
            ssts,
            mem: RwLock::new(BTreeMap::new()),
            log_path: self.path.join(format!("{name}.log")),
            log: Mutex::new(None),
        });
        state.cfs.insert(name.to_string(), Arc::clone(&cf));
        Ok(ColumnFamily { inner: cf })
    }

    /// Inserts a key/value pair into the column family's overlay, appending
    /// it to the per-CF log first.
    pub fn put(
        &self,
        options: &WriteOptions,
        cf: &ColumnFamily,
        key: &[u8],
        value: &[u8],
    ) -> EngineResult<()> {
        if self.read_only {
            return Err(Status::invalid_argument("database is read-only"));
        }
        let mut record = Vec::with_capacity(8 + key.len() + value.len());
        record.write_u32::<LittleEndian>(key.len() as u32).expect("vec write");
        record.extend_from_slice(key);
        record.write_u32::<LittleEndian>(value.len() as u32).expect("vec write");
        record.extend_from_slice(value);

        let mut log = cf.inner.log.lock();
        if log.is_none() {
            *log = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&cf.inner.log_path)?,
            );
        }
        let file = log.as_mut().expect("opened above");
        file.write_all(&record)?;
        if options.sync {
            file.sync_all()?;
        }
        drop(log);

        cf.inner.mem.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    /// Point lookup in one column family.
    pub fn get(
        &self,
        _options: &ReadOptions,
        cf: &ColumnFamily,
        key: &[u8],
    ) -> EngineResult<Option<Vec<u8>>> {
        if let Some(value) = cf.inner.mem.read().get(key) {
            return Ok(Some(value.clone()));
        }
        for sst in cf.inner.ssts.iter().rev() {
            if let Some(value) = sst.get(key)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Creates a forward iterator over one column family. The caller must
    /// position it with [`DbIterator::seek`] before reading.
    pub fn iterator(
        &self,
        options: &ReadOptions,
        cf: &ColumnFamily,
    ) -> EngineResult<DbIterator> {
        let mem: Vec<(Vec<u8>, Vec<u8>)> = {
            let guard = cf.inner.mem.read();
            guard
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        let mut sst_iters: Vec<SstFileIter> = Vec::with_capacity(cf.inner.ssts.len());
        for sst in &cf.inner.ssts {
            sst_iters.push(sst.iter()?);
        }
        Ok(DbIterator::new(mem, sst_iters, options))
    }
}

fn load_column_families(
    path: &Path,
    manifest: &ManifestData,
) -> EngineResult<HashMap<String, Arc<CfState>>> {
    let mut cfs = HashMap::with_capacity(manifest.column_families.len());
    for cf_manifest in &manifest.column_families {
        let cf = CfState::load(path, cf_manifest)?;
        cfs.insert(cf_manifest.name.clone(), Arc::new(cf));
    }
    Ok(cfs)
}

/// Joins a source directory and SST name the way envelopes spell them
/// (`name` conventionally carries a leading separator).
fn source_file_path(db_path: &str, name: &str) -> PathBuf {
    let trimmed = name.trim_start_matches('/');
    Path::new(db_path).join(trimmed)
}
