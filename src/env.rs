//! Environment: owns the database file, its page cache, freelist and WAL,
//! and the header page describing every database within it.
//!
//! Owns the device, the page cache, and the file header for the
//! open/create lifecycle. Header layout: magic, version, page size, max
//! databases, a database-header array, freelist root, global-stats blob.

use std::sync::Arc;

use log::{debug, trace};

use crate::cache::Cache;
use crate::database::Database;
use crate::device::{Device, FileDevice, InMemoryDevice};
use crate::encoding::{read_u16, read_u32, read_u64, write_u16, write_u32, write_u64};
use crate::error::{Error, ErrorCode, Result};
use crate::freelist::Freelist;
use crate::page::PageKind;
use crate::types::{DataAccessMode, EnvFlags, PageId};
use crate::wal::{self, Log};

const MAGIC: u32 = 0x484D_4442; // "HMDB"
const VERSION_MAJOR: u16 = 1;
const VERSION_MINOR: u16 = 0;
const VERSION_REV: u16 = 0;

/// Header page layout (within the page's payload, after the generic page
/// header every page carries): magic(4) + major(2) + minor(2) + rev(2) +
/// page_size(4) + max_databases(2) + freelist_root(8) + stats_blob(8) = 32,
/// followed by `max_databases` fixed-width database header slots.
const ENV_HEADER_FIXED: usize = 32;

/// One database header slot: name(2) + key_size(2) + flags(4) + root(8) +
/// last_recno(8) + dam(4) + stats_blob(8) = 36 bytes.
const DB_HEADER_SLOT: usize = 36;

/// Recognized configuration parameters, gathered into one typed builder
/// rather than a string-keyed property bag.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub cache_size_bytes: u64,
    pub page_size: u32,
    pub max_databases: u16,
    pub initial_db_size: u64,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            cache_size_bytes: 1 << 20,
            page_size: 4096,
            max_databases: 16,
            initial_db_size: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DatabaseConfig {
    pub name: u16,
    pub key_size: u16,
    pub dam: DataAccessMode,
}

#[derive(Debug, Clone, Copy)]
struct DbHeader {
    name: u16,
    key_size: u16,
    flags: u32,
    root: PageId,
    last_recno: u64,
    dam: u32,
    stats_blob: PageId,
}

impl DbHeader {
    fn empty() -> Self {
        Self { name: 0, key_size: 0, flags: 0, root: 0, last_recno: 0, dam: 0, stats_blob: 0 }
    }

    fn in_use(&self) -> bool {
        self.root != 0
    }

    fn read(buf: &[u8]) -> Result<Self> {
        Ok(Self {
            name: read_u16(buf, 0)?,
            key_size: read_u16(buf, 2)?,
            flags: read_u32(buf, 4)?,
            root: read_u64(buf, 8)?,
            last_recno: read_u64(buf, 16)?,
            dam: read_u32(buf, 24)?,
            stats_blob: read_u64(buf, 28)?,
        })
    }

    fn write(&self, buf: &mut [u8]) -> Result<()> {
        write_u16(buf, 0, self.name)?;
        write_u16(buf, 2, self.key_size)?;
        write_u32(buf, 4, self.flags)?;
        write_u64(buf, 8, self.root)?;
        write_u64(buf, 16, self.last_recno)?;
        write_u32(buf, 24, self.dam)?;
        write_u64(buf, 28, self.stats_blob)?;
        Ok(())
    }
}

/// An open database file: cache, freelist, WAL, and the parsed header page.
pub struct Environment {
    cache: Cache,
    freelist: Freelist,
    flags: EnvFlags,
    page_size: u32,
    max_databases: u16,
    databases: Vec<DbHeader>,
    path: Option<String>,
}

impl Environment {
    /// Creates a new database file (or in-memory environment) and writes its
    /// header page.
    pub fn create(path: Option<&str>, flags: EnvFlags, config: EnvConfig) -> Result<Self> {
        debug!("creating environment page_size={} in_memory={}", config.page_size, flags.contains(EnvFlags::IN_MEMORY_DB));
        let in_memory = flags.contains(EnvFlags::IN_MEMORY_DB) || path.is_none();
        let device: Arc<dyn Device> = if in_memory {
            Arc::new(InMemoryDevice::new())
        } else {
            Arc::new(FileDevice::open(path.unwrap(), true, false)?)
        };

        let wal_log = if flags.contains(EnvFlags::ENABLE_TRANSACTIONS) && !in_memory {
            let (d0, d1) = wal::open_log_devices(path.unwrap(), false)?;
            Log::open(d0, d1, 4 << 20)?
        } else {
            Log::disabled()
        };

        let max_pages = (config.cache_size_bytes / config.page_size as u64).max(4) as usize;
        let mut cache = Cache::new(
            device,
            wal_log,
            config.page_size,
            max_pages,
            flags.contains(EnvFlags::WRITE_THROUGH),
            flags.contains(EnvFlags::CACHE_UNLIMITED),
        );

        cache.reserve_region(config.page_size as u64)?;
        cache.alloc_page(0, PageKind::Header, false)?;
        cache.unpin(0);

        let mut freelist = Freelist::new(None, config.page_size);
        if config.initial_db_size > 0 {
            freelist.alloc_bytes(&mut cache, config.initial_db_size, false)?;
        }

        let mut env = Self {
            cache,
            freelist,
            flags,
            page_size: config.page_size,
            max_databases: config.max_databases,
            databases: vec![DbHeader::empty(); config.max_databases as usize],
            path: path.map(str::to_string),
        };
        env.write_header_page()?;
        env.cache.flush_all()?;
        Ok(env)
    }

    /// Opens an existing database file, running recovery first if the
    /// environment was created with `ENABLE_RECOVERY` and the log is
    /// non-empty.
    pub fn open(path: &str, flags: EnvFlags, config: EnvConfig) -> Result<Self> {
        debug!("opening environment at {path}");
        let device: Arc<dyn Device> = Arc::new(FileDevice::open(path, false, flags.contains(EnvFlags::READ_ONLY))?);

        let mut wal_log = if flags.contains(EnvFlags::ENABLE_TRANSACTIONS) {
            let (d0, d1) = wal::open_log_devices(path, false)?;
            Log::open(d0, d1, 4 << 20)?
        } else {
            Log::disabled()
        };

        if flags.contains(EnvFlags::ENABLE_RECOVERY) && wal_log.is_enabled() {
            trace!("running recovery against {path}");
            wal_log.recover(device.as_ref())?;
        }

        let mut header_buf = vec![0u8; config.page_size as usize];
        device.read(0, &mut header_buf)?;
        let payload = &header_buf[crate::page::PAGE_HEADER_SIZE..];
        let magic = read_u32(payload, 0)?;
        if magic != MAGIC {
            return Err(Error::with_context(ErrorCode::Corrupt, "bad magic in header page"));
        }
        let page_size = read_u32(payload, 10)?;
        let max_databases = read_u16(payload, 14)? ;
        let freelist_root = read_u64(payload, 16)?;

        let mut databases = Vec::with_capacity(max_databases as usize);
        for i in 0..max_databases as usize {
            let base = ENV_HEADER_FIXED + i * DB_HEADER_SLOT;
            databases.push(DbHeader::read(&payload[base..base + DB_HEADER_SLOT])?);
        }

        let max_pages = (config.cache_size_bytes / page_size as u64).max(4) as usize;
        let mut cache = Cache::new(
            device,
            wal_log,
            page_size,
            max_pages,
            flags.contains(EnvFlags::WRITE_THROUGH),
            flags.contains(EnvFlags::CACHE_UNLIMITED),
        );
        cache.fetch(0)?;
        cache.unpin(0);

        let root = if freelist_root == 0 { None } else { Some(freelist_root) };
        let freelist = Freelist::new(root, page_size);

        Ok(Self {
            cache,
            freelist,
            flags,
            page_size,
            max_databases,
            databases,
            path: Some(path.to_string()),
        })
    }

    fn write_header_page(&mut self) -> Result<()> {
        self.cache.mark_dirty(0)?;
        let page = self.cache.fetch(0)?;
        let payload = page.payload_mut();
        write_u32(payload, 0, MAGIC)?;
        write_u16(payload, 4, VERSION_MAJOR)?;
        write_u16(payload, 6, VERSION_MINOR)?;
        write_u16(payload, 8, VERSION_REV)?;
        write_u32(payload, 10, self.page_size)?;
        write_u16(payload, 14, self.max_databases)?;
        write_u64(payload, 16, self.freelist.root().unwrap_or(0))?;
        write_u64(payload, 24, 0)?; // global-stats blob: none yet
        for (i, db) in self.databases.iter().enumerate() {
            let base = ENV_HEADER_FIXED + i * DB_HEADER_SLOT;
            db.write(&mut payload[base..base + DB_HEADER_SLOT])?;
        }
        self.cache.unpin(0);
        Ok(())
    }

    /// Creates a database named `config.name` within this environment and
    /// returns a handle to it.
    pub fn create_database(&mut self, config: DatabaseConfig, env_flags: EnvFlags) -> Result<Database> {
        if self.databases.iter().any(|d| d.in_use() && d.name == config.name) {
            return Err(Error::with_context(ErrorCode::AlreadyInitialized, "database name in use"));
        }
        let slot = self
            .databases
            .iter()
            .position(|d| !d.in_use())
            .ok_or_else(|| Error::new(ErrorCode::LimitsReached))?;

        let root = self.freelist.alloc_page(&mut self.cache)?;
        self.cache.alloc_page(root, PageKind::BtreeRoot, false)?;
        self.cache.unpin(root);

        let dam = env_flags.bits();
        self.databases[slot] = DbHeader {
            name: config.name,
            key_size: config.key_size,
            flags: dam,
            root,
            last_recno: 0,
            dam: config.dam.bits(),
            stats_blob: 0,
        };
        self.write_header_page()?;
        self.cache.flush_all()?;

        Ok(Database::new(
            config.name,
            config.key_size,
            root,
            env_flags,
            env_flags.contains(EnvFlags::RECORD_NUMBER),
        ))
    }

    /// Opens a handle onto an already-created database by name.
    pub fn open_database(&mut self, name: u16, env_flags: EnvFlags) -> Result<Database> {
        let header = self
            .databases
            .iter()
            .find(|d| d.in_use() && d.name == name)
            .copied()
            .ok_or_else(|| Error::new(ErrorCode::InvParameter))?;
        Ok(Database::new(
            header.name,
            header.key_size,
            header.root,
            env_flags,
            env_flags.contains(EnvFlags::RECORD_NUMBER),
        ))
    }

    pub fn cache_mut(&mut self) -> &mut Cache {
        &mut self.cache
    }

    pub fn freelist_mut(&mut self) -> &mut Freelist {
        &mut self.freelist
    }

    /// Borrows the cache and freelist together; callers that need both (any
    /// `Database` operation) can't get them from two separate `&mut self`
    /// calls without the borrow checker treating them as conflicting.
    pub fn cache_and_freelist_mut(&mut self) -> (&mut Cache, &mut Freelist) {
        (&mut self.cache, &mut self.freelist)
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Persists `db`'s possibly-updated root (after a split/merge/auto-recno
    /// bump) back into the header array, then flushes every dirty page.
    pub fn sync_database(&mut self, db: &Database) -> Result<()> {
        if let Some(slot) = self.databases.iter_mut().find(|d| d.in_use() && d.name == db.name()) {
            slot.root = db.root();
            slot.last_recno = db.last_recno();
        }
        self.write_header_page()?;
        self.cache.flush_all()?;
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.write_header_page()?;
        self.cache.flush_all()
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OpFlags;

    #[test]
    fn create_open_database_and_round_trip_a_value() {
        let dir = std::env::temp_dir().join(format!("envtest-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("db.hdb");
        let path = path.to_str().unwrap();
        let _ = std::fs::remove_file(path);

        let flags = EnvFlags::ENABLE_TRANSACTIONS;
        let mut env = Environment::create(Some(path), flags, EnvConfig { page_size: 1024, ..Default::default() }).unwrap();
        let mut db = env
            .create_database(DatabaseConfig { name: 1, key_size: 16, dam: DataAccessMode::empty() }, flags)
            .unwrap();

        let (cache, freelist) = env.cache_and_freelist_mut();
        db.insert(cache, freelist, b"a", b"hello", false, None).unwrap();
        let (cache, freelist) = env.cache_and_freelist_mut();
        let value = db.find(cache, freelist, b"a", OpFlags::empty(), None).unwrap();
        assert_eq!(value, b"hello");
        env.sync_database(&db).unwrap();
        env.close().unwrap();

        let mut reopened = Environment::open(path, flags, EnvConfig { page_size: 1024, ..Default::default() }).unwrap();
        let mut db2 = reopened.open_database(1, flags).unwrap();
        let (cache, freelist) = reopened.cache_and_freelist_mut();
        let value = db2.find(cache, freelist, b"a", OpFlags::empty(), None).unwrap();
        assert_eq!(value, b"hello");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
