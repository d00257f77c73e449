//! Write-ahead log: two ring-rotated files holding physical before/after
//! page images, file-size-change markers, and transaction boundaries.
//!
//! Trimmed to this engine's single-writer, single-process model: no
//! shared-memory wal-index, no concurrent-reader frame hashing. What's kept
//! is the physical-logging shape (fixed entry header + payload) and the
//! checkpoint/recovery vocabulary.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::device::{Device, InMemoryDevice};
use crate::encoding::{read_u32, read_u64, read_u8_at, write_u32, write_u64};
use crate::error::{Error, ErrorCode, Result};
use crate::types::{Lsn, PageId, TxnId};

const FILE_HEADER_SIZE: u64 = 16; // valid_end: u64, generation: u64
const ENTRY_HEADER_SIZE: usize = 29; // lsn8 + txn8 + kind1 + page_offset8 + len4

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Kind {
    Begin = 0,
    Commit = 1,
    Abort = 2,
    PageBefore = 3,
    PageAfter = 4,
    FileSize = 5,
    Checkpoint = 6,
}

impl Kind {
    fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => Kind::Begin,
            1 => Kind::Commit,
            2 => Kind::Abort,
            3 => Kind::PageBefore,
            4 => Kind::PageAfter,
            5 => Kind::FileSize,
            6 => Kind::Checkpoint,
            _ => return Err(Error::new(ErrorCode::Corrupt)),
        })
    }
}

struct Entry {
    lsn: Lsn,
    txn_id: TxnId,
    kind: Kind,
    page_offset: PageId,
    payload: Vec<u8>,
}

/// The write-ahead log. Disabled (a pure no-op) when transactions/recovery
/// were not requested or the database is in-memory.
pub struct Log {
    devices: Option<[Arc<dyn Device>; 2]>,
    active: usize,
    write_offset: [u64; 2],
    generation: [u64; 2],
    next_lsn: Lsn,
    durable_lsn: [Lsn; 2],
    rotate_size: u64,
}

impl Log {
    /// A fully disabled log (in-memory databases, or transactions/recovery
    /// not requested). Every operation is a cheap no-op.
    pub fn disabled() -> Self {
        Self {
            devices: None,
            active: 0,
            write_offset: [0, 0],
            generation: [0, 0],
            next_lsn: 1,
            durable_lsn: [0, 0],
            rotate_size: u64::MAX,
        }
    }

    /// Convenience constructor for tests: a disabled log backed by nothing.
    pub fn new_in_memory() -> Self {
        Self::disabled()
    }

    pub fn open(dev0: Arc<dyn Device>, dev1: Arc<dyn Device>, rotate_size: u64) -> Result<Self> {
        let mut log = Self {
            devices: Some([dev0, dev1]),
            active: 0,
            write_offset: [FILE_HEADER_SIZE, FILE_HEADER_SIZE],
            generation: [0, 0],
            next_lsn: 1,
            durable_lsn: [0, 0],
            rotate_size,
        };
        for i in 0..2 {
            log.load_or_init_header(i)?;
        }
        Ok(log)
    }

    pub fn is_enabled(&self) -> bool {
        self.devices.is_some()
    }

    fn load_or_init_header(&mut self, idx: usize) -> Result<()> {
        let Some(devices) = &self.devices else {
            return Ok(());
        };
        let size = devices[idx].file_size()?;
        if size < FILE_HEADER_SIZE {
            self.write_file_header(idx, FILE_HEADER_SIZE, 0)?;
            self.write_offset[idx] = FILE_HEADER_SIZE;
            self.generation[idx] = 0;
        } else {
            let mut hdr = [0u8; FILE_HEADER_SIZE as usize];
            devices[idx].read(0, &mut hdr)?;
            let valid_end = read_u64(&hdr, 0)?;
            let generation = read_u64(&hdr, 8)?;
            self.write_offset[idx] = valid_end.max(FILE_HEADER_SIZE);
            self.generation[idx] = generation;
        }
        Ok(())
    }

    fn write_file_header(&self, idx: usize, valid_end: u64, generation: u64) -> Result<()> {
        let Some(devices) = &self.devices else {
            return Ok(());
        };
        let mut hdr = [0u8; FILE_HEADER_SIZE as usize];
        write_u64(&mut hdr, 0, valid_end)?;
        write_u64(&mut hdr, 8, generation)?;
        devices[idx].write(0, &hdr)
    }

    fn append(&mut self, txn_id: TxnId, kind: Kind, page_offset: PageId, payload: &[u8]) -> Result<Lsn> {
        let lsn = self.next_lsn;
        self.next_lsn += 1;
        let Some(devices) = &self.devices else {
            return Ok(lsn);
        };
        let idx = self.active;
        let mut header = [0u8; ENTRY_HEADER_SIZE];
        write_u64(&mut header, 0, lsn)?;
        write_u64(&mut header, 8, txn_id)?;
        header[16] = kind as u8;
        write_u64(&mut header, 17, page_offset)?;
        write_u32(&mut header, 25, payload.len() as u32)?;

        let offset = self.write_offset[idx];
        devices[idx].write(offset, &header)?;
        if !payload.is_empty() {
            devices[idx].write(offset + ENTRY_HEADER_SIZE as u64, payload)?;
        }
        self.write_offset[idx] = offset + ENTRY_HEADER_SIZE as u64 + payload.len() as u64;
        self.write_file_header(idx, self.write_offset[idx], self.generation[idx])?;

        if self.write_offset[idx] > self.rotate_size {
            self.rotate()?;
        }
        Ok(lsn)
    }

    fn rotate(&mut self) -> Result<()> {
        let next = 1 - self.active;
        self.generation[next] = self.generation[self.active] + 1;
        self.write_offset[next] = FILE_HEADER_SIZE;
        self.write_file_header(next, FILE_HEADER_SIZE, self.generation[next])?;
        self.active = next;
        Ok(())
    }

    pub fn log_begin(&mut self, txn_id: TxnId) -> Result<Lsn> {
        self.append(txn_id, Kind::Begin, 0, &[])
    }

    pub fn log_commit(&mut self, txn_id: TxnId) -> Result<Lsn> {
        let lsn = self.append(txn_id, Kind::Commit, 0, &[])?;
        self.ensure_durable(lsn)?;
        Ok(lsn)
    }

    pub fn log_abort(&mut self, txn_id: TxnId) -> Result<Lsn> {
        self.append(txn_id, Kind::Abort, 0, &[])
    }

    pub fn log_page_before(&mut self, offset: PageId, before_image: &[u8]) -> Result<Lsn> {
        self.append(0, Kind::PageBefore, offset, before_image)
    }

    pub fn log_page_after(&mut self, offset: PageId, after_image: &[u8]) -> Result<Lsn> {
        self.append(0, Kind::PageAfter, offset, after_image)
    }

    pub fn log_file_size(&mut self, new_size: u64) -> Result<Lsn> {
        self.append(0, Kind::FileSize, 0, &new_size.to_le_bytes())
    }

    pub fn log_checkpoint(&mut self) -> Result<Lsn> {
        self.append(0, Kind::Checkpoint, 0, &[])
    }

    /// Ensures the active log file is durable at least up to `lsn`.
    pub fn ensure_durable(&mut self, lsn: Lsn) -> Result<()> {
        let Some(devices) = &self.devices else {
            return Ok(());
        };
        let idx = self.active;
        if self.durable_lsn[idx] >= lsn {
            return Ok(());
        }
        devices[idx].flush()?;
        self.durable_lsn[idx] = self.next_lsn.saturating_sub(1);
        Ok(())
    }

    /// Called once every dirty page is known to be durably on the device;
    /// both log files are reset to empty.
    pub fn truncate_if_fully_flushed(&mut self) -> Result<()> {
        let Some(_devices) = &self.devices else {
            return Ok(());
        };
        for idx in 0..2 {
            self.write_offset[idx] = FILE_HEADER_SIZE;
            self.write_file_header(idx, FILE_HEADER_SIZE, self.generation[idx])?;
        }
        Ok(())
    }

    fn read_entries(&self, idx: usize) -> Result<Vec<Entry>> {
        let Some(devices) = &self.devices else {
            return Ok(Vec::new());
        };
        let dev = &devices[idx];
        let size = dev.file_size()?;
        if size < FILE_HEADER_SIZE {
            return Ok(Vec::new());
        }
        let mut hdr = [0u8; FILE_HEADER_SIZE as usize];
        dev.read(0, &mut hdr)?;
        let valid_end = read_u64(&hdr, 0)?.min(size);

        let mut entries = Vec::new();
        let mut pos = FILE_HEADER_SIZE;
        while pos + ENTRY_HEADER_SIZE as u64 <= valid_end {
            let mut header = vec![0u8; ENTRY_HEADER_SIZE];
            dev.read(pos, &mut header)?;
            let lsn = read_u64(&header, 0)?;
            let txn_id = read_u64(&header, 8)?;
            let kind = Kind::from_u8(read_u8_at(&header, 16)?)?;
            let page_offset = read_u64(&header, 17)?;
            let len = read_u32(&header, 25)? as u64;
            let mut payload = vec![0u8; len as usize];
            if len > 0 {
                dev.read(pos + ENTRY_HEADER_SIZE as u64, &mut payload)?;
            }
            pos += ENTRY_HEADER_SIZE as u64 + len;
            entries.push(Entry {
                lsn,
                txn_id,
                kind,
                page_offset,
                payload,
            });
        }
        Ok(entries)
    }

    /// Runs crash recovery against `device` (the main database file):
    /// replays committed transactions' after-images, undoes uncommitted
    /// ones via before-images, truncates the file back to its size as of
    /// just before the first uncommitted transaction, then empties the log.
    pub fn recover(&mut self, device: &dyn Device) -> Result<()> {
        if self.devices.is_none() {
            return Ok(());
        }
        let mut entries = self.read_entries(0)?;
        entries.extend(self.read_entries(1)?);
        entries.sort_by_key(|e| e.lsn);
        if entries.is_empty() {
            return Ok(());
        }

        let mut begin_lsn: BTreeMap<TxnId, Lsn> = BTreeMap::new();
        let mut committed: BTreeMap<TxnId, bool> = BTreeMap::new();
        let mut before_images: BTreeMap<TxnId, BTreeMap<PageId, Vec<u8>>> = BTreeMap::new();
        let mut after_images: BTreeMap<TxnId, BTreeMap<PageId, (Lsn, Vec<u8>)>> = BTreeMap::new();
        let mut file_sizes: Vec<(Lsn, u64)> = Vec::new();
        let mut max_commit_lsn: BTreeMap<TxnId, Lsn> = BTreeMap::new();

        for e in &entries {
            match e.kind {
                Kind::Begin => {
                    begin_lsn.entry(e.txn_id).or_insert(e.lsn);
                }
                Kind::Commit => {
                    committed.insert(e.txn_id, true);
                    max_commit_lsn.insert(e.txn_id, e.lsn);
                }
                Kind::Abort => {
                    committed.insert(e.txn_id, false);
                }
                Kind::PageBefore => {
                    before_images
                        .entry(e.txn_id)
                        .or_default()
                        .entry(e.page_offset)
                        .or_insert_with(|| e.payload.clone());
                }
                Kind::PageAfter => {
                    after_images
                        .entry(e.txn_id)
                        .or_default()
                        .insert(e.page_offset, (e.lsn, e.payload.clone()));
                }
                Kind::FileSize => {
                    if e.payload.len() == 8 {
                        let mut buf = [0u8; 8];
                        buf.copy_from_slice(&e.payload);
                        file_sizes.push((e.lsn, u64::from_le_bytes(buf)));
                    }
                }
                Kind::Checkpoint => {}
            }
        }

        let first_uncommitted_lsn = begin_lsn
            .iter()
            .filter(|(txn, _)| !*committed.get(*txn).unwrap_or(&false))
            .map(|(_, lsn)| *lsn)
            .min();

        let truncate_size = match first_uncommitted_lsn {
            Some(boundary) => file_sizes
                .iter()
                .filter(|(lsn, _)| *lsn < boundary)
                .map(|(_, size)| *size)
                .last(),
            None => file_sizes.last().map(|(_, size)| *size),
        };

        // Redo: apply after-images of committed transactions in commit order.
        let mut committed_txns: Vec<TxnId> = committed
            .iter()
            .filter(|(_, &ok)| ok)
            .map(|(&txn, _)| txn)
            .collect();
        committed_txns.sort_by_key(|txn| max_commit_lsn.get(txn).copied().unwrap_or(0));
        for txn in committed_txns {
            if let Some(pages) = after_images.get(&txn) {
                let mut ordered: Vec<(&PageId, &(Lsn, Vec<u8>))> = pages.iter().collect();
                ordered.sort_by_key(|(_, (lsn, _))| *lsn);
                for (offset, (_, bytes)) in ordered {
                    device.write(*offset, bytes)?;
                }
            }
        }

        // Undo: restore before-images of transactions lacking a commit marker.
        for (txn, ok) in &committed {
            if *ok {
                continue;
            }
            if let Some(pages) = before_images.get(txn) {
                for (offset, bytes) in pages {
                    device.write(*offset, bytes)?;
                }
            }
        }
        for (txn, pages) in &before_images {
            if !committed.contains_key(txn) {
                for (offset, bytes) in pages {
                    device.write(*offset, bytes)?;
                }
            }
        }

        if let Some(size) = truncate_size {
            device.truncate(size)?;
        }
        device.flush()?;
        self.truncate_if_fully_flushed()?;
        Ok(())
    }
}

/// Constructs the two rotating log-file devices beside a main database path
/// (`<path>.0`, `<path>.1`), or in-memory stand-ins for `IN_MEMORY_DB`.
pub fn open_log_devices(path: &str, in_memory: bool) -> Result<(Arc<dyn Device>, Arc<dyn Device>)> {
    if in_memory {
        return Ok((
            Arc::new(InMemoryDevice::new()),
            Arc::new(InMemoryDevice::new()),
        ));
    }
    use crate::device::FileDevice;
    let dev0 = FileDevice::open(&format!("{path}.0"), true, false)?;
    let dev1 = FileDevice::open(&format!("{path}.1"), true, false)?;
    Ok((Arc::new(dev0), Arc::new(dev1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::InMemoryDevice;

    fn new_log() -> (Log, Arc<dyn Device>, Arc<dyn Device>) {
        let d0: Arc<dyn Device> = Arc::new(InMemoryDevice::new());
        let d1: Arc<dyn Device> = Arc::new(InMemoryDevice::new());
        let log = Log::open(d0.clone(), d1.clone(), 1 << 20).unwrap();
        (log, d0, d1)
    }

    #[test]
    fn redo_committed_undo_uncommitted() {
        let (mut log, _d0, _d1) = new_log();
        let device: Arc<dyn Device> = Arc::new(InMemoryDevice::new());
        device.truncate(4096).unwrap();

        // txn 1: committed write to page 0
        log.log_begin(1).unwrap();
        log.log_page_before(0, &[0u8; 16]).unwrap();
        log.log_page_after(0, &[1u8; 16]).unwrap();
        log.log_commit(1).unwrap();

        // txn 2: uncommitted write to page 16 (crash before commit)
        log.log_begin(2).unwrap();
        log.log_page_before(16, &[0u8; 16]).unwrap();
        // no after-image logged, no commit: simulates in-flight write that
        // never made it back to the device before the crash.

        log.recover(device.as_ref()).unwrap();

        let mut buf = [0u8; 16];
        device.read(0, &mut buf).unwrap();
        assert_eq!(buf, [1u8; 16]);
        device.read(16, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);
    }

    #[test]
    fn recovery_empties_the_log() {
        let (mut log, d0, _d1) = new_log();
        let device: Arc<dyn Device> = Arc::new(InMemoryDevice::new());
        log.log_begin(1).unwrap();
        log.log_commit(1).unwrap();
        log.recover(device.as_ref()).unwrap();
        let mut hdr = [0u8; FILE_HEADER_SIZE as usize];
        d0.read(0, &mut hdr).unwrap();
        assert_eq!(read_u64(&hdr, 0).unwrap(), FILE_HEADER_SIZE);
    }
}
