//! In-memory device backing `EnvFlags::IN_MEMORY_DB` and used directly by
//! the test suite to exercise the engine without touching the filesystem.

use std::sync::Mutex;

use crate::device::Device;
use crate::error::Result;

#[derive(Default)]
pub struct InMemoryDevice {
    bytes: Mutex<Vec<u8>>,
}

impl InMemoryDevice {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Device for InMemoryDevice {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.bytes.lock().unwrap();
        let offset = offset as usize;
        if offset >= data.len() {
            buf.fill(0);
            return Ok(());
        }
        let avail = data.len() - offset;
        let n = avail.min(buf.len());
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        if n < buf.len() {
            buf[n..].fill(0);
        }
        Ok(())
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut data = self.bytes.lock().unwrap();
        let offset = offset as usize;
        let end = offset + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        let mut data = self.bytes.lock().unwrap();
        data.resize(len as usize, 0);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn file_size(&self) -> Result<u64> {
        Ok(self.bytes.lock().unwrap().len() as u64)
    }
}
