use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::{Error, Result};

/// Allocation granule. Offsets and slice sizes are multiples of this.
const ALIGN: u64 = 8;

/// An offset-addressed buffer pool.
///
/// Every connection owns one; queued messages and command output buffers are
/// accounted against it. Callers get back plain offsets, so a slice can be
/// handed across the connection boundary without exposing memory.
#[derive(Debug)]
pub struct Pool {
    inner: Mutex<Slices>,
}

#[derive(Debug)]
struct Slices {
    capacity: u64,
    busy: BTreeMap<u64, Vec<u8>>,
}

impl Pool {
    pub fn new(capacity: u64) -> Self {
        Self {
            inner: Mutex::new(Slices {
                capacity,
                busy: BTreeMap::new(),
            }),
        }
    }

    /// Reserve a slice of `size` bytes and return its offset.
    ///
    /// The pool hands out the lowest-offset gap that fits, so space freed by
    /// [`Pool::free`] is reused.
    pub fn alloc(&self, size: u64) -> Result<u64> {
        let size = align8(size.max(1));
        let mut inner = self.inner.lock();
        if size > inner.capacity {
            return Err(Error::OutOfMemory);
        }

        let mut off = 0;
        for (&start, buf) in &inner.busy {
            if start - off >= size {
                break;
            }
            off = start + align8(buf.len() as u64);
        }
        if off + size > inner.capacity {
            return Err(Error::OutOfMemory);
        }

        inner.busy.insert(off, vec![0; size as usize]);
        Ok(off)
    }

    /// Copy `bytes` into the pool at `pos`. Fails if the target range is not
    /// fully inside one allocated slice.
    pub fn write(&self, pos: u64, bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let (&start, buf) = inner
            .busy
            .range_mut(..=pos)
            .next_back()
            .ok_or(Error::OutOfMemory)?;
        let rel = (pos - start) as usize;
        if rel + bytes.len() > buf.len() {
            return Err(Error::OutOfMemory);
        }
        buf[rel..rel + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Copy `size` bytes out of the pool, starting at `pos`.
    pub fn read(&self, pos: u64, size: u64) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        let (&start, buf) = inner
            .busy
            .range(..=pos)
            .next_back()
            .ok_or(Error::OutOfMemory)?;
        let rel = (pos - start) as usize;
        let size = size as usize;
        if rel + size > buf.len() {
            return Err(Error::OutOfMemory);
        }
        Ok(buf[rel..rel + size].to_vec())
    }

    /// Release the slice starting exactly at `off`.
    pub fn free(&self, off: u64) -> Result<()> {
        match self.inner.lock().busy.remove(&off) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.inner.lock().capacity
    }

    /// Bytes currently reserved, including alignment padding.
    pub fn used(&self) -> u64 {
        self.inner
            .lock()
            .busy
            .values()
            .map(|b| align8(b.len() as u64))
            .sum()
    }
}

fn align8(n: u64) -> u64 {
    (n + ALIGN - 1) & !(ALIGN - 1)
}
