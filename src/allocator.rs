//! In-memory IPv4 address allocator.
//!
//! Tracks one bit per address of an inclusive `[start, end]` range. All
//! operations take a short [`Mutex`] critical section and never await, so the
//! lock is never held across a store round-trip.
//!
//! Allocation order is deterministic: [`Allocation::Any`] always returns the
//! lowest free address.

use std::net::Ipv4Addr;

use parking_lot::Mutex;

use crate::error::{Error, Result};

const WORD_BITS: usize = u64::BITS as usize;

/// What to allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    /// Any free address in the range, lowest first.
    Any,
    /// Exactly this address. Used when re-seeding from the lease store.
    Specific(Ipv4Addr),
}

#[derive(Debug)]
struct Bitmap {
    words: Vec<u64>,
    len: usize,
    set: usize,
}

impl Bitmap {
    fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(WORD_BITS)],
            len,
            set: 0,
        }
    }

    fn get(&self, index: usize) -> bool {
        self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    fn set(&mut self, index: usize) {
        if !self.get(index) {
            self.words[index / WORD_BITS] |= 1 << (index % WORD_BITS);
            self.set += 1;
        }
    }

    fn clear(&mut self, index: usize) {
        if self.get(index) {
            self.words[index / WORD_BITS] &= !(1 << (index % WORD_BITS));
            self.set -= 1;
        }
    }

    fn first_clear(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)
            .map(|(position, word)| position * WORD_BITS + word.trailing_ones() as usize)
            .filter(|index| *index < self.len)
    }
}

/// Thread-safe allocator over a fixed address range.
///
/// # Example
///
/// ```
/// use std::net::Ipv4Addr;
/// use rangelease::{Allocation, Ipv4Allocator};
///
/// let allocator = Ipv4Allocator::new(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 3)).unwrap();
/// assert_eq!(allocator.allocate(Allocation::Any).unwrap(), Ipv4Addr::new(10, 0, 0, 1));
/// ```
#[derive(Debug)]
pub struct Ipv4Allocator {
    start: u32,
    end: u32,
    bitmap: Mutex<Bitmap>,
}

impl Ipv4Allocator {
    /// Creates an allocator with every address in `[start, end]` free.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `start` is not strictly below `end`.
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self> {
        let (start, end) = (u32::from(start), u32::from(end));
        if start >= end {
            return Err(Error::InvalidConfig(
                "start of the range must be lower than its end".to_string(),
            ));
        }
        let len = (end - start) as usize + 1;
        Ok(Self {
            start,
            end,
            bitmap: Mutex::new(Bitmap::new(len)),
        })
    }

    fn index_of(&self, ip: Ipv4Addr) -> Option<usize> {
        let addr = u32::from(ip);
        (self.start..=self.end)
            .contains(&addr)
            .then(|| (addr - self.start) as usize)
    }

    fn addr_at(&self, index: usize) -> Ipv4Addr {
        Ipv4Addr::from(self.start + index as u32)
    }

    /// Allocates an address.
    ///
    /// # Errors
    ///
    /// - [`Error::RangeExhausted`] for [`Allocation::Any`] when nothing is free.
    /// - [`Error::AddressOutOfRange`] for a specific address outside the range.
    /// - [`Error::AlreadyAllocated`] for a specific address that is taken.
    pub fn allocate(&self, request: Allocation) -> Result<Ipv4Addr> {
        let mut bitmap = self.bitmap.lock();
        match request {
            Allocation::Any => {
                let index = bitmap.first_clear().ok_or(Error::RangeExhausted)?;
                bitmap.set(index);
                Ok(self.addr_at(index))
            }
            Allocation::Specific(ip) => {
                let index = self.index_of(ip).ok_or(Error::AddressOutOfRange(ip))?;
                if bitmap.get(index) {
                    return Err(Error::AlreadyAllocated(ip));
                }
                bitmap.set(index);
                Ok(ip)
            }
        }
    }

    /// Marks an address free. Freeing a free address is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AddressOutOfRange`] if the address is outside the range.
    pub fn free(&self, ip: Ipv4Addr) -> Result<()> {
        let index = self.index_of(ip).ok_or(Error::AddressOutOfRange(ip))?;
        self.bitmap.lock().clear(index);
        Ok(())
    }

    pub fn is_allocated(&self, ip: Ipv4Addr) -> bool {
        self.index_of(ip)
            .is_some_and(|index| self.bitmap.lock().get(index))
    }

    /// Number of addresses in the range.
    pub fn capacity(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    pub fn allocated_count(&self) -> usize {
        self.bitmap.lock().set
    }

    pub fn free_count(&self) -> usize {
        self.capacity() - self.allocated_count()
    }

    /// Returns all allocated addresses in ascending order.
    pub fn allocated_addresses(&self) -> Vec<Ipv4Addr> {
        let bitmap = self.bitmap.lock();
        (0..bitmap.len)
            .filter(|index| bitmap.get(*index))
            .map(|index| self.addr_at(index))
            .collect()
    }

    pub fn range(&self) -> (Ipv4Addr, Ipv4Addr) {
        (Ipv4Addr::from(self.start), Ipv4Addr::from(self.end))
    }
}
