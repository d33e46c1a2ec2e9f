// vim: tw=80
//! A 4 KiB page of map entries

use std::{
    sync::Mutex,
    time::Instant,
};

use byteorder::{ByteOrder, LittleEndian};

use crate::{
    layout::ENTRIES_PER_PAGE,
    util::*,
};
use super::entry::MapEntry;

/// Which table a page belongs to
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Table {
    /// Logical to physical
    Fwd,
    /// Physical to logical
    Rev,
    /// CRC32 of every forward and reverse page
    Crc,
}

/// Identifies a page within one megazone
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PageKey {
    pub table: Table,
    pub index: u32,
}

impl PageKey {
    pub fn new(table: Table, index: u32) -> Self {
        PageKey { table, index }
    }
}

#[derive(Debug)]
struct PageData {
    words: Vec<u32>,
    dirty: bool,
    age: Instant,
}

/// One page of either map table, or of the CRC table.
///
/// Pages are shared through `Arc`.  The cache holds one reference; any other
/// reference pins the page in memory.
#[derive(Debug)]
pub struct MapPage {
    key: PageKey,
    inner: Mutex<PageData>,
}

impl MapPage {
    pub fn age(&self) -> Instant {
        self.inner.lock().unwrap().age
    }

    /// Parse a page read from disk
    pub fn from_bytes(key: PageKey, buf: &[u8]) -> Self {
        debug_assert_eq!(buf.len(), BYTES_PER_LBA);
        let mut words = vec![0u32; ENTRIES_PER_PAGE as usize];
        LittleEndian::read_u32_into(buf, &mut words);
        Self::from_words(key, words)
    }

    fn from_words(key: PageKey, words: Vec<u32>) -> Self {
        let data = PageData { words, dirty: false, age: Instant::now() };
        MapPage { key, inner: Mutex::new(data) }
    }

    pub fn get(&self, i: u32) -> MapEntry {
        MapEntry::from_raw(self.get_raw(i))
    }

    pub fn get_raw(&self, i: u32) -> u32 {
        self.inner.lock().unwrap().words[i as usize]
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.lock().unwrap().dirty
    }

    pub fn key(&self) -> PageKey {
        self.key
    }

    pub fn mark_dirty(&self) {
        self.inner.lock().unwrap().dirty = true;
    }

    /// A page that has never been written.  Map pages are all `UNUSED`; CRC
    /// pages are all zero.
    pub fn new(key: PageKey) -> Self {
        let fill = match key.table {
            Table::Crc => 0,
            Table::Fwd | Table::Rev => MapEntry::UNUSED.raw()
        };
        Self::from_words(key, vec![fill; ENTRIES_PER_PAGE as usize])
    }

    /// Store an entry and return the old one.  Dirties the page.
    pub fn set(&self, i: u32, entry: MapEntry) -> MapEntry {
        MapEntry::from_raw(self.set_raw(i, entry.raw()))
    }

    pub fn set_raw(&self, i: u32, raw: u32) -> u32 {
        let mut data = self.inner.lock().unwrap();
        let old = std::mem::replace(&mut data.words[i as usize], raw);
        data.dirty = true;
        data.age = Instant::now();
        old
    }

    /// Serialize the page and clear its dirty flag, atomically with respect to
    /// other mutators.  If the write fails, the caller must redirty it.
    pub fn take_for_writeback(&self) -> Vec<u8> {
        let mut data = self.inner.lock().unwrap();
        data.dirty = false;
        Self::serialize(&data.words)
    }

    fn serialize(words: &[u32]) -> Vec<u8> {
        let mut buf = vec![0u8; BYTES_PER_LBA];
        LittleEndian::write_u32_into(words, &mut buf);
        buf
    }

    pub fn touch(&self) {
        self.inner.lock().unwrap().age = Instant::now();
    }
}

// LCOV_EXCL_STOP
