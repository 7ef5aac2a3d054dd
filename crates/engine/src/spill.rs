//! Bounded spill buffer for bulk index builds
//!
//! `ExternalRefBuffer` accumulates variable-length entries (encoded pin
//! references, or key/reference pairs) for one class while a bulk build
//! runs.
//!
//! # Layout
//!
//! Entries are stored as a `u16` big-endian length followed by the entry
//! bytes. The buffer starts as a small inline `Vec` that grows by
//! reallocation up to one page (64 KiB by default). The first append that
//! does not fit switches to the spilled layout:
//!
//! ```text
//!                 index (level 1)
//!                /               \
//!        index (level 0)      index (level 0)
//!        /     |     \              |
//!     data   data   data          data        <- fixed-size pages
//! ```
//!
//! Data pages are filled in order and never rewritten except to sort them.
//! Index pages list their children; a full index page starts a sibling
//! and the hierarchy grows a level when the top page fills.
//!
//! # Ordering
//!
//! In sorted mode every data page is sorted when it fills (each page is a
//! run) and the cursor merges runs; otherwise the cursor replays entries
//! in insertion order.

use byteorder::{BigEndian, ByteOrder};
use pinstore_core::{Error, Result};
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Default page size
pub const PAGE_SIZE: usize = 64 * 1024;

/// Smallest page size accepted by [`ExternalRefBuffer::with_page_size`]
pub const MIN_PAGE_SIZE: usize = 16;

const INITIAL_CAPACITY: usize = 256;
const ENTRY_HEADER: usize = 2;
/// Bytes per child reference in an index page
const INDEX_SLOT: usize = 4;

#[derive(Debug)]
struct DataPage {
    bytes: Vec<u8>,
    sorted: bool,
}

#[derive(Debug)]
struct IndexPage {
    level: u8,
    children: Vec<u32>,
}

/// Append-only buffer of variable-length entries with page spill
#[derive(Debug)]
pub struct ExternalRefBuffer {
    sorted: bool,
    page_size: usize,
    inline: Vec<u8>,
    inline_sorted: bool,
    pages: Vec<DataPage>,
    index: Vec<IndexPage>,
    /// Rightmost index page of each level; the last entry is the top
    spine: Vec<u32>,
    count: usize,
    payload: usize,
}

fn entry_at(bytes: &[u8], pos: usize) -> (&[u8], usize) {
    let len = BigEndian::read_u16(&bytes[pos..pos + ENTRY_HEADER]) as usize;
    let start = pos + ENTRY_HEADER;
    (&bytes[start..start + len], start + len)
}

fn push_entry(buf: &mut Vec<u8>, entry: &[u8]) {
    let mut header = [0u8; ENTRY_HEADER];
    BigEndian::write_u16(&mut header, entry.len() as u16);
    buf.extend_from_slice(&header);
    buf.extend_from_slice(entry);
}

/// Sort the entries of an encoded run in place
fn sort_run(bytes: &mut Vec<u8>) {
    let mut entries: Vec<&[u8]> = EntryIter::new(bytes).collect();
    entries.sort_unstable();
    let mut out = Vec::with_capacity(bytes.capacity());
    for e in entries {
        push_entry(&mut out, e);
    }
    *bytes = out;
}

impl ExternalRefBuffer {
    /// Create a buffer with the default page size
    pub fn new(sorted: bool) -> Self {
        Self::build(sorted, PAGE_SIZE)
    }

    /// Create a buffer with a custom page size
    pub fn with_page_size(sorted: bool, page_size: usize) -> Result<Self> {
        if !(MIN_PAGE_SIZE..=PAGE_SIZE).contains(&page_size) {
            return Err(Error::invalid(format!(
                "page size {} outside {}..={}",
                page_size, MIN_PAGE_SIZE, PAGE_SIZE
            )));
        }
        Ok(Self::build(sorted, page_size))
    }

    fn build(sorted: bool, page_size: usize) -> Self {
        Self {
            sorted,
            page_size,
            inline: Vec::new(),
            inline_sorted: true,
            pages: Vec::new(),
            index: Vec::new(),
            spine: Vec::new(),
            count: 0,
            payload: 0,
        }
    }

    /// True if the cursor yields entries in byte order
    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.count
    }

    /// Check if no entry was appended
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Encoded size of all entries, headers included
    pub fn bytes(&self) -> usize {
        self.payload
    }

    /// Memory held, counting every page at full size
    pub fn footprint(&self) -> usize {
        self.inline.capacity() + (self.pages.len() + self.index.len()) * self.page_size
    }

    /// True once entries have spilled out of the inline buffer
    pub fn is_spilled(&self) -> bool {
        !self.pages.is_empty()
    }

    /// Number of index levels above the data pages
    pub fn levels(&self) -> usize {
        self.spine.len()
    }

    /// Largest entry a page can hold
    pub fn max_entry(&self) -> usize {
        self.page_size - ENTRY_HEADER
    }

    fn fanout(&self) -> usize {
        (self.page_size / INDEX_SLOT).max(2)
    }

    /// Append one entry
    pub fn append(&mut self, entry: &[u8]) -> Result<()> {
        if entry.len() > self.max_entry() {
            return Err(Error::invalid(format!(
                "entry of {} bytes exceeds page capacity {}",
                entry.len(),
                self.max_entry()
            )));
        }
        let need = entry.len() + ENTRY_HEADER;
        if self.pages.is_empty() {
            if self.inline.len() + need <= self.page_size {
                self.grow_inline(need);
                push_entry(&mut self.inline, entry);
                self.inline_sorted = false;
                self.count += 1;
                self.payload += need;
                return Ok(());
            }
            self.spill();
        }
        if self.last_page_free() < need {
            self.seal_last();
            self.open_page();
        }
        let page = self.pages.last_mut().ok_or_else(|| Error::invalid("no open page"))?;
        push_entry(&mut page.bytes, entry);
        page.sorted = false;
        self.count += 1;
        self.payload += need;
        Ok(())
    }

    fn grow_inline(&mut self, need: usize) {
        let want = self.inline.len() + need;
        if want <= self.inline.capacity() {
            return;
        }
        let cap = (self.inline.capacity() * 2)
            .max(INITIAL_CAPACITY)
            .max(want)
            .min(self.page_size);
        self.inline.reserve_exact(cap - self.inline.len());
    }

    /// Move the inline buffer into the first data page
    fn spill(&mut self) {
        let mut bytes = Vec::with_capacity(self.page_size);
        bytes.extend_from_slice(&self.inline);
        self.inline = Vec::new();
        self.inline_sorted = true;
        self.pages.push(DataPage {
            bytes,
            sorted: false,
        });
        self.link(0);
        self.seal_last();
        self.open_page();
    }

    fn last_page_free(&self) -> usize {
        self.pages
            .last()
            .map(|p| self.page_size - p.bytes.len())
            .unwrap_or(0)
    }

    fn seal_last(&mut self) {
        let sorted = self.sorted;
        if let Some(page) = self.pages.last_mut() {
            if sorted && !page.sorted {
                sort_run(&mut page.bytes);
            }
            page.sorted = sorted;
        }
    }

    fn open_page(&mut self) {
        let id = self.pages.len() as u32;
        self.pages.push(DataPage {
            bytes: Vec::with_capacity(self.page_size),
            sorted: true,
        });
        self.link(id);
    }

    /// Hang `page` off the rightmost level-0 index page
    fn link(&mut self, page: u32) {
        let fanout = self.fanout();
        let mut child = page;
        let mut level = 0;
        loop {
            if level == self.spine.len() {
                let id = self.new_index(level as u8, vec![child]);
                self.spine.push(id);
                return;
            }
            let cur = self.spine[level];
            if self.index[cur as usize].children.len() < fanout {
                self.index[cur as usize].children.push(child);
                return;
            }
            let sibling = self.new_index(level as u8, vec![child]);
            self.spine[level] = sibling;
            if level + 1 == self.spine.len() {
                let top = self.new_index(level as u8 + 1, vec![cur, sibling]);
                self.spine.push(top);
                return;
            }
            child = sibling;
            level += 1;
        }
    }

    fn new_index(&mut self, level: u8, children: Vec<u32>) -> u32 {
        self.index.push(IndexPage { level, children });
        (self.index.len() - 1) as u32
    }

    /// Data page ids in order, found by walking the index from the top
    fn page_order(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.pages.len());
        let Some(&top) = self.spine.last() else {
            return out;
        };
        let mut stack = vec![top];
        while let Some(id) = stack.pop() {
            let page = &self.index[id as usize];
            if page.level == 0 {
                out.extend_from_slice(&page.children);
            } else {
                stack.extend(page.children.iter().rev());
            }
        }
        out
    }

    /// Sort whatever is not yet sorted, if the buffer is in sorted mode
    fn seal(&mut self) {
        if !self.sorted {
            return;
        }
        if !self.inline_sorted {
            sort_run(&mut self.inline);
            self.inline_sorted = true;
        }
        self.seal_last();
    }

    /// Replay every entry once
    pub fn cursor(&mut self) -> RefCursor<'_> {
        self.seal();
        let runs: Vec<&[u8]> = if self.pages.is_empty() {
            vec![self.inline.as_slice()]
        } else {
            self.page_order()
                .into_iter()
                .map(|id| self.pages[id as usize].bytes.as_slice())
                .filter(|b| !b.is_empty())
                .collect()
        };
        RefCursor::new(runs, self.sorted)
    }

    /// All entries in cursor order, as one gap-free encoded buffer
    ///
    /// Returns the buffer and the entry count. Decode it with
    /// [`EntryIter`].
    pub fn compact(&mut self) -> (Vec<u8>, usize) {
        let count = self.count;
        let mut out = Vec::with_capacity(self.payload);
        for entry in self.cursor() {
            push_entry(&mut out, entry);
        }
        (out, count)
    }

    /// Drop every entry and return to the inline layout
    pub fn clear(&mut self) {
        self.inline = Vec::new();
        self.inline_sorted = true;
        self.pages.clear();
        self.index.clear();
        self.spine.clear();
        self.count = 0;
        self.payload = 0;
    }
}

/// Iterator over a length-prefixed entry buffer
#[derive(Debug, Clone)]
pub struct EntryIter<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> EntryIter<'a> {
    /// Iterate entries of `bytes`
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }
}

impl<'a> Iterator for EntryIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.pos + ENTRY_HEADER > self.bytes.len() {
            return None;
        }
        let (entry, next) = entry_at(self.bytes, self.pos);
        self.pos = next;
        Some(entry)
    }
}

/// One pass over every entry of an [`ExternalRefBuffer`]
pub struct RefCursor<'a> {
    runs: Vec<&'a [u8]>,
    mode: CursorMode<'a>,
}

enum CursorMode<'a> {
    Sequential { run: usize, pos: usize },
    Merge(BinaryHeap<Reverse<(&'a [u8], usize, usize)>>),
}

impl<'a> RefCursor<'a> {
    fn new(runs: Vec<&'a [u8]>, sorted: bool) -> Self {
        let mode = if sorted && runs.len() > 1 {
            let mut heap = BinaryHeap::with_capacity(runs.len());
            for (i, run) in runs.iter().enumerate() {
                if !run.is_empty() {
                    let (entry, next) = entry_at(run, 0);
                    heap.push(Reverse((entry, i, next)));
                }
            }
            CursorMode::Merge(heap)
        } else {
            CursorMode::Sequential { run: 0, pos: 0 }
        };
        Self { runs, mode }
    }
}

impl<'a> Iterator for RefCursor<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        match &mut self.mode {
            CursorMode::Sequential { run, pos } => loop {
                let bytes = *self.runs.get(*run)?;
                if *pos + ENTRY_HEADER <= bytes.len() {
                    let (entry, next) = entry_at(bytes, *pos);
                    *pos = next;
                    return Some(entry);
                }
                *run += 1;
                *pos = 0;
            },
            CursorMode::Merge(heap) => {
                let Reverse((entry, run, next)) = heap.pop()?;
                let bytes = self.runs[run];
                if next + ENTRY_HEADER <= bytes.len() {
                    let (following, after) = entry_at(bytes, next);
                    heap.push(Reverse((following, run, after)));
                }
                Some(entry)
            }
        }
    }
}
