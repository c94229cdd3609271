use crate::{Result, StorageError};
use std::cell::RefCell;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

pub type PageId = u32;

/// Shared handle to a pager. The engine is single-threaded by contract, so a
/// `Rc<RefCell<..>>` is the ownership shape: many trees and cursors over one
/// page store, with every borrow released between row deliveries.
pub type SharedPager = Rc<RefCell<Pager>>;

const MAGIC: &[u8; 8] = b"micadb\x00\x01";
pub(crate) const PAGE_SIZE: usize = 4096;

/// Fixed-size page store, held in memory and written back to its file on
/// [`Pager::flush`]. Page 0 is the file header and is never handed out by
/// the allocator.
pub struct Pager {
    path: Option<PathBuf>,
    pages: Vec<Vec<u8>>,
    free: Vec<PageId>,
}

impl Pager {
    /// Open a database file, or an ephemeral in-memory pager when `path` is
    /// `None`. An existing file is loaded whole; a fresh store starts with
    /// only the header page.
    pub fn open(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            if path.exists() {
                let mut buf = Vec::new();
                fs::File::open(path)?.read_to_end(&mut buf)?;
                return Self::from_image(Some(path.to_owned()), buf);
            }
        }
        let mut header = vec![0u8; PAGE_SIZE];
        header[..MAGIC.len()].copy_from_slice(MAGIC);
        Ok(Pager {
            path: path.map(Path::to_owned),
            pages: vec![header],
            free: Vec::new(),
        })
    }

    pub fn in_memory() -> Self {
        Self::open(None).expect("in-memory pager cannot fail")
    }

    fn from_image(path: Option<PathBuf>, buf: Vec<u8>) -> Result<Self> {
        if buf.len() < PAGE_SIZE || &buf[..MAGIC.len()] != MAGIC {
            return Err(StorageError::BadMagic);
        }
        if buf.len() % PAGE_SIZE != 0 {
            return Err(StorageError::Corrupt(format!(
                "file size {} is not a page multiple",
                buf.len()
            )));
        }
        let pages = buf.chunks(PAGE_SIZE).map(<[u8]>::to_vec).collect();
        Ok(Pager {
            path,
            pages,
            free: Vec::new(),
        })
    }

    pub fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }

    /// Hand out a zeroed page, reusing freed pages first.
    pub fn allocate(&mut self) -> PageId {
        if let Some(id) = self.free.pop() {
            self.pages[id as usize].fill(0);
            return id;
        }
        self.pages.push(vec![0u8; PAGE_SIZE]);
        let id = (self.pages.len() - 1) as PageId;
        log::trace!("pager: allocated page {id}");
        id
    }

    /// Return a page to the allocator. The freelist is in-memory only; pages
    /// freed in a session that is never flushed simply stay unused.
    pub fn free(&mut self, id: PageId) {
        debug_assert_ne!(id, 0, "header page is not allocatable");
        self.free.push(id);
    }

    pub fn read(&self, id: PageId) -> Result<&[u8]> {
        self.pages
            .get(id as usize)
            .map(Vec::as_slice)
            .ok_or(StorageError::PageOutOfBounds(id))
    }

    pub fn write(&mut self, id: PageId, data: &[u8]) -> Result<()> {
        debug_assert!(data.len() <= PAGE_SIZE);
        let page = self
            .pages
            .get_mut(id as usize)
            .ok_or(StorageError::PageOutOfBounds(id))?;
        page.fill(0);
        page[..data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Read a `u32` metadata slot from the header page. Slot 0 is reserved
    /// by the engine for the catalog tree's root page.
    pub fn meta_u32(&self, slot: usize) -> u32 {
        let at = MAGIC.len() + 4 * slot;
        u32::from_le_bytes(self.pages[0][at..at + 4].try_into().unwrap())
    }

    pub fn set_meta_u32(&mut self, slot: usize, value: u32) {
        let at = MAGIC.len() + 4 * slot;
        self.pages[0][at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Write the whole image back to the file, if this pager has one.
    pub fn flush(&mut self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut file = fs::File::create(path)?;
        for page in &self.pages {
            file.write_all(page)?;
        }
        file.sync_all()?;
        log::debug!("pager: flushed {} pages to {}", self.pages.len(), path.display());
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_reuse() {
        let mut pager = Pager::in_memory();
        let a = pager.allocate();
        let b = pager.allocate();
        assert_ne!(a, b);
        assert_ne!(a, 0);
        pager.free(a);
        assert_eq!(pager.allocate(), a);
    }

    #[test]
    fn write_read_roundtrip() {
        let mut pager = Pager::in_memory();
        let id = pager.allocate();
        pager.write(id, b"hello pages").unwrap();
        assert_eq!(&pager.read(id).unwrap()[..11], b"hello pages");
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.mica");
        let mut pager = Pager::open(Some(&path)).unwrap();
        let id = pager.allocate();
        pager.write(id, b"durable").unwrap();
        pager.close().unwrap();

        let reopened = Pager::open(Some(&path)).unwrap();
        assert_eq!(&reopened.read(id).unwrap()[..7], b"durable");
    }

    #[test]
    fn rejects_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk");
        fs::write(&path, vec![0xAB; PAGE_SIZE]).unwrap();
        assert!(matches!(
            Pager::open(Some(&path)),
            Err(StorageError::BadMagic)
        ));
    }
}
