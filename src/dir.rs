// Directories.
//
// A directory is an inode whose contents are a dense array of
// fixed-size entries. The first two slots are always "." (the
// directory itself) and ".." (its parent; the root's ".." is the root).
// A deleted entry keeps its slot with in_use cleared and may be reused
// by a later add.

use crate::error::FsError;
use crate::fs::FsInner;
use crate::inode::{self, Inode};
use crate::param::NAME_MAX;
use std::sync::Arc;
use zerocopy::{AsBytes, FromBytes};

/// A single on-disk directory entry.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub(crate) struct DirEntry {
    pub inode_sector: u32,
    pub name: [u8; NAME_MAX + 1], // NUL-terminated
    pub in_use: u8,
    pub is_dir: u8,
    pub pad: [u8; 3],
}

pub(crate) const ENTRY_SIZE: usize = core::mem::size_of::<DirEntry>();

impl DirEntry {
    fn empty() -> Self {
        DirEntry {
            inode_sector: 0,
            name: [0; NAME_MAX + 1],
            in_use: 0,
            is_dir: 0,
            pad: [0; 3],
        }
    }

    pub(crate) fn name(&self) -> &str {
        core::str::from_utf8(&self.name)
            .unwrap_or("")
            .trim_matches(char::from(0))
    }

    fn set_name(&mut self, name: &str) {
        debug_assert!(name.len() <= NAME_MAX);
        self.name = [0; NAME_MAX + 1];
        self.name[..name.len()].copy_from_slice(name.as_bytes());
    }
}

/// An open directory: its inode plus a readdir position.
pub struct Dir {
    inode: Inode,
    pos: usize,
}

impl Dir {
    pub(crate) fn new(inode: Inode) -> Dir {
        Dir { inode, pos: 0 }
    }

    pub(crate) fn open_root(fs: &Arc<FsInner>) -> Dir {
        Dir::new(Inode::open(fs, crate::param::ROOT_DIR_SECTOR))
    }

    /// Another handle on the same directory with a fresh position.
    pub fn reopen(&self) -> Dir {
        Dir::new(self.inode.reopen())
    }

    pub(crate) fn fs(&self) -> &Arc<FsInner> {
        self.inode.fs()
    }

    /// The directory's inode sector (its inumber).
    pub fn inumber(&self) -> u32 {
        self.inode.sector()
    }

    /// Scan for a live entry named `name`; also yields its byte offset.
    pub(crate) fn lookup_entry(&self, name: &str) -> Option<(DirEntry, usize)> {
        let mut raw = [0u8; ENTRY_SIZE];
        let mut ofs = 0;
        while self.inode.read_at(&mut raw, ofs) == ENTRY_SIZE {
            let entry = DirEntry::read_from(&raw[..]).unwrap();
            if entry.in_use != 0 && entry.name() == name {
                return Some((entry, ofs));
            }
            ofs += ENTRY_SIZE;
        }
        None
    }

    /// Open the inode a live entry points at.
    pub fn lookup(&self, name: &str) -> Option<Inode> {
        self.lookup_entry(name)
            .map(|(entry, _)| Inode::open(self.fs(), entry.inode_sector))
    }

    /// Add an entry binding `name` to `inode_sector`, reusing the first
    /// free slot or growing the directory by one entry.
    pub fn add(&self, name: &str, inode_sector: u32, is_dir: bool) -> Result<(), FsError> {
        if name.is_empty() {
            return Err(FsError::NotFound);
        }
        if name.len() > NAME_MAX {
            return Err(FsError::NameTooLong);
        }
        if self.lookup_entry(name).is_some() {
            return Err(FsError::AlreadyExists);
        }

        // First slot not in use, or end of file. A short read only
        // happens at end of file.
        let mut raw = [0u8; ENTRY_SIZE];
        let mut ofs = 0;
        while self.inode.read_at(&mut raw, ofs) == ENTRY_SIZE {
            let entry = DirEntry::read_from(&raw[..]).unwrap();
            if entry.in_use == 0 {
                break;
            }
            ofs += ENTRY_SIZE;
        }

        let mut entry = DirEntry::empty();
        entry.inode_sector = inode_sector;
        entry.set_name(name);
        entry.in_use = 1;
        entry.is_dir = is_dir as u8;
        if self.inode.write_at(entry.as_bytes(), ofs) != ENTRY_SIZE {
            return Err(FsError::NoSpace);
        }
        Ok(())
    }

    /// Remove the entry named `name` and mark its inode for deletion on
    /// last close. Directories must be empty and not open elsewhere.
    pub fn remove(&self, name: &str) -> Result<(), FsError> {
        if name == "." || name == ".." {
            return Err(FsError::Busy);
        }
        let (mut entry, ofs) = self.lookup_entry(name).ok_or(FsError::NotFound)?;

        // Open the victim first: with our own handle as the baseline,
        // is_open flags exactly the case where someone else holds it.
        let victim = Inode::open(self.fs(), entry.inode_sector);
        if victim.is_dir() {
            if self.fs().itable.is_open(entry.inode_sector) {
                return Err(FsError::Busy);
            }
            let dir = Dir::new(victim.reopen());
            if dir.entry_count() > 2 {
                return Err(FsError::NotEmpty);
            }
        }

        entry.in_use = 0;
        if self.inode.write_at(entry.as_bytes(), ofs) != ENTRY_SIZE {
            return Err(FsError::NoSpace);
        }
        victim.remove();
        Ok(())
    }

    /// Next entry name, skipping "." and ".." and free slots. None at
    /// end of directory.
    pub fn readdir(&mut self) -> Option<String> {
        let mut raw = [0u8; ENTRY_SIZE];
        while self.inode.read_at(&mut raw, self.pos + 2 * ENTRY_SIZE) == ENTRY_SIZE {
            self.pos += ENTRY_SIZE;
            let entry = DirEntry::read_from(&raw[..]).unwrap();
            if entry.in_use != 0 && entry.name() != "." && entry.name() != ".." {
                return Some(entry.name().to_string());
            }
        }
        None
    }

    /// Entries up to the first free slot, "." and ".." included.
    pub(crate) fn entry_count(&self) -> usize {
        let mut raw = [0u8; ENTRY_SIZE];
        let mut ofs = 0;
        let mut count = 0;
        while self.inode.read_at(&mut raw, ofs) == ENTRY_SIZE {
            let entry = DirEntry::read_from(&raw[..]).unwrap();
            if entry.in_use == 0 {
                break;
            }
            count += 1;
            ofs += ENTRY_SIZE;
        }
        count
    }
}

/// Create a directory inode at `sector` with its "." and ".." entries.
pub(crate) fn create(fs: &Arc<FsInner>, sector: u32, parent: u32) -> Result<(), FsError> {
    inode::create(fs, sector, 0, true)?;
    let dir = Dir::new(Inode::open(fs, sector));
    dir.add(".", sector, true)?;
    dir.add("..", parent, true)?;
    Ok(())
}
