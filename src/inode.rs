// Inodes.
//
// An inode describes a single unnamed file. The on-disk structure
// occupies exactly one sector and maps file bytes to data sectors
// through one direct pointer, one single-indirect sector and one
// doubly-indirect sector; a zero pointer is a hole that has not been
// allocated yet. Files grow sparsely: extend() allocates the sector
// covering a byte offset on demand, zero-filling every new sector
// through the buffer cache before publishing its pointer, so a
// concurrent reader that observes the pointer never sees stale bytes.
//
// The crate keeps a registry of open inodes so that opening the same
// sector twice yields the same shared entry. The registry tracks the
// opener count, the deferred-removal flag and the deny-write count;
// the file's length is deliberately not cached in memory, every
// length() goes through the buffer cache so extensions made by one
// opener are immediately visible to the rest.
//
// A typical sequence is:
//   let ip = Inode::open(&fs, sector);
//   ... ip.read_at(...) / ip.write_at(...)
//   drop(ip);                  // close; last close of a removed inode
//                              // frees its sectors
//
// Lock order: registry lock, then a per-inode mutex, then the cache
// mutex, then the free-map mutex.

use crate::error::FsError;
use crate::fs::FsInner;
use crate::param::{INODE_MAGIC, MAX_LENGTH, MAX_SECTORS, NDIRECT, NINDIRECT, SECTOR_SIZE};
use log::{debug, warn};
use std::sync::{Arc, Mutex};
use zerocopy::{AsBytes, FromBytes};

/// On-disk inode. Must be exactly one sector.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub(crate) struct DiskInode {
    pub length: i32,
    pub magic: u32,
    pub unused: [u32; 122],
    pub is_dir: u32,
    pub direct: u32,
    pub indirect: u32,
    pub dbl_indirect: u32,
}

// Byte offsets of the fields read and written individually through the
// cache. Checked against the struct layout in the tests below.
const LENGTH_OFFSET: usize = 0;
const MAGIC_OFFSET: usize = 4;
const IS_DIR_OFFSET: usize = 496;
const DIRECT_OFFSET: usize = 500;
const INDIRECT_OFFSET: usize = 504;
const DBL_INDIRECT_OFFSET: usize = 508;

static ZEROS: [u8; SECTOR_SIZE] = [0; SECTOR_SIZE];

fn read_u32(fs: &FsInner, sector: u32, offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    fs.cache.read(sector, &mut raw, offset);
    u32::from_le_bytes(raw)
}

fn write_u32(fs: &FsInner, sector: u32, offset: usize, value: u32) {
    fs.cache.write(sector, &value.to_le_bytes(), offset);
}

/// Magic field of the inode at `sector`; used to sanity-check a mount.
pub(crate) fn magic_of(fs: &FsInner, sector: u32) -> u32 {
    read_u32(fs, sector, MAGIC_OFFSET)
}

/// Current length of the inode at `sector`, from disk via the cache.
pub(crate) fn length_of(fs: &FsInner, sector: u32) -> usize {
    let mut raw = [0u8; 4];
    fs.cache.read(sector, &mut raw, LENGTH_OFFSET);
    i32::from_le_bytes(raw).max(0) as usize
}

fn set_length(fs: &FsInner, sector: u32, length: usize) {
    fs.cache
        .write(sector, &(length as i32).to_le_bytes(), LENGTH_OFFSET);
}

/// Registry of open inodes, one entry per open sector.
pub(crate) struct ITable {
    open: Mutex<Vec<Arc<OpenInode>>>,
}

struct OpenInode {
    sector: u32,
    state: Mutex<InodeState>,
}

struct InodeState {
    open_cnt: u32,
    removed: bool,
    deny_write_cnt: u32,
}

impl ITable {
    pub(crate) fn new() -> Self {
        Self {
            open: Mutex::new(Vec::new()),
        }
    }

    /// True if `sector` is open by anyone beyond a single handle. The
    /// directory-removal path opens its victim first, so its own handle
    /// is the baseline and any other opener trips this.
    pub(crate) fn is_open(&self, sector: u32) -> bool {
        let open = self.open.lock().unwrap();
        open.iter()
            .find(|e| e.sector == sector)
            .map_or(false, |e| e.state.lock().unwrap().open_cnt > 1)
    }
}

/// A handle on an open inode. Dropping the handle closes it; the last
/// close of a removed inode frees its data sectors and its own sector.
pub struct Inode {
    fs: Arc<FsInner>,
    entry: Arc<OpenInode>,
}

impl Inode {
    /// Open the inode stored at `sector`, sharing the registry entry
    /// with any existing openers.
    pub(crate) fn open(fs: &Arc<FsInner>, sector: u32) -> Inode {
        let mut open = fs.itable.open.lock().unwrap();
        if let Some(entry) = open.iter().find(|e| e.sector == sector) {
            entry.state.lock().unwrap().open_cnt += 1;
            return Inode {
                fs: Arc::clone(fs),
                entry: Arc::clone(entry),
            };
        }
        let entry = Arc::new(OpenInode {
            sector,
            state: Mutex::new(InodeState {
                open_cnt: 1,
                removed: false,
                deny_write_cnt: 0,
            }),
        });
        open.push(Arc::clone(&entry));
        Inode {
            fs: Arc::clone(fs),
            entry,
        }
    }

    /// Another handle on the same inode.
    pub fn reopen(&self) -> Inode {
        self.entry.state.lock().unwrap().open_cnt += 1;
        Inode {
            fs: Arc::clone(&self.fs),
            entry: Arc::clone(&self.entry),
        }
    }

    pub(crate) fn fs(&self) -> &Arc<FsInner> {
        &self.fs
    }

    /// The inode's sector number, which doubles as its inumber.
    pub fn sector(&self) -> u32 {
        self.entry.sector
    }

    /// Byte length of the data, always read through the cache.
    pub fn length(&self) -> usize {
        length_of(&self.fs, self.entry.sector)
    }

    pub fn is_dir(&self) -> bool {
        read_u32(&self.fs, self.entry.sector, IS_DIR_OFFSET) != 0
    }

    /// Mark the inode for deletion once the last opener closes it.
    pub fn remove(&self) {
        self.entry.state.lock().unwrap().removed = true;
    }

    /// Refuse writes through any opener until allow_write(). May be
    /// called at most once per opener.
    pub fn deny_write(&self) {
        let mut st = self.entry.state.lock().unwrap();
        st.deny_write_cnt += 1;
        assert!(st.deny_write_cnt <= st.open_cnt);
    }

    pub fn allow_write(&self) {
        let mut st = self.entry.state.lock().unwrap();
        assert!(st.deny_write_cnt > 0);
        assert!(st.deny_write_cnt <= st.open_cnt);
        st.deny_write_cnt -= 1;
    }

    pub(crate) fn denies_writes(&self) -> bool {
        self.entry.state.lock().unwrap().deny_write_cnt > 0
    }

    /// Read up to `buf.len()` bytes starting at byte `offset`. Returns
    /// the number of bytes read, short at end of file.
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        let _ip = self.entry.state.lock().unwrap();
        let mut offset = offset;
        let mut read = 0;
        while read < buf.len() {
            let length = length_of(&self.fs, self.entry.sector);
            if offset >= length {
                break;
            }
            let sector = match extend(&self.fs, self.entry.sector, offset) {
                Some(s) => s,
                None => break,
            };
            let sector_ofs = offset % SECTOR_SIZE;
            let chunk = (buf.len() - read)
                .min(SECTOR_SIZE - sector_ofs)
                .min(length - offset);
            self.fs
                .cache
                .read(sector, &mut buf[read..read + chunk], sector_ofs);
            read += chunk;
            offset += chunk;
        }
        read
    }

    /// Write `buf` starting at byte `offset`, growing the file as
    /// needed. Returns the number of bytes written: 0 while writes are
    /// denied, short when the free map runs dry or the maximum extent
    /// is reached. A write that extends the file publishes the new
    /// length before the first byte is copied, so concurrent readers
    /// see the extension as soon as it is reachable.
    pub fn write_at(&self, buf: &[u8], offset: usize) -> usize {
        let ip = self.entry.state.lock().unwrap();
        if ip.deny_write_cnt > 0 {
            return 0;
        }
        if offset >= MAX_LENGTH {
            return 0;
        }
        let n = buf.len().min(MAX_LENGTH - offset);
        if n == 0 {
            return 0;
        }
        if offset + n > length_of(&self.fs, self.entry.sector) {
            set_length(&self.fs, self.entry.sector, offset + n);
        }
        let mut offset = offset;
        let mut written = 0;
        while written < n {
            let sector = match extend(&self.fs, self.entry.sector, offset) {
                Some(s) => s,
                None => break,
            };
            let sector_ofs = offset % SECTOR_SIZE;
            let length = length_of(&self.fs, self.entry.sector);
            let chunk = (n - written)
                .min(SECTOR_SIZE - sector_ofs)
                .min(length - offset);
            if chunk == 0 {
                break;
            }
            self.fs
                .cache
                .write(sector, &buf[written..written + chunk], sector_ofs);
            written += chunk;
            offset += chunk;
        }
        drop(ip);
        written
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        let mut open = self.fs.itable.open.lock().unwrap();
        let (last, removed) = {
            let mut st = self.entry.state.lock().unwrap();
            st.open_cnt -= 1;
            (st.open_cnt == 0, st.removed)
        };
        if last {
            open.retain(|e| !Arc::ptr_eq(e, &self.entry));
            drop(open);
            if removed {
                debug!("inode: freeing removed inode {}", self.entry.sector);
                free(&self.fs, self.entry.sector);
                self.fs.free_map.release(self.entry.sector, 1);
            }
        }
    }
}

/// Initialize a fresh inode at `sector` with the given length and
/// directory flag. The first data sector is allocated eagerly; further
/// sectors appear lazily on write. The caller owns `sector` itself.
pub(crate) fn create(
    fs: &Arc<FsInner>,
    sector: u32,
    length: usize,
    is_dir: bool,
) -> Result<(), FsError> {
    if length > MAX_LENGTH {
        return Err(FsError::TooLarge);
    }
    // The sector may have held arbitrary data in a previous life; the
    // full-sector write both installs the header and turns every
    // pointer field into a hole before extend() chases them.
    let header = DiskInode {
        length: (length as i32).to_le(),
        magic: INODE_MAGIC.to_le(),
        unused: [0; 122],
        is_dir: (is_dir as u32).to_le(),
        direct: 0,
        indirect: 0,
        dbl_indirect: 0,
    };
    fs.cache.write(sector, header.as_bytes(), 0);
    if extend(fs, sector, 0).is_none() {
        free(fs, sector);
        return Err(FsError::NoSpace);
    }
    Ok(())
}

/// Return the data sector holding byte `offset` of the inode at
/// `inode_sector`, allocating (and zero-filling) any missing sectors on
/// the way. None when the offset lies beyond the maximum extent or the
/// free map is exhausted.
pub(crate) fn extend(fs: &FsInner, inode_sector: u32, offset: usize) -> Option<u32> {
    let idx = offset / SECTOR_SIZE;
    if idx < NDIRECT {
        ensure(fs, inode_sector, DIRECT_OFFSET)
    } else if idx < NDIRECT + NINDIRECT {
        let indirect = ensure(fs, inode_sector, INDIRECT_OFFSET)?;
        ensure(fs, indirect, (idx - NDIRECT) * 4)
    } else if idx < MAX_SECTORS {
        let dbl = ensure(fs, inode_sector, DBL_INDIRECT_OFFSET)?;
        let slot = idx - NDIRECT - NINDIRECT;
        let indirect = ensure(fs, dbl, slot / NINDIRECT * 4)?;
        ensure(fs, indirect, slot % NINDIRECT * 4)
    } else {
        None
    }
}

/// Read the sector pointer at (`sector`, `offset`); if it is a hole,
/// allocate a sector, zero-fill it through the cache and only then
/// store the pointer, so the pointer is never observable before its
/// target is initialized.
fn ensure(fs: &FsInner, sector: u32, offset: usize) -> Option<u32> {
    let ptr = read_u32(fs, sector, offset);
    if ptr != 0 {
        return Some(ptr);
    }
    let fresh = match fs.free_map.allocate(1) {
        Some(s) => s,
        None => {
            warn!("inode: free map exhausted");
            return None;
        }
    };
    fs.cache.write(fresh, &ZEROS, 0);
    write_u32(fs, sector, offset, fresh);
    Some(fresh)
}

/// Release every data and indirect sector of the inode at
/// `inode_sector` back to the free map, zeroing each pointer as it
/// goes. The inode sector itself stays with the caller.
pub(crate) fn free(fs: &FsInner, inode_sector: u32) {
    let direct = read_u32(fs, inode_sector, DIRECT_OFFSET);
    if direct != 0 {
        fs.free_map.release(direct, 1);
    }
    write_u32(fs, inode_sector, DIRECT_OFFSET, 0);

    let indirect = read_u32(fs, inode_sector, INDIRECT_OFFSET);
    if indirect != 0 {
        release_indirect(fs, indirect);
        fs.free_map.release(indirect, 1);
    }
    write_u32(fs, inode_sector, INDIRECT_OFFSET, 0);

    let dbl = read_u32(fs, inode_sector, DBL_INDIRECT_OFFSET);
    if dbl != 0 {
        for i in 0..NINDIRECT {
            let indirect = read_u32(fs, dbl, i * 4);
            if indirect != 0 {
                release_indirect(fs, indirect);
                fs.free_map.release(indirect, 1);
            }
            write_u32(fs, dbl, i * 4, 0);
        }
        fs.free_map.release(dbl, 1);
    }
    write_u32(fs, inode_sector, DBL_INDIRECT_OFFSET, 0);
}

/// Release all data sectors listed in one indirect sector.
fn release_indirect(fs: &FsInner, indirect: u32) {
    for j in 0..NINDIRECT {
        let sector = read_u32(fs, indirect, j * 4);
        if sector != 0 {
            fs.free_map.release(sector, 1);
        }
        write_u32(fs, indirect, j * 4, 0);
    }
}
