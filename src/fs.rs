// Filesystem facade.
//
// Thin composition over the cache, free map, inode and directory
// layers: path-based create/open/remove, mkdir/chdir/readdir, format
// and shutdown. All operations resolve paths relative to a Task's
// current working directory (or the root, for absolute paths and tasks
// without one).

use crate::block::BlockDevice;
use crate::cache::BufCache;
use crate::dir::{self, Dir};
use crate::error::FsError;
use crate::file::File;
use crate::freemap::FreeMap;
use crate::inode::{self, ITable, Inode};
use crate::param::{INODE_MAGIC, MAX_LENGTH, ROOT_DIR_SECTOR};
use crate::path::{resolve, split_path};
use log::info;
use std::sync::{Arc, Mutex};

/// Shared state behind every handle: the cache, the free map and the
/// open-inode registry over one block device.
pub(crate) struct FsInner {
    pub(crate) cache: BufCache,
    pub(crate) free_map: FreeMap,
    pub(crate) itable: ITable,
}

/// A mounted filesystem. Cloning is cheap and shares the same state.
#[derive(Clone)]
pub struct Filesystem {
    inner: Arc<FsInner>,
}

/// The per-task resolution origin for relative paths. The core mutates
/// it only through chdir.
pub struct Task {
    cwd: Mutex<Option<Dir>>,
}

impl Task {
    /// A task with no working directory; relative paths start at the
    /// root until the first chdir.
    pub fn new() -> Task {
        Task {
            cwd: Mutex::new(None),
        }
    }

    pub(crate) fn reopen_cwd(&self) -> Option<Dir> {
        self.cwd.lock().unwrap().as_ref().map(|d| d.reopen())
    }

    fn set_cwd(&self, dir: Dir) {
        *self.cwd.lock().unwrap() = Some(dir);
    }
}

impl Default for Task {
    fn default() -> Self {
        Task::new()
    }
}

/// What open_any() found at a path.
pub enum Handle {
    File(File),
    Dir(Dir),
}

impl Handle {
    pub fn is_dir(&self) -> bool {
        matches!(self, Handle::Dir(_))
    }

    /// The underlying inode sector, file or directory alike.
    pub fn inumber(&self) -> u32 {
        match self {
            Handle::File(f) => f.inumber(),
            Handle::Dir(d) => d.inumber(),
        }
    }
}

impl Filesystem {
    /// Mount the filesystem on `dev`, formatting it first when asked.
    pub fn new(dev: Arc<dyn BlockDevice>, format: bool) -> Result<Filesystem, FsError> {
        let sector_count = dev.sector_count();
        let fs = Filesystem {
            inner: Arc::new(FsInner {
                cache: BufCache::new(dev),
                free_map: FreeMap::new(sector_count),
                itable: ITable::new(),
            }),
        };
        if format {
            fs.format()?;
        } else {
            assert_eq!(
                inode::magic_of(&fs.inner, ROOT_DIR_SECTOR),
                INODE_MAGIC,
                "invalid file system"
            );
        }
        fs.inner.free_map.open(&fs.inner);
        Ok(fs)
    }

    /// Reinitialize the device: fresh free map, empty root directory.
    fn format(&self) -> Result<(), FsError> {
        info!("formatting file system");
        self.inner.free_map.create(&self.inner)?;
        dir::create(&self.inner, ROOT_DIR_SECTOR, ROOT_DIR_SECTOR)?;
        self.inner.free_map.close(&self.inner);
        Ok(())
    }

    /// Write all unwritten state (free map, dirty cache slots) to the
    /// device. Call before dropping the last reference.
    pub fn shutdown(&self) {
        self.inner.free_map.close(&self.inner);
        self.inner.cache.flush();
    }

    /// Create a file of `initial_size` bytes at `path`. The size is
    /// recorded immediately; data sectors appear lazily on write.
    pub fn create(&self, task: &Task, path: &str, initial_size: usize) -> Result<(), FsError> {
        if initial_size > MAX_LENGTH {
            return Err(FsError::TooLarge);
        }
        let (prefix, target) = split_path(path);
        let parent = resolve(&self.inner, task, prefix)?;
        let sector = self.inner.free_map.allocate(1).ok_or(FsError::NoSpace)?;
        let result = inode::create(&self.inner, sector, initial_size, false)
            .and_then(|()| parent.add(target, sector, false));
        if let Err(e) = result {
            inode::free(&self.inner, sector);
            self.inner.free_map.release(sector, 1);
            return Err(e);
        }
        Ok(())
    }

    /// Open the file at `path`.
    pub fn open(&self, task: &Task, path: &str) -> Result<File, FsError> {
        let (prefix, target) = split_path(path);
        let parent = resolve(&self.inner, task, prefix)?;
        let inode = parent.lookup(target).ok_or(FsError::NotFound)?;
        Ok(File::open(inode))
    }

    /// Open whatever `path` names, file or directory.
    pub fn open_any(&self, task: &Task, path: &str) -> Result<Handle, FsError> {
        let (prefix, target) = split_path(path);
        let parent = resolve(&self.inner, task, prefix)?;
        if target.is_empty() {
            // "/" (or a run of slashes): the resolved directory itself.
            if path.starts_with('/') {
                return Ok(Handle::Dir(parent));
            }
            return Err(FsError::NotFound);
        }
        let (entry, _) = parent.lookup_entry(target).ok_or(FsError::NotFound)?;
        let inode = Inode::open(&self.inner, entry.inode_sector);
        Ok(if entry.is_dir != 0 {
            Handle::Dir(Dir::new(inode))
        } else {
            Handle::File(File::open(inode))
        })
    }

    /// Remove the file or empty directory at `path`. The inode lives on
    /// until its last opener closes.
    pub fn remove(&self, task: &Task, path: &str) -> Result<(), FsError> {
        let (prefix, target) = split_path(path);
        let parent = resolve(&self.inner, task, prefix)?;
        parent.remove(target)
    }

    /// Create an empty directory at `path`.
    pub fn mkdir(&self, task: &Task, path: &str) -> Result<(), FsError> {
        if path.is_empty() {
            return Err(FsError::NotFound);
        }
        let (prefix, target) = split_path(path);
        let parent = resolve(&self.inner, task, prefix)?;
        let sector = self.inner.free_map.allocate(1).ok_or(FsError::NoSpace)?;
        let result = dir::create(&self.inner, sector, parent.inumber())
            .and_then(|()| parent.add(target, sector, true));
        if let Err(e) = result {
            inode::free(&self.inner, sector);
            self.inner.free_map.release(sector, 1);
            return Err(e);
        }
        Ok(())
    }

    /// Make `path` the task's working directory.
    pub fn chdir(&self, task: &Task, path: &str) -> Result<(), FsError> {
        if path.is_empty() {
            return Err(FsError::NotFound);
        }
        let dir = resolve(&self.inner, task, path)?;
        task.set_cwd(dir);
        Ok(())
    }

    /// Integer percentage of cache accesses served without device I/O.
    pub fn hit_rate(&self) -> u64 {
        self.inner.cache.hit_rate()
    }

    /// Sector writes issued to the device since mount or reset_stats().
    pub fn device_writes(&self) -> u64 {
        self.inner.cache.device_writes()
    }

    /// Flush, then zero the cache counters.
    pub fn reset_stats(&self) {
        self.inner.cache.reset_stats();
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<FsInner> {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemDisk;
    use crate::param::FREE_MAP_SECTOR;

    fn mounted() -> (Arc<MemDisk>, Filesystem, Task) {
        let disk = Arc::new(MemDisk::new(256));
        let fs = Filesystem::new(disk.clone(), true).unwrap();
        (disk, fs, Task::new())
    }

    #[test]
    fn create_open_write_read() {
        let (_disk, fs, task) = mounted();
        fs.create(&task, "/hello.txt", 0).unwrap();
        let mut f = fs.open(&task, "/hello.txt").unwrap();
        assert_eq!(f.write(b"hi there").unwrap(), 8);

        let mut g = fs.open(&task, "/hello.txt").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(g.read(&mut buf), 8);
        assert_eq!(&buf, b"hi there");
    }

    #[test]
    fn create_records_initial_size_without_data_sectors() {
        let (_disk, fs, task) = mounted();
        let free = fs.inner().free_map.free_sectors();
        fs.create(&task, "/sized", 4096).unwrap();
        // Inode sector plus the one eagerly allocated data sector.
        assert_eq!(fs.inner().free_map.free_sectors(), free - 2);

        let f = fs.open(&task, "/sized").unwrap();
        assert_eq!(f.len(), 4096);
        let mut buf = [1u8; 64];
        assert_eq!(f.read_at(&mut buf, 2000), 64);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn missing_paths_and_bad_components() {
        let (_disk, fs, task) = mounted();
        assert_eq!(fs.open(&task, "/nope").unwrap_err(), FsError::NotFound);
        assert_eq!(
            fs.open(&task, "/nope/deeper").unwrap_err(),
            FsError::NotFound
        );

        fs.create(&task, "/plain", 0).unwrap();
        assert_eq!(
            fs.open(&task, "/plain/child").unwrap_err(),
            FsError::NotADirectory
        );
        assert_eq!(
            fs.chdir(&task, "/plain").unwrap_err(),
            FsError::NotADirectory
        );
    }

    #[test]
    fn duplicate_create_fails_and_allocates_nothing() {
        let (_disk, fs, task) = mounted();
        fs.create(&task, "/dup", 0).unwrap();
        let free = fs.inner().free_map.free_sectors();
        assert_eq!(fs.create(&task, "/dup", 0), Err(FsError::AlreadyExists));
        assert_eq!(fs.inner().free_map.free_sectors(), free);
    }

    #[test]
    fn chdir_changes_the_resolution_origin() {
        let (_disk, fs, task) = mounted();
        fs.mkdir(&task, "/a").unwrap();
        fs.mkdir(&task, "/a/b").unwrap();
        fs.create(&task, "/a/b/f", 0).unwrap();

        fs.chdir(&task, "/a").unwrap();
        assert!(fs.open(&task, "b/f").is_ok());
        fs.chdir(&task, "b").unwrap();
        assert!(fs.open(&task, "f").is_ok());
        // Absolute paths ignore the cwd.
        assert!(fs.open(&task, "/a/b/f").is_ok());

        // A second task is unaffected.
        let other = Task::new();
        assert_eq!(fs.open(&other, "f").unwrap_err(), FsError::NotFound);
    }

    #[test]
    fn dot_and_dotdot_resolve_in_paths() {
        let (_disk, fs, task) = mounted();
        fs.mkdir(&task, "/a").unwrap();
        fs.create(&task, "/top", 0).unwrap();
        fs.chdir(&task, "/a").unwrap();
        assert!(fs.open(&task, "../top").is_ok());
        assert!(fs.open(&task, "./../top").is_ok());
    }

    #[test]
    fn open_any_distinguishes_files_and_directories() {
        let (_disk, fs, task) = mounted();
        fs.mkdir(&task, "/d").unwrap();
        fs.create(&task, "/f", 0).unwrap();

        let root = fs.open_any(&task, "/").unwrap();
        assert!(root.is_dir());
        assert_eq!(root.inumber(), ROOT_DIR_SECTOR);

        assert!(fs.open_any(&task, "/d").unwrap().is_dir());
        let f = fs.open_any(&task, "/f").unwrap();
        assert!(!f.is_dir());
        assert_ne!(f.inumber(), FREE_MAP_SECTOR);
        assert_ne!(f.inumber(), ROOT_DIR_SECTOR);
    }

    #[test]
    fn remove_then_recreate() {
        let (_disk, fs, task) = mounted();
        fs.create(&task, "/cycle", 0).unwrap();
        fs.remove(&task, "/cycle").unwrap();
        fs.create(&task, "/cycle", 0).unwrap();

        fs.mkdir(&task, "/dcycle").unwrap();
        fs.remove(&task, "/dcycle").unwrap();
        fs.mkdir(&task, "/dcycle").unwrap();
    }

    #[test]
    fn mkdir_failure_releases_the_inode_sector() {
        let (_disk, fs, task) = mounted();
        fs.mkdir(&task, "/d").unwrap();
        let free = fs.inner().free_map.free_sectors();
        assert_eq!(fs.mkdir(&task, "/d"), Err(FsError::AlreadyExists));
        assert_eq!(fs.inner().free_map.free_sectors(), free);
    }

    #[test]
    fn shutdown_persists_across_remount() {
        let (disk, fs, task) = mounted();
        fs.create(&task, "/keep", 0).unwrap();
        let mut f = fs.open(&task, "/keep").unwrap();
        f.write(b"durable bytes").unwrap();
        drop(f);
        fs.shutdown();
        drop(fs);

        let fs = Filesystem::new(disk, false).unwrap();
        let task = Task::new();
        let mut f = fs.open(&task, "/keep").unwrap();
        let mut buf = [0u8; 13];
        assert_eq!(f.read(&mut buf), 13);
        assert_eq!(&buf, b"durable bytes");
    }

    #[test]
    fn remount_free_map_stays_consistent() {
        let (disk, fs, task) = mounted();
        fs.create(&task, "/a", 0).unwrap();
        let free_before = fs.inner().free_map.free_sectors();
        fs.shutdown();
        drop(fs);

        let fs = Filesystem::new(disk, false).unwrap();
        assert_eq!(fs.inner().free_map.free_sectors(), free_before);

        // New allocations after remount do not collide with old data.
        let task = Task::new();
        fs.create(&task, "/b", 0).unwrap();
        let mut f = fs.open(&task, "/b").unwrap();
        f.write(b"fresh").unwrap();
        assert!(fs.open(&task, "/a").is_ok());
    }

    #[test]
    #[should_panic(expected = "invalid file system")]
    fn mounting_an_unformatted_device_panics() {
        let disk = Arc::new(MemDisk::new(64));
        let _ = Filesystem::new(disk, false);
    }
}
