// sectorfs: a small on-disk filesystem. Five layers:
//   - Block devices: synchronous 512-byte sector I/O (block.rs).
//   - Buffer cache: 64 sectors cached in memory, write-back, LRU
//     eviction (cache.rs).
//   - Free map: sector allocation bitmap, persisted as a file
//     (freemap.rs).
//   - Inodes: reading, writing, lazy multi-level block allocation
//     (inode.rs).
//   - Directories and names: directory entries over inodes, paths like
//     /usr/doc/design.txt resolved against a per-task cwd (dir.rs,
//     path.rs, fs.rs).
//
// The Filesystem facade in fs.rs ties the layers together; File in
// file.rs is the per-opener handle the facade hands out.

mod block;
mod cache;
mod dir;
mod error;
mod file;
mod freemap;
mod fs;
mod inode;
mod param;
mod path;

pub use block::{BlockDevice, FileDisk, MemDisk};
pub use dir::Dir;
pub use error::FsError;
pub use file::File;
pub use fs::{Filesystem, Handle, Task};
pub use inode::Inode;
pub use param::{MAX_LENGTH, NAME_MAX, ROOT_DIR_SECTOR, SECTOR_SIZE};
