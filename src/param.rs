// Filesystem layout constants.

/// Size of a device sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Number of slots in the buffer cache.
pub const CACHE_SLOTS: usize = 64;

/// Sector number marking a cache slot that has never been bound.
pub const INVALID_SECTOR: u32 = u32::MAX;

/// Sector holding the free map's inode.
pub const FREE_MAP_SECTOR: u32 = 0;

/// Sector holding the root directory's inode.
pub const ROOT_DIR_SECTOR: u32 = 1;

/// Maximum length of a file name component.
pub const NAME_MAX: usize = 14;

/// Identifies an on-disk inode ("INOD").
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// Data sectors reachable through the inode's direct pointer.
pub const NDIRECT: usize = 1;
/// Sector pointers held by one indirect sector.
pub const NINDIRECT: usize = SECTOR_SIZE / core::mem::size_of::<u32>();
/// Data sectors reachable through the doubly-indirect pointer.
pub const NDBL_INDIRECT: usize = NINDIRECT * NINDIRECT;

/// Largest number of data sectors a single inode can map.
pub const MAX_SECTORS: usize = NDIRECT + NINDIRECT + NDBL_INDIRECT;

/// Largest representable file length in bytes.
pub const MAX_LENGTH: usize = MAX_SECTORS * SECTOR_SIZE;
