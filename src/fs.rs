//! Minimal in-memory file system backing executables and swap files.
//!
//! The paging core only needs a narrow slice of what a real file system
//! offers: refcounted inode handles, create/lookup/unlink on a flat path
//! namespace, byte-granular reads and writes that report short transfers,
//! and a `begin_op`/`end_op` transaction bracket. File contents live behind
//! a per-inode lock that is held for the whole of each transfer, mirroring
//! the inode-lock discipline of a disk file system.
//!
//! Unlinking a file only removes it from the namespace; the contents stay
//! reachable until the last handle drops. The per-process swap file relies
//! on this: it can be unlinked during teardown while I/O handles still exist.

use alloc::{collections::BTreeMap, string::String, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};

use lazy_static::lazy_static;
use spin::Mutex;

/// Errors of the file-system surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// The path is not absolute or is empty.
    BadPath,
    /// No file with this path exists.
    NotFound,
}

/// An in-memory inode.
#[derive(Debug, Default)]
pub struct Inode {
    data: Mutex<Vec<u8>>,
}

impl Inode {
    /// Size of the file in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.lock().len()
    }

    /// Read up to `buf.len()` bytes at `offset`.
    ///
    /// Returns the number of bytes transferred, which is short when the read
    /// crosses the end of the file. The inode lock is held for the whole
    /// transfer.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        let data = self.data.lock();
        if offset >= data.len() {
            return 0;
        }
        let len = core::cmp::min(buf.len(), data.len() - offset);
        buf[..len].copy_from_slice(&data[offset..offset + len]);
        len
    }

    /// Write `buf` at `offset`, growing the file (and zero-filling any gap)
    /// as needed.
    ///
    /// Returns the number of bytes transferred. The inode lock is held for
    /// the whole transfer.
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> usize {
        let Some(end) = offset.checked_add(buf.len()) else {
            return 0;
        };

        let mut data = self.data.lock();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        buf.len()
    }
}

lazy_static! {
    /// Flat namespace of the RAM file system.
    static ref ROOT_DIR: Mutex<BTreeMap<String, Arc<Inode>>> = Mutex::new(BTreeMap::new());
}

/// Number of open file-system transactions.
static OUTSTANDING_OPS: AtomicUsize = AtomicUsize::new(0);

/// Open a file-system transaction.
///
/// Namespace changes and page-granular file I/O happen inside a
/// `begin_op`/`end_op` bracket so a future disk-backed implementation can
/// batch them into one log transaction.
pub fn begin_op() {
    OUTSTANDING_OPS.fetch_add(1, Ordering::Acquire);
}

/// Close a transaction opened with [`begin_op`].
pub fn end_op() {
    let previous = OUTSTANDING_OPS.fetch_sub(1, Ordering::Release);
    debug_assert!(previous > 0, "end_op without a matching begin_op.");
}

/// Create a file at `path`, returning a handle to it.
///
/// Creating a path that already exists returns a handle to the existing
/// file, as a disk file system's `create` would.
///
/// # Errors
/// Fails with [`FsError::BadPath`] when the path is empty or not absolute.
pub fn create(path: &str) -> Result<Arc<Inode>, FsError> {
    if !path.starts_with('/') || path.len() < 2 {
        return Err(FsError::BadPath);
    }

    let mut dir = ROOT_DIR.lock();
    if let Some(inode) = dir.get(path) {
        return Ok(inode.clone());
    }

    let inode = Arc::new(Inode::default());
    dir.insert(String::from(path), inode.clone());
    Ok(inode)
}

/// Look up the file at `path`.
#[must_use]
pub fn lookup(path: &str) -> Option<Arc<Inode>> {
    ROOT_DIR.lock().get(path).cloned()
}

/// Remove `path` from the namespace.
///
/// Existing handles stay valid; the contents are freed when the last one
/// drops.
///
/// # Errors
/// Fails with [`FsError::NotFound`] when no such file exists.
pub fn unlink(path: &str) -> Result<(), FsError> {
    match ROOT_DIR.lock().remove(path) {
        Some(_) => Ok(()),
        None => Err(FsError::NotFound),
    }
}
