use crate::{*, error::*, util::*};
use std::{fs::{File, OpenOptions}, collections::HashMap, ffi::CString, path::Path, slice, sync::Mutex, sync::atomic::{AtomicUsize, Ordering}, os::unix::io::{AsRawFd, FromRawFd}, os::unix::ffi::OsStrExt, os::linux::fs::MetadataExt};
use memmap2::MmapRaw;

// The staging file is sparse until written, so size it generously up front instead
// of tracking growth; holes are punched back out as the serializer drains it.
pub const STAGING_FILE_SIZE: usize = 512 << 30;

// Backing store for captured target bytes between capture and serialization: an
// unlinked temp file in the output's directory, mapped read-write shared. Region
// copies land in it through StagingSpan pointers with no intermediate user-space
// buffer, and the serializer later streams the same mapping out to the core file.
pub struct StagingBuffer {
    // Declared before `file`: the mapping must be released before the fd closes.
    map: MmapRaw,
    file: File,
    mapped_len: usize,
    align: usize, // filesystem block size, so punched holes actually free blocks
    alloc: Mutex<AllocTable>,
}

struct AllocTable {
    offsets: HashMap<(usize, usize), usize>, // (region start, region size) -> file offset
    cursor: usize,
}

// A bounded window into the staging mapping. Constructed only by
// StagingBuffer::span, which validates the range, so holding one is proof the
// pointer stays inside the mapping.
pub struct StagingSpan {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for StagingSpan {}
unsafe impl Sync for StagingSpan {}

impl StagingSpan {
    pub fn as_mut_ptr(&self) -> *mut u8 { self.ptr }
    pub fn len(&self) -> usize { self.len }

    // The mapping is shared and other spans may alias it; callers only read a span
    // after the writes that filled it completed (pass barriers, then the frozen
    // region list at serialization time).
    pub fn as_slice(&self) -> &[u8] {
        unsafe {slice::from_raw_parts(self.ptr, self.len)}
    }
}

impl StagingBuffer {
    pub fn new(output_path: &Path) -> Result<StagingBuffer> {
        Self::with_size(output_path, STAGING_FILE_SIZE)
    }

    pub fn with_size(output_path: &Path, size: usize) -> Result<StagingBuffer> {
        let dir = match output_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let file = open_unlinked_temp(dir)?;
        let align = match file.metadata() {
            Ok(m) => (m.st_blksize() as usize).max(1),
            Err(e) => return Err(Error::from_io_error(e, "failed to stat staging file".to_string())),
        };
        file.set_len(size as u64).map_err(|e| Error::from_io_error(e, format!("failed to size staging file to {}", PrettySize(size))))?;
        let map = MmapRaw::map_raw(&file).map_err(|e| Error::from_io_error(e, "failed to mmap staging file".to_string()))?;
        Ok(StagingBuffer {
            map,
            file,
            mapped_len: size,
            align,
            alloc: Mutex::new(AllocTable {offsets: HashMap::new(), cursor: 0}),
        })
    }

    pub fn block_align(&self) -> usize { self.align }

    // File offset staging the given (start, size) region: the previously assigned
    // one, or a fresh cursor bump rounded up to the block alignment. The cursor
    // only ever advances; entries are never moved.
    pub fn offset_for(&self, start: usize, size: usize) -> usize {
        let mut t = self.alloc.lock().unwrap();
        if let Some(&offset) = t.offsets.get(&(start, size)) {
            return offset;
        }
        let offset = (t.cursor + self.align - 1) / self.align * self.align;
        t.offsets.insert((start, size), offset);
        t.cursor = offset + size;
        offset
    }

    pub fn existing_offset_for(&self, start: usize, size: usize) -> Option<usize> {
        self.alloc.lock().unwrap().offsets.get(&(start, size)).copied()
    }

    pub fn span(&self, offset: usize, len: usize) -> Result<StagingSpan> {
        match offset.checked_add(len) {
            Some(end) if end <= self.mapped_len => (),
            _ => return err!(StagingOOB, "staging range 0x{:x}+0x{:x} is outside the mapped 0x{:x} bytes", offset, len, self.mapped_len),
        }
        Ok(StagingSpan {ptr: unsafe {self.map.as_mut_ptr().add(offset)}, len})
    }

    // Give the written-out blocks back to the filesystem. Best-effort: reclamation
    // failing never fails the dump.
    pub fn punch(&self, offset: usize, len: usize) {
        let r = unsafe {
            libc::fallocate(self.file.as_raw_fd(), libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE, offset as i64, len as i64)
        };
        if r != 0 {
            eprintln!("warning: failed to punch hole at 0x{:x}+0x{:x} in staging file: {}", offset, len, std::io::Error::last_os_error());
        }
    }
}

// An fd with no name: O_TMPFILE where the filesystem supports it, otherwise
// create-then-unlink. Lives in the same directory as the output core so the disk
// space accounting stays on one filesystem.
fn open_unlinked_temp(dir: &Path) -> Result<File> {
    let cdir = CString::new(dir.as_os_str().as_bytes()).map_err(|_| error!(Internal, "staging directory path contains a NUL byte"))?;
    let fd = unsafe {libc::open(cdir.as_ptr(), libc::O_TMPFILE | libc::O_RDWR | libc::O_CLOEXEC, 0o600)};
    if fd >= 0 {
        return Ok(unsafe {File::from_raw_fd(fd)});
    }

    static TEMP_SEQ: AtomicUsize = AtomicUsize::new(0);
    let path = dir.join(format!("livecore-staging-{}-{}.tmp", std::process::id(), TEMP_SEQ.fetch_add(1, Ordering::Relaxed)));
    let file = OpenOptions::new().read(true).write(true).create_new(true).open(&path)
        .map_err(|e| Error::from_io_error(e, format!("failed to create staging file {:?}", path)))?;
    let _ = std::fs::remove_file(&path);
    Ok(file)
}
