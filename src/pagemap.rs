use crate::{*, error::*, os::*, procfs::*};
use std::{fs::{File, OpenOptions}, io::Write, os::unix::fs::FileExt};
use libc::pid_t;

// Bit 55 of a pagemap entry: set by the kernel on write, cleared in bulk via clear_refs.
const SOFT_DIRTY_BIT: u64 = 1 << 55;

// A page whose soft-dirty bit was set at scan time, remembered together with the
// region it was found under (the region locates its staging offset later).
pub struct DirtyPage {
    pub addr: usize,
    pub region: usize, // index into the scanned region list
}

pub struct DirtyScan {
    pub pages: Vec<DirtyPage>,
    pub total_pages: usize,
}

impl DirtyScan {
    pub fn ratio(&self) -> f64 {
        if self.total_pages == 0 {
            0.0
        } else {
            self.pages.len() as f64 / self.total_pages as f64
        }
    }
}

pub struct SoftDirtyTracker {
    pid: pid_t,
    buf: Vec<u8>, // reused across scans to avoid reallocating per region
}

impl SoftDirtyTracker {
    pub fn new(pid: pid_t) -> Self { SoftDirtyTracker {pid, buf: Vec::new()} }

    // Asks the kernel to clear the soft-dirty bit on every page-table entry of the
    // target: a single "4\n" write to clear_refs.
    pub fn reset(&self) -> Result<()> {
        let path = format!("/proc/{}/clear_refs", self.pid);
        let mut file = match OpenOptions::new().write(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return err!(TargetGone, "no process with pid {}", self.pid),
            Err(e) => return Err(Error::from_io_error(e, format!("failed to open {}", path))),
        };
        file.write_all(b"4\n").map_err(|e| Error::from_io_error(e, format!("failed to clear soft-dirty bits via {}", path)))?;
        Ok(())
    }

    // One pagemap read per region: N contiguous 8-byte entries starting at
    // (start/page_size)*8. Regions the kernel refuses to describe (vsyscall and
    // friends) contribute zero dirty pages; every region still counts toward the
    // ratio denominator.
    pub fn scan(&mut self, regions: &[Region]) -> Result<DirtyScan> {
        let path = format!("/proc/{}/pagemap", self.pid);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return err!(TargetGone, "no process with pid {}", self.pid),
            Err(e) => return Err(Error::from_io_error(e, format!("failed to open {}", path))),
        };

        let page_size = sysconf_PAGE_SIZE();
        let mut pages: Vec<DirtyPage> = Vec::new();
        let mut total_pages = 0usize;
        for (idx, region) in regions.iter().enumerate() {
            let n = region.page_count();
            total_pages += n;
            if n == 0 {
                continue;
            }
            let want = n * 8;
            self.buf.clear();
            self.buf.resize(want, 0);
            let entry_offset = (region.start / page_size * 8) as u64;
            match file.read_at(&mut self.buf[..want], entry_offset) {
                Ok(0) => continue,
                Ok(got) => collect_dirty(&self.buf[..got - got % 8], region.start, idx, page_size, &mut pages),
                Err(e) if e.raw_os_error() == Some(libc::ENOENT) => continue,
                Err(e) => return err!(PagemapRead, "failed to read pagemap entries for 0x{:x}-0x{:x}: {}", region.start, region.end, e),
            }
        }

        Ok(DirtyScan {pages, total_pages})
    }
}

fn collect_dirty(entries: &[u8], region_start: usize, region_idx: usize, page_size: usize, out: &mut Vec<DirtyPage>) {
    for (i, chunk) in entries.chunks_exact(8).enumerate() {
        let entry = u64::from_le_bytes(chunk.try_into().unwrap());
        if entry & SOFT_DIRTY_BIT != 0 {
            out.push(DirtyPage {addr: region_start + i * page_size, region: region_idx});
        }
    }
}
