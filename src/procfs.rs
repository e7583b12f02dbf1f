use crate::{*, error::*, os::*};
use std::{fs, collections::HashMap, str::FromStr};
use bitflags::*;
use libc::{pid_t, c_void};

bitflags! { pub struct RegionPerms: u8 {
        const READ = 0b00001;
        const WRITE = 0b00010;
        const EXECUTE = 0b00100;
        const SHARED = 0b01000;
        const PRIVATE = 0b10000;
}}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum RegionKind {
    Anonymous,
    File,
    Heap,
    Stack,
    Shared,
}

// A two-letter advisory flag from the VmFlags line of smaps, e.g. "dd" for MADV_DONTDUMP.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct VmFlag(pub [u8; 2]);

pub const VM_FLAG_DONT_DUMP: VmFlag = VmFlag(*b"dd");

// One entry of /proc/<pid>/maps. Never mutated after parsing; a re-scan produces a fresh list.
#[derive(Clone, Debug)]
pub struct Region {
    pub start: usize,
    pub end: usize,
    pub perms: RegionPerms,
    pub offset: u64,
    pub dev: u64,
    pub inode: u64,
    pub path: Option<String>,
    pub kind: RegionKind,
    pub vm_flags: Vec<VmFlag>,
    // No-access regions and the special kernel pseudo-mappings can't be read via
    // process_vm_readv; their load segments are written as sparse zeroes instead.
    pub zero_fill: bool,
}

// Which regions make it into the core. The defaults match what the offline
// heap-analysis consumer wants: file-backed private bytes included,
// MADV_DONTDUMP honored.
#[derive(Clone, Copy)]
pub struct DumpPolicy {
    pub include_file_maps: bool,
    pub only_anon: bool,
    pub respect_dontdump: bool,
}

impl Default for DumpPolicy {
    fn default() -> Self { Self {include_file_maps: true, only_anon: false, respect_dontdump: true} }
}

impl Region {
    pub fn len(&self) -> usize { self.end - self.start }

    pub fn page_count(&self) -> usize {
        let page_size = sysconf_PAGE_SIZE();
        (self.len() + page_size - 1) / page_size
    }

    pub fn dumpable(&self, policy: &DumpPolicy) -> bool {
        // A region with neither read nor write permission never has bytes worth keeping.
        if !self.perms.intersects(RegionPerms::READ | RegionPerms::WRITE) {
            return false;
        }
        if policy.only_anon && self.kind != RegionKind::Anonymous {
            return false;
        }
        // Shared mappings are file-backed too (shm files, MAP_SHARED of regular
        // files), so the file-maps switch covers both kinds.
        if !policy.include_file_maps && matches!(self.kind, RegionKind::File | RegionKind::Shared) {
            return false;
        }
        if policy.respect_dontdump && self.vm_flags.contains(&VM_FLAG_DONT_DUMP) {
            return false;
        }
        true
    }
}

// Reads /proc/<pid>/maps and attaches the VmFlags advisory vector from /proc/<pid>/smaps.
// The returned list is sorted by start address; ranges don't overlap.
pub fn read_region_list(pid: pid_t) -> Result<Vec<Region>> {
    let maps = read_proc_text(pid, "maps")?;
    let mut regions = parse_maps_text(&maps)?;
    if regions.is_empty() {
        return err!(TargetGone, "/proc/{}/maps is empty", pid);
    }

    let smaps = read_proc_text(pid, "smaps")?;
    let flags = parse_smaps_flags(&smaps);
    for r in &mut regions {
        // A region whose flag vector can't be located keeps an empty one.
        if let Some(f) = flags.get(&r.start) {
            r.vm_flags = f.clone();
        }
    }

    Ok(regions)
}

fn read_proc_text(pid: pid_t, name: &str) -> Result<String> {
    match fs::read_to_string(format!("/proc/{}/{}", pid, name)) {
        Ok(s) => Ok(s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => err!(TargetGone, "no process with pid {}", pid),
        Err(e) => Err(Error::from_io_error(e, format!("failed to read /proc/{}/{}", pid, name))),
    }
}

fn parse_maps_text(text: &str) -> Result<Vec<Region>> {
    let mut regions: Vec<Region> = Vec::new();
    for line in text.lines() {
        regions.push(parse_maps_line(line).map_err(|e| error!(MapParse, "bad maps line {:?}: {}", line, e))?);
    }
    regions.sort_by_key(|r| r.start);
    Ok(regions)
}

fn parse_maps_line(line: &str) -> Result<Region> {
    // The last field of the line is path. It can contain spaces (including trailing),
    // so we can't just use split_whitespace() over the whole line.
    let mut s = line.trim_start().splitn(2, ' ');
    let (range, rest) = (s.next(), s.next());
    if rest.is_none() { return err!(MapParse, "too few fields"); }

    let mut s = range.unwrap().splitn(2, '-');
    let (start, end) = (s.next(), s.next());
    if end.is_none() { return err!(MapParse, "bad address range"); }
    let start = usize::from_str_radix(start.unwrap(), 16)?;
    let end = usize::from_str_radix(end.unwrap(), 16)?;

    let mut s = rest.unwrap().trim_start().splitn(2, ' ');
    let (perms_str, rest) = (s.next(), s.next());
    if rest.is_none() { return err!(MapParse, "too few fields"); }
    let perms_str = perms_str.unwrap();
    let mut perms = RegionPerms::empty();
    for ch in perms_str.chars() {
        match ch {
            'r' => perms.insert(RegionPerms::READ),
            'w' => perms.insert(RegionPerms::WRITE),
            'x' => perms.insert(RegionPerms::EXECUTE),
            's' => perms.insert(RegionPerms::SHARED),
            'p' => perms.insert(RegionPerms::PRIVATE),
            _ => (),
        }
    }

    let mut s = rest.unwrap().trim_start().splitn(2, ' ');
    let (offset, rest) = (s.next(), s.next());
    if rest.is_none() { return err!(MapParse, "too few fields"); }
    let offset = u64::from_str_radix(offset.unwrap(), 16)?;

    let mut s = rest.unwrap().trim_start().splitn(2, ' ');
    let (dev, rest) = (s.next(), s.next());
    if rest.is_none() { return err!(MapParse, "too few fields"); }
    let mut d = dev.unwrap().splitn(2, ':');
    let (major, minor) = (d.next(), d.next());
    if minor.is_none() { return err!(MapParse, "bad device"); }
    let major = u64::from_str_radix(major.unwrap(), 16)?;
    let minor = u64::from_str_radix(minor.unwrap(), 16)?;

    let mut s = rest.unwrap().trim_start().splitn(2, ' ');
    let (inode, rest) = (s.next(), s.next());
    if inode.is_none() { return err!(MapParse, "too few fields"); }
    let inode = u64::from_str_radix(inode.unwrap(), 10)?;

    let path = match rest {
        None => None,
        Some(p) => {
            let p = p.trim_start();
            if p.is_empty() {None} else {Some(p.to_string())}
        }
    };

    let kind = match &path {
        None => RegionKind::Anonymous,
        Some(p) if p == "[heap]" => RegionKind::Heap,
        Some(p) if p == "[stack]" => RegionKind::Stack,
        Some(p) if p.starts_with('[') => RegionKind::Anonymous,
        Some(_) if perms.contains(RegionPerms::SHARED) => RegionKind::Shared,
        Some(_) => RegionKind::File,
    };
    let zero_fill = perms_str == "---p" || match &path {
        Some(p) => p == "[vvar]" || p == "[vvar_vclock]" || p == "[vdso]" || p == "[vsyscall]",
        None => false,
    };

    Ok(Region {start, end, perms, offset, dev: (major << 8) | minor, inode, path, kind, vm_flags: Vec::new(), zero_fill})
}

// Collects the VmFlags line of each smaps entry, keyed by the entry's start address.
// We only care about the flags, so every other property line is skipped.
fn parse_smaps_flags(text: &str) -> HashMap<usize, Vec<VmFlag>> {
    let mut res: HashMap<usize, Vec<VmFlag>> = HashMap::new();
    let mut current: Option<usize> = None;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("VmFlags:") {
            if let Some(start) = current {
                let flags = rest.split_whitespace().filter(|t| t.len() == 2)
                    .map(|t| VmFlag([t.as_bytes()[0], t.as_bytes()[1]])).collect();
                res.insert(start, flags);
            }
        } else if let Some((head, _)) = line.split_once('-') {
            if let Ok(start) = usize::from_str_radix(head, 16) {
                current = Some(start);
            }
        }
    }
    res
}

pub fn list_threads(pid: pid_t) -> Result<Vec<pid_t>> {
    let dir = match fs::read_dir(format!("/proc/{}/task/", pid)) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return err!(TargetGone, "no process with pid {}", pid),
        Err(e) => return Err(Error::from(e)),
    };
    let mut r: Vec<pid_t> = Vec::new();
    for entry in dir {
        let entry = entry?;
        if let Ok(tid) = pid_t::from_str(&entry.file_name().to_string_lossy()) {
            r.push(tid);
        }
    }
    if r.is_empty() {
        return err!(TargetGone, "process {} has no threads", pid);
    }
    r.sort();
    Ok(r)
}

pub fn read_auxv(pid: pid_t) -> Result<Vec<u8>> {
    let data = match fs::read(format!("/proc/{}/auxv", pid)) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return err!(TargetGone, "no process with pid {}", pid),
        Err(e) => return Err(Error::from(e)),
    };
    if data.is_empty() {
        return err!(TargetGone, "/proc/{}/auxv is empty", pid);
    }
    Ok(data)
}

// Reads target memory with process_vm_readv, one vectored call per request.
#[derive(Clone, Copy)]
pub struct PidMemReader {
    pid: pid_t,
}

impl PidMemReader {
    pub fn new(pid: pid_t) -> Self { PidMemReader {pid} }

    // Copies `len` bytes of target memory at `addr` into `dst` with a single call.
    // Ok(false) means the range is currently unreadable (guard pages, vsyscall and
    // friends) and the destination was left untouched; the caller relies on the
    // staging bytes there being zero (or a previous pass's copy).
    pub fn read_raw(&self, addr: usize, dst: *mut u8, len: usize) -> Result<bool> {
        unsafe {
            let local_iov = libc::iovec {iov_base: dst as *mut c_void, iov_len: len};
            let remote_iov = libc::iovec {iov_base: addr as *mut c_void, iov_len: len};
            let r = libc::process_vm_readv(self.pid, &local_iov as *const libc::iovec, 1, &remote_iov as *const libc::iovec, 1, 0);
            if r < 0 {
                let errno = *libc::__errno_location();
                if errno == libc::EFAULT || errno == libc::ENOENT {
                    return Ok(false);
                }
                return Err(error!(MemoryRead, "process_vm_readv(0x{:x}, {}) failed: {}", addr, len, std::io::Error::from_raw_os_error(errno)));
            }
            // A short read stops at the first unreadable page; the staged tail keeps
            // whatever was there before (zeroes on a fresh mapping).
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::procfs::*;

    #[test]
    fn maps_line_file_backed() {
        let r = parse_maps_line("7f5c8a9c2000-7f5c8a9c4000 r-xp 00001000 08:02 131203                     /usr/lib/libfoo.so.6").unwrap();
        assert_eq!(r.start, 0x7f5c8a9c2000);
        assert_eq!(r.end, 0x7f5c8a9c4000);
        assert_eq!(r.perms, RegionPerms::READ | RegionPerms::EXECUTE | RegionPerms::PRIVATE);
        assert_eq!(r.offset, 0x1000);
        assert_eq!(r.dev, (0x08 << 8) | 0x02);
        assert_eq!(r.inode, 131203);
        assert_eq!(r.path.as_deref(), Some("/usr/lib/libfoo.so.6"));
        assert_eq!(r.kind, RegionKind::File);
        assert!(!r.zero_fill);
        assert!(r.dumpable(&DumpPolicy::default()));
    }

    #[test]
    fn maps_line_path_with_spaces() {
        let r = parse_maps_line("10000-20000 rw-s 00000000 00:01 42 /tmp/my file (deleted)").unwrap();
        assert_eq!(r.path.as_deref(), Some("/tmp/my file (deleted)"));
        assert!(r.perms.contains(RegionPerms::SHARED));
        assert_eq!(r.kind, RegionKind::Shared);
    }

    #[test]
    fn maps_line_shared_kind() {
        // A shared file mapping gets the shared kind; private file mappings and
        // anonymous MAP_SHARED regions don't.
        let shm = parse_maps_line("10000-20000 rw-s 00000000 00:01 42 /dev/shm/cache").unwrap();
        assert_eq!(shm.kind, RegionKind::Shared);
        let private = parse_maps_line("30000-40000 r--p 00000000 08:02 99 /usr/lib/libc.so.6").unwrap();
        assert_eq!(private.kind, RegionKind::File);
        let anon = parse_maps_line("50000-60000 rw-s 00000000 00:00 0").unwrap();
        assert_eq!(anon.kind, RegionKind::Anonymous);
    }

    #[test]
    fn maps_line_anonymous_and_special() {
        let r = parse_maps_line("5646d3a00000-5646d3a21000 rw-p 00000000 00:00 0").unwrap();
        assert_eq!(r.path, None);
        assert_eq!(r.kind, RegionKind::Anonymous);

        let r = parse_maps_line("5646d5000000-5646d5021000 rw-p 00000000 00:00 0                          [heap]").unwrap();
        assert_eq!(r.kind, RegionKind::Heap);

        let r = parse_maps_line("7ffd1c000000-7ffd1c021000 rw-p 00000000 00:00 0                          [stack]").unwrap();
        assert_eq!(r.kind, RegionKind::Stack);

        let r = parse_maps_line("7ffd1c3bb000-7ffd1c3bd000 r-xp 00000000 00:00 0                          [vdso]").unwrap();
        assert_eq!(r.kind, RegionKind::Anonymous);
        assert!(r.zero_fill);
        assert!(r.dumpable(&DumpPolicy::default()));
    }

    #[test]
    fn maps_line_no_access() {
        let r = parse_maps_line("7f0000000000-7f0000001000 ---p 00000000 00:00 0").unwrap();
        assert!(r.zero_fill);
        assert!(!r.dumpable(&DumpPolicy::default()));
    }

    #[test]
    fn dump_policy() {
        let anon = parse_maps_line("10000-20000 rw-p 00000000 00:00 0").unwrap();
        let heap = parse_maps_line("30000-40000 rw-p 00000000 00:00 0 [heap]").unwrap();
        let file = parse_maps_line("50000-60000 r--p 00000000 08:02 99 /usr/lib/libc.so.6").unwrap();

        let default = DumpPolicy::default();
        assert!(anon.dumpable(&default) && heap.dumpable(&default) && file.dumpable(&default));

        let shared = parse_maps_line("90000-a0000 rw-s 00000000 00:01 7 /dev/shm/cache").unwrap();
        assert!(shared.dumpable(&default));

        let no_files = DumpPolicy {include_file_maps: false, ..Default::default()};
        assert!(anon.dumpable(&no_files) && heap.dumpable(&no_files));
        assert!(!file.dumpable(&no_files));
        assert!(!shared.dumpable(&no_files));

        let only_anon = DumpPolicy {only_anon: true, ..Default::default()};
        assert!(anon.dumpable(&only_anon));
        assert!(!heap.dumpable(&only_anon) && !file.dumpable(&only_anon) && !shared.dumpable(&only_anon));

        let mut marked = parse_maps_line("70000-80000 rw-p 00000000 00:00 0").unwrap();
        marked.vm_flags = vec![VM_FLAG_DONT_DUMP];
        assert!(!marked.dumpable(&default));
        let ignore_dd = DumpPolicy {respect_dontdump: false, ..Default::default()};
        assert!(marked.dumpable(&ignore_dd));
    }

    #[test]
    fn maps_text_is_sorted() {
        let text = "50000-60000 r--p 00000000 00:00 0\n\
                    10000-20000 rw-p 00000000 00:00 0\n\
                    30000-40000 rw-p 00000000 00:00 0 [heap]\n";
        let regions = parse_maps_text(text).unwrap();
        assert_eq!(regions.len(), 3);
        assert!(regions.windows(2).all(|w| w[0].end <= w[1].start));
        assert_eq!(regions[0].start, 0x10000);
    }

    #[test]
    fn maps_line_malformed() {
        assert!(parse_maps_line("garbage").is_err());
        assert!(parse_maps_line("zzzz-10000 rw-p 00000000 00:00 0").is_err());
        assert!(parse_maps_line("10000-20000 rw-p 00000000 00:00 notanumber").is_err());
    }

    #[test]
    fn smaps_flags() {
        let text = "10000-20000 rw-p 00000000 00:00 0\n\
                    Size:                 64 kB\n\
                    Rss:                  64 kB\n\
                    VmFlags: rd wr mr mw me ac sd\n\
                    20000-30000 rw-p 00000000 00:00 0\n\
                    Size:                 64 kB\n\
                    VmFlags: rd wr dd sd\n";
        let flags = parse_smaps_flags(text);
        assert_eq!(flags.len(), 2);
        assert!(!flags[&0x10000].contains(&VM_FLAG_DONT_DUMP));
        assert!(flags[&0x20000].contains(&VM_FLAG_DONT_DUMP));

        let mut r = parse_maps_line("20000-30000 rw-p 00000000 00:00 0").unwrap();
        r.vm_flags = flags[&0x20000].clone();
        assert!(!r.dumpable(&DumpPolicy::default()));
    }

    #[test]
    fn read_own_memory() {
        let buf: Vec<u8> = (0..8192).map(|i| (i % 251) as u8).collect();
        let mut out = vec![0u8; buf.len()];
        let reader = PidMemReader::new(unsafe {libc::getpid()});
        assert!(reader.read_raw(buf.as_ptr() as usize, out.as_mut_ptr(), out.len()).unwrap());
        assert_eq!(buf, out);
    }

    #[test]
    fn read_unmapped_memory() {
        let reader = PidMemReader::new(unsafe {libc::getpid()});
        let mut out = [0u8; 16];
        // Page 0 is never mapped.
        assert!(!reader.read_raw(0x1000, out.as_mut_ptr(), out.len()).unwrap());
    }
}
