use crate::{*, error::*, util::*, os::*, procfs::*, threads::*, staging::*};
use std::{fs, fs::File, mem, slice, str, path::Path, os::unix::fs::FileExt, time::Instant};
use libc::pid_t;

pub const EHDR_SIZE: usize = 64;
pub const PHDR_SIZE: usize = 56;

// Every note we emit carries the standard core-dump originator name.
pub const NOTE_NAME: &str = "CORE";

// Cap on a single write to the output file, to keep any one syscall bounded.
const WRITE_CHUNK: usize = 1 << 27;

pub struct Note {
    pub name: &'static str,
    pub type_: u32,
    pub data: Vec<u8>,
}

// One row of the NT_FILE table: a file-backed mapping of the target.
pub struct FileMapping {
    pub start: usize,
    pub end: usize,
    pub page_offset: u64, // file offset in pages
    pub path: Vec<u8>,
}

// The immutable input to the serializer. Regions come from the authoritative
// post-freeze re-scan; threads carry the register blocks read while frozen.
pub struct CoreDescription {
    pub pid: pid_t,
    pub threads: Vec<ThreadSnapshot>,
    pub regions: Vec<Region>,
    pub policy: DumpPolicy,
    pub notes: Vec<Note>,
    pub file_table: Vec<FileMapping>,
}

impl CoreDescription {
    pub fn new(pid: pid_t, threads: Vec<ThreadSnapshot>, regions: Vec<Region>, policy: DumpPolicy) -> Result<CoreDescription> {
        let file_table = build_file_table(&regions);
        let notes = build_notes(pid, &threads, &file_table)?;
        Ok(CoreDescription {pid, threads, regions, policy, notes, file_table})
    }
}

// File-backed mappings, in map order. Pseudo-maps like [vdso] are excluded the
// same way the kernel's own core dumper excludes them.
fn build_file_table(regions: &[Region]) -> Vec<FileMapping> {
    let mut table: Vec<FileMapping> = Vec::new();
    for r in regions {
        let path = match &r.path {
            Some(p) if !p.starts_with('[') => p,
            _ => continue,
        };
        table.push(FileMapping {
            start: r.start,
            end: r.end,
            page_offset: r.offset / sysconf_PAGE_SIZE() as u64,
            path: path.as_bytes().to_vec(),
        });
    }
    table
}

// Note order matches what readers expect from kernel cores: per-thread register
// notes first, then the process-wide ones.
pub fn build_notes(pid: pid_t, threads: &[ThreadSnapshot], file_table: &[FileMapping]) -> Result<Vec<Note>> {
    let mut notes: Vec<Note> = Vec::new();
    for t in threads {
        notes.push(prstatus_note(t));
    }
    for _ in threads {
        notes.push(Note {name: NOTE_NAME, type_: NT_PRFPREG, data: vec![0u8; FPREGSET_SIZE]});
    }
    for _ in threads {
        notes.push(Note {name: NOTE_NAME, type_: NT_X86_XSTATE, data: vec![0u8; XSTATE_PLACEHOLDER_SIZE]});
    }
    notes.push(prpsinfo_note(pid));
    notes.push(auxv_note(pid)?);
    if !file_table.is_empty() {
        notes.push(file_note(file_table));
    }
    Ok(notes)
}

fn prstatus_note(thread: &ThreadSnapshot) -> Note {
    // Fields other than the tid and registers are left zero; the downstream
    // heap-analysis consumer (and most debuggers) never look at them.
    let mut prstatus: elf_prstatus = unsafe {mem::zeroed()};
    prstatus.pr_pid = thread.tid;
    let n = thread.regs.len().min(GENERAL_REGS_SIZE);
    prstatus.pr_reg[..n].copy_from_slice(&thread.regs[..n]);
    let data = unsafe {slice::from_raw_parts(&prstatus as *const elf_prstatus as *const u8, mem::size_of::<elf_prstatus>())}.to_vec();
    Note {name: NOTE_NAME, type_: NT_PRSTATUS, data}
}

fn prpsinfo_note(pid: pid_t) -> Note {
    let mut info: elf_prpsinfo = unsafe {mem::zeroed()};
    info.pr_pid = pid;
    match fs::read(format!("/proc/{}/stat", pid)) {
        Ok(s) => {
            if let Err(e) = fill_prpsinfo_from_stat(&s, &mut info) {
                eprintln!("warning: failed to parse /proc/{}/stat: {}", pid, e);
                fill_fname_from_comm(pid, &mut info);
            }
        }
        Err(e) => {
            eprintln!("warning: failed to read /proc/{}/stat: {}", pid, e);
            fill_fname_from_comm(pid, &mut info);
        }
    }
    match fs::read(format!("/proc/{}/cmdline", pid)) {
        Ok(c) => fill_prpsinfo_args(&c, &mut info),
        Err(e) => eprintln!("warning: failed to read /proc/{}/cmdline: {}", pid, e),
    }
    let data = unsafe {slice::from_raw_parts(&info as *const elf_prpsinfo as *const u8, mem::size_of::<elf_prpsinfo>())}.to_vec();
    Note {name: NOTE_NAME, type_: NT_PRPSINFO, data}
}

// Pulls state, ppid, pgrp, sid, nice and the executable short-name out of the
// stat line. The comm field may itself contain parens and spaces, so anchor on
// the first '(' and the last ')'.
fn fill_prpsinfo_from_stat(s: &[u8], info: &mut elf_prpsinfo) -> Result<()> {
    let Some(name_start) = s.iter().position(|c| *c == b'(') else { return err!(Internal, "no '(' in stat"); };
    let Some(name_end) = s.iter().rposition(|c| *c == b')') else { return err!(Internal, "no ')' in stat"); };
    if name_end < name_start {
        return err!(Internal, "mismatched parens in stat");
    }
    for (i, tok) in str::from_utf8(&s[name_end+1..])?.split_whitespace().enumerate() {
        match i {
            0 => {
                let state = tok.as_bytes()[0];
                info.pr_state = state as i8;
                info.pr_sname = state as i8;
                info.pr_zomb = if state == b'Z' {1} else {0};
            }
            1 => info.pr_ppid = tok.parse::<pid_t>()?,
            2 => info.pr_pgrp = tok.parse::<pid_t>()?,
            3 => info.pr_sid = tok.parse::<pid_t>()?,
            6 => info.pr_flag = tok.parse::<u64>()?,
            16 => info.pr_nice = tok.parse::<i8>()?,
            _ => (),
        }
    }

    let name = &s[name_start+1..name_end];
    let name = &name[..name.len().min(15)];
    info.pr_fname[..name.len()].copy_from_slice(name);
    Ok(())
}

fn fill_fname_from_comm(pid: pid_t, info: &mut elf_prpsinfo) {
    if let Ok(comm) = fs::read(format!("/proc/{}/comm", pid)) {
        let comm = comm.strip_suffix(b"\n").unwrap_or(&comm);
        let n = comm.len().min(15);
        info.pr_fname[..n].copy_from_slice(&comm[..n]);
    }
}

// cmdline as the kernel stores it: NUL-separated argv. Joined with spaces,
// trailing whitespace dropped, truncated to the 79 bytes prpsinfo has room for.
fn fill_prpsinfo_args(cmdline: &[u8], info: &mut elf_prpsinfo) {
    let mut args: Vec<u8> = cmdline.iter().map(|c| if *c == 0 {b' '} else {*c}).collect();
    while args.last() == Some(&b' ') {
        args.pop();
    }
    args.truncate(info.pr_psargs.len() - 1);
    info.pr_psargs[..args.len()].copy_from_slice(&args);
}

fn auxv_note(pid: pid_t) -> Result<Note> {
    let data = normalize_auxv(read_auxv(pid)?)?;
    Ok(Note {name: NOTE_NAME, type_: NT_AUXV, data})
}

// The auxiliary vector is 16-byte (type, value) entries and must end with an
// all-zero AT_NULL entry; append one if the kernel's copy doesn't have it.
fn normalize_auxv(mut data: Vec<u8>) -> Result<Vec<u8>> {
    if data.len() % 16 != 0 {
        return err!(AuxvMalformed, "auxv length {} is not a multiple of 16", data.len());
    }
    if data.is_empty() || data[data.len()-16..].iter().any(|b| *b != 0) {
        data.extend_from_slice(&[0u8; 16]);
    }
    Ok(data)
}

// NT_FILE: (count, page_size), count (start, end, page offset) triples, then the
// NUL-terminated paths in the same order.
fn file_note(table: &[FileMapping]) -> Note {
    let mut buf: Vec<u8> = Vec::new();
    buf.write_usize(table.len()).unwrap();
    buf.write_usize(4096).unwrap();
    for entry in table {
        buf.write_usize(entry.start).unwrap();
        buf.write_usize(entry.end).unwrap();
        buf.write_u64(entry.page_offset).unwrap();
    }
    for entry in table {
        buf.extend_from_slice(&entry.path);
        buf.push(0);
    }
    Note {name: NOTE_NAME, type_: NT_FILE, data: buf}
}

fn pad4(n: usize) -> usize {
    (n + 3) & !3
}

pub fn note_size(note: &Note) -> usize {
    12 + pad4(note.name.len() + 1) + pad4(note.data.len())
}

pub struct ParsedNote<'a> {
    pub type_: u32,
    pub name: &'a [u8],
    pub desc: &'a [u8],
}

// Reads one note off the front of a serialized note segment, returning it and
// the remainder. The inverse of append_note; tests use it to check that a
// standard note walk recovers exactly what went in.
pub fn parse_note(data: &[u8]) -> Result<(ParsedNote, &[u8])> {
    if data.len() < 12 {
        return err!(Internal, "note segment truncated: {} bytes left", data.len());
    }
    let name_size = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
    let desc_size = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
    let type_ = u32::from_le_bytes(data[8..12].try_into().unwrap());
    let name_padded = pad4(name_size);
    let desc_padded = pad4(desc_size);
    if 12 + name_padded + desc_padded > data.len() {
        return err!(Internal, "note overruns its segment");
    }
    let name_field = &data[12..12 + name_size];
    let name = &name_field[..name_field.iter().position(|c| *c == 0).unwrap_or(name_field.len())];
    let desc = &data[12 + name_padded..12 + name_padded + desc_size];
    Ok((ParsedNote {type_, name, desc}, &data[12 + name_padded + desc_padded..]))
}

pub fn note_segment_size(notes: &[Note]) -> usize {
    notes.iter().map(note_size).sum()
}

// 12-byte header, then the NUL-terminated name and the payload, each padded to a
// 4-byte boundary. The header holds the padded sizes; the downstream core
// consumers read them that way, and readers that round the sizes up themselves
// land on the same offsets either way.
pub fn append_note(buf: &mut Vec<u8>, note: &Note) {
    let name_size = pad4(note.name.len() + 1);
    let data_size = pad4(note.data.len());
    buf.write_u32(name_size as u32).unwrap();
    buf.write_u32(data_size as u32).unwrap();
    buf.write_u32(note.type_).unwrap();
    buf.extend_from_slice(note.name.as_bytes());
    buf.resize(buf.len() + (name_size - note.name.len()), 0);
    buf.extend_from_slice(&note.data);
    buf.resize(buf.len() + (data_size - note.data.len()), 0);
}

pub struct CoreLayout {
    pub notes_offset: usize,
    pub segments: Vec<usize>, // file offset of each dumpable region, in order
    pub file_end: usize,
}

// Single-pass layout: program headers right after the ELF header, the note
// segment right after those, then every load segment back to back.
pub fn compute_layout(region_sizes: &[usize], notes_size: usize) -> CoreLayout {
    let notes_offset = EHDR_SIZE + (region_sizes.len() + 1) * PHDR_SIZE;
    let mut offset = notes_offset + notes_size;
    let mut segments = Vec::with_capacity(region_sizes.len());
    for &size in region_sizes {
        segments.push(offset);
        offset += size;
    }
    CoreLayout {notes_offset, segments, file_end: offset}
}

fn make_ehdr(phnum: usize) -> libc::Elf64_Ehdr {
    libc::Elf64_Ehdr {
        e_ident: [
            libc::ELFMAG0, libc::ELFMAG1, libc::ELFMAG2, libc::ELFMAG3,
            libc::ELFCLASS64, libc::ELFDATA2LSB, libc::EV_CURRENT as u8, libc::ELFOSABI_SYSV,
            0, 0, 0, 0, 0, 0, 0, 0],
        e_type: libc::ET_CORE,
        e_machine: libc::EM_X86_64,
        e_version: libc::EV_CURRENT,
        e_entry: 0,
        e_phoff: EHDR_SIZE as u64,
        e_shoff: 0,
        e_flags: 0,
        e_ehsize: EHDR_SIZE as u16,
        e_phentsize: PHDR_SIZE as u16,
        e_phnum: phnum as u16,
        e_shentsize: 0,
        e_shnum: 0,
        e_shstrndx: 0,
    }
}

fn make_note_phdr(offset: usize, size: usize) -> libc::Elf64_Phdr {
    libc::Elf64_Phdr {
        p_type: libc::PT_NOTE,
        p_flags: libc::PF_R,
        p_offset: offset as u64,
        p_vaddr: 0,
        p_paddr: 0,
        p_filesz: size as u64,
        p_memsz: size as u64,
        p_align: 0,
    }
}

fn make_load_phdr(region: &Region, offset: usize) -> libc::Elf64_Phdr {
    // PF_R is always set so the dumped bytes can be read back.
    let mut flags = libc::PF_R;
    if region.perms.contains(RegionPerms::WRITE) {
        flags |= libc::PF_W;
    }
    if region.perms.contains(RegionPerms::EXECUTE) {
        flags |= libc::PF_X;
    }
    libc::Elf64_Phdr {
        p_type: libc::PT_LOAD,
        p_flags: flags,
        p_offset: offset as u64,
        p_vaddr: region.start as u64,
        p_paddr: region.start as u64,
        p_filesz: region.len() as u64,
        p_memsz: region.len() as u64,
        p_align: 4096,
    }
}

// Serializes the core description to `path`. Runs after the target resumed; all
// memory bytes come out of the staging mapping, never from the target.
pub fn write_core(path: &Path, desc: &CoreDescription, staging: &StagingBuffer, verbose: bool) -> Result<()> {
    let start_time = Instant::now();
    let file = File::create(path).map_err(|e| Error::from_io_error(e, format!("failed to create core file {:?}", path)))?;

    let dumpable: Vec<&Region> = desc.regions.iter().filter(|r| r.dumpable(&desc.policy) && r.len() > 0).collect();
    if dumpable.len() + 1 > u16::MAX as usize {
        return err!(Sanity, "program header table can't hold {} segments", dumpable.len() + 1);
    }
    let notes_size = note_segment_size(&desc.notes);
    let sizes: Vec<usize> = dumpable.iter().map(|r| r.len()).collect();
    let layout = compute_layout(&sizes, notes_size);

    // ELF header, program headers and the note segment go out as one contiguous block.
    let mut buf: Vec<u8> = Vec::with_capacity(layout.notes_offset + notes_size);
    buf.write_struct(&make_ehdr(dumpable.len() + 1)).unwrap();
    buf.write_struct(&make_note_phdr(layout.notes_offset, notes_size)).unwrap();
    for (i, region) in dumpable.iter().enumerate() {
        buf.write_struct(&make_load_phdr(region, layout.segments[i])).unwrap();
    }
    assert!(buf.len() == layout.notes_offset);
    for note in &desc.notes {
        append_note(&mut buf, note);
    }
    assert!(buf.len() == layout.notes_offset + notes_size);
    file.write_all_at(&buf, 0).map_err(|e| Error::from_io_error(e, "failed to write core file headers".to_string()))?;

    let mut bytes_written = buf.len();
    for (i, region) in dumpable.iter().enumerate() {
        let seg_offset = layout.segments[i];
        let len = region.len();
        if region.zero_fill {
            // No bytes to transfer: extend the file past the segment instead, which
            // keeps it sparse. Segment offsets only grow, so this never truncates.
            file.set_len((seg_offset + len) as u64).map_err(|e| Error::from_io_error(e, "failed to extend core file over zero-fill region".to_string()))?;
            continue;
        }
        let staged = match staging.existing_offset_for(region.start, len) {
            Some(o) => o,
            None => return err!(UncopiedRegion, "dumpable region 0x{:x}-0x{:x} was never staged", region.start, region.end),
        };
        let span = staging.span(staged, len)?;
        let bytes = span.as_slice();
        let mut pos = 0usize;
        while pos < len {
            let chunk = (len - pos).min(WRITE_CHUNK);
            file.write_all_at(&bytes[pos..pos+chunk], (seg_offset + pos) as u64)
                .map_err(|e| Error::from_io_error(e, format!("failed to write region 0x{:x}-0x{:x} to core file", region.start, region.end)))?;
            pos += chunk;
        }
        bytes_written += len;
        staging.punch(staged, len);
    }

    if verbose {
        eprintln!("(wrote {} to {:?} in {:.3}s)", PrettySize(bytes_written), path, start_time.elapsed().as_secs_f64());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::{elfcore::*, precopy, procfs::*, staging::*, os::*};
    use std::mem;

    #[test]
    fn elf_struct_sizes() {
        assert_eq!(mem::size_of::<libc::Elf64_Ehdr>(), EHDR_SIZE);
        assert_eq!(mem::size_of::<libc::Elf64_Phdr>(), PHDR_SIZE);
    }

    #[test]
    fn note_padding() {
        let note = Note {name: NOTE_NAME, type_: NT_PRSTATUS, data: vec![1, 2, 3, 4, 5]};
        assert_eq!(note_size(&note), 12 + 8 + 8);
        let mut buf: Vec<u8> = Vec::new();
        append_note(&mut buf, &note);
        assert_eq!(buf.len(), note_size(&note));
        assert_eq!(&buf[0..4], &8u32.to_le_bytes());  // padded name size
        assert_eq!(&buf[4..8], &8u32.to_le_bytes());  // padded data size
        assert_eq!(&buf[8..12], &1u32.to_le_bytes()); // NT_PRSTATUS
        assert_eq!(&buf[12..20], b"CORE\0\0\0\0");
        assert_eq!(&buf[20..25], &[1, 2, 3, 4, 5]);
        assert_eq!(&buf[25..28], &[0, 0, 0]);
        assert!(note_size(&note) % 4 == 0);
    }

    #[test]
    fn prstatus_field_placement() {
        let t = crate::threads::ThreadSnapshot {tid: 0x1234, regs: (0..216).map(|i| (i % 200) as u8).collect()};
        let note = prstatus_note(&t);
        assert_eq!(note.data.len(), 336);
        assert_eq!(&note.data[32..36], &0x1234u32.to_le_bytes());
        assert_eq!(&note.data[112..328], &t.regs[..]);
        assert!(note.data[..32].iter().all(|b| *b == 0));
        assert!(note.data[328..].iter().all(|b| *b == 0));
    }

    #[test]
    fn prstatus_empty_registers_pad_to_zero() {
        let t = crate::threads::ThreadSnapshot {tid: 7, regs: Vec::new()};
        let note = prstatus_note(&t);
        assert_eq!(note.data.len(), 336);
        assert!(note.data[112..328].iter().all(|b| *b == 0));
    }

    #[test]
    fn prpsinfo_from_stat() {
        let mut info: elf_prpsinfo = unsafe {mem::zeroed()};
        let stat = b"4242 (test (prog)) S 1 77 88 0 -1 4194560 0 0 0 0 0 0 0 0 20 -5 1 0 100 200 300";
        fill_prpsinfo_from_stat(stat, &mut info).unwrap();
        assert_eq!(info.pr_state, b'S' as i8);
        assert_eq!(info.pr_sname, b'S' as i8);
        assert_eq!(info.pr_zomb, 0);
        assert_eq!(info.pr_ppid, 1);
        assert_eq!(info.pr_pgrp, 77);
        assert_eq!(info.pr_sid, 88);
        assert_eq!(info.pr_nice, -5);
        assert_eq!(info.pr_flag, 4194560);
        assert_eq!(&info.pr_fname[..11], b"test (prog)");
        assert!(info.pr_fname[11..].iter().all(|b| *b == 0));
    }

    #[test]
    fn prpsinfo_args() {
        let mut info: elf_prpsinfo = unsafe {mem::zeroed()};
        fill_prpsinfo_args(b"foo\0--bar\0baz\0\0", &mut info);
        assert_eq!(&info.pr_psargs[..13], b"foo --bar baz");
        assert!(info.pr_psargs[13..].iter().all(|b| *b == 0));

        let mut info: elf_prpsinfo = unsafe {mem::zeroed()};
        let long: Vec<u8> = vec![b'x'; 200];
        fill_prpsinfo_args(&long, &mut info);
        assert_eq!(&info.pr_psargs[..79], &long[..79]);
        assert_eq!(info.pr_psargs[79], 0);
    }

    #[test]
    fn auxv_termination() {
        // Already terminated: byte-for-byte.
        let mut v = vec![0u8; 32];
        v[0] = 6; v[8] = 0x10;
        assert_eq!(normalize_auxv(v.clone()).unwrap(), v);
        // Missing terminator: exactly one appended.
        let mut v = vec![0u8; 16];
        v[0] = 6; v[8] = 0x10;
        let n = normalize_auxv(v.clone()).unwrap();
        assert_eq!(n.len(), 32);
        assert_eq!(&n[..16], &v[..]);
        assert!(n[16..].iter().all(|b| *b == 0));
        // Empty: a lone AT_NULL.
        assert_eq!(normalize_auxv(Vec::new()).unwrap(), vec![0u8; 16]);
        // Odd length: malformed.
        assert!(normalize_auxv(vec![0u8; 24]).is_err());
    }

    #[test]
    fn file_note_encoding() {
        let table = vec![
            FileMapping {start: 0x1000, end: 0x3000, page_offset: 2, path: b"/lib/a.so".to_vec()},
            FileMapping {start: 0x8000, end: 0x9000, page_offset: 0, path: b"/bin/b".to_vec()},
        ];
        let note = file_note(&table);
        let d = &note.data;
        assert_eq!(&d[0..8], &2u64.to_le_bytes());
        assert_eq!(&d[8..16], &4096u64.to_le_bytes());
        assert_eq!(&d[16..24], &0x1000u64.to_le_bytes());
        assert_eq!(&d[24..32], &0x3000u64.to_le_bytes());
        assert_eq!(&d[32..40], &2u64.to_le_bytes());
        assert_eq!(&d[64..74], b"/lib/a.so\0");
        assert_eq!(&d[74..81], b"/bin/b\0");
    }

    #[test]
    fn layout_offsets() {
        let layout = compute_layout(&[0x2000, 0x1000], 100);
        assert_eq!(layout.notes_offset, 64 + 3 * 56);
        assert_eq!(layout.segments, vec![64 + 3*56 + 100, 64 + 3*56 + 100 + 0x2000]);
        assert_eq!(layout.file_end, 64 + 3*56 + 100 + 0x3000);

        let empty = compute_layout(&[], 0);
        assert_eq!(empty.notes_offset, 64 + 56);
        assert_eq!(empty.file_end, empty.notes_offset);
    }

    // End to end against our own process: stage a buffer of known bytes, serialize
    // a core describing it, then walk the resulting file with an independent
    // reading of the format.
    #[test]
    fn write_core_roundtrip() {
        precalc_globals_os();
        let dir = std::env::temp_dir();
        let out = dir.join("livecore-elfcore-test.core");
        let staging = StagingBuffer::with_size(&out, 1 << 22).unwrap();

        let payload: Vec<u8> = (0..8192).map(|i| (i * 7 % 251) as u8).collect();
        let region = Region {
            start: payload.as_ptr() as usize,
            end: payload.as_ptr() as usize + payload.len(),
            perms: RegionPerms::READ | RegionPerms::WRITE | RegionPerms::PRIVATE,
            offset: 0, dev: 0, inode: 0, path: None,
            kind: RegionKind::Anonymous, vm_flags: Vec::new(), zero_fill: false,
        };
        let reader = PidMemReader::new(my_pid());
        precopy::copy_region(&reader, &staging, &region, false).unwrap();

        let thread = crate::threads::ThreadSnapshot {tid: my_pid(), regs: vec![0xab; 216]};
        let desc = CoreDescription::new(my_pid(), vec![thread], vec![region.clone()], DumpPolicy::default()).unwrap();
        write_core(&out, &desc, &staging, false).unwrap();

        let bytes = std::fs::read(&out).unwrap();
        std::fs::remove_file(&out).unwrap();

        // ELF header.
        assert_eq!(&bytes[0..4], b"\x7fELF");
        assert_eq!(bytes[4], 2); // 64-bit
        assert_eq!(bytes[5], 1); // little-endian
        let u16_at = |o: usize| u16::from_le_bytes(bytes[o..o+2].try_into().unwrap());
        let u32_at = |o: usize| u32::from_le_bytes(bytes[o..o+4].try_into().unwrap());
        let u64_at = |o: usize| u64::from_le_bytes(bytes[o..o+8].try_into().unwrap());
        assert_eq!(u16_at(16), 4);  // ET_CORE
        assert_eq!(u16_at(18), 62); // EM_X86_64
        assert_eq!(u64_at(32), 64); // e_phoff
        assert_eq!(u16_at(54), 56); // e_phentsize
        assert_eq!(u16_at(56), 2);  // PT_NOTE + one PT_LOAD

        // PT_NOTE header.
        assert_eq!(u32_at(64), 4); // PT_NOTE
        let notes_off = u64_at(64 + 8) as usize;
        let notes_size = u64_at(64 + 32) as usize;
        assert_eq!(notes_off, 64 + 2 * 56);

        // PT_LOAD header.
        let ph = 64 + 56;
        assert_eq!(u32_at(ph), 1); // PT_LOAD
        assert_eq!(u32_at(ph + 4), 4 | 2); // PF_R | PF_W
        let seg_off = u64_at(ph + 8) as usize;
        assert_eq!(u64_at(ph + 16) as usize, region.start);
        assert_eq!(u64_at(ph + 24) as usize, region.start);
        assert_eq!(u64_at(ph + 32) as usize, region.len());
        assert_eq!(u64_at(ph + 40) as usize, region.len());
        assert_eq!(seg_off, notes_off + notes_size);

        // Walk the note segment back with the note reader.
        let mut rest = &bytes[notes_off..notes_off + notes_size];
        let mut types: Vec<u32> = Vec::new();
        while !rest.is_empty() {
            let (note, tail) = parse_note(rest).unwrap();
            assert_eq!(note.name, b"CORE");
            if note.type_ == NT_PRSTATUS {
                assert_eq!(&note.desc[32..36], &(my_pid() as u32).to_le_bytes());
                assert!(note.desc[112..328].iter().all(|b| *b == 0xab));
            }
            types.push(note.type_);
            rest = tail;
        }
        assert_eq!(types, vec![NT_PRSTATUS, NT_PRFPREG, NT_X86_XSTATE, NT_PRPSINFO, NT_AUXV]);

        // The load segment carries the payload bytes.
        assert_eq!(&bytes[seg_off..seg_off + payload.len()], &payload[..]);
        assert_eq!(bytes.len(), seg_off + payload.len());
    }

    #[test]
    fn uncopied_region_is_an_error() {
        precalc_globals_os();
        let dir = std::env::temp_dir();
        let out = dir.join("livecore-elfcore-test2.core");
        let staging = StagingBuffer::with_size(&out, 1 << 20).unwrap();
        let region = Region {
            start: 0x10000, end: 0x11000,
            perms: RegionPerms::READ | RegionPerms::PRIVATE,
            offset: 0, dev: 0, inode: 0, path: None,
            kind: RegionKind::Anonymous, vm_flags: Vec::new(), zero_fill: false,
        };
        let desc = CoreDescription {
            pid: 1, threads: Vec::new(), regions: vec![region], policy: DumpPolicy::default(),
            notes: Vec::new(), file_table: Vec::new(),
        };
        let r = write_core(&out, &desc, &staging, false);
        let _ = std::fs::remove_file(&out);
        assert!(r.is_err());
    }

    #[test]
    fn zero_fill_region_is_sparse() {
        precalc_globals_os();
        let dir = std::env::temp_dir();
        let out = dir.join("livecore-elfcore-test3.core");
        let staging = StagingBuffer::with_size(&out, 1 << 20).unwrap();
        let region = Region {
            start: 0x20000, end: 0x22000,
            perms: RegionPerms::READ | RegionPerms::PRIVATE,
            offset: 0, dev: 0, inode: 0, path: Some("[vvar]".to_string()),
            kind: RegionKind::Anonymous, vm_flags: Vec::new(), zero_fill: true,
        };
        let desc = CoreDescription {
            pid: 1, threads: Vec::new(), regions: vec![region.clone()], policy: DumpPolicy::default(),
            notes: Vec::new(), file_table: Vec::new(),
        };
        write_core(&out, &desc, &staging, false).unwrap();
        let bytes = std::fs::read(&out).unwrap();
        std::fs::remove_file(&out).unwrap();
        // filesz == memsz == region size, file extends over it, bytes all zero.
        let ph = 64 + 56;
        let seg_off = u64::from_le_bytes(bytes[ph+8..ph+16].try_into().unwrap()) as usize;
        assert_eq!(u64::from_le_bytes(bytes[ph+32..ph+40].try_into().unwrap()) as usize, region.len());
        assert_eq!(bytes.len(), seg_off + region.len());
        assert!(bytes[seg_off..].iter().all(|b| *b == 0));
    }
}
