use libc::pid_t;
use std::sync::atomic::{AtomicUsize, Ordering};

// Linux api stuff.
//  * Some sysconf values cached at startup.
//  * Some constants and structs that are not in libc rust crate, or have pointless
//    minor differences between musl and glibc versions of the "libc" rust crate.

static SYSCONF_PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);
static SYSCONF_NPROCESSORS_ONLN: AtomicUsize = AtomicUsize::new(0);
static MY_PID: AtomicUsize = AtomicUsize::new(0);

#[allow(non_snake_case)]
pub fn sysconf_PAGE_SIZE() -> usize {
    let r = SYSCONF_PAGE_SIZE.load(Ordering::Relaxed);
    debug_assert!(r != 0);
    r
}
#[allow(non_snake_case)]
pub fn sysconf_NPROCESSORS_ONLN() -> usize {
    let r = SYSCONF_NPROCESSORS_ONLN.load(Ordering::Relaxed);
    debug_assert!(r != 0);
    r
}

pub fn my_pid() -> pid_t {
    MY_PID.load(Ordering::Relaxed) as pid_t
}

pub fn precalc_globals_os() {
    let assert_nonzero = |x: usize| -> usize {
        assert!(x != 0);
        x
    };

    SYSCONF_PAGE_SIZE.store(assert_nonzero(unsafe {libc::sysconf(libc::_SC_PAGE_SIZE)} as usize), Ordering::Relaxed);
    SYSCONF_NPROCESSORS_ONLN.store(assert_nonzero(unsafe {libc::sysconf(libc::_SC_NPROCESSORS_ONLN)} as usize), Ordering::Relaxed);
    MY_PID.store(assert_nonzero(unsafe {libc::getpid()} as usize), Ordering::Relaxed);
}

// These are used in core dumps.
pub const NT_PRSTATUS: u32 = 1;
pub const NT_PRFPREG: u32 = 2;
pub const NT_PRPSINFO: u32 = 3;
pub const NT_AUXV: u32 = 6;
pub const NT_FILE: u32 = 0x46494c45;
pub const NT_X86_XSTATE: u32 = 0x202;

// Size of the x86-64 general-purpose register block (elf_gregset_t): 27 values, 8 bytes each.
pub const GENERAL_REGS_SIZE: usize = 216;
// Placeholder note bodies; the downstream heap-analysis consumer ignores both.
pub const FPREGSET_SIZE: usize = 512;
pub const XSTATE_PLACEHOLDER_SIZE: usize = 1024;

pub const PTRACE_CONT: i32 = 7;
pub const PTRACE_GETREGS: i32 = 12;
pub const PTRACE_DETACH: i32 = 17;
pub const PTRACE_SEIZE: i32 = 0x4206;
pub const PTRACE_INTERRUPT: i32 = 0x4207;

pub const PTRACE_EVENT_STOP: i32 = 128;

pub fn ptrace_request_name(c: i32) -> &'static str {
    match c {
        PTRACE_CONT => "PTRACE_CONT", PTRACE_GETREGS => "PTRACE_GETREGS", PTRACE_DETACH => "PTRACE_DETACH", PTRACE_SEIZE => "PTRACE_SEIZE", PTRACE_INTERRUPT => "PTRACE_INTERRUPT",
        _ => "[unknown request]",
    }
}

// Uuuugh.
const SIGNAL_NAMES: [&str; 32] = ["[unknown signal number]", "SIGHUP", "SIGINT", "SIGQUIT", "SIGILL", "SIGTRAP", "SIGABRT", "SIGBUS", "SIGFPE", "SIGKILL", "SIGUSR1", "SIGSEGV", "SIGUSR2", "SIGPIPE", "SIGALRM", "SIGTERM", "SIGSTKFLT", "SIGCHLD", "SIGCONT", "SIGSTOP", "SIGTSTP", "SIGTTIN", "SIGTTOU", "SIGURG", "SIGXCPU", "SIGXFSZ", "SIGVTALRM", "SIGPROF", "SIGWINCH", "SIGIO", "SIGPWR", "SIGSYS"];

pub fn signal_name(sig: i32) -> &'static str {
    // strsignal() is not thread safe, and sigabbrev_np() is not in rust libc bindings.
    let sig = sig as usize;
    SIGNAL_NAMES[if sig >= SIGNAL_NAMES.len() {0} else {sig}]
}

// Structs found in core dump notes.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct elf_prstatus {
    pub si_signo: i32, // signal number
    pub si_code: i32,  // extra code
    pub si_errno: i32, // errno

    pub pr_cursig: i16, // Current signal
    pub pr_sigpend: usize, // Set of pending signals
    pub pr_sighold: usize, // Set of held signals
    pub pr_pid: pid_t,
    pub pr_ppid: pid_t,
    pub pr_pgrp: pid_t,
    pub pr_sid: pid_t,
    pub pr_utime: libc::timeval, // User time
    pub pr_stime: libc::timeval, // System time
    pub pr_cutime: libc::timeval, // Cumulative user time
    pub pr_cstime: libc::timeval, // Cumulative system time
    pub pr_reg: [u8; GENERAL_REGS_SIZE], // GP registers, already serialized
    pub pr_fpvalid: i32, // True if math co-processor being used.
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct elf_prpsinfo {
    pub pr_state: i8, // numeric process state
    pub pr_sname: i8, // char for pr_state
    pub pr_zomb: i8, // zombie
    pub pr_nice: i8, // nice val
    pub pr_flag: u64, // flags
    pub pr_uid: u32,
    pub pr_gid: u32,
    pub pr_pid: pid_t,
    pub pr_ppid: pid_t,
    pub pr_pgrp: pid_t,
    pub pr_sid: pid_t,
    pub pr_fname: [u8; 16], // filename of executable
    pub pr_psargs: [u8; 80], // initial part of arg list
}

#[cfg(test)]
mod tests {
    use crate::os::*;
    use std::mem;

    #[test]
    fn core_note_struct_sizes() {
        // These layouts are kernel ABI; the serializer depends on the exact offsets.
        assert_eq!(mem::size_of::<elf_prstatus>(), 336);
        assert_eq!(mem::size_of::<elf_prpsinfo>(), 136);

        let z: elf_prstatus = unsafe {mem::zeroed()};
        let base = &z as *const _ as usize;
        assert_eq!(&z.pr_pid as *const _ as usize - base, 32);
        assert_eq!(&z.pr_reg as *const _ as usize - base, 112);
        assert_eq!(&z.pr_fpvalid as *const _ as usize - base, 328);

        let p: elf_prpsinfo = unsafe {mem::zeroed()};
        let base = &p as *const _ as usize;
        assert_eq!(&p.pr_pid as *const _ as usize - base, 24);
        assert_eq!(&p.pr_fname as *const _ as usize - base, 40);
        assert_eq!(&p.pr_psargs as *const _ as usize - base, 56);
    }
}
