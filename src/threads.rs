use crate::{*, error::*, util::*, os::*, procfs::*};
use std::{collections::HashSet, io, mem};
use libc::pid_t;

// A thread of the target at freeze time. `regs` is the serialized 216-byte
// general-purpose register block, or empty if the thread exited before the
// registers could be read (the serializer pads with zeroes).
pub struct ThreadSnapshot {
    pub tid: pid_t,
    pub regs: Vec<u8>,
}

pub struct ThreadController {
    pid: pid_t,
    frozen: Vec<pid_t>,
}

impl ThreadController {
    pub fn new(pid: pid_t) -> Self { ThreadController {pid, frozen: Vec::new()} }

    pub fn frozen_count(&self) -> usize { self.frozen.len() }

    // Seize-and-interrupt every thread of the target, re-enumerating the task
    // directory until a pass finds no new threads. Threads spawned mid-freeze are
    // picked up by the next pass; once every live thread is stopped nothing can
    // spawn more, so the loop settles.
    pub fn freeze_all(&mut self) -> Result<()> {
        let mut seen: HashSet<pid_t> = HashSet::new();
        for round in 0.. {
            if round > 30 {
                self.unfreeze_all();
                return err!(FreezeFailed, "suspiciously many freeze rounds were required, giving up");
            }

            let threads = match list_threads(self.pid) {
                Ok(t) => t,
                Err(e) => {
                    self.unfreeze_all();
                    return Err(e);
                }
            };
            let added: Vec<pid_t> = threads.iter().copied().filter(|t| seen.insert(*t)).collect();
            if added.is_empty() {
                break;
            }

            let mut stopping: HashSet<pid_t> = HashSet::new();
            for tid in added {
                match unsafe {ptrace(PTRACE_SEIZE, tid, 0, 0)} {
                    Ok(_) => (),
                    // The task exited between enumeration and seize: it doesn't exist.
                    Err(e) if e.is_io_no_such_process() => continue,
                    Err(e) if e.is_io_permission_denied() => {
                        self.unfreeze_all();
                        return err!(PermissionDenied, "ptrace(PTRACE_SEIZE, {}) not permitted - run as root, or lower kernel.yama.ptrace_scope (see --fix-yama)", tid);
                    }
                    Err(e) => {
                        self.unfreeze_all();
                        return err!(FreezeFailed, "failed to seize thread {}: {}", tid, e);
                    }
                }
                self.frozen.push(tid);
                match unsafe {ptrace(PTRACE_INTERRUPT, tid, 0, 0)} {
                    Ok(_) => { stopping.insert(tid); }
                    Err(e) if e.is_io_no_such_process() => { self.frozen.retain(|t| *t != tid); }
                    Err(e) => {
                        self.unfreeze_all();
                        return err!(FreezeFailed, "failed to interrupt thread {}: {}", tid, e);
                    }
                }
            }

            if let Err(e) = self.wait_for_stops(&mut stopping) {
                self.unfreeze_all();
                return err!(FreezeFailed, "failed waiting for threads to stop: {}", e);
            }
        }
        if self.frozen.is_empty() {
            return err!(FreezeFailed, "no threads left to freeze in process {}", self.pid);
        }
        self.frozen.sort();
        Ok(())
    }

    fn wait_for_stops(&mut self, running: &mut HashSet<pid_t>) -> Result<()> {
        let mut signal_race_count = 0usize;
        while !running.is_empty() {
            let mut wstatus = 0i32;
            let tid = unsafe {libc::waitpid(-1, &mut wstatus, libc::__WALL)};
            if tid < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }
            if !running.contains(&tid) {
                eprintln!("warning: got event 0x{:x} for unexpected thread {}", wstatus, tid);
                continue;
            }

            if libc::WIFEXITED(wstatus) || libc::WIFSIGNALED(wstatus) {
                // Exited between seize and stop; treat as gone.
                self.frozen.retain(|t| *t != tid);
                running.remove(&tid);
            } else if wstatus >> 16 == PTRACE_EVENT_STOP {
                // The expected way for a thread to stop after PTRACE_INTERRUPT.
                running.remove(&tid);
            } else if libc::WIFSTOPPED(wstatus) {
                // An unrelated signal arrived before our interrupt. Deliver it and
                // re-request a ptrace stop so we don't latch onto a signal stop that
                // would leave the thread stopped after we detach.
                let signal = libc::WSTOPSIG(wstatus);
                signal_race_count += 1;
                if signal_race_count > 30 {
                    return err!(Sanity, "hit signal delivery race suspiciously many times, giving up");
                }
                let r = unsafe {ptrace(PTRACE_CONT, tid, 0, signal as u64)}
                    .and_then(|_| unsafe {ptrace(PTRACE_INTERRUPT, tid, 0, 0)});
                match r {
                    Ok(_) => (),
                    Err(e) if e.is_io_no_such_process() => {
                        self.frozen.retain(|t| *t != tid);
                        running.remove(&tid);
                    }
                    Err(e) => return Err(e),
                }
            } else {
                return err!(Internal, "waitpid() returned unexpected status 0x{:x} for thread {}", wstatus, tid);
            }
        }
        Ok(())
    }

    // Reads the general-purpose register set of every frozen thread. A thread that
    // vanished mid-freeze yields an empty buffer; any other ptrace failure aborts
    // (the caller unfreezes on its error path).
    pub fn capture_registers(&self) -> Result<Vec<ThreadSnapshot>> {
        let mut snapshots: Vec<ThreadSnapshot> = Vec::with_capacity(self.frozen.len());
        for &tid in &self.frozen {
            let mut regs: libc::user_regs_struct = unsafe {mem::zeroed()};
            let regs = match unsafe {ptrace(PTRACE_GETREGS, tid, 0, &mut regs as *mut _ as u64)} {
                Ok(_) => serialize_gp_registers(&regs),
                Err(e) if e.is_io_no_such_process() => Vec::new(),
                Err(e) => return Err(e),
            };
            snapshots.push(ThreadSnapshot {tid, regs});
        }
        Ok(snapshots)
    }

    // Detach every frozen thread, resuming it. Best-effort: a thread that already
    // exited is fine, other failures are reported and the rest keep detaching.
    pub fn unfreeze_all(&mut self) {
        for tid in mem::take(&mut self.frozen) {
            match unsafe {ptrace(PTRACE_DETACH, tid, 0, 0)} {
                Ok(_) => (),
                Err(e) if e.is_io_no_such_process() => (),
                Err(e) => eprintln!("warning: failed to detach thread {}: {}", tid, e),
            }
        }
    }
}

// Serializes a register snapshot into the 216-byte x86-64 elf_gregset_t layout:
// 27 little-endian 8-byte values in kernel order.
pub fn serialize_gp_registers(regs: &libc::user_regs_struct) -> Vec<u8> {
    let mut out: Vec<u8> = Vec::with_capacity(GENERAL_REGS_SIZE);
    for v in [
        regs.r15, regs.r14, regs.r13, regs.r12, regs.rbp, regs.rbx, regs.r11, regs.r10,
        regs.r9, regs.r8, regs.rax, regs.rcx, regs.rdx, regs.rsi, regs.rdi, regs.orig_rax,
        regs.rip, regs.cs, regs.eflags, regs.rsp, regs.ss,
        regs.fs_base, regs.gs_base, regs.ds, regs.es, regs.fs, regs.gs,
    ] {
        out.write_u64(v).unwrap();
    }
    debug_assert!(out.len() == GENERAL_REGS_SIZE);
    out
}
