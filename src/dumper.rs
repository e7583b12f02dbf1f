use crate::{*, error::*, util::*, os::*, procfs::*, threads::*, pagemap::*, staging::*, precopy::*, elfcore::*};
use std::{fs, io, mem, panic, process, ptr, path::PathBuf, time::{Duration, Instant}};
use libc::pid_t;

#[derive(Clone)]
pub struct Config {
    pub pid: pid_t,
    pub output: PathBuf,
    pub max_passes: usize,     // >= 1
    pub dirty_threshold: f64,  // ratio in [0, 1]
    pub concurrency: usize,    // >= 1
    pub policy: DumpPolicy,
    pub verbose: bool,
    // Prior kernel.yama.ptrace_scope value to put back on every exit path.
    pub yama_restore: Option<i32>,
}

pub struct Dumper {
    config: Config,
    controller: ThreadController,
}

struct FreezeReport {
    threads: Vec<ThreadSnapshot>,
    regions: Vec<Region>, // authoritative for the output
    delta_pages: usize,
    stw: Duration,
}

impl Dumper {
    fn try_dump(&mut self) -> Result<()> {
        let pid = self.config.pid;
        let verbose = self.config.verbose;
        let start_time = Instant::now();

        // Discovery. Also validates the target's pseudo-files up front, before we
        // create the staging file or touch soft-dirty state.
        let regions = read_region_list(pid)?;
        let threads = list_threads(pid)?;
        read_auxv(pid)?;
        if verbose {
            let total: usize = regions.iter().map(|r| r.len()).sum();
            eprintln!("(found {} regions ({}) and {} threads)", regions.len(), PrettySize(total), threads.len());
        }

        let staging = StagingBuffer::new(&self.config.output)?;
        let mut tracker = SoftDirtyTracker::new(pid);

        let opts = PreCopyOptions {
            max_passes: self.config.max_passes,
            dirty_threshold: self.config.dirty_threshold,
            concurrency: self.config.concurrency,
            verbose,
        };
        let pre = run_pre_copy(pid, &regions, &staging, &mut tracker, &opts)?;
        if verbose {
            eprintln!("(pre-copy finished after {} passes in {:.3}s, final dirty ratio {:.2}%)",
                pre.passes, pre.duration.as_secs_f64(), pre.final_dirty_ratio * 100.0);
        }

        let report = self.freeze_delta(&staging, &mut tracker)?;
        eprintln!("the target was paused for {:.3}s ({} threads, {} delta pages)",
            report.stw.as_secs_f64(), report.threads.len(), report.delta_pages);

        // The target is running again; everything below reads only staged bytes
        // and the target's pseudo-files.
        let desc = CoreDescription::new(pid, report.threads, report.regions, self.config.policy)?;
        write_core(&self.config.output, &desc, &staging, verbose)?;
        eprintln!("all done in {:.3}s", start_time.elapsed().as_secs_f64());
        Ok(())
    }

    // The latency-critical window: freeze, registers, authoritative map re-scan,
    // final dirty delta, unfreeze. SIGINT/SIGTERM are held for its duration so the
    // window either completes or unwinds through its own failure path.
    fn freeze_delta(&mut self, staging: &StagingBuffer, tracker: &mut SoftDirtyTracker) -> Result<FreezeReport> {
        let _deferred = DeferredSignals::block();
        let stw_start = Instant::now();
        self.controller.freeze_all()?;
        let r = self.frozen_section(staging, tracker);
        // Unfreeze before propagating any failure. This ends the STW window.
        self.controller.unfreeze_all();
        let stw = stw_start.elapsed();
        let (threads, regions, delta_pages) = r?;
        Ok(FreezeReport {threads, regions, delta_pages, stw})
    }

    fn frozen_section(&mut self, staging: &StagingBuffer, tracker: &mut SoftDirtyTracker) -> Result<(Vec<ThreadSnapshot>, Vec<Region>, usize)> {
        let pid = self.config.pid;
        let verbose = self.config.verbose;

        let t0 = Instant::now();
        let threads = self.controller.capture_registers()?;
        if verbose {
            eprintln!("(captured registers of {} threads in {:.3}s)", threads.len(), t0.elapsed().as_secs_f64());
        }

        let regions = read_region_list(pid)?;
        let t1 = Instant::now();
        let scan = tracker.scan(&regions)?;
        let scan_elapsed = t1.elapsed();

        let t2 = Instant::now();
        let page_size = sysconf_PAGE_SIZE();
        let reader = PidMemReader::new(pid);
        let mut limiter = Limiter::new();
        for page in &scan.pages {
            let region = &regions[page.region];
            let offset = staging.offset_for(region.start, region.len()) + (page.addr - region.start);
            let span = staging.span(offset, page_size)?;
            match reader.read_raw(page.addr, span.as_mut_ptr(), page_size) {
                // Unreadable pages silently keep their pre-copy bytes.
                Ok(_) => (),
                Err(e) => {
                    if limiter.check_n(line!(), 10) {
                        eprintln!("warning: failed to copy dirty page 0x{:x}: {}", page.addr, e);
                    }
                }
            }
        }
        if verbose {
            eprintln!("(delta: {} dirty pages, discovery {:.3}s + copy {:.3}s)",
                scan.pages.len(), scan_elapsed.as_secs_f64(), t2.elapsed().as_secs_f64());
        }
        Ok((threads, regions, scan.pages.len()))
    }

    // Called from the fatal-signal and panic paths: resume the target and put the
    // sysctl back before dying.
    fn emergency_cleanup(&mut self) {
        self.controller.unfreeze_all();
        restore_yama(&mut self.config);
    }
}

pub fn restore_yama(config: &mut Config) {
    if let Some(v) = config.yama_restore.take() {
        match fs::write("/proc/sys/kernel/yama/ptrace_scope", format!("{}\n", v)) {
            Ok(()) => eprintln!("(restored kernel.yama.ptrace_scope to {})", v),
            Err(e) => eprintln!("warning: failed to restore kernel.yama.ptrace_scope to {}: {}", v, e),
        }
    }
}

// Holds SIGINT/SIGTERM blocked while in scope; they deliver on drop.
struct DeferredSignals {
    prev: libc::sigset_t,
}

impl DeferredSignals {
    fn block() -> Self {
        unsafe {
            let mut set: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, libc::SIGINT);
            libc::sigaddset(&mut set, libc::SIGTERM);
            let mut prev: libc::sigset_t = mem::zeroed();
            libc::sigprocmask(libc::SIG_BLOCK, &set, &mut prev);
            DeferredSignals {prev}
        }
    }
}

impl Drop for DeferredSignals {
    fn drop(&mut self) {
        unsafe {
            libc::sigprocmask(libc::SIG_SETMASK, &self.prev, ptr::null_mut());
        }
    }
}

struct DumperPtr(*mut Dumper);
unsafe impl Sync for DumperPtr {}
static DUMPER: SyncUnsafeCell<DumperPtr> = SyncUnsafeCell::new(DumperPtr(ptr::null_mut()));

extern "C" fn fatal_signal_handler(sig: i32, _: *mut libc::siginfo_t, _: *mut libc::c_void) {
    // This is all not signal-safe, but it's better than leaving the target frozen
    // or the sysctl changed.
    unsafe {
        let dumper = (*DUMPER.get()).0;
        if dumper != ptr::null_mut() {
            (*dumper).emergency_cleanup();
            eprintln!("failed: fatal signal {}", signal_name(sig));
        }

        // Restore the default handler and re-raise the signal to proceed with dying.
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = 0;
        libc::sigaction(sig, &action, ptr::null_mut());

        libc::raise(sig);

        // In case raising doesn't kill us (shouldn't happen).
        process::exit(128 + sig);
    }
}

fn install_cleanup_hooks() {
    // Panic hook rather than catch_unwind, because release builds use panic='abort'.
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        unsafe {
            let dumper = (*DUMPER.get()).0;
            if dumper != ptr::null_mut() {
                (*dumper).emergency_cleanup();
            }
        }
        default_hook(info);
        process::exit(2);
    }));

    for sig in [libc::SIGSEGV, libc::SIGABRT, libc::SIGILL, libc::SIGFPE, libc::SIGTERM, libc::SIGINT] {
        unsafe {
            let mut action: libc::sigaction = mem::zeroed();
            action.sa_flags = libc::SA_SIGINFO;
            action.sa_sigaction = fatal_signal_handler as libc::sighandler_t;
            libc::sigemptyset(&mut action.sa_mask);
            let r = libc::sigaction(sig, &action, ptr::null_mut());
            if r != 0 {
                eprintln!("warning: sigaction({}) failed: {}", signal_name(sig), io::Error::last_os_error());
            }
        }
    }
}

pub fn run_dump_tool(config: Config) -> Result<()> {
    let mut dumper = Dumper {controller: ThreadController::new(config.pid), config};
    unsafe { *DUMPER.get() = DumperPtr(&mut dumper as *mut Dumper); }
    install_cleanup_hooks();

    let r = dumper.try_dump();
    if r.is_err() {
        // The freeze paths already unwound; this is an idempotent backstop.
        dumper.controller.unfreeze_all();
    }
    restore_yama(&mut dumper.config);
    unsafe { *DUMPER.get() = DumperPtr(ptr::null_mut()); }
    r
}
