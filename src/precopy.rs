use crate::{*, error::*, util::*, procfs::*, pagemap::*, staging::*};
use std::{sync::Mutex, sync::atomic::{AtomicUsize, Ordering}, thread, time::{Duration, Instant}};
use libc::pid_t;

pub struct PreCopyOptions {
    pub max_passes: usize,     // >= 1
    pub dirty_threshold: f64,  // ratio in [0, 1]
    pub concurrency: usize,    // >= 1
    pub verbose: bool,
}

pub struct PreCopyResult {
    pub passes: usize,
    pub duration: Duration,
    pub final_dirty_ratio: f64,
}

// Iterative pre-copy: clear soft-dirty bits, bulk-copy every region while the
// target keeps running, measure how much got re-dirtied, repeat until the dirty
// ratio drops under the threshold or the passes run out. The freeze-time
// delta pass afterwards only has to move what's still dirty.
pub fn run_pre_copy(pid: pid_t, regions: &[Region], staging: &StagingBuffer, tracker: &mut SoftDirtyTracker, opts: &PreCopyOptions) -> Result<PreCopyResult> {
    let start = Instant::now();
    let mut passes = 0usize;
    let mut ratio = 0.0f64;
    for pass in 1..=opts.max_passes {
        passes = pass;
        tracker.reset()?;

        let pass_start = Instant::now();
        copy_regions_parallel(pid, regions, staging, opts.concurrency, opts.verbose)?;

        // One scan produces both the dirty set and the ratio; the dirty set itself
        // is only interesting to the freeze-time delta, which re-scans anyway.
        let scan = tracker.scan(regions)?;
        ratio = scan.ratio();
        if opts.verbose {
            eprintln!("(pass {}/{}: copied {} regions in {:.3}s, dirty ratio {:.2}%)",
                pass, opts.max_passes, regions.len(), pass_start.elapsed().as_secs_f64(), ratio * 100.0);
        }
        if ratio < opts.dirty_threshold {
            if opts.verbose {
                eprintln!("(dirty ratio {:.2}% below threshold {:.2}%, stopping pre-copy)", ratio * 100.0, opts.dirty_threshold * 100.0);
            }
            break;
        }
    }
    Ok(PreCopyResult {passes, duration: start.elapsed(), final_dirty_ratio: ratio})
}

// min(concurrency, |regions|) workers pull region indices off a shared cursor.
// Staging allocation is the only shared state; the spans workers write through
// are disjoint, so no further synchronization is needed.
pub fn copy_regions_parallel(pid: pid_t, regions: &[Region], staging: &StagingBuffer, concurrency: usize, verbose: bool) -> Result<()> {
    if regions.is_empty() {
        return Ok(());
    }
    let workers = concurrency.min(regions.len()).max(1);
    let next = AtomicUsize::new(0);
    let failure: Mutex<Option<Error>> = Mutex::new(None);
    thread::scope(|s| {
        for _ in 0..workers {
            s.spawn(|| {
                let reader = PidMemReader::new(pid);
                loop {
                    let idx = next.fetch_add(1, Ordering::Relaxed);
                    if idx >= regions.len() || failure.lock().unwrap().is_some() {
                        break;
                    }
                    if let Err(e) = copy_region(&reader, staging, &regions[idx], verbose) {
                        let mut f = failure.lock().unwrap();
                        if f.is_none() {
                            *f = Some(e);
                        }
                        break;
                    }
                }
            });
        }
    });
    match failure.into_inner().unwrap() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

// Copies one region wholesale into its staging slot: one vectored cross-process
// read, no per-page syscalls. Read failures leave the staged bytes as they are
// (zeroes on first touch); only staging problems are fatal.
pub fn copy_region(reader: &PidMemReader, staging: &StagingBuffer, region: &Region, verbose: bool) -> Result<()> {
    let len = region.len();
    if len == 0 {
        return Ok(());
    }
    let offset = staging.offset_for(region.start, len);
    let span = staging.span(offset, len)?;
    let start_time = Instant::now();
    match reader.read_raw(region.start, span.as_mut_ptr(), len) {
        Ok(true) => (),
        Ok(false) => {
            if verbose {
                eprintln!("(skipping unreadable region 0x{:x}-0x{:x})", region.start, region.end);
            }
        }
        Err(e) => eprintln!("warning: couldn't read region 0x{:x}-0x{:x}, keeping staged bytes: {}", region.start, region.end, e),
    }
    let elapsed = start_time.elapsed();
    if verbose && elapsed.as_millis() > 10 {
        eprintln!("(copying region 0x{:x}-0x{:x} ({}) took {:.3}s)", region.start, region.end, PrettySize(len), elapsed.as_secs_f64());
    }
    Ok(())
}
