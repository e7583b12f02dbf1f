#![allow(dead_code)]
#![allow(unused_variables)]
#![allow(unused_imports)]
use livecore::{*, error::*, util::*, os::*, procfs::*, dumper::*};
use std::{fs, io, process, collections::HashSet, path::PathBuf, str::FromStr};
use libc::pid_t;

const YAMA_PATH: &str = "/proc/sys/kernel/yama/ptrace_scope";

const USAGE: &str = "\
usage: livecore [flags] <pid> <output.core>
  --passes=N        maximum pre-copy passes (default 2)
  --dirty-thresh=P  stop pre-copy when the dirty percentage drops below P (default 5)
  --concurrency=N   concurrent copy workers (default: logical CPU count)
  --skip-file-maps  leave private file-backed bytes out of the core
  --only-anon       dump only anonymous mappings
  --ignore-dontdump dump regions advised with MADV_DONTDUMP too
  --verbose, -v     show progress and statistics
  --fix-yama        temporarily set kernel.yama.ptrace_scope=0 and restore it on exit
";

fn usage_error(msg: &str) -> ! {
    eprintln!("{}", msg);
    eprint!("{}", USAGE);
    process::exit(1);
}

fn parse_arg(args: &mut &[String], seen_args: &mut HashSet<String>, long_name: &str, short_name: &str, bool_switch: bool) -> Option<String> {
    assert!(!args.is_empty());
    if args[0].is_empty() {
        return None;
    }
    let check_duplicate = |seen_args: &mut HashSet<String>, name: &str| {
        if !seen_args.insert(name.to_string()) {
            eprintln!("{} can't be specified multiple times", name);
            process::exit(1);
        }
    };
    if !long_name.is_empty() && args[0].starts_with(long_name) && args[0][long_name.len()..].starts_with('=') {
        check_duplicate(seen_args, long_name);
        if bool_switch {
            eprintln!("{} doesn't accept a value", long_name);
            process::exit(1);
        }
        let v = args[0][long_name.len()+1..].to_string();
        *args = &args[1..];
        return Some(v);
    }
    if &args[0][..] == short_name || &args[0][..] == long_name {
        let name = if &args[0][..] == short_name {short_name} else {long_name};
        check_duplicate(seen_args, name);
        if bool_switch {
            *args = &args[1..];
            return Some(String::new());
        }
        if args.len() == 1 {
            eprintln!("{} requires an argument", name);
            process::exit(1);
        }
        let v = args[1].clone();
        *args = &args[2..];
        return Some(v);
    }
    None
}

fn read_yama_scope() -> Result<i32> {
    let s = match fs::read_to_string(YAMA_PATH) {
        Ok(s) => s,
        // Kernel without yama: nothing restricts ptrace.
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(Error::from_io_error(e, format!("failed to read {}", YAMA_PATH))),
    };
    match s.trim().parse::<i32>() {
        Ok(v) => Ok(v),
        Err(_) => err!(Internal, "unparsable {} value: {:?}", YAMA_PATH, s.trim()),
    }
}

// Returns the prior ptrace_scope value if we changed it; the dumper puts it back
// on every exit path, including fatal signals.
fn prepare_yama(fix: bool) -> Result<Option<i32>> {
    let scope = read_yama_scope()?;
    if scope == 0 {
        return Ok(None);
    }
    if !fix {
        return err!(PermissionDenied, "kernel.yama.ptrace_scope is {} and prevents ptrace; run `sudo sysctl kernel.yama.ptrace_scope=0`, or pass --fix-yama to change and restore it automatically", scope);
    }
    fs::write(YAMA_PATH, "0\n").map_err(|e| Error::from_io_error(e, format!("failed to set {} to 0 (are you root?)", YAMA_PATH)))?;
    eprintln!("(temporarily set kernel.yama.ptrace_scope to 0, was {})", scope);
    Ok(Some(scope))
}

fn main() {
    precalc_globals_os();

    let all_args: Vec<String> = std::env::args().collect();
    let mut args = &all_args[1..];
    let mut seen_args: HashSet<String> = HashSet::new();
    let mut max_passes = 2usize;
    let mut dirty_thresh = 5.0f64; // percentage
    let mut concurrency = sysconf_NPROCESSORS_ONLN();
    let mut policy = DumpPolicy::default();
    let mut verbose = false;
    let mut fix_yama = false;
    while !args.is_empty() && args[0].starts_with('-') {
        if let Some(v) = parse_arg(&mut args, &mut seen_args, "--passes", "", false) {
            max_passes = match v.parse::<usize>() {
                Ok(n) if n >= 1 => n,
                _ => usage_error(&format!("invalid --passes (expected an integer >= 1): '{}'", v)),
            };
        } else if let Some(v) = parse_arg(&mut args, &mut seen_args, "--dirty-thresh", "", false) {
            dirty_thresh = match v.parse::<f64>() {
                Ok(x) if (0.0..=100.0).contains(&x) => x,
                _ => usage_error(&format!("invalid --dirty-thresh (expected a percentage in [0, 100]): '{}'", v)),
            };
        } else if let Some(v) = parse_arg(&mut args, &mut seen_args, "--concurrency", "-j", false) {
            concurrency = match v.parse::<usize>() {
                Ok(n) if n >= 1 => n,
                _ => usage_error(&format!("invalid --concurrency (expected an integer >= 1): '{}'", v)),
            };
        } else if parse_arg(&mut args, &mut seen_args, "--skip-file-maps", "", true).is_some() {
            policy.include_file_maps = false;
        } else if parse_arg(&mut args, &mut seen_args, "--only-anon", "", true).is_some() {
            policy.only_anon = true;
        } else if parse_arg(&mut args, &mut seen_args, "--ignore-dontdump", "", true).is_some() {
            policy.respect_dontdump = false;
        } else if parse_arg(&mut args, &mut seen_args, "--verbose", "-v", true).is_some() {
            verbose = true;
        } else if parse_arg(&mut args, &mut seen_args, "--fix-yama", "", true).is_some() {
            fix_yama = true;
        } else {
            usage_error(&format!("unrecognized flag: {}", args[0]));
        }
    }
    if args.len() != 2 {
        usage_error("expected exactly two positional arguments: <pid> <output.core>");
    }
    let pid = match pid_t::from_str(&args[0]) {
        Ok(p) if p >= 1 => p,
        _ => usage_error(&format!("invalid pid: '{}'", args[0])),
    };
    let output = PathBuf::from(&args[1]);

    let yama_restore = match prepare_yama(fix_yama) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("error: {}", e);
            process::exit(1);
        }
    };

    let config = Config {
        pid,
        output,
        max_passes,
        dirty_threshold: dirty_thresh / 100.0,
        concurrency,
        policy,
        verbose,
        yama_restore,
    };
    match run_dump_tool(config) {
        Ok(()) => (),
        Err(e) => {
            eprintln!("error: {}", e);
            process::exit(1);
        }
    }
}
