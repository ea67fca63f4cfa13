use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::process;
use std::thread;

use clap::Parser;
use io_uring::IoUring;
use log::{error, info, warn};
use nix::fcntl::posix_fallocate;
use nix::sys::resource::{Resource, setrlimit};
use nix::sys::stat::fstat;

use splicefs::error::ServiceError;
use splicefs::mnt::DevFuse;
use splicefs::session::Session;
use splicefs::{handshake, mnt};

/// Exit code for malformed invocations.
const USAGE_ERROR: i32 = 101;

/// Extra congestion headroom past `max_background`, mirroring what the
/// kernel is told at init.
const CONGESTION_HEADROOM: u16 = 1000;

#[derive(Parser, Debug)]
#[command(version, about = "Zero-copy FUSE volume server on io_uring")]
struct Args {
    /// File backing the volume; created and grown to the requested size.
    backing_file: PathBuf,

    /// Directory to mount the filesystem on.
    mount_point: PathBuf,

    /// Size of the backing file in bytes.
    backing_size: u64,

    /// Value advertised as max_background at FUSE_INIT.
    max_background: u16,

    /// Serving threads; each gets its own cloned session fd and ring.
    #[arg(long, default_value_t = 1)]
    threads: usize,

    /// Maximum in-flight requests per thread (defaults to max_background).
    #[arg(long)]
    max_ops: Option<usize>,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            process::exit(USAGE_ERROR);
        }
    };
    env_logger::init();

    match serve(&args) {
        Ok(()) => {}
        Err(err) => {
            error!("{err}");
            process::exit(err.exit_code());
        }
    }
}

fn serve(args: &Args) -> Result<(), ServiceError> {
    let backing = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(0o700)
        .open(&args.backing_file)
        .map_err(ServiceError::BackingFile)?;
    posix_fallocate(&backing, 0, args.backing_size as libc::off_t)
        .map_err(|err| ServiceError::BackingFile(err.into()))?;

    // The registered buffers must stay pinned and the server must keep
    // making progress under memory pressure; both calls are advisory.
    if let Err(err) = setrlimit(
        Resource::RLIMIT_MEMLOCK,
        libc::RLIM_INFINITY,
        libc::RLIM_INFINITY,
    ) {
        warn!("raising RLIMIT_MEMLOCK failed: {err}");
    }
    const PR_SET_IO_FLUSHER: libc::c_int = 57;
    if unsafe { libc::prctl(PR_SET_IO_FLUSHER, 1, 0, 0, 0) } != 0 {
        warn!(
            "PR_SET_IO_FLUSHER failed: {}",
            std::io::Error::last_os_error()
        );
    }

    let dev = DevFuse::open()?;
    let _mount = mnt::mount(&dev, &args.mount_point)?;
    let congestion = args.max_background.saturating_add(CONGESTION_HEADROOM);
    let negotiated = handshake(&dev, args.max_background, congestion)?;

    let stat = fstat(&backing).map_err(|err| ServiceError::BackingStat(err.into()))?;
    let backing_size = stat.st_size as u64;

    let nslots = args.max_ops.unwrap_or(args.max_background as usize).max(1);
    let entries = (nslots as u32 * 2).max(8);
    let threads = args.threads.max(1);

    // The primary ring owns the kernel work queue; worker rings attach to it
    // so a multi-threaded server shares one async backend.
    let mut rings = vec![IoUring::new(entries).map_err(ServiceError::RingSetup)?];
    for _ in 1..threads {
        let ring = IoUring::builder()
            .setup_attach_wq(rings[0].as_raw_fd())
            .build(entries)
            .map_err(ServiceError::RingSetup)?;
        rings.push(ring);
    }
    let mut devs = vec![dev];
    for _ in 1..threads {
        let clone = devs[0].clone_session()?;
        devs.push(clone);
    }

    info!(
        "serving {} ({} bytes) on {} with {} thread(s), {} slots each",
        args.backing_file.display(),
        backing_size,
        args.mount_point.display(),
        threads,
        nslots
    );

    let backing_fd = backing.as_raw_fd();
    let negotiated = &negotiated;
    thread::scope(|scope| {
        let mut workers = Vec::with_capacity(threads);
        for (index, (ring, dev)) in rings.drain(..).zip(devs.drain(..)).enumerate() {
            workers.push(
                thread::Builder::new()
                    .name(format!("splicefs-{index}"))
                    .spawn_scoped(scope, move || -> Result<(), ServiceError> {
                        let session =
                            Session::new(ring, dev, backing_fd, backing_size, negotiated, nslots)?;
                        session.run()
                    })
                    .expect("spawning a serving thread"),
            );
        }
        let mut result = Ok(());
        for worker in workers {
            let outcome = worker.join().expect("serving thread panicked");
            if result.is_ok() {
                result = outcome;
            }
        }
        result
    })
}
