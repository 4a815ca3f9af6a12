/// File descriptor closure for freshly forked sandbox processes
///
/// A proxy forked while another run is in flight inherits that run's pipe
/// ends. Holding them would delay the other run's EOF-based exec detection,
/// so the proxy closes everything it does not own right after fork.
use nix::unistd::close;
use std::fs;
use std::io;
use std::os::unix::io::RawFd;

/// Open file descriptors of the calling process, sorted
pub fn get_open_fds() -> io::Result<Vec<RawFd>> {
    let mut fds: Vec<RawFd> = fs::read_dir("/proc/self/fd")?
        .flatten()
        .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
        .collect();
    fds.sort_unstable();
    Ok(fds)
}

/// Close every descriptor above stderr that is not in `keep`. `keep` is
/// sorted in place.
///
/// Uses `close_range(2)`, which needs no allocation after fork. Kernels
/// before 5.9 and seccomp filters that refuse it fall back to listing
/// `/proc/self/fd`.
pub fn close_fds_except(keep: &mut [RawFd]) -> io::Result<()> {
    keep.sort_unstable();
    match close_gaps(keep) {
        Err(e) if matches!(e.raw_os_error(), Some(libc::ENOSYS) | Some(libc::EPERM)) => {
            close_listed(keep)
        }
        other => other,
    }
}

fn close_gaps(sorted_keep: &[RawFd]) -> io::Result<()> {
    let mut first: libc::c_uint = 3;
    for &fd in sorted_keep.iter().filter(|&&fd| fd >= 3) {
        let fd = fd as libc::c_uint;
        if fd > first {
            close_range(first, fd - 1)?;
        }
        first = first.max(fd + 1);
    }
    close_range(first, libc::c_uint::MAX)
}

fn close_range(first: libc::c_uint, last: libc::c_uint) -> io::Result<()> {
    // SAFETY: close_range only closes descriptors; no memory is passed.
    let rc = unsafe { libc::syscall(libc::SYS_close_range, first, last, 0 as libc::c_uint) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn close_listed(sorted_keep: &[RawFd]) -> io::Result<()> {
    // Collected first: the directory handle itself shows up in the listing
    for fd in get_open_fds()? {
        if fd > 2 && sorted_keep.binary_search(&fd).is_err() {
            let _ = close(fd);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, ForkResult};
    use std::fs::File;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_get_open_fds_has_stdio() {
        let fds = get_open_fds().unwrap();
        assert!(fds.contains(&0));
        assert!(fds.contains(&1));
        assert!(fds.contains(&2));
    }

    fn is_open(fd: RawFd) -> bool {
        // SAFETY: F_GETFD only inspects the descriptor table.
        (unsafe { libc::fcntl(fd, libc::F_GETFD) }) != -1
    }

    #[test]
    fn test_only_kept_descriptors_survive() {
        let dropped = File::open("/dev/null").unwrap();
        let kept = File::open("/dev/null").unwrap();
        let also_dropped = File::open("/dev/null").unwrap();
        let (dropped, kept, also_dropped) =
            (dropped.as_raw_fd(), kept.as_raw_fd(), also_dropped.as_raw_fd());

        // SAFETY: the child only makes raw syscalls before _exit.
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let mut keep = [kept, 1, kept];
                let closed = close_fds_except(&mut keep).is_ok();
                let ok = closed
                    && is_open(0)
                    && is_open(1)
                    && is_open(2)
                    && is_open(kept)
                    && !is_open(dropped)
                    && !is_open(also_dropped);
                unsafe { libc::_exit(if ok { 0 } else { 1 }) }
            }
            ForkResult::Parent { child } => {
                assert!(matches!(waitpid(child, None).unwrap(), WaitStatus::Exited(_, 0)));
            }
        }
        assert!(is_open(dropped));
    }

    #[test]
    fn test_listing_fallback_closes_the_same_set() {
        let dropped = File::open("/dev/null").unwrap();
        let kept = File::open("/dev/null").unwrap();
        let (dropped, kept) = (dropped.as_raw_fd(), kept.as_raw_fd());

        // SAFETY: see above; the listing allocates, which the C library permits here.
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let ok = close_listed(&[kept]).is_ok() && is_open(kept) && !is_open(dropped);
                unsafe { libc::_exit(if ok { 0 } else { 1 }) }
            }
            ForkResult::Parent { child } => {
                assert!(matches!(waitpid(child, None).unwrap(), WaitStatus::Exited(_, 0)));
            }
        }
    }
}
