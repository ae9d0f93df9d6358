//! Descriptor hygiene for the spawned worker.
//!
//! The worker must not inherit any descriptor the parent has open above
//! stderr (listening sockets in particular would silently stay bound in
//! the child). The parent enumerates its descriptor table before the
//! spawn and a post-fork hook closes every descriptor above 2 in the
//! child; stdio has already been rewired by the time the hook runs.

use std::os::fd::RawFd;

use tokio::process::Command;

// Probe limit when /dev/fd is unavailable.
const PROBE_CEILING: RawFd = 1024;

pub(crate) fn close_inherited_descriptors(cmd: &mut Command) {
    let fds = descriptors_above_stderr();
    if fds.is_empty() {
        return;
    }
    unsafe {
        cmd.pre_exec(move || {
            // Post-fork context: async-signal-safe calls only, no
            // allocation. The list was built pre-fork.
            for &fd in &fds {
                let _ = nix::unistd::close(fd);
            }
            Ok(())
        });
    }
}

fn descriptors_above_stderr() -> Vec<RawFd> {
    enumerate_dev_fd().unwrap_or_else(probe_descriptor_table)
}

fn enumerate_dev_fd() -> Option<Vec<RawFd>> {
    let entries = std::fs::read_dir("/dev/fd").ok()?;
    let mut fds = Vec::new();
    for entry in entries.flatten() {
        if let Ok(fd) = entry.file_name().to_string_lossy().parse::<RawFd>() {
            if fd > 2 {
                fds.push(fd);
            }
        }
    }
    Some(fds)
}

fn probe_descriptor_table() -> Vec<RawFd> {
    (3..PROBE_CEILING)
        .filter(|&fd| nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_GETFD).is_ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumeration_sees_an_open_descriptor() {
        let file = std::fs::File::open("/dev/null").expect("open /dev/null");
        let fd = {
            use std::os::fd::AsRawFd;
            file.as_raw_fd()
        };
        let fds = descriptors_above_stderr();
        assert!(fds.contains(&fd));
        assert!(fds.iter().all(|&fd| fd > 2));
    }
}
