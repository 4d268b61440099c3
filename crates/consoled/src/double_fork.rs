use std::{fs::OpenOptions, os::fd::AsRawFd, process::exit};

use rustix::{
    fs::Mode,
    process::{chdir, umask},
};

use crate::Result;

/// Daemonize (from: advanced programming in the unix environment)
pub fn daemon_double_fork() -> Result<()> {
    do_fork()?;

    if unsafe { libc::setsid() } < 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    // cannot be killed by the parent's session going away; the reload
    // handler replaces this later
    unsafe {
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
    }

    // really shake them off our tail
    do_fork()?;

    // no risk of unmounting
    chdir("/")?;

    // clear umask
    umask(Mode::empty());

    redirect_std_fds_to_devnull()
}

fn redirect_std_fds_to_devnull() -> Result<()> {
    let devnull = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;

    let fd = devnull.as_raw_fd();
    for target in 0..=2 {
        if unsafe { libc::dup2(fd, target) } < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
    }
    Ok(())
}

fn do_fork() -> Result<()> {
    match unsafe { libc::fork() } {
        p if p < 0 => Err(std::io::Error::last_os_error().into()),
        0 => Ok(()),   // child
        _ => exit(0), // parent
    }
}
