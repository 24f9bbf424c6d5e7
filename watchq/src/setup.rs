use log::debug;
use std::process;

/// The mount-wide channel needs CAP_SYS_ADMIN; anything else fails at init
/// with a permission error, so refuse early with a readable message.
pub fn check_permission() {
    if unsafe { libc::geteuid() } != 0 {
        eprintln!("the mount backend currently only supports running as the root user.");
        process::exit(1);
    }
}

/// Every undrained kernel record pins an open descriptor until it is
/// resolved, so run with the hard descriptor limit.
pub fn raise_fd_limit() {
    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let ret = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) };
    if ret != 0 {
        debug!("read descriptor limit failed, ret is: {}", ret);
        return;
    }
    rlim.rlim_cur = rlim.rlim_max;
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) };
    if ret != 0 {
        debug!("raise descriptor limit failed, ret is: {}", ret);
    }
}
