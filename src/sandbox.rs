//! Capability narrowing for capture workers.
//!
//! A worker opens its packet socket while still privileged, then gives up
//! everything it no longer needs: the user it ran as, every capability and
//! finally most system calls.

use std::ffi::CString;
use std::fs;
use std::io;
use std::ops::BitOr;
use std::os::fd::RawFd;

use caps::{CapSet, Capability};
use tracing::debug;

use crate::capture::filter::{BpfInsn, BPF_ABS, BPF_JEQ, BPF_JMP, BPF_K, BPF_LD, BPF_RET, BPF_W};
use crate::error::CaptureError;

/// `SO_LOCK_FILTER` from `<asm-generic/socket.h>`
const SO_LOCK_FILTER: libc::c_int = 44;

// From <linux/seccomp.h> and <linux/audit.h>
const SECCOMP_MODE_FILTER: libc::c_ulong = 2;
const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
#[cfg(target_arch = "x86_64")]
const AUDIT_ARCH: u32 = 0xc000_003e;
#[cfg(target_arch = "aarch64")]
const AUDIT_ARCH: u32 = 0xc000_00b7;

// Offsets into struct seccomp_data
const SECCOMP_DATA_NR: u32 = 0;
const SECCOMP_DATA_ARCH: u32 = 4;

/// Operations a worker may still perform on its raw descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rights(u32);

impl Rights {
    pub const READ: Rights = Rights(0x01);
    pub const WRITE: Rights = Rights(0x02);
    pub const EVENT: Rights = Rights(0x04);
    /// Reconfigure the attached filter.
    pub const IOCTL: Rights = Rights(0x08);

    /// Exactly what a capture worker needs.
    pub const CAPTURE: Rights = Rights(0x0f);

    pub const fn contains(self, other: Rights) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Rights {
    type Output = Rights;

    fn bitor(self, rhs: Rights) -> Rights {
        Rights(self.0 | rhs.0)
    }
}

/// System calls every process needs to keep running and to exit.
const BASE_SYSCALLS: &[libc::c_long] = &[
    libc::SYS_exit,
    libc::SYS_exit_group,
    libc::SYS_rt_sigreturn,
    libc::SYS_rt_sigprocmask,
    libc::SYS_rt_sigaction,
    libc::SYS_sigaltstack,
    libc::SYS_restart_syscall,
    libc::SYS_rseq,
    libc::SYS_futex,
    libc::SYS_mmap,
    libc::SYS_munmap,
    libc::SYS_mremap,
    libc::SYS_mprotect,
    libc::SYS_madvise,
    libc::SYS_brk,
    libc::SYS_close,
    // Logging goes to stderr.
    libc::SYS_write,
    libc::SYS_writev,
    libc::SYS_getrandom,
    libc::SYS_sched_yield,
    libc::SYS_getpid,
    libc::SYS_gettid,
    libc::SYS_tgkill,
    libc::SYS_clock_gettime,
    libc::SYS_clock_nanosleep,
    libc::SYS_nanosleep,
];

const READ_SYSCALLS: &[libc::c_long] = &[libc::SYS_read, libc::SYS_recvfrom, libc::SYS_recvmsg];

const WRITE_SYSCALLS: &[libc::c_long] = &[libc::SYS_sendto, libc::SYS_sendmsg];

#[cfg(target_arch = "x86_64")]
const EVENT_SYSCALLS: &[libc::c_long] = &[
    libc::SYS_epoll_ctl,
    libc::SYS_epoll_wait,
    libc::SYS_epoll_pwait,
    libc::SYS_poll,
    libc::SYS_ppoll,
];
#[cfg(not(target_arch = "x86_64"))]
const EVENT_SYSCALLS: &[libc::c_long] = &[libc::SYS_epoll_ctl, libc::SYS_epoll_pwait, libc::SYS_ppoll];

const IOCTL_SYSCALLS: &[libc::c_long] = &[libc::SYS_ioctl, libc::SYS_setsockopt, libc::SYS_getsockopt];

/// System calls left to a process limited to `rights`.
pub fn allowed_syscalls(rights: Rights) -> Vec<u32> {
    let groups = [
        (Rights::READ, READ_SYSCALLS),
        (Rights::WRITE, WRITE_SYSCALLS),
        (Rights::EVENT, EVENT_SYSCALLS),
        (Rights::IOCTL, IOCTL_SYSCALLS),
    ];
    let mut nrs: Vec<u32> = BASE_SYSCALLS.iter().map(|&nr| nr as u32).collect();
    for (right, syscalls) in groups {
        if rights.contains(right) {
            nrs.extend(syscalls.iter().map(|&nr| nr as u32));
        }
    }
    nrs
}

/// Seccomp program allowing `allowed` and failing everything else with EPERM.
///
/// ```text
///   ld   [4]                   ; arch
///   jeq  #AUDIT_ARCH, 1, 0
///   ret  #KILL_PROCESS
///   ld   [0]                   ; syscall number
///   jeq  #nr0, allow           ; one per allowed call
///   ...
///   ret  #ERRNO(EPERM)
/// allow:
///   ret  #ALLOW
/// ```
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub fn seccomp_filter(allowed: &[u32]) -> Vec<BpfInsn> {
    let insn = |code, jt, jf, k| BpfInsn { code, jt, jf, k };
    let n = allowed.len();
    debug_assert!(n < usize::from(u8::MAX), "too many syscalls for one jump");

    let mut prog = vec![
        insn(BPF_LD | BPF_W | BPF_ABS, 0, 0, SECCOMP_DATA_ARCH),
        insn(BPF_JMP | BPF_JEQ | BPF_K, 1, 0, AUDIT_ARCH),
        insn(BPF_RET | BPF_K, 0, 0, SECCOMP_RET_KILL_PROCESS),
        insn(BPF_LD | BPF_W | BPF_ABS, 0, 0, SECCOMP_DATA_NR),
    ];
    for (i, &nr) in allowed.iter().enumerate() {
        // Skip the remaining checks and the deny to land on allow.
        prog.push(insn(BPF_JMP | BPF_JEQ | BPF_K, (n - i) as u8, 0, nr));
    }
    prog.push(insn(BPF_RET | BPF_K, 0, 0, SECCOMP_RET_ERRNO | libc::EPERM as u32));
    prog.push(insn(BPF_RET | BPF_K, 0, 0, SECCOMP_RET_ALLOW));
    prog
}

/// Limit the calling thread to `rights`.
///
/// Linux has no per-descriptor rights. When `IOCTL` is not granted the
/// filter on `fd` is locked first. Then a seccomp filter restricts the
/// thread to the system calls `rights` needs on any descriptor; new sockets,
/// `execve` and the rest fail with EPERM. Threads created afterwards inherit
/// the filter. `Unsupported` means the kernel lacks seccomp filtering.
pub fn limit_rights(fd: RawFd, rights: Rights) -> io::Result<()> {
    if !rights.contains(Rights::IOCTL) {
        let one: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                SO_LOCK_FILTER,
                &one as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    install_seccomp(&allowed_syscalls(rights))
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
fn install_seccomp(allowed: &[u32]) -> io::Result<()> {
    let insns: Vec<libc::sock_filter> = seccomp_filter(allowed)
        .iter()
        .map(|i| libc::sock_filter {
            code: i.code,
            jt: i.jt,
            jf: i.jf,
            k: i.k,
        })
        .collect();
    let prog = libc::sock_fprog {
        len: insns.len() as libc::c_ushort,
        filter: insns.as_ptr() as *mut libc::sock_filter,
    };

    // Unprivileged filters need no_new_privs.
    set_no_new_privs()?;
    let rc = unsafe {
        libc::prctl(
            libc::PR_SET_SECCOMP,
            SECCOMP_MODE_FILTER,
            &prog as *const libc::sock_fprog as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
        )
    };
    if rc == -1 {
        let err = io::Error::last_os_error();
        // EINVAL: kernel built without CONFIG_SECCOMP_FILTER.
        if err.raw_os_error() == Some(libc::EINVAL) {
            return Err(io::Error::new(io::ErrorKind::Unsupported, err));
        }
        return Err(err);
    }
    debug!("Installed seccomp filter ({} syscalls allowed)", allowed.len());
    Ok(())
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn install_seccomp(_allowed: &[u32]) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

/// Whether an error from [`limit_rights`] only says the mechanism is missing.
pub fn is_unsupported(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::Unsupported || err.raw_os_error() == Some(libc::ENOSYS)
}

/// Switch to `user`, clear every capability and forbid regaining privileges.
///
/// When not running as root the user is kept, but capabilities granted
/// some other way (file capabilities, ambient set) are still cleared.
pub fn drop_privileges(user: &str) -> Result<(), CaptureError> {
    if unsafe { libc::geteuid() } == 0 {
        let (uid, gid) = lookup_user(user)?;

        let rc = unsafe { libc::setgroups(1, &gid) };
        if rc == -1 {
            return Err(CaptureError::Privileges(io::Error::last_os_error()));
        }
        if unsafe { libc::setgid(gid) } == -1 {
            return Err(CaptureError::Privileges(io::Error::last_os_error()));
        }
        if unsafe { libc::setuid(uid) } == -1 {
            return Err(CaptureError::Privileges(io::Error::last_os_error()));
        }
        // Must not be able to get root back.
        if unsafe { libc::setuid(0) } != -1 {
            return Err(CaptureError::Privileges(io::Error::from(
                io::ErrorKind::PermissionDenied,
            )));
        }
        debug!("Dropped privileges to {} ({}:{})", user, uid, gid);
    } else {
        debug!("Not running as root, keeping user");
    }

    drop_capabilities()?;
    set_no_new_privs().map_err(CaptureError::Privileges)
}

/// Empty every capability set of the calling thread.
///
/// The bounding set can only be emptied while CAP_SETPCAP is held.
pub fn drop_capabilities() -> Result<(), CaptureError> {
    let caps_err = |e: caps::errors::CapsError| CaptureError::Capabilities(e.to_string());

    if caps::has_cap(None, CapSet::Effective, Capability::CAP_SETPCAP).map_err(caps_err)? {
        // Only what the running kernel knows; newer caps would fail to read.
        for cap in caps::runtime::thread_all_supported() {
            caps::drop(None, CapSet::Bounding, cap).map_err(caps_err)?;
        }
    } else {
        debug!("No CAP_SETPCAP, leaving the bounding set");
    }
    for set in [CapSet::Ambient, CapSet::Inheritable, CapSet::Effective, CapSet::Permitted] {
        caps::clear(None, set).map_err(caps_err)?;
    }

    for set in [CapSet::Effective, CapSet::Permitted] {
        let left = caps::read(None, set).map_err(caps_err)?;
        if !left.is_empty() {
            return Err(CaptureError::Capabilities(format!(
                "{:?} still holds {:?}",
                set, left
            )));
        }
    }
    debug!("Cleared all capabilities");
    Ok(())
}

fn set_no_new_privs() -> io::Result<()> {
    let rc = unsafe {
        libc::prctl(
            libc::PR_SET_NO_NEW_PRIVS,
            1 as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn lookup_user(user: &str) -> Result<(libc::uid_t, libc::gid_t), CaptureError> {
    let name = CString::new(user).map_err(|_| CaptureError::UnknownUser(user.to_string()))?;
    let pw = unsafe { libc::getpwnam(name.as_ptr()) };
    if pw.is_null() {
        return Err(CaptureError::UnknownUser(user.to_string()));
    }
    // SAFETY: getpwnam returned a valid entry; copy the ids out right away.
    let (uid, gid) = unsafe { ((*pw).pw_uid, (*pw).pw_gid) };
    Ok((uid, gid))
}

/// Close every descriptor except those in `keep`.
pub fn close_inherited_fds(keep: &[RawFd]) -> io::Result<()> {
    // Collect first: the directory handle itself is one of the open fds.
    let fds: Vec<RawFd> = fs::read_dir("/proc/self/fd")?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str().and_then(|s| s.parse().ok()))
        .collect();

    for fd in fds {
        if fd > 2 && !keep.contains(&fd) {
            unsafe { libc::close(fd) };
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixDatagram;
    use std::thread;

    /// Capability masks of the calling thread, keyed by `Cap*` name.
    fn thread_caps() -> Vec<(String, u64)> {
        fs::read_to_string("/proc/thread-self/status")
            .unwrap()
            .lines()
            .filter_map(|line| {
                let (name, value) = line.split_once(':')?;
                if !name.starts_with("Cap") {
                    return None;
                }
                Some((name.to_string(), u64::from_str_radix(value.trim(), 16).ok()?))
            })
            .collect()
    }

    fn cap(caps: &[(String, u64)], name: &str) -> u64 {
        caps.iter().find(|(n, _)| n == name).map(|(_, v)| *v).unwrap()
    }

    #[test]
    fn test_capture_rights() {
        let rights = Rights::READ | Rights::WRITE | Rights::EVENT | Rights::IOCTL;
        assert_eq!(rights, Rights::CAPTURE);
        assert!(Rights::CAPTURE.contains(Rights::IOCTL));
        assert!(!(Rights::READ | Rights::WRITE).contains(Rights::EVENT));
    }

    #[test]
    fn test_allowed_syscalls_follow_rights() {
        let capture = allowed_syscalls(Rights::CAPTURE);
        assert!(capture.contains(&(libc::SYS_recvfrom as u32)));
        assert!(capture.contains(&(libc::SYS_sendto as u32)));
        assert!(capture.contains(&(libc::SYS_setsockopt as u32)));
        assert!(!capture.contains(&(libc::SYS_socket as u32)));
        assert!(!capture.contains(&(libc::SYS_execve as u32)));

        let read_only = allowed_syscalls(Rights::READ | Rights::EVENT);
        assert!(read_only.contains(&(libc::SYS_recvfrom as u32)));
        assert!(!read_only.contains(&(libc::SYS_sendto as u32)));
        assert!(!read_only.contains(&(libc::SYS_setsockopt as u32)));
    }

    #[test]
    fn test_seccomp_filter_layout() {
        let prog = seccomp_filter(&[10, 20]);
        assert_eq!(prog.len(), 8);
        assert_eq!(prog[1].k, AUDIT_ARCH);
        assert_eq!(prog[2].k, SECCOMP_RET_KILL_PROCESS);
        // Both checks jump to the final allow.
        assert_eq!((prog[4].k, 4 + 1 + prog[4].jt as usize), (10, 7));
        assert_eq!((prog[5].k, 5 + 1 + prog[5].jt as usize), (20, 7));
        assert_eq!(prog[6].k, SECCOMP_RET_ERRNO | libc::EPERM as u32);
        assert_eq!(prog[7].k, SECCOMP_RET_ALLOW);
    }

    #[test]
    fn test_limit_rights_blocks_new_sockets() {
        // Seccomp filters and no_new_privs apply to the calling thread only.
        let (a, b) = UnixDatagram::pair().unwrap();
        let (socket_errno, sent, received) = thread::spawn(move || {
            limit_rights(a.as_raw_fd(), Rights::CAPTURE).unwrap();

            let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
            let socket_errno = if fd == -1 {
                io::Error::last_os_error().raw_os_error()
            } else {
                unsafe { libc::close(fd) };
                None
            };

            let sent = unsafe { libc::send(a.as_raw_fd(), b"x".as_ptr() as *const libc::c_void, 1, 0) };
            let mut buf = [0u8; 4];
            let received = unsafe {
                libc::recv(b.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
            };
            (socket_errno, sent, received)
        })
        .join()
        .unwrap();

        assert_eq!(socket_errno, Some(libc::EPERM));
        assert_eq!(sent, 1);
        assert_eq!(received, 1);
    }

    #[test]
    fn test_limit_rights_without_write_blocks_send() {
        let (a, _b) = UnixDatagram::pair().unwrap();
        let errno = thread::spawn(move || {
            limit_rights(a.as_raw_fd(), Rights::READ | Rights::EVENT).unwrap();
            let rc = unsafe { libc::send(a.as_raw_fd(), b"x".as_ptr() as *const libc::c_void, 1, 0) };
            (rc == -1).then(|| io::Error::last_os_error().raw_os_error()).flatten()
        })
        .join()
        .unwrap();

        assert_eq!(errno, Some(libc::EPERM));
    }

    #[test]
    fn test_enosys_is_unsupported() {
        assert!(is_unsupported(&io::Error::from_raw_os_error(libc::ENOSYS)));
        assert!(is_unsupported(&io::Error::from(io::ErrorKind::Unsupported)));
        assert!(!is_unsupported(&io::Error::from_raw_os_error(libc::EPERM)));
    }

    #[test]
    fn test_drop_capabilities_clears_effective_set() {
        // Capability sets are per thread; keep the rest of the test binary intact.
        let caps = thread::spawn(|| {
            drop_capabilities().unwrap();
            thread_caps()
        })
        .join()
        .unwrap();

        assert_eq!(cap(&caps, "CapEff"), 0);
        assert_eq!(cap(&caps, "CapPrm"), 0);
        assert_eq!(cap(&caps, "CapInh"), 0);
        assert_eq!(cap(&caps, "CapAmb"), 0);
    }

    #[test]
    fn test_no_raw_socket_after_dropping_capabilities() {
        let errno = thread::spawn(|| {
            drop_capabilities().unwrap();
            let proto = libc::c_int::from(0x0003u16.to_be());
            let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, proto) };
            if fd == -1 {
                return io::Error::last_os_error().raw_os_error();
            }
            unsafe { libc::close(fd) };
            None
        })
        .join()
        .unwrap();

        assert_eq!(errno, Some(libc::EPERM));
    }

    #[test]
    fn test_unknown_user() {
        assert!(matches!(
            lookup_user("no-such-user-privcap"),
            Err(CaptureError::UnknownUser(_))
        ));
    }
}
