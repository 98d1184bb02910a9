//! Unix plumbing the standard library doesn't expose: restricted socket
//! creation, non-blocking connects, peer credentials and child reaping.
use std::io;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::ptr;

/// Credentials of the process at the other end of a Unix stream socket,
/// as authenticated by the kernel.
#[derive(Debug, Clone, Copy)]
pub struct PeerCredentials {
    pub uid: libc::uid_t,
    pub pid: libc::pid_t,
}

/// Outcome of a non-blocking connect.
#[derive(Debug)]
pub enum Connect {
    /// The connect completed synchronously.
    Ready(UnixStream),
    /// The connect is in progress; completion is signalled by
    /// write-readiness on the stream.
    Pending(UnixStream),
}

/// Fill in a `sockaddr_un` for the given filesystem path.
fn socket_addr(path: &Path) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = path.as_os_str().as_bytes();
    // One byte is reserved for the nul terminator.
    if bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "socket path too long",
        ));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes.iter()) {
        *dst = *src as libc::c_char;
    }
    let len = (bytes.len() + mem::size_of::<libc::sa_family_t>()) as libc::socklen_t;

    Ok((addr, len))
}

/// Create a non-blocking, close-on-exec Unix stream socket.
fn stream_socket() -> io::Result<RawFd> {
    let fd = unsafe {
        libc::socket(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Bind a listening socket at `path`, owner-only. A stale socket left at
/// the path by a previous run is removed first. The mode is set on the
/// socket before `bind`, so the file is never visible with looser
/// permissions.
pub fn bind(path: &Path, backlog: libc::c_int) -> io::Result<UnixListener> {
    let (addr, len) = socket_addr(path)?;
    // Wrapped immediately so the descriptor is closed on any error path.
    let listener = unsafe { UnixListener::from_raw_fd(stream_socket()?) };

    if unsafe { libc::fchmod(listener.as_raw_fd(), 0o700) } == -1 {
        return Err(io::Error::last_os_error());
    }

    let _ = std::fs::remove_file(path);

    if unsafe {
        libc::bind(
            listener.as_raw_fd(),
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            len,
        )
    } == -1
    {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::listen(listener.as_raw_fd(), backlog) } == -1 {
        return Err(io::Error::last_os_error());
    }

    Ok(listener)
}

/// Start a non-blocking connect to the stream socket at `path`.
pub fn connect(path: &Path) -> io::Result<Connect> {
    let (addr, len) = socket_addr(path)?;
    let stream = unsafe { UnixStream::from_raw_fd(stream_socket()?) };

    let result = unsafe {
        libc::connect(
            stream.as_raw_fd(),
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            len,
        )
    };
    if result == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINPROGRESS) {
            return Ok(Connect::Pending(stream));
        }
        return Err(err);
    }
    Ok(Connect::Ready(stream))
}

/// Look up the credentials of the peer connected to `stream`.
pub fn peer_credentials(stream: &UnixStream) -> io::Result<PeerCredentials> {
    let mut ucred: libc::ucred = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::ucred>() as libc::socklen_t;

    if unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut ucred as *mut libc::ucred as *mut libc::c_void,
            &mut len,
        )
    } == -1
    {
        return Err(io::Error::last_os_error());
    }

    Ok(PeerCredentials {
        uid: ucred.uid,
        pid: ucred.pid,
    })
}

/// The real user id of this process.
pub fn user_id() -> libc::uid_t {
    unsafe { libc::getuid() }
}

/// Arrange for terminated children to be reaped by the kernel, with no
/// signal delivered. The poll loop is never interrupted by notifier exits
/// and no zombies accumulate.
pub fn reap_children_automatically() -> io::Result<()> {
    let mut sa: libc::sigaction = unsafe { mem::zeroed() };
    sa.sa_sigaction = libc::SIG_IGN;
    sa.sa_flags = libc::SA_NOCLDSTOP | libc::SA_NOCLDWAIT | libc::SA_RESTART;

    if unsafe { libc::sigaction(libc::SIGCHLD, &sa, ptr::null_mut()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn peer_credentials_report_our_own_process() {
        let (local, remote) = UnixStream::pair().unwrap();
        let creds = peer_credentials(&local).unwrap();

        assert_eq!(creds.uid, user_id());
        assert_eq!(creds.pid as u32, std::process::id());

        drop(remote);
    }

    #[test]
    fn bound_socket_is_restricted_to_the_owner() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("relay.sock");
        let _listener = bind(&path, 5).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn binding_replaces_a_stale_socket() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("relay.sock");

        let listener = bind(&path, 5).unwrap();
        drop(listener); // leaves the socket file behind

        assert!(path.exists());
        bind(&path, 5).unwrap();
    }

    #[test]
    fn overlong_paths_are_rejected() {
        let mut path = std::path::PathBuf::from("/tmp");
        path.push("x".repeat(200));

        let err = bind(&path, 5).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn connect_fails_when_no_socket_exists() {
        let tmp = tempfile::tempdir().unwrap();
        let err = connect(&tmp.path().join("absent.sock")).unwrap_err();

        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn connect_resolves_for_a_listening_socket() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("agent.sock");
        let _listener = bind(&path, 5).unwrap();

        // A local connect with backlog room completes synchronously.
        match connect(&path).unwrap() {
            Connect::Ready(_) => {}
            Connect::Pending(_) => panic!("expected a synchronous connect"),
        }
    }
}
