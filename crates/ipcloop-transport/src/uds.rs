use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::traits::{ConnectStatus, Connection, Listener, Transport};

/// Maximum socket path length.
/// Unix `sockaddr_un.sun_path` is typically 108 bytes on Linux, 104 on macOS.
#[cfg(target_os = "linux")]
pub const MAX_PATH_LEN: usize = 108;
#[cfg(not(target_os = "linux"))]
pub const MAX_PATH_LEN: usize = 104;

/// Unix domain socket transport.
///
/// Addresses are filesystem paths. Listeners remove stale sockets left behind
/// by a previous run before binding, and remove their own socket file on drop.
#[derive(Debug, Clone)]
pub struct UdsTransport {
    socket_mode: u32,
}

impl UdsTransport {
    /// Default permission mode for created socket paths.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;

    /// Transport creating sockets with the default `0o600` mode.
    pub fn new() -> Self {
        Self::with_socket_mode(Self::DEFAULT_SOCKET_MODE)
    }

    /// Transport creating sockets with an explicit permission mode.
    pub fn with_socket_mode(socket_mode: u32) -> Self {
        Self { socket_mode }
    }

    /// Permission mode applied to bound socket paths.
    pub fn socket_mode(&self) -> u32 {
        self.socket_mode
    }
}

impl Default for UdsTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for UdsTransport {
    fn name(&self) -> &'static str {
        "unix-domain-socket"
    }

    fn validate_address(&self, address: &Path) -> Result<()> {
        validate_path(address)
    }

    fn listen(&self, address: &Path) -> Result<Box<dyn Listener>> {
        let listener = UnixDomainSocket::bind_with_mode(address, self.socket_mode)?;
        Ok(Box::new(listener))
    }

    fn connect(&self, address: &Path) -> Result<(Box<dyn Connection>, ConnectStatus)> {
        let (stream, status) = UdsConnection::connect(address)?;
        Ok((Box::new(stream), status))
    }
}

/// Reject paths that cannot fit into `sockaddr_un`.
pub fn validate_path(path: &Path) -> Result<()> {
    let bytes = path.as_os_str().as_bytes();
    if bytes.is_empty() {
        return Err(TransportError::InvalidAddress {
            path: path.to_path_buf(),
            reason: "empty path",
        });
    }
    if bytes.contains(&0) {
        return Err(TransportError::InvalidAddress {
            path: path.to_path_buf(),
            reason: "path contains a NUL byte",
        });
    }
    if bytes.len() >= MAX_PATH_LEN {
        return Err(TransportError::PathTooLong {
            path: path.to_path_buf(),
            len: bytes.len(),
            max: MAX_PATH_LEN,
        });
    }
    Ok(())
}

/// A non-blocking listening Unix domain socket.
pub struct UnixDomainSocket {
    listener: UnixListener,
    path: PathBuf,
    created_inode: Option<(u64, u64)>,
}

impl UnixDomainSocket {
    /// Bind and listen on a filesystem-path Unix domain socket.
    ///
    /// If the file already exists and is a socket, it is removed first
    /// (stale socket cleanup). Non-socket files are never removed.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_with_mode(path, UdsTransport::DEFAULT_SOCKET_MODE)
    }

    /// Bind and listen with an explicit permission mode.
    pub fn bind_with_mode(path: impl AsRef<Path>, mode: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        validate_path(&path)?;

        let bind_err = |source: std::io::Error| TransportError::Bind {
            path: path.clone(),
            source,
        };

        if let Ok(metadata) = std::fs::symlink_metadata(&path) {
            if metadata.file_type().is_socket() {
                debug!(?path, "removing stale socket");
                std::fs::remove_file(&path).map_err(bind_err)?;
            } else {
                return Err(bind_err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "existing path is not a unix socket",
                )));
            }
        }

        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .map_err(bind_err)?;
        let created = std::fs::symlink_metadata(&path).map_err(bind_err)?;

        info!(?path, "listening on unix domain socket");

        Ok(Self {
            listener,
            created_inode: Some((created.dev(), created.ino())),
            path,
        })
    }

    /// The path this socket is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Listener for UnixDomainSocket {
    fn accept(&self) -> std::io::Result<Box<dyn Connection>> {
        let (stream, _addr) = self.listener.accept()?;
        stream.set_nonblocking(true)?;
        debug!(path = ?self.path, "accepted connection");
        Ok(Box::new(UdsConnection { stream }))
    }

    fn raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

impl std::fmt::Debug for UnixDomainSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnixDomainSocket")
            .field("path", &self.path)
            .field("fd", &self.listener.as_raw_fd())
            .finish()
    }
}

impl Drop for UnixDomainSocket {
    fn drop(&mut self) {
        let Some((expected_dev, expected_ino)) = self.created_inode else {
            return;
        };
        if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
            if metadata.file_type().is_socket()
                && metadata.dev() == expected_dev
                && metadata.ino() == expected_ino
            {
                debug!(path = ?self.path, "cleaning up socket file");
                let _ = std::fs::remove_file(&self.path);
            } else {
                debug!(
                    path = ?self.path,
                    "socket path identity changed; skipping cleanup"
                );
            }
        }
    }
}

/// A non-blocking Unix domain socket stream.
#[derive(Debug)]
pub struct UdsConnection {
    stream: UnixStream,
}

impl UdsConnection {
    /// Start a non-blocking connect to `path`.
    ///
    /// Local sockets usually complete immediately; `EINPROGRESS` yields
    /// [`ConnectStatus::InProgress`]. A full listen backlog (`EAGAIN`) and a
    /// missing or refusing listener are reported as errors.
    pub fn connect(path: impl AsRef<Path>) -> Result<(Self, ConnectStatus)> {
        let path = path.as_ref();
        validate_path(path)?;
        let connect_err = |source: std::io::Error| TransportError::Connect {
            path: path.to_path_buf(),
            source,
        };

        let (addr, addr_len) = sockaddr_un(path).map_err(connect_err)?;

        // SAFETY: socket(2) takes no pointers; the result is checked below.
        let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            return Err(connect_err(std::io::Error::last_os_error()));
        }
        // SAFETY: `fd` was just returned by socket(2) and is owned by nothing else.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        set_cloexec(owned.as_raw_fd()).map_err(connect_err)?;

        let stream = UnixStream::from(owned);
        stream.set_nonblocking(true).map_err(connect_err)?;

        // SAFETY: `addr` is a fully initialised sockaddr_un and `addr_len` does
        // not exceed its size; `stream` keeps the descriptor open for the call.
        let rc = unsafe {
            libc::connect(
                stream.as_raw_fd(),
                (&addr as *const libc::sockaddr_un).cast::<libc::sockaddr>(),
                addr_len,
            )
        };
        if rc == 0 {
            debug!(?path, "connected to unix domain socket");
            return Ok((Self { stream }, ConnectStatus::Connected));
        }

        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINPROGRESS) {
            debug!(?path, "connect in progress");
            return Ok((Self { stream }, ConnectStatus::InProgress));
        }
        Err(connect_err(err))
    }

    /// Wrap an already connected stream, switching it to non-blocking mode.
    pub fn from_stream(stream: UnixStream) -> std::io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self { stream })
    }
}

impl Read for UdsConnection {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for UdsConnection {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.stream.flush()
    }
}

impl Connection for UdsConnection {
    fn take_error(&self) -> std::io::Result<Option<std::io::Error>> {
        self.stream.take_error()
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

fn sockaddr_un(path: &Path) -> std::io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    let bytes = path.as_os_str().as_bytes();

    // SAFETY: sockaddr_un is plain old data; all-zero is a valid value.
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    if bytes.len() >= addr.sun_path.len() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "path does not fit into sockaddr_un",
        ));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    let len = std::mem::offset_of!(libc::sockaddr_un, sun_path) + bytes.len() + 1;
    Ok((addr, len as libc::socklen_t))
}

fn set_cloexec(fd: RawFd) -> std::io::Result<()> {
    // SAFETY: fcntl(2) on a descriptor we own; no pointers involved.
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;
    use std::time::{Duration, Instant};

    fn test_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "ipcloop-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .subsec_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn accept_within(listener: &UnixDomainSocket, timeout: Duration) -> Box<dyn Connection> {
        let start = Instant::now();
        loop {
            match listener.accept() {
                Ok(conn) => return conn,
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    assert!(start.elapsed() < timeout, "accept timed out");
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(err) => panic!("accept failed: {err}"),
            }
        }
    }

    fn read_exact_nonblocking(conn: &mut dyn Connection, buf: &mut [u8]) {
        let start = Instant::now();
        let mut filled = 0;
        while filled < buf.len() {
            match conn.read(&mut buf[filled..]) {
                Ok(0) => panic!("unexpected eof"),
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    assert!(start.elapsed() < Duration::from_secs(2), "read timed out");
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(err) => panic!("read failed: {err}"),
            }
        }
    }

    #[test]
    fn test_bind_accept_connect() {
        let dir = test_dir("uds");
        let sock_path = dir.join("test.sock");

        let listener = UnixDomainSocket::bind(&sock_path).unwrap();
        assert!(sock_path.exists());

        let (mut client, status) = UdsConnection::connect(&sock_path).unwrap();
        assert!(matches!(
            status,
            ConnectStatus::Connected | ConnectStatus::InProgress
        ));

        let mut server = accept_within(&listener, Duration::from_secs(2));
        assert!(client.take_error().unwrap().is_none());
        client.write_all(b"hello").unwrap();

        let mut buf = [0u8; 5];
        read_exact_nonblocking(server.as_mut(), &mut buf);
        assert_eq!(&buf, b"hello");

        drop(listener);
        assert!(
            !sock_path.exists(),
            "socket file should be cleaned up on drop"
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_accept_would_block_without_pending_client() {
        let dir = test_dir("uds-idle");
        let listener = UnixDomainSocket::bind(dir.join("idle.sock")).unwrap();

        let err = listener.accept().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_read_would_block_on_idle_connection() {
        let (left, _right) = UnixStream::pair().unwrap();
        let mut conn = UdsConnection::from_stream(left).unwrap();

        let mut buf = [0u8; 8];
        let err = conn.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
    }

    #[test]
    fn test_connect_without_listener_fails() {
        let dir = test_dir("uds-missing");
        let result = UdsConnection::connect(dir.join("missing.sock"));
        assert!(matches!(result, Err(TransportError::Connect { .. })));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_path_too_long() {
        let long_path = "/tmp/".to_string() + &"a".repeat(200) + ".sock";
        let result = UnixDomainSocket::bind(&long_path);
        assert!(matches!(result, Err(TransportError::PathTooLong { .. })));

        let transport = UdsTransport::new();
        assert!(matches!(
            transport.validate_address(Path::new(&long_path)),
            Err(TransportError::PathTooLong { .. })
        ));
    }

    #[test]
    fn test_empty_path_rejected() {
        let result = validate_path(Path::new(""));
        assert!(matches!(result, Err(TransportError::InvalidAddress { .. })));
    }

    #[test]
    fn test_bind_default_permissions_hardened() {
        let dir = test_dir("uds-perms");
        let sock_path = dir.join("perm.sock");

        let listener = UnixDomainSocket::bind(&sock_path).unwrap();
        let mode = std::fs::metadata(&sock_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_bind_removes_stale_socket() {
        let dir = test_dir("uds-stale");
        let sock_path = dir.join("stale.sock");

        // A std listener leaves its socket file behind when dropped.
        drop(UnixListener::bind(&sock_path).unwrap());
        assert!(sock_path.exists());

        let listener = UnixDomainSocket::bind(&sock_path).unwrap();
        assert_eq!(listener.path(), sock_path.as_path());

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_bind_rejects_existing_non_socket_file() {
        let dir = test_dir("uds-file");
        let sock_path = dir.join("not-a-socket.sock");
        std::fs::write(&sock_path, b"regular-file").unwrap();

        let result = UnixDomainSocket::bind(&sock_path);
        assert!(matches!(result, Err(TransportError::Bind { .. })));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_drop_does_not_remove_replaced_path() {
        let dir = test_dir("uds-drop");
        let sock_path = dir.join("drop.sock");

        let listener = UnixDomainSocket::bind(&sock_path).unwrap();
        std::fs::remove_file(&sock_path).unwrap();
        std::fs::write(&sock_path, b"replacement-file").unwrap();

        drop(listener);
        assert!(
            sock_path.exists(),
            "drop must not remove path if inode identity changed"
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_transport_listen_and_connect() {
        let dir = test_dir("uds-transport");
        let sock_path = dir.join("t.sock");
        let transport = UdsTransport::default();
        assert_eq!(transport.socket_mode(), 0o600);

        let listener = transport.listen(&sock_path).unwrap();
        assert!(listener.raw_fd() >= 0);

        let (client, _status) = transport.connect(&sock_path).unwrap();
        assert!(client.raw_fd() >= 0);

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
