//! Where a guest agent can be reached from the host.
//!
//! Hypervisors expose the guest's virtio-serial port as a unix socket on
//! the host. Vsock-capable setups are reached by CID and port instead.

use std::fmt;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::PathBuf;
use std::pin::Pin;
use std::str::FromStr;
use std::task::Poll;

use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::{ClientError, Result};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentAddress {
    Unix(PathBuf),
    Vsock { cid: u32, port: u32 },
}

impl fmt::Display for AgentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentAddress::Unix(path) => write!(f, "unix:{}", path.display()),
            AgentAddress::Vsock { cid, port } => write!(f, "vsock:{cid}:{port}"),
        }
    }
}

/// Accepts `unix:/path`, `vsock:CID:PORT`, `vsock:CID` (default port) or a
/// bare absolute path.
impl FromStr for AgentAddress {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("vsock:") {
            let (cid, port) = match rest.split_once(':') {
                Some((cid, port)) => (cid, Some(port)),
                None => (rest, None),
            };
            let cid = cid.parse().map_err(|_| format!("invalid vsock CID: {cid}"))?;
            let port = match port {
                Some(p) => p.parse().map_err(|_| format!("invalid vsock port: {p}"))?,
                None => guestlink_protocol::GUEST_AGENT_PORT,
            };
            return Ok(AgentAddress::Vsock { cid, port });
        }
        let path = s.strip_prefix("unix:").unwrap_or(s);
        if path.starts_with('/') {
            Ok(AgentAddress::Unix(PathBuf::from(path)))
        } else {
            Err(format!("expected unix:/path or vsock:CID[:PORT], got {s}"))
        }
    }
}

pub async fn connect(address: &AgentAddress) -> Result<(BoxedReader, BoxedWriter)> {
    match address {
        AgentAddress::Unix(path) => {
            let stream = tokio::net::UnixStream::connect(path).await?;
            let (reader, writer) = stream.into_split();
            Ok((Box::new(reader), Box::new(writer)))
        }
        AgentAddress::Vsock { cid, port } => {
            let (cid, port) = (*cid, *port);
            let fd = tokio::task::spawn_blocking(move || vsock_connect(cid, port))
                .await
                .map_err(|e| ClientError::Io(std::io::Error::other(e)))??;
            let stream = VsockStream {
                fd: AsyncFd::new(fd)?,
            };
            let (reader, writer) = tokio::io::split(stream);
            Ok((Box::new(reader), Box::new(writer)))
        }
    }
}

const AF_VSOCK: i32 = 40;

// sockaddr_vm layout per include/uapi/linux/vm_sockets.h
#[repr(C)]
struct SockaddrVm {
    svm_family: libc::sa_family_t,
    svm_reserved1: u16,
    svm_port: u32,
    svm_cid: u32,
    svm_flags: u8,
    svm_zero: [u8; 3],
}

fn check(ret: libc::c_int) -> std::io::Result<()> {
    if ret < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn byte_count(n: libc::ssize_t) -> std::io::Result<usize> {
    usize::try_from(n).map_err(|_| std::io::Error::last_os_error())
}

/// Blocking connect, then switch to non-blocking for the reactor.
fn vsock_connect(cid: u32, port: u32) -> std::io::Result<OwnedFd> {
    let raw = unsafe { libc::socket(AF_VSOCK, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    check(raw)?;
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    let addr = SockaddrVm {
        svm_family: AF_VSOCK as libc::sa_family_t,
        svm_reserved1: 0,
        svm_port: port,
        svm_cid: cid,
        svm_flags: 0,
        svm_zero: [0; 3],
    };
    check(unsafe {
        libc::connect(
            fd.as_raw_fd(),
            std::ptr::addr_of!(addr).cast::<libc::sockaddr>(),
            std::mem::size_of::<SockaddrVm>() as libc::socklen_t,
        )
    })?;
    check(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, libc::O_NONBLOCK) })?;
    Ok(fd)
}

/// Vsock fds cannot go through `tokio::net::UnixStream`, so reads and
/// writes are issued directly against the fd.
struct VsockStream {
    fd: AsyncFd<OwnedFd>,
}

impl AsyncRead for VsockStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            let mut ready = std::task::ready!(self.fd.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            let result = ready.try_io(|fd| {
                byte_count(unsafe {
                    libc::read(fd.as_raw_fd(), unfilled.as_mut_ptr().cast(), unfilled.len())
                })
            });
            if let Ok(read) = result {
                let n = read?;
                buf.advance(n);
                return Poll::Ready(Ok(()));
            }
        }
    }
}

impl AsyncWrite for VsockStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        loop {
            let mut ready = std::task::ready!(self.fd.poll_write_ready(cx))?;
            let result = ready.try_io(|fd| {
                byte_count(unsafe { libc::write(fd.as_raw_fd(), buf.as_ptr().cast(), buf.len()) })
            });
            if let Ok(written) = result {
                return Poll::Ready(written);
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut std::task::Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Ready(check(unsafe {
            libc::shutdown(self.fd.get_ref().as_raw_fd(), libc::SHUT_WR)
        }))
    }
}
