//! Byte-stream endpoints for the host channel.
//!
//! Two kinds of endpoint exist: a virtio-serial character device that the
//! hypervisor exposes inside the guest, and an AF_VSOCK listener. Both are
//! driven through [`FdStream`], a raw fd registered with the tokio reactor.
//! This layer moves bytes only; framing lives in the protocol crate.

use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::Poll;

use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;

/// Well-known virtio-serial port locations, probed in order for "auto".
pub const DEVICE_CANDIDATES: &[&str] = &[
    "/dev/virtio-ports/org.guestlink.agent.0",
    "/dev/vport0p1",
    "/dev/vport1p1",
];

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("channel device not found: {0}")]
    DeviceNotFound(String),

    #[error("channel device busy: {}", .0.display())]
    DeviceBusy(PathBuf),

    #[error("vsock unavailable: {0}")]
    VsockUnavailable(std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Pick the device path to open. "auto" probes [`DEVICE_CANDIDATES`].
pub fn resolve_device(configured: &str) -> Result<PathBuf, TransportError> {
    if configured == "auto" {
        return DEVICE_CANDIDATES
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
            .ok_or_else(|| TransportError::DeviceNotFound(DEVICE_CANDIDATES.join(", ")));
    }
    let path = PathBuf::from(configured);
    if path.exists() {
        Ok(path)
    } else {
        Err(TransportError::DeviceNotFound(configured.to_string()))
    }
}

/// Open a channel device non-blocking for use with the tokio reactor.
pub fn open_device(path: &Path) -> Result<FdStream, TransportError> {
    // std sets O_CLOEXEC on every open.
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY)
        .open(path)
        .map_err(|e| match e.raw_os_error() {
            Some(libc::EBUSY) => TransportError::DeviceBusy(path.to_path_buf()),
            Some(libc::ENOENT) => TransportError::DeviceNotFound(path.display().to_string()),
            _ => TransportError::Io(e),
        })?;
    Ok(FdStream::new(OwnedFd::from(file))?)
}

/// Poll until the device shows up and opens. Never gives up.
///
/// The caller owns the backoff and decides when a session earned a reset.
pub async fn wait_for_device(configured: &str, backoff: &mut Backoff) -> (PathBuf, FdStream) {
    let mut logged = false;
    loop {
        match resolve_device(configured).and_then(|p| open_device(&p).map(|s| (p, s))) {
            Ok((path, stream)) => {
                info!(device = %path.display(), "opened channel device");
                return (path, stream);
            }
            Err(e) => {
                if !logged {
                    info!(error = %e, "waiting for channel device");
                    logged = true;
                } else {
                    debug!(error = %e, "channel device still unavailable");
                }
            }
        }
        backoff.wait().await;
    }
}

/// One attached channel.
pub struct Endpoint {
    pub stream: FdStream,
    /// Human-readable peer description for logs.
    pub peer: String,
    /// True when the transport itself proves a host is on the other end
    /// (a vsock accept). A character device gives no such signal.
    pub host_attached: bool,
}

impl Endpoint {
    pub fn device(path: &Path, stream: FdStream) -> Self {
        Self {
            stream,
            peer: format!("device:{}", path.display()),
            host_attached: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Raw fd stream
// ---------------------------------------------------------------------------

/// An async stream backed by `AsyncFd<OwnedFd>` with raw read/write.
///
/// Used for both virtio-serial devices and vsock sockets. Neither can be
/// wrapped in `tokio::net::UnixStream`, which expects `AF_UNIX` semantics.
pub struct FdStream {
    inner: AsyncFd<OwnedFd>,
}

impl FdStream {
    pub fn new(fd: OwnedFd) -> std::io::Result<Self> {
        let inner = AsyncFd::new(fd)?;
        Ok(Self { inner })
    }
}

impl AsyncRead for FdStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            let mut guard = match self.inner.poll_read_ready(cx) {
                Poll::Ready(Ok(guard)) => guard,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };

            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| {
                let fd = inner.get_ref().as_raw_fd();
                let n = unsafe {
                    libc::read(fd, unfilled.as_mut_ptr() as *mut libc::c_void, unfilled.len())
                };
                if n >= 0 {
                    Ok(n as usize)
                } else {
                    Err(std::io::Error::last_os_error())
                }
            }) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for FdStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        loop {
            let mut guard = match self.inner.poll_write_ready(cx) {
                Poll::Ready(Ok(guard)) => guard,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };

            match guard.try_io(|inner| {
                let fd = inner.get_ref().as_raw_fd();
                let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
                if n >= 0 {
                    Ok(n as usize)
                } else {
                    Err(std::io::Error::last_os_error())
                }
            }) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        // Character devices have no half-close; dropping the fd is enough.
        Poll::Ready(Ok(()))
    }
}

// ---------------------------------------------------------------------------
// Vsock listener
// ---------------------------------------------------------------------------

const AF_VSOCK: i32 = 40;
const VMADDR_CID_ANY: u32 = u32::MAX;

#[repr(C)]
struct SockaddrVm {
    svm_family: u16,
    svm_reserved1: u16,
    svm_port: u32,
    svm_cid: u32,
    svm_flags: u8,
    svm_zero: [u8; 3],
}

/// A vsock listener that accepts connections using raw syscalls.
pub struct VsockListener {
    async_fd: AsyncFd<OwnedFd>,
    port: u32,
}

impl VsockListener {
    pub fn bind(port: u32) -> Result<Self, TransportError> {
        let fd = unsafe {
            libc::socket(
                AF_VSOCK,
                libc::SOCK_STREAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                0,
            )
        };
        if fd < 0 {
            return Err(TransportError::VsockUnavailable(
                std::io::Error::last_os_error(),
            ));
        }
        // Owned from here so every early return closes it.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };

        let addr = SockaddrVm {
            svm_family: AF_VSOCK as u16,
            svm_reserved1: 0,
            svm_port: port,
            svm_cid: VMADDR_CID_ANY,
            svm_flags: 0,
            svm_zero: [0; 3],
        };

        let ret = unsafe {
            libc::bind(
                owned.as_raw_fd(),
                &addr as *const SockaddrVm as *const libc::sockaddr,
                std::mem::size_of::<SockaddrVm>() as u32,
            )
        };
        if ret < 0 {
            return Err(TransportError::VsockUnavailable(
                std::io::Error::last_os_error(),
            ));
        }

        let ret = unsafe { libc::listen(owned.as_raw_fd(), 16) };
        if ret < 0 {
            return Err(TransportError::VsockUnavailable(
                std::io::Error::last_os_error(),
            ));
        }

        let async_fd = AsyncFd::new(owned)?;
        Ok(Self { async_fd, port })
    }

    pub fn port(&self) -> u32 {
        self.port
    }

    /// Accept one host connection. The accept itself is the host-attached
    /// signal, so the endpoint is marked accordingly.
    pub async fn accept(&self) -> Result<Endpoint, TransportError> {
        loop {
            let mut guard = self.async_fd.readable().await?;

            match guard.try_io(|inner| {
                let client_fd = unsafe {
                    libc::accept4(
                        inner.get_ref().as_raw_fd(),
                        std::ptr::null_mut(),
                        std::ptr::null_mut(),
                        libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                    )
                };
                if client_fd >= 0 {
                    Ok(client_fd)
                } else {
                    Err(std::io::Error::last_os_error())
                }
            }) {
                Ok(Ok(client_fd)) => {
                    let owned = unsafe { OwnedFd::from_raw_fd(client_fd) };
                    let peer_cid = peer_cid(&owned);
                    let stream = FdStream::new(owned)?;
                    return Ok(Endpoint {
                        stream,
                        peer: format!("vsock:cid={peer_cid}"),
                        host_attached: true,
                    });
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }
}

fn peer_cid(fd: &OwnedFd) -> u32 {
    let mut peer_addr: SockaddrVm = unsafe { std::mem::zeroed() };
    let mut addr_len = std::mem::size_of::<SockaddrVm>() as u32;
    let ret = unsafe {
        libc::getpeername(
            fd.as_raw_fd(),
            &mut peer_addr as *mut SockaddrVm as *mut libc::sockaddr,
            &mut addr_len,
        )
    };
    if ret == 0 {
        peer_addr.svm_cid
    } else {
        0
    }
}

/// Bind the vsock listener. Never gives up: the transport modules are
/// loaded after the first failure, then binding is retried under `backoff`.
pub async fn wait_for_vsock(port: u32, backoff: &mut Backoff) -> VsockListener {
    retry_bind(|| VsockListener::bind(port), load_vsock_modules, backoff).await
}

async fn retry_bind<T>(
    mut bind: impl FnMut() -> Result<T, TransportError>,
    prepare: impl FnOnce(),
    backoff: &mut Backoff,
) -> T {
    let mut prepare = Some(prepare);
    let mut logged = false;
    loop {
        match bind() {
            Ok(bound) => return bound,
            Err(e) => {
                if let Some(prepare) = prepare.take() {
                    info!(error = %e, "vsock not available, loading kernel modules");
                    prepare();
                    continue;
                }
                if !logged {
                    warn!(error = %e, "vsock bind failed, retrying");
                    logged = true;
                } else {
                    debug!(error = %e, "vsock still unavailable");
                }
            }
        }
        backoff.wait().await;
    }
}

fn load_vsock_modules() {
    for module in ["vsock", "vmw_vsock_virtio_transport_common", "vmw_vsock_virtio_transport"] {
        match std::process::Command::new("modprobe").arg(module).output() {
            Ok(output) if output.status.success() => info!(module, "loaded kernel module"),
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!(module, error = %stderr.trim(), "modprobe failed");
            }
            Err(e) => warn!(module, error = %e, "failed to run modprobe"),
        }
    }
    match std::fs::read_to_string("/sys/class/vsock/local_cid") {
        Ok(cid) => info!(local_cid = %cid.trim(), "vsock transport active"),
        Err(e) => warn!(error = %e, "cannot read vsock local CID"),
    }
}
