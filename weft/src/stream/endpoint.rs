use bitflags::bitflags;
use std::io;
use std::net::TcpStream;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;

bitflags! {
    /// Directions of a duplex endpoint to half-close.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct Shutdown: u8 {
        const READ = 1;
        const WRITE = 1 << 1;
        const BOTH = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// A non-blocking byte endpoint a [`Stream`] can wrap: readiness comes from
/// the raw fd, data moves through `read`/`write`, and each direction can be
/// closed independently.
///
/// Implementors must already be in non-blocking mode; the stream layer
/// treats `WouldBlock` as back-pressure, never as an error.
///
/// [`Stream`]: crate::stream::Stream
pub trait Endpoint: AsRawFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn shutdown(&mut self, how: Shutdown) -> io::Result<()>;
}

/// Endpoint over a raw owned fd (pipes, socketpairs, pre-connected
/// sockets).
#[derive(Debug)]
pub struct FdEndpoint {
    fd: OwnedFd,
}

impl FdEndpoint {
    pub fn new(fd: OwnedFd) -> Self {
        FdEndpoint { fd }
    }
}

impl From<OwnedFd> for FdEndpoint {
    fn from(fd: OwnedFd) -> Self {
        FdEndpoint::new(fd)
    }
}

impl AsRawFd for FdEndpoint {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.fd.as_raw_fd()
    }
}

impl Endpoint for FdEndpoint {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        let how = if how.contains(Shutdown::BOTH) {
            libc::SHUT_RDWR
        } else if how.contains(Shutdown::WRITE) {
            libc::SHUT_WR
        } else {
            libc::SHUT_RD
        };
        let rc = unsafe { libc::shutdown(self.fd.as_raw_fd(), how) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // Pipes have no half-close; dropping the fd later closes them.
            if err.raw_os_error() == Some(libc::ENOTSOCK) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }
}

fn to_net_shutdown(how: Shutdown) -> std::net::Shutdown {
    if how.contains(Shutdown::BOTH) {
        std::net::Shutdown::Both
    } else if how.contains(Shutdown::WRITE) {
        std::net::Shutdown::Write
    } else {
        std::net::Shutdown::Read
    }
}

impl Endpoint for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(self, buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(self, buf)
    }

    fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        TcpStream::shutdown(self, to_net_shutdown(how))
    }
}

impl Endpoint for UnixStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(self, buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(self, buf)
    }

    fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        UnixStream::shutdown(self, to_net_shutdown(how))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};

    fn pair() -> (FdEndpoint, FdEndpoint) {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_NONBLOCK,
        )
        .expect("socketpair");
        (FdEndpoint::new(a), FdEndpoint::new(b))
    }

    #[test]
    fn test_fd_endpoint_roundtrip() {
        let (mut a, mut b) = pair();
        assert_eq!(a.write(b"ping").unwrap(), 4);
        let mut buf = [0u8; 16];
        assert_eq!(b.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");
    }

    #[test]
    fn test_empty_read_would_block() {
        let (mut a, _b) = pair();
        let mut buf = [0u8; 4];
        let err = a.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_write_shutdown_gives_peer_eof() {
        let (mut a, mut b) = pair();
        a.shutdown(Shutdown::WRITE).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(b.read(&mut buf).unwrap(), 0);
    }
}
