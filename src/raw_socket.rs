//! Raw IP capture sockets.
//!
//! The capture loop only needs "give me the next IPv4 datagram seen on the
//! host", so the OS specifics live behind [`SourceFactory`]:
//!
//! - Linux: `AF_PACKET` / `SOCK_DGRAM` for `ETH_P_IP`. The link header is
//!   stripped, both directions are delivered on every interface.
//! - Windows: raw `IPPROTO_UDP` socket bound to the local address with
//!   `SIO_RCVALL` enabled (requires Administrator).
//! - Other Unix: raw `IPPROTO_UDP` socket bound to the local address.

use crate::error::{MonitorError, Result};
use log::info;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Read};
use std::net::Ipv4Addr;
use std::time::Duration;

/// Upper bound on how long a receive blocks before the loop re-checks for stop.
pub const READ_TIMEOUT: Duration = Duration::from_millis(250);

/// Largest datagram we expect to see.
pub const MAX_DATAGRAM: usize = 65_535;

pub trait PacketSource: Send {
    /// Receive one datagram, IP header first. Times out with `WouldBlock` or
    /// `TimedOut` after at most [`READ_TIMEOUT`].
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

pub trait SourceFactory: Send + Sync {
    fn open(&self, local: Ipv4Addr) -> Result<Box<dyn PacketSource>>;
}

pub fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

pub struct RawSocketFactory;

struct RawSocketSource {
    socket: Socket,
}

impl PacketSource for RawSocketSource {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.read(buf)
    }
}

impl SourceFactory for RawSocketFactory {
    fn open(&self, local: Ipv4Addr) -> Result<Box<dyn PacketSource>> {
        let socket = open_socket(local)?;
        socket
            .set_read_timeout(Some(READ_TIMEOUT))
            .map_err(|source| MonitorError::SocketOption {
                option: "SO_RCVTIMEO",
                source,
            })?;
        Ok(Box::new(RawSocketSource { socket }))
    }
}

fn bind_error(address: Ipv4Addr) -> impl FnOnce(io::Error) -> MonitorError {
    move |source| MonitorError::Bind { address, source }
}

#[cfg(target_os = "linux")]
fn open_socket(local: Ipv4Addr) -> Result<Socket> {
    const ETH_P_IP: u16 = 0x0800;

    let protocol = Protocol::from(i32::from(ETH_P_IP.to_be()));
    let socket = Socket::new(Domain::PACKET, Type::DGRAM, Some(protocol)).map_err(bind_error(local))?;
    info!("Opened packet socket for IPv4 capture, filtering on {}", local);
    Ok(socket)
}

#[cfg(windows)]
fn open_socket(local: Ipv4Addr) -> Result<Socket> {
    use std::net::SocketAddrV4;

    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::UDP)).map_err(bind_error(local))?;
    socket
        .bind(&SocketAddrV4::new(local, 0).into())
        .map_err(bind_error(local))?;
    socket
        .set_header_included(true)
        .map_err(|source| MonitorError::SocketOption {
            option: "IP_HDRINCL",
            source,
        })?;
    enable_receive_all(&socket)?;
    info!("Opened raw socket on {} with SIO_RCVALL", local);
    Ok(socket)
}

#[cfg(windows)]
fn enable_receive_all(socket: &Socket) -> Result<()> {
    use std::ffi::c_void;
    use std::os::windows::io::AsRawSocket;
    use windows::Win32::Networking::WinSock::{WSAIoctl, SIO_RCVALL, SOCKET};

    const RCVALL_ON: u32 = 1;
    let mut returned: u32 = 0;

    let rc = unsafe {
        WSAIoctl(
            SOCKET(socket.as_raw_socket() as usize),
            SIO_RCVALL,
            Some(&RCVALL_ON as *const u32 as *const c_void),
            std::mem::size_of::<u32>() as u32,
            None,
            0,
            &mut returned,
            None,
            None,
        )
    };

    if rc != 0 {
        return Err(MonitorError::SocketOption {
            option: "SIO_RCVALL",
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
fn open_socket(local: Ipv4Addr) -> Result<Socket> {
    use std::net::SocketAddrV4;

    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::UDP)).map_err(bind_error(local))?;
    socket
        .bind(&SocketAddrV4::new(local, 0).into())
        .map_err(bind_error(local))?;
    info!("Opened raw UDP socket on {}", local);
    Ok(socket)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_kinds() {
        assert!(is_timeout(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(is_timeout(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(!is_timeout(&io::Error::from(io::ErrorKind::ConnectionReset)));
    }
}
