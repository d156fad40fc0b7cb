use anyhow::{Context, Result, anyhow};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use crate::probe::interface::{InterfaceInfo, bind_socket_to_interface};
use crate::probe::timestamp::{TimestampMode, TxStamp, wall_clock_nanos};

/// Buffer size for ancillary data (timestamps)
const CMSG_BUFFER_SIZE: usize = 256;

/// Requested kernel receive buffer
const RECV_BUFFER_BYTES: usize = 1024 * 1024;

/// Error-queue reads per drain, so a flooded queue cannot stall a round
const MAX_TX_STAMPS_PER_DRAIN: usize = 64;

/// Options applied when opening the probe socket
#[derive(Debug, Clone, Default)]
pub struct SocketOptions {
    /// Read deadline; bounds how long the receiver can miss a shutdown
    pub read_timeout: Duration,
    /// Upper bound on a single send call
    pub write_timeout: Duration,
    /// IP Type-of-Service byte
    pub tos: Option<u8>,
    /// Device to bind to
    pub interface: Option<InterfaceInfo>,
}

/// A datagram read from the socket
#[derive(Debug, Clone, Copy)]
pub struct Received {
    pub len: usize,
    pub source: Ipv4Addr,
    /// Kernel timestamp if available, else wall clock at syscall return (ns)
    pub timestamp_ns: i64,
}

/// The single ICMP socket shared by sender and receiver
///
/// Datagram sockets allow concurrent `send_to` and `recvmsg` from different
/// threads, so this is shared behind an `Arc` without a lock.
#[derive(Debug)]
pub struct ProbeSocket {
    socket: Socket,
    /// True if SOCK_DGRAM (no IP header in received packets)
    is_dgram: bool,
    timestamps: TimestampMode,
}

/// Create a raw ICMP socket
pub fn create_raw_icmp_socket() -> io::Result<Socket> {
    Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))
}

/// Create an unprivileged IPv4 ICMP socket (SOCK_DGRAM)
pub fn create_dgram_icmp_socket() -> io::Result<Socket> {
    Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4))
}

impl ProbeSocket {
    /// Open the probe socket, preferring RAW and falling back to DGRAM
    pub fn open(options: &SocketOptions) -> Result<Self> {
        let (socket, is_dgram) = match create_raw_icmp_socket() {
            Ok(socket) => (socket, false),
            Err(raw_err) => match create_dgram_icmp_socket() {
                Ok(socket) => {
                    tracing::warn!(
                        error = %raw_err,
                        "raw ICMP socket unavailable, using unprivileged ICMP socket"
                    );
                    (socket, true)
                }
                Err(_) => return Err(permission_error(raw_err)),
            },
        };

        configure(&socket, options)?;

        if let Some(ref info) = options.interface {
            bind_socket_to_interface(&socket, info)?;
        }

        let timestamps = TimestampMode::negotiate(&socket);

        Ok(Self {
            socket,
            is_dgram,
            timestamps,
        })
    }

    pub fn is_dgram(&self) -> bool {
        self.is_dgram
    }

    pub fn timestamp_mode(&self) -> TimestampMode {
        self.timestamps
    }

    /// Send one ICMP packet to `target`
    pub fn send_to(&self, packet: &[u8], target: Ipv4Addr) -> io::Result<usize> {
        let addr = SockAddr::from(SocketAddr::new(IpAddr::V4(target), 0));
        self.socket.send_to(packet, &addr)
    }

    /// Receive one datagram along with its best available timestamp
    ///
    /// Blocks at most for the configured read timeout.
    pub fn recv(&self, buffer: &mut [u8]) -> io::Result<Received> {
        let mut cmsg_buf = [0u8; CMSG_BUFFER_SIZE];
        let mut src_storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };

        let (len, control_len) =
            recvmsg_raw(&self.socket, buffer, &mut cmsg_buf, Some(&mut src_storage), 0)?;
        let wall_clock = wall_clock_nanos();

        let source = parse_sockaddr_v4(&src_storage)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-IPv4 source"))?;
        let timestamp_ns = self.timestamps.resolve(&cmsg_buf[..control_len], wall_clock);

        Ok(Received {
            len,
            source,
            timestamp_ns,
        })
    }

    /// Read every transmit stamp currently queued on the error queue
    ///
    /// Non-blocking: stops at the first empty read. Each stamp carries the
    /// kernel's send counter so the caller can match it to its own send.
    pub fn drain_tx_stamps(&self) -> Vec<TxStamp> {
        if !self.timestamps.tx_enabled() {
            return Vec::new();
        }
        drain_tx_stamps(&self.socket)
    }
}

/// Send side of the probe socket, as used by the sender
pub trait ProbeTransport: Send + Sync + 'static {
    fn send_to(&self, packet: &[u8], target: Ipv4Addr) -> io::Result<usize>;

    /// Whether sends produce error-queue TX stamps
    fn tx_stamps_enabled(&self) -> bool {
        false
    }

    fn drain_tx_stamps(&self) -> Vec<TxStamp> {
        Vec::new()
    }
}

impl ProbeTransport for ProbeSocket {
    fn send_to(&self, packet: &[u8], target: Ipv4Addr) -> io::Result<usize> {
        ProbeSocket::send_to(self, packet, target)
    }

    fn tx_stamps_enabled(&self) -> bool {
        self.timestamps.tx_enabled()
    }

    fn drain_tx_stamps(&self) -> Vec<TxStamp> {
        ProbeSocket::drain_tx_stamps(self)
    }
}

#[cfg(target_os = "linux")]
fn drain_tx_stamps(socket: &Socket) -> Vec<TxStamp> {
    use crate::probe::timestamp::extract_tx_stamp;

    let mut stamps = Vec::new();
    for _ in 0..MAX_TX_STAMPS_PER_DRAIN {
        let mut cmsg_buf = [0u8; CMSG_BUFFER_SIZE];
        let mut data = [0u8; 0];
        match recvmsg_raw(
            socket,
            &mut data,
            &mut cmsg_buf,
            None,
            libc::MSG_ERRQUEUE | libc::MSG_DONTWAIT,
        ) {
            Ok((_, control_len)) => match extract_tx_stamp(&cmsg_buf[..control_len]) {
                Ok(stamp) => stamps.push(stamp),
                Err(e) => tracing::debug!(error = %e, "no TX timestamp on error queue message"),
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                tracing::debug!(error = %e, "TX timestamp fetch failed");
                break;
            }
        }
    }
    stamps
}

#[cfg(not(target_os = "linux"))]
fn drain_tx_stamps(_socket: &Socket) -> Vec<TxStamp> {
    Vec::new()
}

/// Blocking mode, I/O deadlines, receive buffer and TOS
fn configure(socket: &Socket, options: &SocketOptions) -> Result<()> {
    socket
        .set_nonblocking(false)
        .context("Failed to set blocking mode")?;
    socket
        .set_read_timeout(Some(options.read_timeout))
        .context("Failed to set read timeout")?;
    socket
        .set_write_timeout(Some(options.write_timeout))
        .context("Failed to set write timeout")?;
    // Best effort: the kernel caps this at net.core.rmem_max anyway
    if let Err(e) = socket.set_recv_buffer_size(RECV_BUFFER_BYTES) {
        tracing::debug!(error = %e, "Failed to enlarge receive buffer");
    }

    if let Some(tos) = options.tos {
        socket
            .set_tos(tos as u32)
            .with_context(|| format!("Failed to set TOS {}", tos))?;
    }
    Ok(())
}

/// `recvmsg()` into `buffer`, returning (data length, control length)
fn recvmsg_raw(
    socket: &Socket,
    buffer: &mut [u8],
    control: &mut [u8],
    source: Option<&mut libc::sockaddr_storage>,
    flags: libc::c_int,
) -> io::Result<(usize, usize)> {
    let mut iov = libc::iovec {
        iov_base: buffer.as_mut_ptr() as *mut libc::c_void,
        iov_len: buffer.len(),
    };

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    if let Some(storage) = source {
        msg.msg_name = storage as *mut _ as *mut libc::c_void;
        msg.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    }
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    // msg_controllen type differs: usize on Linux, u32 on macOS
    msg.msg_controllen = control.len() as _;

    let len = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, flags) };
    if len < 0 {
        return Err(io::Error::last_os_error());
    }

    let control_len = (msg.msg_controllen as usize).min(control.len());
    Ok((len as usize, control_len))
}

/// Parse sockaddr_storage to an IPv4 address
fn parse_sockaddr_v4(storage: &libc::sockaddr_storage) -> Option<Ipv4Addr> {
    if storage.ss_family as libc::c_int != libc::AF_INET {
        return None;
    }
    let addr: &libc::sockaddr_in = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
    Some(Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)))
}

fn permission_error(err: io::Error) -> anyhow::Error {
    let binary_path = std::env::current_exe()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "mping".to_string());

    anyhow!(
        "Failed to create ICMP socket: {}\n\n\
         Fix options:\n\
         \u{2022} Run with sudo: sudo mping <targets>\n\
         \u{2022} Add capability: sudo setcap cap_net_raw+ep {}\n\
         \u{2022} Enable unprivileged ICMP: sudo sysctl -w net.ipv4.ping_group_range='0 65534'",
        err,
        binary_path
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sockaddr_v4() {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        {
            let addr = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            addr.sin_family = libc::AF_INET as _;
            addr.sin_addr.s_addr = u32::from(Ipv4Addr::new(10, 1, 2, 3)).to_be();
        }
        assert_eq!(parse_sockaddr_v4(&storage), Some(Ipv4Addr::new(10, 1, 2, 3)));
    }

    #[test]
    fn test_parse_sockaddr_rejects_ipv6() {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        storage.ss_family = libc::AF_INET6 as _;
        assert_eq!(parse_sockaddr_v4(&storage), None);
    }

    fn udp_socket() -> Socket {
        Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).unwrap()
    }

    #[test]
    fn test_configure_sets_blocking_deadlines() {
        let socket = udp_socket();
        socket.set_nonblocking(true).unwrap();
        let options = SocketOptions {
            read_timeout: Duration::from_millis(250),
            write_timeout: Duration::from_millis(500),
            tos: Some(0x10),
            interface: None,
        };

        configure(&socket, &options).unwrap();
        assert_eq!(socket.read_timeout().unwrap(), Some(Duration::from_millis(250)));
        assert_eq!(socket.write_timeout().unwrap(), Some(Duration::from_millis(500)));
        assert_eq!(socket.tos().unwrap(), 0x10);
        assert!(socket.recv_buffer_size().unwrap() > 0);
    }

    #[test]
    fn test_drain_empty_error_queue() {
        let socket = udp_socket();
        socket.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        // MSG_DONTWAIT keeps this from waiting on the read timeout
        assert!(drain_tx_stamps(&socket).is_empty());
    }
}
