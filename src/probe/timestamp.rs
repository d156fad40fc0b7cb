//! Kernel timestamp negotiation and extraction.
//!
//! Linux can stamp packets in the NIC (hardware) or in the network stack
//! (software) and hand those stamps back as ancillary data:
//!
//! - RX stamps arrive as control messages on the `recvmsg()` that returns the
//!   datagram.
//! - TX stamps are looped back on the socket error queue (`MSG_ERRQUEUE`).
//!
//! The capability is negotiated once per socket and recorded as a
//! [`TimestampMode`]. Every extraction failure degrades to the wall clock, so
//! callers never have to branch on what the kernel supports.

use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

use socket2::Socket;

/// Flags for `SO_TIMESTAMPING` (linux/net_tstamp.h)
pub mod flags {
    pub const SOF_TIMESTAMPING_TX_HARDWARE: u32 = 1 << 0;
    pub const SOF_TIMESTAMPING_TX_SOFTWARE: u32 = 1 << 1;
    pub const SOF_TIMESTAMPING_RX_HARDWARE: u32 = 1 << 2;
    pub const SOF_TIMESTAMPING_RX_SOFTWARE: u32 = 1 << 3;
    pub const SOF_TIMESTAMPING_SOFTWARE: u32 = 1 << 4;
    pub const SOF_TIMESTAMPING_RAW_HARDWARE: u32 = 1 << 6;
    /// Tag each TX stamp with the socket's send counter
    pub const SOF_TIMESTAMPING_OPT_ID: u32 = 1 << 7;
    pub const SOF_TIMESTAMPING_OPT_TSONLY: u32 = 1 << 11;

    /// Combined hardware + software stamping in both directions
    pub const COMBINED: u32 = SOF_TIMESTAMPING_TX_HARDWARE
        | SOF_TIMESTAMPING_TX_SOFTWARE
        | SOF_TIMESTAMPING_RX_HARDWARE
        | SOF_TIMESTAMPING_RX_SOFTWARE
        | SOF_TIMESTAMPING_SOFTWARE
        | SOF_TIMESTAMPING_RAW_HARDWARE
        | SOF_TIMESTAMPING_OPT_ID
        | SOF_TIMESTAMPING_OPT_TSONLY;
}

/// `sock_extended_err.ee_origin` for timestamping notifications
#[cfg(target_os = "linux")]
const SO_EE_ORIGIN_TIMESTAMPING: u8 = 4;

/// A transmit stamp read back from the error queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxStamp {
    /// Kernel send counter: the Nth send on the socket carries id N-1
    pub id: u32,
    pub timestamp_ns: i64,
    /// Taken by the NIC rather than the network stack
    pub hardware: bool,
}

/// Errors from timestamp extraction
///
/// Both variants are soft: the caller keeps the timestamp it already has.
#[derive(Debug, thiserror::Error)]
pub enum TimestampError {
    /// No timestamping control message in the ancillary data
    #[error("timestamp not found in control messages")]
    NotFound,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Timestamping capability negotiated for a socket, best first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampMode {
    /// `SO_TIMESTAMPING` with hardware and software stamps for TX and RX
    Combined,
    /// `SO_TIMESTAMPNS`: software RX stamps only
    SoftwareRx,
    /// No kernel stamps; wall clock at syscall return
    WallClock,
}

impl TimestampMode {
    /// Negotiate the best mode the kernel/driver accepts for this socket
    pub fn negotiate(socket: &Socket) -> Self {
        match enable_combined(socket) {
            Ok(()) => return Self::Combined,
            Err(e) => tracing::debug!(error = %e, "SO_TIMESTAMPING rejected, trying SO_TIMESTAMPNS"),
        }
        match enable_software_rx(socket) {
            Ok(()) => Self::SoftwareRx,
            Err(e) => {
                tracing::debug!(error = %e, "SO_TIMESTAMPNS rejected, using wall clock");
                Self::WallClock
            }
        }
    }

    /// Whether transmit stamps are looped back on the error queue
    pub fn tx_enabled(&self) -> bool {
        matches!(self, Self::Combined)
    }

    /// Whether receive calls should request ancillary data at all
    pub fn rx_enabled(&self) -> bool {
        !matches!(self, Self::WallClock)
    }

    /// Resolve the receive timestamp for a datagram, falling back to `fallback`
    pub fn resolve(&self, control: &[u8], fallback: i64) -> i64 {
        if !self.rx_enabled() {
            return fallback;
        }
        match extract_timestamp(control) {
            Ok(ts) => ts,
            Err(e) => {
                tracing::trace!(error = %e, "falling back to wall clock");
                fallback
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Combined => "hardware+software",
            Self::SoftwareRx => "software-rx",
            Self::WallClock => "wall-clock",
        }
    }
}

impl std::fmt::Display for TimestampMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Nanoseconds since the Unix epoch from the system clock
pub fn wall_clock_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

#[cfg(target_os = "linux")]
fn set_int_option(socket: &Socket, name: libc::c_int, val: u32) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            name,
            &val as *const u32 as *const libc::c_void,
            std::mem::size_of::<u32>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn enable_combined(socket: &Socket) -> io::Result<()> {
    set_int_option(socket, libc::SO_TIMESTAMPING, flags::COMBINED)
}

#[cfg(target_os = "linux")]
fn enable_software_rx(socket: &Socket) -> io::Result<()> {
    set_int_option(socket, libc::SO_TIMESTAMPNS, 1)
}

#[cfg(not(target_os = "linux"))]
fn enable_combined(_socket: &Socket) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

#[cfg(not(target_os = "linux"))]
fn enable_software_rx(_socket: &Socket) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

/// Round a control message length up to the platform alignment
#[cfg(target_os = "linux")]
const fn cmsg_align(len: usize) -> usize {
    let align = std::mem::size_of::<usize>();
    (len + align - 1) & !(align - 1)
}

#[cfg(target_os = "linux")]
fn timespec_nanos(ts: &libc::timespec) -> Option<i64> {
    if ts.tv_sec == 0 && ts.tv_nsec == 0 {
        return None;
    }
    Some(ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64)
}

/// Iterator over `(level, type, data)` of each control message in a buffer
#[cfg(target_os = "linux")]
struct ControlMessages<'a> {
    control: &'a [u8],
    offset: usize,
}

#[cfg(target_os = "linux")]
impl<'a> ControlMessages<'a> {
    fn new(control: &'a [u8]) -> Self {
        Self { control, offset: 0 }
    }
}

#[cfg(target_os = "linux")]
impl<'a> Iterator for ControlMessages<'a> {
    type Item = (libc::c_int, libc::c_int, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let hdr_len = std::mem::size_of::<libc::cmsghdr>();
        let offset = self.offset;
        if offset + hdr_len > self.control.len() {
            return None;
        }

        let hdr: libc::cmsghdr = unsafe {
            std::ptr::read_unaligned(self.control[offset..].as_ptr() as *const libc::cmsghdr)
        };
        let cmsg_len = hdr.cmsg_len as usize;
        let data_offset = cmsg_align(hdr_len);
        if cmsg_len < data_offset || offset + cmsg_len > self.control.len() {
            return None;
        }

        self.offset = offset + cmsg_align(cmsg_len);
        let data = &self.control[offset + data_offset..offset + cmsg_len];
        Some((hdr.cmsg_level, hdr.cmsg_type, data))
    }
}

/// Best stamp of an `SCM_TIMESTAMPING` payload and whether it is a hardware one
#[cfg(target_os = "linux")]
fn best_timestamping(data: &[u8]) -> Option<(i64, bool)> {
    if data.len() < 3 * std::mem::size_of::<libc::timespec>() {
        return None;
    }
    let stamps: [libc::timespec; 3] =
        unsafe { std::ptr::read_unaligned(data.as_ptr() as *const [libc::timespec; 3]) };
    // ts[2] raw hardware, ts[1] transformed hardware, ts[0] software
    timespec_nanos(&stamps[2])
        .or_else(|| timespec_nanos(&stamps[1]))
        .map(|ns| (ns, true))
        .or_else(|| timespec_nanos(&stamps[0]).map(|ns| (ns, false)))
}

/// Walk an ancillary data buffer and return the best timestamp it carries
///
/// For `SCM_TIMESTAMPING` the first non-zero of raw hardware, transformed
/// hardware, software is returned. `SCM_TIMESTAMPNS` carries a single
/// software stamp.
#[cfg(target_os = "linux")]
pub fn extract_timestamp(control: &[u8]) -> Result<i64, TimestampError> {
    ControlMessages::new(control)
        .filter(|(level, _, _)| *level == libc::SOL_SOCKET)
        .find_map(|(_, kind, data)| match kind {
            libc::SO_TIMESTAMPING => best_timestamping(data).map(|(ns, _)| ns),
            libc::SO_TIMESTAMPNS if data.len() >= std::mem::size_of::<libc::timespec>() => {
                let ts: libc::timespec =
                    unsafe { std::ptr::read_unaligned(data.as_ptr() as *const libc::timespec) };
                timespec_nanos(&ts)
            }
            _ => None,
        })
        .ok_or(TimestampError::NotFound)
}

/// Parse one error-queue message into a send-id tagged TX stamp
///
/// Needs both the `SCM_TIMESTAMPING` stamp and the `IP_RECVERR` extended
/// error carrying the `SOF_TIMESTAMPING_OPT_ID` counter.
#[cfg(target_os = "linux")]
pub fn extract_tx_stamp(control: &[u8]) -> Result<TxStamp, TimestampError> {
    let mut stamp = None;
    let mut id = None;

    for (level, kind, data) in ControlMessages::new(control) {
        if level == libc::SOL_SOCKET && kind == libc::SO_TIMESTAMPING {
            stamp = stamp.or(best_timestamping(data));
        } else if level == libc::SOL_IP
            && kind == libc::IP_RECVERR
            && data.len() >= std::mem::size_of::<libc::sock_extended_err>()
        {
            let err: libc::sock_extended_err = unsafe {
                std::ptr::read_unaligned(data.as_ptr() as *const libc::sock_extended_err)
            };
            if err.ee_errno == libc::ENOMSG as u32 && err.ee_origin == SO_EE_ORIGIN_TIMESTAMPING {
                id = Some(err.ee_data);
            }
        }
    }

    match (stamp, id) {
        (Some((timestamp_ns, hardware)), Some(id)) => Ok(TxStamp {
            id,
            timestamp_ns,
            hardware,
        }),
        _ => Err(TimestampError::NotFound),
    }
}

#[cfg(not(target_os = "linux"))]
pub fn extract_timestamp(_control: &[u8]) -> Result<i64, TimestampError> {
    Err(TimestampError::NotFound)
}

#[cfg(not(target_os = "linux"))]
pub fn extract_tx_stamp(_control: &[u8]) -> Result<TxStamp, TimestampError> {
    Err(TimestampError::NotFound)
}
