//! Linux UDP transport with kernel TX timestamping via SO_TIMESTAMPING.
//!
//! Hardware mode switches the NIC into timestamping with SIOCSHWTSTAMP and asks
//! for raw hardware stamps; software mode uses the stack's stamps. Either way the
//! stamp arrives on the socket error queue (MSG_ERRQUEUE) together with a copy of
//! the sent packet.

use std::{
    io::{self, IoSliceMut},
    net::{IpAddr, SocketAddr, UdpSocket},
    os::fd::{AsRawFd, RawFd},
};

use chrono::{DateTime, Utc};
use nix::{
    errno::Errno,
    libc,
    sys::{
        socket::{recvmsg, ControlMessageOwned, MsgFlags, RecvMsg, SockaddrStorage},
        time::TimeSpec,
    },
};

use crate::{configuration::Configuration, timestamp_mode::TimestampMode};

use super::{Channel, TimestampBuffers, Transport, TransportError, TxTimestamp};

const SIOCSHWTSTAMP: libc::c_ulong = 0x89b0;
const HWTSTAMP_TX_ON: libc::c_int = 1;
const HWTSTAMP_FILTER_ALL: libc::c_int = 1;
const HWTSTAMP_FILTER_PTP_V2_EVENT: libc::c_int = 12;

/// `struct hwtstamp_config` from linux/net_tstamp.h.
#[repr(C)]
struct HwTstampConfig {
    flags: libc::c_int,
    tx_type: libc::c_int,
    rx_filter: libc::c_int,
}

/// `struct ifreq` with the `ifr_data` member of the union.
#[repr(C)]
struct IfReqData {
    name: [libc::c_char; libc::IFNAMSIZ],
    data: *mut libc::c_void,
    _pad: [u8; 16],
}

/// Event and general UDP sockets of one send worker.
///
/// Both sockets are closed when the transport is dropped.
pub struct UdpTransport {
    event: UdpSocket,
    general: UdpSocket,
}

impl UdpTransport {
    /// Opens both sockets and enables TX timestamping on the event socket.
    ///
    /// Any failure is a fatal setup error for the worker.
    pub fn open(conf: &Configuration) -> Result<Self, TransportError> {
        let event = bind_socket(Channel::Event, conf.ip)?;
        let fd = event.as_raw_fd();
        match conf.timestamp_type {
            TimestampMode::Hardware => enable_hardware_timestamps(fd, &conf.interface)?,
            TimestampMode::Software => enable_software_timestamps(fd)?,
        }

        let general = bind_socket(Channel::General, conf.ip)?;

        let transport = UdpTransport { event, general };
        if let Some(dscp) = conf.dscp {
            transport.set_dscp(dscp)?;
        }
        log::debug!(
            "Opened event socket {:?} ({} timestamps) and general socket {:?}",
            transport.local_addr(Channel::Event),
            conf.timestamp_type,
            transport.local_addr(Channel::General)
        );
        Ok(transport)
    }

    /// Opens both sockets without enabling timestamping.
    pub fn bind(ip: IpAddr) -> Result<Self, TransportError> {
        Ok(UdpTransport {
            event: bind_socket(Channel::Event, ip)?,
            general: bind_socket(Channel::General, ip)?,
        })
    }

    /// Raw descriptor of one of the sockets.
    pub fn raw_fd(&self, channel: Channel) -> RawFd {
        self.socket(channel).as_raw_fd()
    }

    /// Local address of one of the sockets.
    pub fn local_addr(&self, channel: Channel) -> io::Result<SocketAddr> {
        self.socket(channel).local_addr()
    }

    fn socket(&self, channel: Channel) -> &UdpSocket {
        match channel {
            Channel::Event => &self.event,
            Channel::General => &self.general,
        }
    }

    /// Sets the DSCP bits of outgoing packets on both sockets.
    pub fn set_dscp(&self, dscp: u8) -> Result<(), TransportError> {
        let tos = (dscp as libc::c_int) << 2;
        for channel in [Channel::Event, Channel::General] {
            let socket = self.socket(channel);
            let is_ipv6 = socket
                .local_addr()
                .map(|a| a.is_ipv6())
                .unwrap_or(false);
            let result = if is_ipv6 {
                set_int_option(
                    socket.as_raw_fd(),
                    libc::IPPROTO_IPV6,
                    libc::IPV6_TCLASS,
                    tos,
                )
            } else {
                set_int_option(socket.as_raw_fd(), libc::IPPROTO_IP, libc::IP_TOS, tos)
            };
            result.map_err(|source| TransportError::Dscp { channel, source })?;
        }
        Ok(())
    }
}

impl Transport for UdpTransport {
    fn send_to(
        &mut self,
        channel: Channel,
        buf: &[u8],
        peer: SocketAddr,
    ) -> Result<(), TransportError> {
        self.socket(channel)
            .send_to(buf, peer)
            .map(|_| ())
            .map_err(|source| TransportError::Send { peer, source })
    }

    fn recv_tx_timestamp(
        &mut self,
        buffers: &mut TimestampBuffers,
    ) -> Result<Option<TxTimestamp>, TransportError> {
        let mut iov = [IoSliceMut::new(&mut buffers.echo)];

        let msg = match recvmsg::<SockaddrStorage>(
            self.event.as_raw_fd(),
            &mut iov,
            Some(&mut buffers.control),
            MsgFlags::MSG_ERRQUEUE | MsgFlags::MSG_DONTWAIT,
        ) {
            Ok(msg) => msg,
            Err(Errno::EAGAIN) => return Ok(None),
            Err(e) => return Err(TransportError::ErrorQueue(e.into())),
        };

        let echoed = msg.bytes;
        match extract_tx_timestamp(&msg) {
            Some(timestamp) => Ok(Some(TxTimestamp { timestamp, echoed })),
            None => {
                log::debug!("Error queue message without a TX timestamp");
                Ok(None)
            }
        }
    }
}

fn bind_socket(channel: Channel, ip: IpAddr) -> Result<UdpSocket, TransportError> {
    let addr = SocketAddr::new(ip, 0);
    UdpSocket::bind(addr).map_err(|source| TransportError::Bind {
        channel,
        addr,
        source,
    })
}

fn set_int_option(
    fd: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    let result = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_hwtstamp(fd: RawFd, interface: &str, rx_filter: libc::c_int) -> io::Result<()> {
    let mut config = HwTstampConfig {
        flags: 0,
        tx_type: HWTSTAMP_TX_ON,
        rx_filter,
    };
    let mut ifreq = IfReqData {
        name: [0; libc::IFNAMSIZ],
        data: &mut config as *mut HwTstampConfig as *mut libc::c_void,
        _pad: [0; 16],
    };
    for (dst, src) in ifreq.name.iter_mut().zip(interface.bytes()) {
        *dst = src as libc::c_char;
    }

    let result = unsafe { libc::ioctl(fd, SIOCSHWTSTAMP as _, &mut ifreq as *mut IfReqData) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Turns on NIC timestamping for `interface` and requests raw hardware TX
/// timestamps on the socket.
pub fn enable_hardware_timestamps(fd: RawFd, interface: &str) -> Result<(), TransportError> {
    let hw_err = |source| TransportError::HardwareTimestamps {
        interface: interface.to_string(),
        source,
    };

    if interface.is_empty() || interface.len() >= libc::IFNAMSIZ {
        return Err(hw_err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "invalid interface name",
        )));
    }

    // Some drivers only accept PTP event filtering on RX.
    if let Err(e) = set_hwtstamp(fd, interface, HWTSTAMP_FILTER_ALL) {
        log::debug!(
            "SIOCSHWTSTAMP with HWTSTAMP_FILTER_ALL failed on {}: {}, retrying with PTP v2 events",
            interface,
            e
        );
        set_hwtstamp(fd, interface, HWTSTAMP_FILTER_PTP_V2_EVENT).map_err(hw_err)?;
    }

    let flags = libc::SOF_TIMESTAMPING_TX_HARDWARE
        | libc::SOF_TIMESTAMPING_RX_HARDWARE
        | libc::SOF_TIMESTAMPING_RAW_HARDWARE;
    set_int_option(fd, libc::SOL_SOCKET, libc::SO_TIMESTAMPING, flags as libc::c_int)
        .map_err(hw_err)?;
    select_err_queue(fd);
    Ok(())
}

/// Requests software TX timestamps from the kernel stack on the socket.
pub fn enable_software_timestamps(fd: RawFd) -> Result<(), TransportError> {
    let flags = libc::SOF_TIMESTAMPING_TX_SOFTWARE
        | libc::SOF_TIMESTAMPING_RX_SOFTWARE
        | libc::SOF_TIMESTAMPING_SOFTWARE;
    set_int_option(fd, libc::SOL_SOCKET, libc::SO_TIMESTAMPING, flags as libc::c_int)
        .map_err(TransportError::SoftwareTimestamps)?;
    select_err_queue(fd);
    Ok(())
}

fn select_err_queue(fd: RawFd) {
    // Only affects poll/select wakeups, the error queue is read without them.
    if let Err(e) = set_int_option(fd, libc::SOL_SOCKET, libc::SO_SELECT_ERR_QUEUE, 1) {
        log::warn!("Failed to set SO_SELECT_ERR_QUEUE: {}", e);
    }
}

fn is_set(ts: &TimeSpec) -> bool {
    ts.tv_sec() != 0 || ts.tv_nsec() != 0
}

/// Extracts the TX timestamp from an error queue message.
///
/// Prefers the raw hardware stamp and falls back to the software one.
fn extract_tx_timestamp(msg: &RecvMsg<SockaddrStorage>) -> Option<DateTime<Utc>> {
    let cmsgs = msg.cmsgs().ok()?;

    for cmsg in cmsgs {
        if let ControlMessageOwned::ScmTimestampsns(stamps) = cmsg {
            let ts = if is_set(&stamps.hw_raw) {
                stamps.hw_raw
            } else if is_set(&stamps.system) {
                stamps.system
            } else {
                continue;
            };
            return DateTime::<Utc>::from_timestamp(ts.tv_sec() as i64, ts.tv_nsec() as u32);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_bind_uses_ephemeral_ports() {
        let transport = UdpTransport::bind(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
        let event = transport.local_addr(Channel::Event).unwrap();
        let general = transport.local_addr(Channel::General).unwrap();
        assert_ne!(event.port(), 0);
        assert_ne!(general.port(), 0);
        assert_ne!(event.port(), general.port());
    }

    #[test]
    fn test_empty_error_queue_reports_nothing() {
        let mut transport = UdpTransport::bind(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
        let mut buffers = TimestampBuffers::new();
        assert!(transport.recv_tx_timestamp(&mut buffers).unwrap().is_none());
    }

    #[test]
    fn test_send_on_general_channel() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut transport = UdpTransport::bind(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
        transport
            .send_to(Channel::General, &[1, 2, 3], receiver.local_addr().unwrap())
            .unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);
        assert_eq!(from, transport.local_addr(Channel::General).unwrap());
    }

    #[test]
    fn test_hardware_timestamps_reject_bad_interface_name() {
        let transport = UdpTransport::bind(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
        let result = enable_hardware_timestamps(
            transport.raw_fd(Channel::Event),
            "an-interface-name-way-too-long",
        );
        assert!(matches!(
            result,
            Err(TransportError::HardwareTimestamps { .. })
        ));
    }
}
