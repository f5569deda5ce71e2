//! # UDP Port
//!
//! A bound, non-connected UDP socket for both sending and receiving. The
//! send and receive paths retry interrupted system calls but otherwise keep
//! the fundamentally unreliable nature of UDP.

use std::io;
use std::net::{Ipv4Addr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Mutex;

use crate::error::{CommsError, Result};

/// A datagram read from the socket, with its source endpoint.
#[derive(Debug, Clone)]
pub struct ReceivedDatagram {
    pub data: Vec<u8>,
    pub source_addr: String,
    pub source_port: u16,
}

/// Bound IPv4 UDP socket.
///
/// Sends may come from any thread; receives must stay on a single thread at
/// a time (the receive buffer is shared). The socket is deliberately kept in
/// blocking mode: receivers are expected to `poll` the descriptor first.
pub struct UdpPort {
    socket: UdpSocket,
    recv_buf: Mutex<Vec<u8>>,
    bound_addr: String,
    bound_port: u16,
}

impl UdpPort {
    /// Bind to `ip:port`.
    pub fn bind(ip: &str, port: u16) -> Result<Self> {
        let addr: Ipv4Addr = ip
            .parse()
            .map_err(|_| CommsError::Startup(format!("bad ip address for binding: {}", ip)))?;
        let socket = UdpSocket::bind((addr, port)).map_err(|e| {
            CommsError::Startup(format!("could not bind UDP socket {}:{}: {}", ip, port, e))
        })?;

        let local = socket
            .local_addr()
            .map_err(|e| CommsError::Startup(format!("could not read bound address: {}", e)))?;

        Ok(UdpPort {
            socket,
            recv_buf: Mutex::new(vec![0u8; 16]),
            bound_addr: local.ip().to_string(),
            bound_port: local.port(),
        })
    }

    /// Send one datagram. Returns false if the send failed or was partial;
    /// the caller may retry.
    pub fn send(&self, msg: &[u8], dest_addr: &str, dest_port: u16) -> bool {
        let dest: Ipv4Addr = match dest_addr.parse() {
            Ok(ip) => ip,
            Err(_) => {
                log::error!("bad ip address for sending: {}", dest_addr);
                return false;
            }
        };

        loop {
            match self.socket.send_to(msg, (dest, dest_port)) {
                Ok(sent) => return sent == msg.len(),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("UDP send to {}:{} failed: {}", dest_addr, dest_port, e);
                    return false;
                }
            }
        }
    }

    /// Block until a datagram arrives and return it, or `None` on a socket
    /// error.
    ///
    /// The receive buffer is sized to the datagram by peeking first and
    /// doubling the buffer until the peek no longer fills it, so datagrams
    /// of any size up to the UDP maximum are returned whole.
    pub fn receive(&self) -> Option<ReceivedDatagram> {
        let mut buf = self.recv_buf.lock().unwrap();

        loop {
            let peeked = loop {
                match self.socket.peek_from(&mut buf) {
                    Ok((n, _)) => break n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::debug!("UDP peek failed: {}", e);
                        return None;
                    }
                }
            };
            if peeked == buf.len() {
                let doubled = buf.len() * 2;
                buf.resize(doubled, 0);
            } else {
                break;
            }
        }

        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((n, src)) => {
                    return Some(ReceivedDatagram {
                        data: buf[..n].to_vec(),
                        source_addr: src.ip().to_string(),
                        source_port: src.port(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("UDP receive failed: {}", e);
                    return None;
                }
            }
        }
    }

    pub fn bound_addr(&self) -> &str {
        &self.bound_addr
    }

    pub fn bound_port(&self) -> u16 {
        self.bound_port
    }

    /// The socket descriptor, for poll-based readiness monitoring.
    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_and_receive_roundtrip() {
        let a = UdpPort::bind("127.0.0.1", 0).unwrap();
        let b = UdpPort::bind("127.0.0.1", 0).unwrap();

        assert!(a.send(b"over the wire", b.bound_addr(), b.bound_port()));

        let msg = b.receive().unwrap();
        assert_eq!(msg.data, b"over the wire");
        assert_eq!(msg.source_addr, "127.0.0.1");
        assert_eq!(msg.source_port, a.bound_port());
    }

    #[test]
    fn test_large_datagram_grows_buffer() {
        let a = UdpPort::bind("127.0.0.1", 0).unwrap();
        let b = UdpPort::bind("127.0.0.1", 0).unwrap();

        let big: Vec<u8> = (0..40_000u32).map(|i| i as u8).collect();
        assert!(a.send(&big, b.bound_addr(), b.bound_port()));

        let msg = b.receive().unwrap();
        assert_eq!(msg.data, big);
    }

    #[test]
    fn test_consecutive_datagrams_keep_boundaries() {
        let a = UdpPort::bind("127.0.0.1", 0).unwrap();
        let b = UdpPort::bind("127.0.0.1", 0).unwrap();

        assert!(a.send(b"first", b.bound_addr(), b.bound_port()));
        assert!(a.send(b"second, longer", b.bound_addr(), b.bound_port()));

        assert_eq!(b.receive().unwrap().data, b"first");
        assert_eq!(b.receive().unwrap().data, b"second, longer");
    }

    #[test]
    fn test_bad_destination_address_reports_failure() {
        let a = UdpPort::bind("127.0.0.1", 0).unwrap();
        assert!(!a.send(b"x", "not-an-address", 9));
    }

    #[test]
    fn test_bad_bind_address_rejected() {
        assert!(matches!(
            UdpPort::bind("256.0.0.1", 0),
            Err(CommsError::Startup(_))
        ));
    }

    #[test]
    fn test_descriptor_is_exposed() {
        let a = UdpPort::bind("127.0.0.1", 0).unwrap();
        assert!(a.fd() >= 0);
    }
}
