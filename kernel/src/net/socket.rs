//! Socket endpoints.
//!
//! A socket is a typed record with local/remote addresses and a TCP-like
//! connection state. With no transport collaborator attached, stream
//! connects complete immediately (loopback semantics) and sent data lands in
//! a transmit queue the collaborator drains; received data is queued by the
//! collaborator and drained by `recv`.

use alloc::collections::VecDeque;

use crate::error::{KernelError, Result};

/// Socket flavour, mirroring SOCK_STREAM / SOCK_DGRAM / SOCK_RAW.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    Stream,
    Dgram,
    Raw,
}

impl SocketType {
    /// Map a Linux `socket(2)` type argument.
    pub fn from_raw(raw: u64) -> Result<Self> {
        match raw & 0xF {
            1 => Ok(SocketType::Stream),
            2 => Ok(SocketType::Dgram),
            3 => Ok(SocketType::Raw),
            _ => Err(KernelError::InvalidArgument),
        }
    }
}

/// TCP connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

/// IPv4 endpoint address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketAddr {
    pub ip: [u8; 4],
    pub port: u16,
}

pub struct Socket {
    ty: SocketType,
    state: TcpState,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    /// Bytes queued by the transport collaborator, drained by `recv`.
    rx: VecDeque<u8>,
    /// Bytes queued by `send`, drained by the transport collaborator.
    tx: VecDeque<u8>,
}

impl Socket {
    pub fn new(ty: SocketType) -> Self {
        Self {
            ty,
            state: TcpState::Closed,
            local: None,
            remote: None,
            rx: VecDeque::new(),
            tx: VecDeque::new(),
        }
    }

    pub fn socket_type(&self) -> SocketType {
        self.ty
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    pub fn local(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn bind(&mut self, addr: SocketAddr) {
        self.local = Some(addr);
    }

    /// Drive the endpoint towards `remote`.
    ///
    /// Stream sockets leave CLOSED through SYN_SENT; with no transport
    /// collaborator attached the handshake completes immediately. Datagram
    /// and raw sockets just record the remote.
    pub fn connect(&mut self, remote: SocketAddr) -> Result<()> {
        match self.ty {
            SocketType::Stream => {
                if self.state != TcpState::Closed {
                    return Err(KernelError::InvalidArgument);
                }
                self.remote = Some(remote);
                self.state = TcpState::SynSent;
                // Loopback completion: no transport collaborator is wired
                // in, so the SYN/ACK round is instantaneous.
                self.state = TcpState::Established;
                Ok(())
            }
            SocketType::Dgram | SocketType::Raw => {
                self.remote = Some(remote);
                Ok(())
            }
        }
    }

    /// Queue bytes for transmission. Stream sockets must be ESTABLISHED;
    /// datagram sockets need a remote.
    pub fn send(&mut self, data: &[u8]) -> Result<usize> {
        match self.ty {
            SocketType::Stream if self.state != TcpState::Established => {
                Err(KernelError::InvalidArgument)
            }
            SocketType::Dgram | SocketType::Raw if self.remote.is_none() => {
                Err(KernelError::InvalidArgument)
            }
            _ => {
                self.tx.extend(data.iter().copied());
                Ok(data.len())
            }
        }
    }

    /// Drain received bytes; returns 0 when nothing is queued.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.ty == SocketType::Stream && self.state != TcpState::Established {
            return Err(KernelError::InvalidArgument);
        }
        let n = buf.len().min(self.rx.len());
        for slot in buf.iter_mut().take(n) {
            // Length-checked above.
            *slot = self.rx.pop_front().unwrap_or(0);
        }
        Ok(n)
    }

    /// Transport collaborator hook: queue inbound bytes.
    pub fn deliver(&mut self, data: &[u8]) {
        self.rx.extend(data.iter().copied());
    }

    /// Transport collaborator hook: take outbound bytes.
    pub fn take_outbound(&mut self, max: usize) -> VecDeque<u8> {
        let n = max.min(self.tx.len());
        self.tx.drain(..n).collect()
    }

    /// Close the endpoint. Established streams walk the active-close edge of
    /// the state machine; everything else drops straight to CLOSED.
    pub fn close(&mut self) {
        match (self.ty, self.state) {
            (SocketType::Stream, TcpState::Established) => {
                self.state = TcpState::FinWait1;
                // FIN/ACK rounds collapse for the same loopback reason as
                // connect; TIME_WAIT has nothing to wait for.
                self.state = TcpState::FinWait2;
                self.state = TcpState::TimeWait;
                self.state = TcpState::Closed;
            }
            _ => self.state = TcpState::Closed,
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn addr(last: u8, port: u16) -> SocketAddr {
        SocketAddr {
            ip: [10, 0, 0, last],
            port,
        }
    }

    #[test]
    fn stream_connect_establishes() {
        let mut sock = Socket::new(SocketType::Stream);
        assert_eq!(sock.state(), TcpState::Closed);
        sock.connect(addr(1, 80)).unwrap();
        assert_eq!(sock.state(), TcpState::Established);
        assert_eq!(sock.remote(), Some(addr(1, 80)));
    }

    #[test]
    fn connect_twice_is_rejected() {
        let mut sock = Socket::new(SocketType::Stream);
        sock.connect(addr(1, 80)).unwrap();
        assert!(sock.connect(addr(2, 81)).is_err());
    }

    #[test]
    fn dgram_connect_only_sets_remote() {
        let mut sock = Socket::new(SocketType::Dgram);
        sock.connect(addr(9, 53)).unwrap();
        assert_eq!(sock.state(), TcpState::Closed);
        assert_eq!(sock.remote(), Some(addr(9, 53)));
    }

    #[test]
    fn send_requires_connection_state() {
        let mut stream = Socket::new(SocketType::Stream);
        assert!(stream.send(b"hi").is_err());
        stream.connect(addr(1, 80)).unwrap();
        assert_eq!(stream.send(b"hi").unwrap(), 2);

        let mut dgram = Socket::new(SocketType::Dgram);
        assert!(dgram.send(b"hi").is_err());
        dgram.connect(addr(1, 53)).unwrap();
        assert_eq!(dgram.send(b"hi").unwrap(), 2);
    }

    #[test]
    fn recv_drains_delivered_bytes() {
        let mut sock = Socket::new(SocketType::Stream);
        sock.connect(addr(1, 80)).unwrap();
        sock.deliver(b"response");

        let mut buf = [0u8; 5];
        assert_eq!(sock.recv(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"respo");
        let mut rest = [0u8; 8];
        assert_eq!(sock.recv(&mut rest).unwrap(), 3);
        assert_eq!(&rest[..3], b"nse");
        assert_eq!(sock.recv(&mut rest).unwrap(), 0);
    }

    #[test]
    fn close_returns_to_closed() {
        let mut sock = Socket::new(SocketType::Stream);
        sock.connect(addr(1, 80)).unwrap();
        sock.close();
        assert_eq!(sock.state(), TcpState::Closed);
    }

    #[test]
    fn socket_type_mapping() {
        assert_eq!(SocketType::from_raw(1).unwrap(), SocketType::Stream);
        assert_eq!(SocketType::from_raw(2).unwrap(), SocketType::Dgram);
        assert!(SocketType::from_raw(0).is_err());
    }
}
