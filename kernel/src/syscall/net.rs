//! Socket syscalls.

use alloc::sync::Arc;
use alloc::vec;

use spin::Mutex;

use super::{copy_from_user, copy_to_user, SysResult, MAX_IO_CHUNK};
use crate::error::Errno;
use crate::net::{Socket, SocketAddr, SocketType};
use crate::process::Process;

const AF_INET: u64 = 2;

pub fn sys_socket(proc: &mut Process, domain: u64, ty: u64, _protocol: u64) -> SysResult {
    if domain != AF_INET {
        return Err(Errno::Einval);
    }
    let ty = SocketType::from_raw(ty).map_err(Errno::from)?;
    let socket = Arc::new(Mutex::new(Socket::new(ty)));
    let fd = super::filesystem::install_socket(proc, socket)?;
    Ok(fd as i64)
}

/// Decode a `sockaddr_in`: family, big-endian port, IPv4 address.
fn decode_sockaddr(bytes: &[u8]) -> core::result::Result<SocketAddr, Errno> {
    if bytes.len() < 8 {
        return Err(Errno::Einval);
    }
    let family = u16::from_le_bytes([bytes[0], bytes[1]]);
    if family as u64 != AF_INET {
        return Err(Errno::Einval);
    }
    Ok(SocketAddr {
        port: u16::from_be_bytes([bytes[2], bytes[3]]),
        ip: [bytes[4], bytes[5], bytes[6], bytes[7]],
    })
}

pub fn sys_connect(proc: &mut Process, fd: u64, addr: u64, addrlen: u64) -> SysResult {
    if addrlen < 16 {
        return Err(Errno::Einval);
    }
    let mut raw = [0u8; 16];
    copy_from_user(proc, addr, &mut raw)?;
    let remote = decode_sockaddr(&raw)?;

    let entry = proc.fds.get(fd as usize).map_err(Errno::from)?;
    let socket = super::filesystem::socket_of(&entry.lock())?;
    socket.lock().connect(remote).map_err(Errno::from)?;
    Ok(0)
}

pub fn sys_send(proc: &mut Process, fd: u64, buf: u64, len: u64, _flags: u64) -> SysResult {
    let len = (len as usize).min(MAX_IO_CHUNK);
    let mut kbuf = vec![0u8; len];
    copy_from_user(proc, buf, &mut kbuf)?;

    let entry = proc.fds.get(fd as usize).map_err(Errno::from)?;
    let socket = super::filesystem::socket_of(&entry.lock())?;
    let n = socket.lock().send(&kbuf).map_err(Errno::from)?;
    Ok(n as i64)
}

pub fn sys_recv(proc: &mut Process, fd: u64, buf: u64, len: u64, _flags: u64) -> SysResult {
    let len = (len as usize).min(MAX_IO_CHUNK);
    super::validate_user_range(proc, buf, len)?;

    let entry = proc.fds.get(fd as usize).map_err(Errno::from)?;
    let socket = super::filesystem::socket_of(&entry.lock())?;
    let mut kbuf = vec![0u8; len];
    let n = socket.lock().recv(&mut kbuf).map_err(Errno::from)?;
    copy_to_user(proc, buf, &kbuf[..n])?;
    Ok(n as i64)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::super::testutil::SyscallFixture;
    use super::*;
    use crate::net::TcpState;

    fn sockaddr_bytes(ip: [u8; 4], port: u16) -> [u8; 16] {
        let mut raw = [0u8; 16];
        raw[0..2].copy_from_slice(&(AF_INET as u16).to_le_bytes());
        raw[2..4].copy_from_slice(&port.to_be_bytes());
        raw[4..8].copy_from_slice(&ip);
        raw
    }

    #[test]
    fn socket_connect_send_recv_flow() {
        let mut fx = SyscallFixture::new();

        let fd = sys_socket(&mut fx.proc, AF_INET, 1, 0).unwrap() as u64;
        let addr_ptr = fx.user_bytes(0x50_0000, &sockaddr_bytes([10, 0, 0, 1], 8080));
        assert_eq!(sys_connect(&mut fx.proc, fd, addr_ptr, 16).unwrap(), 0);

        // The endpoint is ESTABLISHED and the tx path accepts data.
        {
            let entry = fx.proc.fds.get(fd as usize).unwrap();
            let socket = super::super::filesystem::socket_of(&entry.lock()).unwrap();
            assert_eq!(socket.lock().state(), TcpState::Established);
        }

        let payload = fx.user_bytes(0x51_0000, b"GET / HTTP/1.0\r\n\r\n");
        assert_eq!(
            sys_send(&mut fx.proc, fd, payload, 18, 0).unwrap(),
            18
        );

        // Simulate the transport delivering a response, then recv it.
        {
            let entry = fx.proc.fds.get(fd as usize).unwrap();
            let socket = super::super::filesystem::socket_of(&entry.lock()).unwrap();
            socket.lock().deliver(b"HTTP/1.0 200 OK");
        }
        let rbuf = fx.user_bytes(0x52_0000, &[0u8; 32]);
        assert_eq!(sys_recv(&mut fx.proc, fd, rbuf, 32, 0).unwrap(), 15);
        assert_eq!(fx.read_user(rbuf, 15), b"HTTP/1.0 200 OK");
    }

    #[test]
    fn send_before_connect_is_rejected() {
        let mut fx = SyscallFixture::new();
        let fd = sys_socket(&mut fx.proc, AF_INET, 1, 0).unwrap() as u64;
        let payload = fx.user_bytes(0x51_0000, b"data");
        assert_eq!(
            sys_send(&mut fx.proc, fd, payload, 4, 0),
            Err(Errno::Einval)
        );
    }

    #[test]
    fn connect_on_non_socket_is_ebadf() {
        let mut fx = SyscallFixture::new();
        let addr_ptr = fx.user_bytes(0x50_0000, &sockaddr_bytes([1, 2, 3, 4], 80));
        // fd 1 is the console.
        assert_eq!(
            sys_connect(&mut fx.proc, 1, addr_ptr, 16),
            Err(Errno::Ebadf)
        );
        assert_eq!(
            sys_socket(&mut fx.proc, 99, 1, 0),
            Err(Errno::Einval)
        );
    }
}
