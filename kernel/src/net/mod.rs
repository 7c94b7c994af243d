//! Network objects exposed through the socket syscalls. The protocol
//! engines (NIC driver, TCP/IP stack) are external collaborators; this layer
//! owns the endpoint records and their state machine.

pub mod socket;

pub use socket::{Socket, SocketAddr, SocketType, TcpState};
