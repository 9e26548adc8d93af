//! Request/reply socket over TCP.

use std::io::{self, prelude::*};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use super::CtrlMessage;
use crate::error::{Error, Result};

/// Upper bound on a control-plane message body. Anything larger is a
/// corrupt or hostile frame.
const MAX_FRAME_LEN: usize = 1 << 20;

pub(crate) fn write_message(stream: &mut TcpStream, msg: &CtrlMessage) -> io::Result<()> {
    let body = serde_json::to_vec(msg)?;
    stream.write_all(&(body.len() as u32).to_le_bytes())?;
    stream.write_all(&body)?;
    Ok(())
}

pub(crate) fn read_message(stream: &mut TcpStream) -> io::Result<CtrlMessage> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("oversized control-plane frame of {} bytes", len),
        ));
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    Ok(serde_json::from_slice(&body)?)
}

/// A connected request/reply channel to one control-plane peer.
///
/// The connection is persistent; any number of request/reply exchanges may
/// ride on it. Connect, send, and receive each observe the configured
/// timeout.
pub struct CtrlSocket {
    stream: TcpStream,
    peer: String,
}

impl CtrlSocket {
    /// Connect to `addr` (an `ip:port` string).
    pub fn connect(addr: &str, timeout: Duration) -> Result<Self> {
        let sock_addr = addr
            .to_socket_addrs()
            .map_err(|e| Error::ctrl(format!("cannot resolve '{}': {}", addr, e)))?
            .next()
            .ok_or_else(|| Error::ctrl(format!("'{}' resolves to no address", addr)))?;

        let stream = TcpStream::connect_timeout(&sock_addr, timeout)
            .map_err(|e| Error::ctrl(format!("cannot connect to '{}': {}", addr, e)))?;
        stream
            .set_nodelay(true)
            .and_then(|()| stream.set_read_timeout(Some(timeout)))
            .and_then(|()| stream.set_write_timeout(Some(timeout)))
            .map_err(|e| Error::ctrl(format!("cannot configure socket to '{}': {}", addr, e)))?;

        Ok(Self {
            stream,
            peer: addr.to_owned(),
        })
    }

    /// The peer this socket is connected to.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Send a request and block for the reply.
    pub fn request(&mut self, msg: &CtrlMessage) -> Result<CtrlMessage> {
        write_message(&mut self.stream, msg)
            .map_err(|e| Error::ctrl(format!("send to '{}' failed: {}", self.peer, e)))?;
        read_message(&mut self.stream)
            .map_err(|e| Error::ctrl(format!("receive from '{}' failed: {}", self.peer, e)))
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::thread;

    use super::*;
    use crate::proto::{MessageStatus, QpAddress};

    #[test]
    fn frame_roundtrip_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let echo = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            for _ in 0..2 {
                let msg = read_message(&mut stream).unwrap();
                write_message(&mut stream, &msg).unwrap();
            }
        });

        let mut socket =
            CtrlSocket::connect(&addr.to_string(), Duration::from_millis(500)).unwrap();

        let sent = CtrlMessage::ConnRequest {
            address: QpAddress {
                buffer: 0xDEAD_0000,
                rkey: 7,
                qp_num: 42,
                lid: 3,
                gid: crate::verbs::Gid([9; 16]),
                psn: 0x123456,
            },
            node_id: 17,
        };
        match socket.request(&sent).unwrap() {
            CtrlMessage::ConnRequest { address, node_id } => {
                assert_eq!(node_id, 17);
                assert_eq!(address.buffer, 0xDEAD_0000);
                assert_eq!(address.qp_num, 42);
                assert_eq!(address.gid.0, [9; 16]);
            }
            other => panic!("unexpected echo: {:?}", other),
        }

        // A second exchange on the same connection must work too.
        let again = CtrlMessage::Error {
            status: MessageStatus::InvalidMessage,
        };
        match socket.request(&again).unwrap() {
            CtrlMessage::Error { status } => assert_eq!(status, MessageStatus::InvalidMessage),
            other => panic!("unexpected echo: {:?}", other),
        }

        echo.join().unwrap();
    }

    #[test]
    fn connect_to_dead_port_fails() {
        // Port 1 is virtually never listening.
        let result = CtrlSocket::connect("127.0.0.1:1", Duration::from_millis(100));
        assert!(result.is_err());
    }
}
