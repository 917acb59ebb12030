//! Gateway-to-gateway networking: framed peer requests and the listener

pub mod protocol;
pub mod url;

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use self::protocol::{decode_message, encode_message, Message};

/// Ceiling on a framed message (one write can carry many blocks)
const MAX_MESSAGE_BYTES: usize = 100 * 1024 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Send one request to a peer gateway and wait for its response.
///
/// Any transport failure maps to `RemoteUnavailable`, which is what lets
/// the dispatcher attempt a coordinator takeover.
pub fn peer_request(addr: &str, msg: &Message) -> Result<Message> {
    let sock_addr: SocketAddr = addr
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("bad peer address {}", addr)))?;

    let mut stream = TcpStream::connect_timeout(&sock_addr, CONNECT_TIMEOUT)
        .map_err(|e| Error::RemoteUnavailable(format!("{}: {}", addr, e)))?;
    stream
        .set_read_timeout(Some(IO_TIMEOUT))
        .map_err(|e| Error::RemoteUnavailable(e.to_string()))?;
    stream
        .set_write_timeout(Some(IO_TIMEOUT))
        .map_err(|e| Error::RemoteUnavailable(e.to_string()))?;

    send_framed(&mut stream, msg).map_err(|e| Error::RemoteUnavailable(e.to_string()))?;
    recv_framed(&mut stream).map_err(|e| Error::RemoteUnavailable(e.to_string()))
}

fn send_framed(stream: &mut TcpStream, msg: &Message) -> Result<()> {
    let data = encode_message(msg)?;
    let len = (data.len() as u32).to_le_bytes();
    stream.write_all(&len)?;
    stream.write_all(&data)?;
    stream.flush()?;
    Ok(())
}

fn recv_framed(stream: &mut TcpStream) -> Result<Message> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;

    if len > MAX_MESSAGE_BYTES {
        return Err(Error::Corrupt(format!("peer message of {} bytes", len)));
    }

    let mut data = vec![0u8; len];
    stream.read_exact(&mut data)?;
    Ok(decode_message(&data)?)
}

/// Listener for requests from peer gateways
pub struct PeerServer {
    running: Arc<RwLock<bool>>,
}

impl PeerServer {
    /// Start serving on `bind`, dispatching each message to `handler`
    pub fn start<F>(bind: &str, handler: F) -> Result<Self>
    where
        F: Fn(Message) -> Message + Send + Sync + 'static,
    {
        let bind_addr: SocketAddr = bind
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("bad bind address {}", bind)))?;
        let listener = TcpListener::bind(bind_addr)?;
        listener.set_nonblocking(true)?;

        let running = Arc::new(RwLock::new(true));
        let running_for_accept = Arc::clone(&running);
        let handler = Arc::new(handler);

        thread::spawn(move || {
            info!("Peer server listening on {}", bind_addr);

            while *running_for_accept.read().unwrap() {
                match listener.accept() {
                    Ok((stream, addr)) => {
                        debug!("Accepted peer connection from {}", addr);
                        let handler = Arc::clone(&handler);
                        thread::spawn(move || {
                            if let Err(e) = serve_connection(stream, handler.as_ref()) {
                                debug!("Peer connection from {} ended: {}", addr, e);
                            }
                        });
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(100));
                    }
                    Err(e) => {
                        warn!("Accept error: {}", e);
                    }
                }
            }
        });

        Ok(Self { running })
    }

    pub fn stop(&self) {
        *self.running.write().unwrap() = false;
    }
}

fn serve_connection<F>(mut stream: TcpStream, handler: &F) -> Result<()>
where
    F: Fn(Message) -> Message,
{
    stream.set_read_timeout(Some(Duration::from_secs(60)))?;

    loop {
        let msg = recv_framed(&mut stream)?;
        let response = handler(msg);
        send_framed(&mut stream, &response)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::protocol::{AcceptedMsg, DetachMsg};

    #[test]
    fn test_request_response_over_loopback() {
        let server = PeerServer::start("127.0.0.1:19611", |msg| match msg {
            Message::Detach(d) => {
                assert_eq!(d.fs_path, "/x");
                Message::Accepted(AcceptedMsg { write_nonce: 7 })
            }
            _ => Message::Error(protocol::ErrorMsg {
                code: libc::EINVAL,
                text: "unexpected".to_string(),
            }),
        })
        .unwrap();

        // The accept loop polls at 100ms; give it a beat to come up
        std::thread::sleep(Duration::from_millis(200));

        let reply = peer_request(
            "127.0.0.1:19611",
            &Message::Detach(DetachMsg {
                fs_path: "/x".to_string(),
                file_version: 1,
            }),
        )
        .unwrap();

        match reply {
            Message::Accepted(a) => assert_eq!(a.write_nonce, 7),
            other => panic!("wrong reply: {:?}", other),
        }
        server.stop();
    }

    #[test]
    fn test_unreachable_peer_is_remote_unavailable() {
        let err = peer_request(
            "127.0.0.1:1",
            &Message::Detach(DetachMsg {
                fs_path: "/x".to_string(),
                file_version: 1,
            }),
        )
        .unwrap_err();
        assert!(err.is_remote_unavailable());
    }
}
