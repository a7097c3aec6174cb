// Blocking TCP transport to the update server (std::net works on ESP-IDF and on the host)

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};

use crate::config::OtaConfig;
use crate::error::TransportError;
use crate::transport::Connection;

/// Socket to the update server with bounded connect and receive waits.
pub struct TcpConnection {
    stream: TcpStream,
}

impl TcpConnection {
    pub fn connect(config: &OtaConfig) -> Result<Self, TransportError> {
        let addr = (config.server_host.as_str(), config.server_port)
            .to_socket_addrs()
            .map_err(|_| TransportError::Resolve)?
            .next()
            .ok_or(TransportError::Resolve)?;

        let stream = TcpStream::connect_timeout(&addr, config.connect_timeout())
            .map_err(|e| TransportError::Connect(e.kind()))?;
        stream
            .set_read_timeout(Some(config.recv_timeout()))
            .map_err(|e| TransportError::Connect(e.kind()))?;
        stream
            .set_write_timeout(Some(config.recv_timeout()))
            .map_err(|e| TransportError::Connect(e.kind()))?;
        stream.set_nodelay(true).map_err(|e| TransportError::Connect(e.kind()))?;

        log::debug!("Connected to {}", addr);
        Ok(Self { stream })
    }
}

impl Connection for TcpConnection {
    fn send_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(bytes).map_err(|e| match e.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut => TransportError::Timeout,
            kind => TransportError::Send(kind),
        })
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        loop {
            match self.stream.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                // Read timeouts surface as WouldBlock on some platforms.
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Err(TransportError::Timeout)
                }
                Err(e) => return Err(TransportError::Receive(e.kind())),
            }
        }
    }
}
