use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use super::{
    is_login_successful, login_envelope, logout_envelope, ProtocolError, RECEIVE_BUFFER_BYTES,
};

/// One plaintext TCP session to a provisioning server.
///
/// Every envelope goes out in a single write and every response is taken
/// from a single read; the protocol has no length prefix.
#[derive(Debug)]
pub struct SpsSession {
    stream: TcpStream,
    peer_addr: SocketAddr,
    home_path: String,
}

impl SpsSession {
    /// `connect_timeout` of `None` leaves the OS default in place.
    pub fn connect(
        peer_addr: SocketAddr,
        home_path: &str,
        connect_timeout: Option<Duration>,
    ) -> io::Result<Self> {
        let stream = match connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(&peer_addr, timeout)?,
            None => TcpStream::connect(peer_addr)?,
        };
        stream.set_nodelay(true)?;

        Ok(Self {
            stream,
            peer_addr,
            home_path: home_path.to_owned(),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn home_path(&self) -> &str {
        &self.home_path
    }

    pub fn send(&mut self, envelope: &str) -> Result<(), ProtocolError> {
        self.stream
            .write_all(envelope.as_bytes())
            .map_err(|source| ProtocolError::Send { source })
    }

    /// Raw bytes of one read.
    pub fn receive_bytes(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let mut buffer = [0_u8; RECEIVE_BUFFER_BYTES];
        loop {
            match self.stream.read(&mut buffer) {
                Ok(0) => return Err(ProtocolError::ConnectionClosed),
                Ok(size) => return Ok(buffer[..size].to_vec()),
                Err(source) if source.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => return Err(ProtocolError::Receive { source }),
            }
        }
    }

    /// One read as text. Bytes that are not valid UTF-8 are rejected, never
    /// replaced.
    pub fn receive(&mut self) -> Result<String, ProtocolError> {
        let bytes = self.receive_bytes()?;
        let size = bytes.len();
        String::from_utf8(bytes).map_err(|error| ProtocolError::InvalidEncoding {
            size,
            valid_up_to: error.utf8_error().valid_up_to(),
        })
    }

    pub fn exchange(&mut self, envelope: &str) -> Result<String, ProtocolError> {
        self.send(envelope)?;
        self.receive()
    }

    pub fn login(&mut self, user_name: &str, password: &str) -> Result<(), ProtocolError> {
        let envelope = login_envelope(&self.home_path, user_name, password);
        self.send(&envelope)?;
        let response = String::from_utf8_lossy(&self.receive_bytes()?).into_owned();
        if is_login_successful(&response) {
            Ok(())
        } else {
            Err(ProtocolError::LoginRejected { response })
        }
    }

    /// Best effort; the response content is not inspected.
    pub fn logout(&mut self) -> Result<(), ProtocolError> {
        let envelope = logout_envelope(&self.home_path);
        self.send(&envelope)?;
        self.receive_bytes().map(|_| ())
    }

    pub fn close(self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
