//! Blocking client for the application side of the channel protocol.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use netcon_rpc::{
    decode_address_reply, encode_token, Command, RetVal, RpcBlock, AF_INET, AF_INET6,
    ADDRESS_REPLY_LEN, RETVAL_REPLY_LEN, RPC_ACK, RPC_RETVAL_TAG, SOCK_DGRAM, SOCK_STREAM,
};
use netcon_stack::SocketKind;
use thiserror::Error;

use crate::fdpass;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] netcon_rpc::Error),
    #[error("remote call failed: {}", io::Error::from_raw_os_error(*.0))]
    Errno(i32),
    #[error("unexpected acknowledgement byte {0:#04x}")]
    UnexpectedAck(u8),
}

impl ClientError {
    pub fn errno(&self) -> Option<i32> {
        match self {
            ClientError::Errno(errno) => Some(*errno),
            ClientError::Io(err) => err.raw_os_error(),
            _ => None,
        }
    }
}

/// Talks to a `netcon-tapd` socket path. Each call opens a fresh reply channel.
#[derive(Debug, Clone)]
pub struct RpcClient {
    path: PathBuf,
    pid: u32,
}

/// The data channel of one remote socket.
#[derive(Debug)]
pub struct ClientSocket {
    stream: UnixStream,
    kind: SocketKind,
}

impl RpcClient {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            pid: std::process::id(),
        }
    }

    pub fn socket(&self, kind: SocketKind, ipv6: bool) -> Result<ClientSocket, ClientError> {
        let socket_type = match kind {
            SocketKind::Stream => SOCK_STREAM,
            SocketKind::Datagram => SOCK_DGRAM,
        };
        let domain = if ipv6 { AF_INET6 } else { AF_INET };
        let mut stream = UnixStream::connect(&self.path)?;
        self.send_block(
            &mut stream,
            0,
            Command::Socket {
                domain: i32::from(domain),
                socket_type,
                protocol: 0,
            },
        )?;
        Ok(ClientSocket { stream, kind })
    }

    pub fn bind(&self, socket: &mut ClientSocket, addr: SocketAddr) -> Result<(), ClientError> {
        let fd = socket.fd();
        self.call_retval(socket, Command::Bind { fd, addr: Some(addr) })
    }

    pub fn listen(&self, socket: &mut ClientSocket, backlog: i32) -> Result<(), ClientError> {
        let fd = socket.fd();
        self.call_retval(socket, Command::Listen { fd, backlog })
    }

    pub fn connect(&self, socket: &mut ClientSocket, addr: SocketAddr) -> Result<(), ClientError> {
        let fd = socket.fd();
        self.call_retval(socket, Command::Connect { fd, addr: Some(addr) })
    }

    pub fn getsockname(&self, socket: &mut ClientSocket) -> Result<SocketAddr, ClientError> {
        let fd = socket.fd();
        self.call_address(socket, Command::GetSockName { fd })
    }

    pub fn getpeername(&self, socket: &mut ClientSocket) -> Result<SocketAddr, ClientError> {
        let fd = socket.fd();
        self.call_address(socket, Command::GetPeerName { fd })
    }

    fn send_block(
        &self,
        stream: &mut UnixStream,
        token: u64,
        command: Command,
    ) -> Result<(), ClientError> {
        let block = RpcBlock::new(self.pid, 0, token, command);
        stream.write_all(&block.encode())?;
        let mut ack = [0u8; 1];
        stream.read_exact(&mut ack)?;
        match ack[0] {
            RPC_ACK => Ok(()),
            RPC_RETVAL_TAG => {
                let mut reply = [0u8; RETVAL_REPLY_LEN];
                reply[0] = ack[0];
                stream.read_exact(&mut reply[1..])?;
                Err(ClientError::Errno(RetVal::decode(&reply)?.errno))
            }
            other => Err(ClientError::UnexpectedAck(other)),
        }
    }

    /// Stages `command`, ties it to `socket` with a token and returns the raw reply.
    fn call(
        &self,
        socket: &mut ClientSocket,
        command: Command,
        reply_len: usize,
    ) -> Result<Vec<u8>, ClientError> {
        let token = loop {
            let token: u64 = rand::random();
            if token != 0 {
                break token;
            }
        };
        let mut reply_channel = UnixStream::connect(&self.path)?;
        self.send_block(&mut reply_channel, token, command)?;
        socket.stream.write_all(&encode_token(token))?;
        let mut reply = vec![0u8; reply_len];
        reply_channel.read_exact(&mut reply[..RETVAL_REPLY_LEN])?;
        let ret = RetVal::decode(&reply[..RETVAL_REPLY_LEN])?;
        if !ret.is_ok() {
            return Err(ClientError::Errno(ret.errno));
        }
        reply_channel.read_exact(&mut reply[RETVAL_REPLY_LEN..])?;
        Ok(reply)
    }

    fn call_retval(&self, socket: &mut ClientSocket, command: Command) -> Result<(), ClientError> {
        self.call(socket, command, RETVAL_REPLY_LEN).map(|_| ())
    }

    fn call_address(
        &self,
        socket: &mut ClientSocket,
        command: Command,
    ) -> Result<SocketAddr, ClientError> {
        let reply = self.call(socket, command, ADDRESS_REPLY_LEN)?;
        let (_, addr) = decode_address_reply(&reply)?;
        addr.ok_or(ClientError::Errno(netcon_rpc::errno::ENOTCONN))
    }
}

impl ClientSocket {
    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    fn fd(&self) -> i32 {
        self.stream.as_raw_fd()
    }

    /// Waits for the next connection accepted on this listening socket.
    pub fn accept(&self) -> Result<UnixStream, ClientError> {
        let fd = fdpass::recv_fd(self.stream.as_raw_fd())?;
        Ok(UnixStream::from(fd))
    }

    pub fn stream(&self) -> &UnixStream {
        &self.stream
    }

    pub fn into_stream(self) -> UnixStream {
        self.stream
    }
}

impl Read for ClientSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for ClientSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}
