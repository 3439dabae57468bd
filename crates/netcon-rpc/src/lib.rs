#![forbid(unsafe_code)]

//! Application channel wire protocol codec.
//!
//! An application talks to the tap over a local byte-stream channel. Frames on that channel are
//! either fixed-size control blocks or raw stream bytes for an already-open connection. A frame is
//! a control block if and only if it is exactly [`RPC_BLOCK_LEN`] bytes long.
//!
//! Control block (integers little-endian):
//!
//! ```text
//! 0       4       8                    28    29          37                      128
//! +-------+-------+--------------------+-----+-----------+-----------------------+
//! |  pid  |  tid  |  timestamp (20)    | cmd |  token    | command payload (91)  |
//! +-------+-------+--------------------+-----+-----------+-----------------------+
//! ```
//!
//! Every accepted control block is acknowledged with [`RPC_ACK`]. Deferred commands are answered
//! with a retval reply:
//!
//! ```text
//! +-----+-------------+-------------+
//! | 'R' | retval(i32) | errno (i32) |   9 bytes
//! +-----+-------------+-------------+
//! ```
//!
//! A stream frame may embed `[token:u64][TOKEN_MARKER]` so the tap can tie the data channel to a
//! pending command without a second round trip.

use core::fmt;
use std::net::SocketAddr;

pub mod errno;
mod sockaddr;

pub use sockaddr::{decode_sockaddr, encode_sockaddr, AF_INET, AF_INET6, AF_UNSPEC, SOCKADDR_LEN};

pub const RPC_BLOCK_LEN: usize = 128;
pub const RPC_HEADER_LEN: usize = 37;
pub const RPC_PAYLOAD_LEN: usize = RPC_BLOCK_LEN - RPC_HEADER_LEN;
pub const RPC_TIMESTAMP_LEN: usize = 20;

const IDX_PID: usize = 0;
const IDX_TID: usize = 4;
const IDX_TIMESTAMP: usize = 8;
const IDX_CMD: usize = 28;
const IDX_TOKEN: usize = 29;
const IDX_PAYLOAD: usize = RPC_HEADER_LEN;

pub const RPC_CMD_SOCKET: u8 = 1;
pub const RPC_CMD_BIND: u8 = 2;
pub const RPC_CMD_LISTEN: u8 = 3;
pub const RPC_CMD_CONNECT: u8 = 4;
pub const RPC_CMD_GETSOCKNAME: u8 = 5;
pub const RPC_CMD_GETPEERNAME: u8 = 6;

/// Single-byte acknowledgement written for every accepted control block.
pub const RPC_ACK: u8 = b'z';
pub const RPC_RETVAL_TAG: u8 = b'R';
pub const RETVAL_REPLY_LEN: usize = 9;
pub const ADDRESS_REPLY_LEN: usize = RETVAL_REPLY_LEN + SOCKADDR_LEN;

pub const TOKEN_MARKER: [u8; 8] = [0x7f, b'N', b'C', b'T', b'O', b'K', 0x7f, 0x00];
pub const TOKEN_FRAME_LEN: usize = 8 + TOKEN_MARKER.len();

pub const SOCK_STREAM: i32 = 1;
pub const SOCK_DGRAM: i32 = 2;
pub const SOCK_RAW: i32 = 3;
/// Masks off `SOCK_NONBLOCK` / `SOCK_CLOEXEC` style flags.
pub const SOCK_TYPE_MASK: i32 = 0xf;

pub const DATAGRAM_HEADER_LEN: usize = 21;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    BlockWrongLen { len: usize },
    AddressTooShort { len: usize },
    UnknownAddressFamily { family: u16 },
    ReplyTooShort { len: usize, expected: usize },
    UnexpectedReplyTag { tag: u8 },
    RecordTooShort { len: usize },
    RecordTruncated { expected: usize, got: usize },
    RecordUnknownFamily { family: u8 },
    PayloadTooLarge { len: usize, max: usize },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BlockWrongLen { len } => {
                write!(f, "control block must be {RPC_BLOCK_LEN} bytes (got {len})")
            }
            Error::AddressTooShort { len } => {
                write!(f, "socket address too short: {len} < {SOCKADDR_LEN}")
            }
            Error::UnknownAddressFamily { family } => {
                write!(f, "unknown socket address family: {family}")
            }
            Error::ReplyTooShort { len, expected } => {
                write!(f, "reply too short: {len} < {expected}")
            }
            Error::UnexpectedReplyTag { tag } => write!(f, "unexpected reply tag: {tag:#04x}"),
            Error::RecordTooShort { len } => {
                write!(f, "datagram record too short: {len} < {DATAGRAM_HEADER_LEN}")
            }
            Error::RecordTruncated { expected, got } => write!(
                f,
                "datagram record truncated: expected {expected} bytes, got {got}"
            ),
            Error::RecordUnknownFamily { family } => {
                write!(f, "datagram record has unknown family: {family}")
            }
            Error::PayloadTooLarge { len, max } => write!(f, "payload too large: {len} > {max}"),
        }
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Socket {
        domain: i32,
        socket_type: i32,
        protocol: i32,
    },
    Bind {
        fd: i32,
        addr: Option<SocketAddr>,
    },
    Listen {
        fd: i32,
        backlog: i32,
    },
    Connect {
        fd: i32,
        addr: Option<SocketAddr>,
    },
    GetSockName {
        fd: i32,
    },
    GetPeerName {
        fd: i32,
    },
    Unknown(u8),
}

impl Command {
    pub fn code(&self) -> u8 {
        match self {
            Command::Socket { .. } => RPC_CMD_SOCKET,
            Command::Bind { .. } => RPC_CMD_BIND,
            Command::Listen { .. } => RPC_CMD_LISTEN,
            Command::Connect { .. } => RPC_CMD_CONNECT,
            Command::GetSockName { .. } => RPC_CMD_GETSOCKNAME,
            Command::GetPeerName { .. } => RPC_CMD_GETPEERNAME,
            Command::Unknown(code) => *code,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Socket { .. } => "socket",
            Command::Bind { .. } => "bind",
            Command::Listen { .. } => "listen",
            Command::Connect { .. } => "connect",
            Command::GetSockName { .. } => "getsockname",
            Command::GetPeerName { .. } => "getpeername",
            Command::Unknown(_) => "unknown",
        }
    }

    fn decode(code: u8, payload: &[u8]) -> Result<Self, Error> {
        let cmd = match code {
            RPC_CMD_SOCKET => Command::Socket {
                domain: read_i32(payload, 0),
                socket_type: read_i32(payload, 4),
                protocol: read_i32(payload, 8),
            },
            RPC_CMD_BIND => Command::Bind {
                fd: read_i32(payload, 0),
                addr: decode_sockaddr(&payload[4..])?,
            },
            RPC_CMD_LISTEN => Command::Listen {
                fd: read_i32(payload, 0),
                backlog: read_i32(payload, 4),
            },
            RPC_CMD_CONNECT => Command::Connect {
                fd: read_i32(payload, 0),
                addr: decode_sockaddr(&payload[4..])?,
            },
            RPC_CMD_GETSOCKNAME => Command::GetSockName {
                fd: read_i32(payload, 0),
            },
            RPC_CMD_GETPEERNAME => Command::GetPeerName {
                fd: read_i32(payload, 0),
            },
            other => Command::Unknown(other),
        };
        Ok(cmd)
    }

    fn encode_payload(&self, out: &mut [u8]) {
        match *self {
            Command::Socket {
                domain,
                socket_type,
                protocol,
            } => {
                out[0..4].copy_from_slice(&domain.to_le_bytes());
                out[4..8].copy_from_slice(&socket_type.to_le_bytes());
                out[8..12].copy_from_slice(&protocol.to_le_bytes());
            }
            Command::Bind { fd, addr } | Command::Connect { fd, addr } => {
                out[0..4].copy_from_slice(&fd.to_le_bytes());
                out[4..4 + SOCKADDR_LEN].copy_from_slice(&encode_sockaddr(addr));
                let addrlen = SOCKADDR_LEN as u32;
                out[4 + SOCKADDR_LEN..8 + SOCKADDR_LEN].copy_from_slice(&addrlen.to_le_bytes());
            }
            Command::Listen { fd, backlog } => {
                out[0..4].copy_from_slice(&fd.to_le_bytes());
                out[4..8].copy_from_slice(&backlog.to_le_bytes());
            }
            Command::GetSockName { fd } | Command::GetPeerName { fd } => {
                out[0..4].copy_from_slice(&fd.to_le_bytes());
            }
            Command::Unknown(_) => {}
        }
    }
}

fn read_i32(buf: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcBlock {
    pub pid: u32,
    pub tid: u32,
    pub timestamp: [u8; RPC_TIMESTAMP_LEN],
    pub token: u64,
    pub command: Command,
}

impl RpcBlock {
    pub fn new(pid: u32, tid: u32, token: u64, command: Command) -> Self {
        Self {
            pid,
            tid,
            timestamp: [0u8; RPC_TIMESTAMP_LEN],
            token,
            command,
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() != RPC_BLOCK_LEN {
            return Err(Error::BlockWrongLen { len: buf.len() });
        }
        let pid = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let tid = u32::from_le_bytes([
            buf[IDX_TID],
            buf[IDX_TID + 1],
            buf[IDX_TID + 2],
            buf[IDX_TID + 3],
        ]);
        let mut timestamp = [0u8; RPC_TIMESTAMP_LEN];
        timestamp.copy_from_slice(&buf[IDX_TIMESTAMP..IDX_TIMESTAMP + RPC_TIMESTAMP_LEN]);
        let mut token = [0u8; 8];
        token.copy_from_slice(&buf[IDX_TOKEN..IDX_TOKEN + 8]);
        let command = Command::decode(buf[IDX_CMD], &buf[IDX_PAYLOAD..])?;
        Ok(Self {
            pid,
            tid,
            timestamp,
            token: u64::from_le_bytes(token),
            command,
        })
    }

    pub fn encode(&self) -> [u8; RPC_BLOCK_LEN] {
        let mut out = [0u8; RPC_BLOCK_LEN];
        out[IDX_PID..IDX_PID + 4].copy_from_slice(&self.pid.to_le_bytes());
        out[IDX_TID..IDX_TID + 4].copy_from_slice(&self.tid.to_le_bytes());
        out[IDX_TIMESTAMP..IDX_TIMESTAMP + RPC_TIMESTAMP_LEN].copy_from_slice(&self.timestamp);
        out[IDX_CMD] = self.command.code();
        out[IDX_TOKEN..IDX_TOKEN + 8].copy_from_slice(&self.token.to_le_bytes());
        self.command.encode_payload(&mut out[IDX_PAYLOAD..]);
        out
    }
}

/// Stream bytes from one channel read, with an embedded correlation token removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataFrame<'a> {
    pub token: Option<u64>,
    /// Bytes preceding the token, or the whole frame when no token is present.
    pub head: &'a [u8],
    /// Bytes following the token marker.
    pub tail: &'a [u8],
}

impl<'a> DataFrame<'a> {
    pub fn len(&self) -> usize {
        self.head.len() + self.tail.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn chunks(&self) -> [&'a [u8]; 2] {
        [self.head, self.tail]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFrame<'a> {
    Control(RpcBlock),
    Data(DataFrame<'a>),
}

/// Classifies one read from an application channel.
pub fn classify_frame(buf: &[u8]) -> Result<ChannelFrame<'_>, Error> {
    if buf.len() == RPC_BLOCK_LEN {
        return RpcBlock::decode(buf).map(ChannelFrame::Control);
    }
    Ok(ChannelFrame::Data(split_token(buf)))
}

pub fn split_token(buf: &[u8]) -> DataFrame<'_> {
    let marker_at = buf
        .windows(TOKEN_MARKER.len())
        .position(|w| w == TOKEN_MARKER)
        .filter(|&pos| pos >= 8);
    match marker_at {
        Some(pos) => {
            let mut token = [0u8; 8];
            token.copy_from_slice(&buf[pos - 8..pos]);
            DataFrame {
                token: Some(u64::from_le_bytes(token)),
                head: &buf[..pos - 8],
                tail: &buf[pos + TOKEN_MARKER.len()..],
            }
        }
        None => DataFrame {
            token: None,
            head: buf,
            tail: &[],
        },
    }
}

pub fn encode_token(token: u64) -> [u8; TOKEN_FRAME_LEN] {
    let mut out = [0u8; TOKEN_FRAME_LEN];
    out[..8].copy_from_slice(&token.to_le_bytes());
    out[8..].copy_from_slice(&TOKEN_MARKER);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetVal {
    pub retval: i32,
    pub errno: i32,
}

impl RetVal {
    pub const OK: RetVal = RetVal {
        retval: 0,
        errno: 0,
    };

    pub fn error(errno: i32) -> Self {
        Self { retval: -1, errno }
    }

    pub fn is_ok(&self) -> bool {
        self.retval >= 0
    }

    pub fn encode(&self) -> [u8; RETVAL_REPLY_LEN] {
        let mut out = [0u8; RETVAL_REPLY_LEN];
        out[0] = RPC_RETVAL_TAG;
        out[1..5].copy_from_slice(&self.retval.to_le_bytes());
        out[5..9].copy_from_slice(&self.errno.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < RETVAL_REPLY_LEN {
            return Err(Error::ReplyTooShort {
                len: buf.len(),
                expected: RETVAL_REPLY_LEN,
            });
        }
        if buf[0] != RPC_RETVAL_TAG {
            return Err(Error::UnexpectedReplyTag { tag: buf[0] });
        }
        Ok(Self {
            retval: read_i32(buf, 1),
            errno: read_i32(buf, 5),
        })
    }
}

pub fn encode_address_reply(ret: RetVal, addr: Option<SocketAddr>) -> [u8; ADDRESS_REPLY_LEN] {
    let mut out = [0u8; ADDRESS_REPLY_LEN];
    out[..RETVAL_REPLY_LEN].copy_from_slice(&ret.encode());
    out[RETVAL_REPLY_LEN..].copy_from_slice(&encode_sockaddr(addr));
    out
}

pub fn decode_address_reply(buf: &[u8]) -> Result<(RetVal, Option<SocketAddr>), Error> {
    if buf.len() < ADDRESS_REPLY_LEN {
        return Err(Error::ReplyTooShort {
            len: buf.len(),
            expected: ADDRESS_REPLY_LEN,
        });
    }
    let ret = RetVal::decode(&buf[..RETVAL_REPLY_LEN])?;
    let addr = decode_sockaddr(&buf[RETVAL_REPLY_LEN..])?;
    Ok((ret, addr))
}

/// Header prepended to each datagram delivered to the application.
///
/// ```text
/// +--------+----------+-------------+----------+
/// | family | port(BE) | address(16) | len (BE) |   21 bytes, then `len` payload bytes
/// +--------+----------+-------------+----------+
/// ```
pub fn encode_datagram_header(
    from: SocketAddr,
    len: usize,
) -> Result<[u8; DATAGRAM_HEADER_LEN], Error> {
    if len > u16::MAX as usize {
        return Err(Error::PayloadTooLarge {
            len,
            max: u16::MAX as usize,
        });
    }
    let mut out = [0u8; DATAGRAM_HEADER_LEN];
    match from {
        SocketAddr::V4(v4) => {
            out[0] = 4;
            out[3..7].copy_from_slice(&v4.ip().octets());
        }
        SocketAddr::V6(v6) => {
            out[0] = 6;
            out[3..19].copy_from_slice(&v6.ip().octets());
        }
    }
    out[1..3].copy_from_slice(&from.port().to_be_bytes());
    out[19..21].copy_from_slice(&(len as u16).to_be_bytes());
    Ok(out)
}

/// Decodes one datagram record from the front of `buf`, returning the sender, the payload and the
/// number of bytes consumed.
pub fn decode_datagram_record(buf: &[u8]) -> Result<(SocketAddr, &[u8], usize), Error> {
    if buf.len() < DATAGRAM_HEADER_LEN {
        return Err(Error::RecordTooShort { len: buf.len() });
    }
    let port = u16::from_be_bytes([buf[1], buf[2]]);
    let from = match buf[0] {
        4 => SocketAddr::from(([buf[3], buf[4], buf[5], buf[6]], port)),
        6 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[3..19]);
            SocketAddr::from((octets, port))
        }
        family => return Err(Error::RecordUnknownFamily { family }),
    };
    let len = u16::from_be_bytes([buf[19], buf[20]]) as usize;
    let end = DATAGRAM_HEADER_LEN + len;
    if buf.len() < end {
        return Err(Error::RecordTruncated {
            expected: end,
            got: buf.len(),
        });
    }
    Ok((from, &buf[DATAGRAM_HEADER_LEN..end], end))
}
