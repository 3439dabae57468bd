//! Errno numbers carried in retval replies.
//!
//! Values use Linux numbering regardless of the host platform so both ends of the channel agree.

pub const EBADF: i32 = 9;
pub const ENOMEM: i32 = 12;
pub const EINVAL: i32 = 22;
pub const ESOCKTNOSUPPORT: i32 = 94;
pub const EADDRINUSE: i32 = 98;
pub const ENETUNREACH: i32 = 101;
pub const ECONNABORTED: i32 = 103;
pub const ENOBUFS: i32 = 105;
pub const EISCONN: i32 = 106;
pub const ENOTCONN: i32 = 107;
pub const ETIMEDOUT: i32 = 110;
pub const ECONNREFUSED: i32 = 111;
