//! Raw socket calls the standard library does not expose: descriptor passing and a
//! nonconsuming liveness peek.
#![allow(unsafe_code)]

use std::io;
use std::mem;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::ptr;

/// Byte carried alongside a passed descriptor.
pub const FD_MARKER: u8 = b'A';

fn control_words() -> usize {
    // SAFETY: CMSG_SPACE only does arithmetic on its argument.
    let space = unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) } as usize;
    space.div_ceil(mem::size_of::<u64>())
}

/// Sends `fd` over the connected Unix socket `socket` without blocking.
pub fn send_fd(socket: RawFd, fd: RawFd) -> io::Result<()> {
    let payload = [FD_MARKER];
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };
    // u64 backing keeps the control buffer aligned for `cmsghdr`.
    let mut control = vec![0u64; control_words()];

    // SAFETY: an all-zero msghdr is a valid empty message.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = (control.len() * mem::size_of::<u64>()) as _;

    // SAFETY: `msg` points at `control`, which is large enough for one descriptor, so the first
    // header and its data area are in bounds.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "control buffer too small",
            ));
        }
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
        ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>(), fd);
    }

    // SAFETY: every pointer in `msg` refers to a live local buffer.
    let sent = unsafe { libc::sendmsg(socket, &msg, libc::MSG_NOSIGNAL | libc::MSG_DONTWAIT) };
    if sent < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Blocks until a descriptor arrives on `socket`.
pub fn recv_fd(socket: RawFd) -> io::Result<OwnedFd> {
    let mut payload = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr().cast(),
        iov_len: payload.len(),
    };
    let mut control = vec![0u64; control_words()];

    // SAFETY: an all-zero msghdr is a valid empty message.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = (control.len() * mem::size_of::<u64>()) as _;

    // SAFETY: every pointer in `msg` refers to a live local buffer.
    let n = unsafe { libc::recvmsg(socket, &mut msg, libc::MSG_CMSG_CLOEXEC) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    if n == 0 {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }

    // SAFETY: the kernel filled `control` and set `msg_controllen`; the CMSG macros stay within
    // that length.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let fd = ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>());
                return Ok(OwnedFd::from_raw_fd(fd));
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "message carried no descriptor",
    ))
}

/// `Ok(false)` once the peer has closed its end. Pending bytes are left in place.
pub fn peek_alive(socket: RawFd) -> io::Result<bool> {
    let mut byte = [0u8; 1];
    // SAFETY: `byte` is a live one-byte buffer.
    let n = unsafe {
        libc::recv(
            socket,
            byte.as_mut_ptr().cast(),
            byte.len(),
            libc::MSG_PEEK | libc::MSG_DONTWAIT,
        )
    };
    match n {
        0 => Ok(false),
        n if n > 0 => Ok(true),
        _ => {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(true)
            } else {
                Err(err)
            }
        }
    }
}
