//! Fixed binary layouts for the check-in and lookup protocols.
//!
//! All integers are little-endian. A message that carries a port carries it as
//! exactly one descriptor in `SCM_RIGHTS` ancillary data attached to the
//! message bytes.
//!
//! ```text
//! CheckInRequest   msg_id:u32  token:u64
//! CheckInReply     msg_id:u32  status:u32              + 1 fd
//! LookUpRequest    msg_id:u32  len:u32     name[len]
//! LookUpReply      msg_id:u32  status:u32              + 1 fd iff status == Ok
//! ```
//!
//! `send_with_fd` and `recv_with_fd` touch only caller-provided and stack
//! buffers, so they are usable between `fork` and `exec`.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use super::namespace::MAX_SERVICE_NAME;

pub const CHECK_IN_MSG_ID: u32 = 0x4253_0001;
pub const CHECK_IN_REPLY_MSG_ID: u32 = 0x4253_0002;
pub const LOOK_UP_MSG_ID: u32 = 0x4253_0003;
pub const LOOK_UP_REPLY_MSG_ID: u32 = 0x4253_0004;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("short message: expected {expected} bytes, got {actual}")]
    Short { expected: usize, actual: usize },

    #[error("unexpected message id {0:#x}")]
    UnexpectedId(u32),

    #[error("unknown status {0}")]
    UnknownStatus(u32),

    #[error("service name length {0} exceeds limit")]
    NameTooLong(usize),

    #[error("service name is not valid UTF-8")]
    InvalidName,
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn expect_len(buf: &[u8], expected: usize) -> Result<(), WireError> {
    if buf.len() < expected {
        return Err(WireError::Short {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn expect_id(buf: &[u8], id: u32) -> Result<(), WireError> {
    match read_u32(buf, 0) {
        got if got == id => Ok(()),
        got => Err(WireError::UnexpectedId(got)),
    }
}

/// A child's first contact with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckInRequest {
    pub token: u64,
}

impl CheckInRequest {
    pub const LEN: usize = 12;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[..4].copy_from_slice(&CHECK_IN_MSG_ID.to_le_bytes());
        out[4..].copy_from_slice(&self.token.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        expect_len(buf, Self::LEN)?;
        expect_id(buf, CHECK_IN_MSG_ID)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[4..12]);
        Ok(Self {
            token: u64::from_le_bytes(raw),
        })
    }
}

/// Broker answer to a check-in; the replacement bootstrap port rides along.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckInReply;

impl CheckInReply {
    pub const LEN: usize = 8;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[..4].copy_from_slice(&CHECK_IN_REPLY_MSG_ID.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        expect_len(buf, Self::LEN)?;
        expect_id(buf, CHECK_IN_REPLY_MSG_ID)?;
        match read_u32(buf, 4) {
            0 => Ok(Self),
            other => Err(WireError::UnknownStatus(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookUpRequest {
    pub name: String,
}

impl LookUpRequest {
    pub const HEADER_LEN: usize = 8;

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let name = self.name.as_bytes();
        if name.len() > MAX_SERVICE_NAME {
            return Err(WireError::NameTooLong(name.len()));
        }
        let mut out = Vec::with_capacity(Self::HEADER_LEN + name.len());
        out.extend_from_slice(&LOOK_UP_MSG_ID.to_le_bytes());
        out.extend_from_slice(&(name.len() as u32).to_le_bytes());
        out.extend_from_slice(name);
        Ok(out)
    }

    /// Validate a header and return the length of the name that follows.
    pub fn body_len(header: &[u8]) -> Result<usize, WireError> {
        expect_len(header, Self::HEADER_LEN)?;
        expect_id(header, LOOK_UP_MSG_ID)?;
        let len = read_u32(header, 4) as usize;
        if len > MAX_SERVICE_NAME {
            return Err(WireError::NameTooLong(len));
        }
        Ok(len)
    }

    pub fn decode(header: &[u8], body: &[u8]) -> Result<Self, WireError> {
        let len = Self::body_len(header)?;
        expect_len(body, len)?;
        let name = std::str::from_utf8(&body[..len]).map_err(|_| WireError::InvalidName)?;
        Ok(Self {
            name: name.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LookUpStatus {
    Ok = 0,
    UnknownService = 1,
    NotPermitted = 2,
    Malformed = 3,
}

impl TryFrom<u32> for LookUpStatus {
    type Error = WireError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(LookUpStatus::Ok),
            1 => Ok(LookUpStatus::UnknownService),
            2 => Ok(LookUpStatus::NotPermitted),
            3 => Ok(LookUpStatus::Malformed),
            other => Err(WireError::UnknownStatus(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookUpReply {
    pub status: LookUpStatus,
}

impl LookUpReply {
    pub const LEN: usize = 8;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[..4].copy_from_slice(&LOOK_UP_REPLY_MSG_ID.to_le_bytes());
        out[4..].copy_from_slice(&(self.status as u32).to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        expect_len(buf, Self::LEN)?;
        expect_id(buf, LOOK_UP_REPLY_MSG_ID)?;
        Ok(Self {
            status: LookUpStatus::try_from(read_u32(buf, 4))?,
        })
    }
}

/// Room for one `SCM_RIGHTS` descriptor, aligned for `cmsghdr`.
#[repr(C)]
struct CmsgSpace {
    _align: [libc::cmsghdr; 0],
    buf: [u8; 64],
}

#[cfg(target_os = "linux")]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: libc::c_int = 0;

#[cfg(target_os = "linux")]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(target_os = "linux"))]
const RECV_FLAGS: libc::c_int = 0;

/// Send `bytes` with `fd` attached as a single `SCM_RIGHTS` descriptor.
///
/// Returns the number of bytes written. The descriptor is duplicated into the
/// receiver; the caller still owns `fd`.
pub fn send_with_fd(sock: BorrowedFd<'_>, bytes: &[u8], fd: BorrowedFd<'_>) -> io::Result<usize> {
    let raw_fd: RawFd = fd.as_raw_fd();
    let mut space = CmsgSpace {
        _align: [],
        buf: [0u8; 64],
    };

    let mut iov = libc::iovec {
        iov_base: bytes.as_ptr() as *mut libc::c_void,
        iov_len: bytes.len(),
    };

    // SAFETY: all pointers reference live stack/caller buffers for the
    // duration of the call, and the control buffer is large enough for one
    // descriptor (CMSG_SPACE(4) is at most 24 bytes).
    unsafe {
        let fd_size = std::mem::size_of::<RawFd>() as libc::c_uint;
        let mut msg: libc::msghdr = std::mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = space.buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = libc::CMSG_SPACE(fd_size) as _;

        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(fd_size) as _;
        std::ptr::copy_nonoverlapping(
            &raw_fd as *const RawFd as *const u8,
            libc::CMSG_DATA(cmsg),
            fd_size as usize,
        );

        loop {
            let n = libc::sendmsg(sock.as_raw_fd(), &msg, SEND_FLAGS);
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

/// Receive into `buf`, collecting at most one attached descriptor.
///
/// Extra descriptors beyond the first are closed.
pub fn recv_with_fd(sock: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<(usize, Option<OwnedFd>)> {
    let mut space = CmsgSpace {
        _align: [],
        buf: [0u8; 64],
    };
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    // SAFETY: as in `send_with_fd`; descriptors read out of the control
    // buffer were just installed by the kernel and are owned by us.
    unsafe {
        let mut msg: libc::msghdr = std::mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = space.buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = space.buf.len() as _;

        let n = loop {
            let n = libc::recvmsg(sock.as_raw_fd(), &mut msg, RECV_FLAGS);
            if n >= 0 {
                break n as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        };

        let mut received: Option<OwnedFd> = None;
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg);
                let header = libc::CMSG_LEN(0) as usize;
                let count = ((*cmsg).cmsg_len as usize).saturating_sub(header)
                    / std::mem::size_of::<RawFd>();
                for i in 0..count {
                    let mut raw: RawFd = -1;
                    std::ptr::copy_nonoverlapping(
                        data.add(i * std::mem::size_of::<RawFd>()),
                        &mut raw as *mut RawFd as *mut u8,
                        std::mem::size_of::<RawFd>(),
                    );
                    let owned = OwnedFd::from_raw_fd(raw);
                    if received.is_none() {
                        received = Some(owned);
                    }
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }

        #[cfg(not(target_os = "linux"))]
        if let Some(fd) = &received {
            libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC);
        }

        Ok((n, received))
    }
}
