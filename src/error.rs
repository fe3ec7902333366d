// Copyright (c) 2025 vivo Mobile Communication Co., Ltd.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//       http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error values crossing the executive's boundary. Codes are carried as
//! negative errno numbers and are wire-stable.

pub mod code {
    pub const EOK: super::Error = super::Error(0);
    pub const EPERM: super::Error = super::Error(-1);
    pub const EINTR: super::Error = super::Error(-4);
    pub const EAGAIN: super::Error = super::Error(-11);
    pub const EWOULDBLOCK: super::Error = super::Error(-11);
    pub const ENOMEM: super::Error = super::Error(-12);
    pub const EBUSY: super::Error = super::Error(-16);
    pub const ENODEV: super::Error = super::Error(-19);
    pub const EINVAL: super::Error = super::Error(-22);
    pub const ENOSYS: super::Error = super::Error(-38);
    pub const ETIMEDOUT: super::Error = super::Error(-110);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Error(i32);

impl Error {
    pub fn from_errno(errno: i32) -> Error {
        Error(errno)
    }

    pub fn to_errno(self) -> i32 {
        self.0
    }

    pub fn name(&self) -> &'static str {
        match *self {
            code::EOK => "OK",
            code::EPERM => "Operation not permitted",
            code::EINTR => "Interrupted system call",
            code::EAGAIN => "Try again",
            code::ENOMEM => "Cannot allocate memory",
            code::EBUSY => "Device or resource busy",
            code::ENODEV => "No such device",
            code::EINVAL => "Invalid argument",
            code::ENOSYS => "Function not implemented",
            code::ETIMEDOUT => "Timed out",
            _ => "Unknown error",
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Error({}): {}", self.0, self.name())
    }
}

pub type Result<T = ()> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_round_trip() {
        assert_eq!(Error::from_errno(-22), code::EINVAL);
        assert_eq!(code::ETIMEDOUT.to_errno(), -110);
        assert_eq!(code::EWOULDBLOCK, code::EAGAIN);
    }

    #[test]
    fn names() {
        assert_eq!(code::EBUSY.name(), "Device or resource busy");
        assert_eq!(Error::from_errno(-77).name(), "Unknown error");
    }
}
