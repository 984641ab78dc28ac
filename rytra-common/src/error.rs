// SPDX-FileCopyrightText: 2026 rytra contributors
// SPDX-License-Identifier: GPL-3.0-or-later

/// 3DS result code.
/// Layout: bits [9:0] = description, [17:10] = module, [26:21] = summary,
/// [31:27] = level. Value 0 = success.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResultCode(pub u32);

impl ResultCode {
    pub const SUCCESS: Self = Self(0);

    /// Build a result code from its four fields.
    #[inline]
    pub const fn new(description: u32, module: u32, summary: u32, level: u32) -> Self {
        Self(
            (description & 0x3FF)
                | ((module & 0xFF) << 10)
                | ((summary & 0x3F) << 21)
                | ((level & 0x1F) << 27),
        )
    }

    /// Wrap a raw value (used for kernel sentinel codes like 0xE7E3FFFF).
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn description(self) -> u32 {
        self.0 & 0x3FF
    }

    #[inline]
    pub const fn module(self) -> u32 {
        (self.0 >> 10) & 0xFF
    }

    #[inline]
    pub const fn summary(self) -> u32 {
        (self.0 >> 21) & 0x3F
    }

    #[inline]
    pub const fn level(self) -> u32 {
        (self.0 >> 27) & 0x1F
    }

    #[inline]
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_error(self) -> bool {
        self.0 != 0
    }

    /// Raw u32 value, as written back to guest r0.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Debug for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_success() {
            write!(f, "ResultCode::SUCCESS")
        } else {
            write!(
                f,
                "ResultCode(desc={}, module={}, summary={}, level={}, raw=0x{:08X})",
                self.description(),
                self.module(),
                self.summary(),
                self.level(),
                self.0
            )
        }
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_success() {
            write!(f, "Success")
        } else {
            write!(f, "Error(raw=0x{:08X})", self.0)
        }
    }
}

impl std::error::Error for ResultCode {}

/// Error description values used by the kernel.
pub mod description {
    pub const WRONG_PERMISSION: u32 = 46;
    pub const INVALID_BUFFER_DESCRIPTOR: u32 = 48;
    pub const MAX_CONNECTIONS_REACHED: u32 = 52;

    pub const OUT_OF_HANDLES: u32 = 19;
    pub const SESSION_CLOSED_BY_REMOTE: u32 = 26;
    pub const PORT_NAME_TOO_LONG: u32 = 30;
    pub const WRONG_LOCKING_THREAD: u32 = 31;
    pub const NO_PENDING_SESSIONS: u32 = 35;

    pub const NOT_AUTHORIZED: u32 = 1002;
    pub const INVALID_ENUM_VALUE: u32 = 1005;
    pub const INVALID_COMBINATION: u32 = 1006;
    pub const MISALIGNED_ADDRESS: u32 = 1009;
    pub const MISALIGNED_SIZE: u32 = 1010;
    pub const OUT_OF_MEMORY: u32 = 1011;
    pub const NOT_IMPLEMENTED: u32 = 1012;
    pub const INVALID_ADDRESS: u32 = 1013;
    pub const INVALID_POINTER: u32 = 1014;
    pub const INVALID_HANDLE: u32 = 1015;
    pub const NOT_FOUND: u32 = 1018;
    pub const OUT_OF_RANGE: u32 = 1021;
    pub const TIMEOUT: u32 = 1022;
}

/// Error modules.
pub mod module {
    pub const COMMON: u32 = 0;
    pub const KERNEL: u32 = 1;
    pub const OS: u32 = 6;
}

/// Error summaries.
pub mod summary {
    pub const WOULD_BLOCK: u32 = 2;
    pub const OUT_OF_RESOURCE: u32 = 3;
    pub const NOT_FOUND: u32 = 4;
    pub const INVALID_STATE: u32 = 5;
    pub const NOT_SUPPORTED: u32 = 6;
    pub const INVALID_ARGUMENT: u32 = 7;
    pub const WRONG_ARGUMENT: u32 = 8;
    pub const CANCELED: u32 = 9;
    pub const STATUS_CHANGED: u32 = 10;
}

/// Error levels.
pub mod level {
    pub const INFO: u32 = 1;
    pub const STATUS: u32 = 25;
    pub const TEMPORARY: u32 = 26;
    pub const PERMANENT: u32 = 27;
    pub const USAGE: u32 = 28;
}

// Kernel error constants (flat at module level for easy import).

pub const TIMEOUT: ResultCode = ResultCode::new(
    description::TIMEOUT,
    module::OS,
    summary::STATUS_CHANGED,
    level::INFO,
);
pub const INVALID_HANDLE: ResultCode = ResultCode::new(
    description::INVALID_HANDLE,
    module::KERNEL,
    summary::INVALID_ARGUMENT,
    level::PERMANENT,
);
pub const SESSION_CLOSED_BY_REMOTE: ResultCode = ResultCode::new(
    description::SESSION_CLOSED_BY_REMOTE,
    module::OS,
    summary::CANCELED,
    level::STATUS,
);
pub const PORT_NAME_TOO_LONG: ResultCode = ResultCode::new(
    description::PORT_NAME_TOO_LONG,
    module::OS,
    summary::INVALID_ARGUMENT,
    level::USAGE,
);
pub const MAX_CONNECTIONS_REACHED: ResultCode = ResultCode::new(
    description::MAX_CONNECTIONS_REACHED,
    module::OS,
    summary::WOULD_BLOCK,
    level::TEMPORARY,
);
pub const NO_PENDING_SESSIONS: ResultCode = ResultCode::new(
    description::NO_PENDING_SESSIONS,
    module::KERNEL,
    summary::WOULD_BLOCK,
    level::PERMANENT,
);
pub const WRONG_LOCKING_THREAD: ResultCode = ResultCode::new(
    description::WRONG_LOCKING_THREAD,
    module::KERNEL,
    summary::INVALID_ARGUMENT,
    level::PERMANENT,
);
pub const MISALIGNED_ADDRESS: ResultCode = ResultCode::new(
    description::MISALIGNED_ADDRESS,
    module::OS,
    summary::INVALID_ARGUMENT,
    level::USAGE,
);
pub const MISALIGNED_SIZE: ResultCode = ResultCode::new(
    description::MISALIGNED_SIZE,
    module::OS,
    summary::INVALID_ARGUMENT,
    level::USAGE,
);
pub const INVALID_COMBINATION: ResultCode = ResultCode::new(
    description::INVALID_COMBINATION,
    module::OS,
    summary::INVALID_ARGUMENT,
    level::USAGE,
);
pub const INVALID_COMBINATION_KERNEL: ResultCode = ResultCode::new(
    description::INVALID_COMBINATION,
    module::KERNEL,
    summary::WRONG_ARGUMENT,
    level::PERMANENT,
);
pub const INVALID_ADDRESS: ResultCode = ResultCode::new(
    description::INVALID_ADDRESS,
    module::OS,
    summary::INVALID_ARGUMENT,
    level::USAGE,
);
pub const INVALID_POINTER: ResultCode = ResultCode::new(
    description::INVALID_POINTER,
    module::KERNEL,
    summary::INVALID_ARGUMENT,
    level::PERMANENT,
);
pub const OUT_OF_MEMORY: ResultCode = ResultCode::new(
    description::OUT_OF_MEMORY,
    module::KERNEL,
    summary::OUT_OF_RESOURCE,
    level::PERMANENT,
);
pub const OUT_OF_HANDLES: ResultCode = ResultCode::new(
    description::OUT_OF_HANDLES,
    module::KERNEL,
    summary::OUT_OF_RESOURCE,
    level::PERMANENT,
);
pub const OUT_OF_RANGE: ResultCode = ResultCode::new(
    description::OUT_OF_RANGE,
    module::OS,
    summary::INVALID_ARGUMENT,
    level::USAGE,
);
pub const OUT_OF_RANGE_KERNEL: ResultCode = ResultCode::new(
    description::OUT_OF_RANGE,
    module::KERNEL,
    summary::INVALID_ARGUMENT,
    level::PERMANENT,
);
pub const NOT_FOUND: ResultCode = ResultCode::new(
    description::NOT_FOUND,
    module::KERNEL,
    summary::NOT_FOUND,
    level::PERMANENT,
);
pub const NOT_AUTHORIZED: ResultCode = ResultCode::new(
    description::NOT_AUTHORIZED,
    module::OS,
    summary::WRONG_ARGUMENT,
    level::PERMANENT,
);
pub const NOT_IMPLEMENTED: ResultCode = ResultCode::new(
    description::NOT_IMPLEMENTED,
    module::OS,
    summary::INVALID_ARGUMENT,
    level::USAGE,
);
pub const INVALID_ENUM_VALUE: ResultCode = ResultCode::new(
    description::INVALID_ENUM_VALUE,
    module::KERNEL,
    summary::WRONG_ARGUMENT,
    level::PERMANENT,
);

/// Placeholder the kernel returns from ReplyAndReceive when no reply was sent
/// and no handles were given.
pub const NO_REPLY_NO_WAIT: ResultCode = ResultCode::from_raw(0xE7E3_FFFF);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_round_trip() {
        let rc = ResultCode::new(1015, 1, 7, 27);
        assert_eq!(rc.description(), 1015);
        assert_eq!(rc.module(), 1);
        assert_eq!(rc.summary(), 7);
        assert_eq!(rc.level(), 27);
        assert!(rc.is_error());
    }

    #[test]
    fn test_success() {
        assert!(ResultCode::SUCCESS.is_success());
        assert_eq!(ResultCode::SUCCESS.raw(), 0);
    }

    // Raw values match the codes the real kernel hands back to guests.
    #[test]
    fn test_canonical_raw_values() {
        assert_eq!(TIMEOUT.raw(), 0x0940_1BFE);
        assert_eq!(INVALID_HANDLE.raw(), 0xD8E0_07F7);
        assert_eq!(SESSION_CLOSED_BY_REMOTE.raw(), 0xC920_181A);
        assert_eq!(PORT_NAME_TOO_LONG.raw(), 0xE0E0_181E);
        assert_eq!(MAX_CONNECTIONS_REACHED.raw(), 0xD040_1834);
        assert_eq!(MISALIGNED_ADDRESS.raw(), 0xE0E0_1BF1);
        assert_eq!(MISALIGNED_SIZE.raw(), 0xE0E0_1BF2);
        assert_eq!(INVALID_COMBINATION.raw(), 0xE0E0_1BEE);
        assert_eq!(INVALID_ADDRESS.raw(), 0xE0E0_1BF5);
        assert_eq!(OUT_OF_RANGE.raw(), 0xE0E0_1BFD);
        assert_eq!(NOT_FOUND.raw(), 0xD880_07FA);
        assert_eq!(NOT_AUTHORIZED.raw(), 0xD900_1BEA);
    }
}
