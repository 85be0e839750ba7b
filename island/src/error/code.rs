//
// Copyright 2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Numeric error codes.
//!
//! Every error code packs three independently assigned namespaces into one
//! integer:
//!
//! ```text
//!   1 0 1 0 0 0 0 1
//!   _____ _ _______
//!   |     | \_ error code
//!   |     \_ island level
//!   \_ island code
//! ```
//!
//! The island code identifies the deployment (service), the island level the
//! layer that raised the error, and the error code the specific condition.

use std::fmt;

/// Multiplier applied to the island code.
const ISLAND_CODE_FACTOR: u32 = 100_000;

/// Multiplier applied to the island level.
const ISLAND_LEVEL_FACTOR: u32 = 10_000;

/// Largest error code that fits below the island level digit.
pub const MAX_ERROR_CODE: u16 = 9_999;

/// Identifies the service (island) that raised an error.
///
/// Valid island codes are in the range `100..1000`. `100` is reserved for
/// services that did not configure a code of their own.
///
/// # Examples
///
/// ```rust
/// use island::error::IslandCode;
///
/// let code = IslandCode::new(101).unwrap();
/// assert_eq!(code.get(), 101);
/// assert!(IslandCode::new(99).is_none());
/// assert!(IslandCode::new(1000).is_none());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IslandCode(u16);

impl IslandCode {
    /// The island code used when none was configured.
    pub const UNKNOWN: IslandCode = IslandCode(100);

    /// Creates an island code, returning `None` when it is outside `100..1000`.
    #[must_use]
    pub const fn new(code: u16) -> Option<Self> {
        if code >= 100 && code < 1000 {
            Some(Self(code))
        } else {
            None
        }
    }

    /// Returns the raw island code.
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }

    /// Merges this island code with a level and a runtime error code.
    #[must_use]
    pub const fn merge(self, level: IslandLevel, code: ErrorCode) -> u32 {
        pack(self, level, code.get())
    }
}

impl Default for IslandCode {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

impl fmt::Display for IslandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The layer that raised an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IslandLevel {
    /// Raised by service code running on top of the runtime.
    Island = 0,
    /// Raised by the island runtime itself.
    Runtime = 1,
    /// Raised by something the runtime could not categorize.
    Unknown = 2,
    /// Reserved level.
    Reserved3 = 3,
    /// Reserved level.
    Reserved4 = 4,
    /// Reserved level.
    Reserved5 = 5,
    /// Reserved level.
    Reserved6 = 6,
    /// Reserved level.
    Reserved7 = 7,
    /// Reserved level.
    Reserved8 = 8,
    /// Reserved level.
    Reserved9 = 9,
}

impl IslandLevel {
    /// Converts a single decimal digit into a level.
    #[must_use]
    pub const fn from_digit(digit: u32) -> Option<Self> {
        Some(match digit {
            0 => Self::Island,
            1 => Self::Runtime,
            2 => Self::Unknown,
            3 => Self::Reserved3,
            4 => Self::Reserved4,
            5 => Self::Reserved5,
            6 => Self::Reserved6,
            7 => Self::Reserved7,
            8 => Self::Reserved8,
            9 => Self::Reserved9,
            _ => return None,
        })
    }

    /// Returns the level name used in diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Island => "ISLAND",
            Self::Runtime => "RUNTIME",
            Self::Unknown => "UNKNOWN",
            Self::Reserved3 => "RESERVED3",
            Self::Reserved4 => "RESERVED4",
            Self::Reserved5 => "RESERVED5",
            Self::Reserved6 => "RESERVED6",
            Self::Reserved7 => "RESERVED7",
            Self::Reserved8 => "RESERVED8",
            Self::Reserved9 => "RESERVED9",
        }
    }
}

/// Error conditions raised by the runtime itself.
///
/// All of them are merged with [`IslandLevel::Runtime`] to form a full code,
/// except [`Uncategorized`](Self::Uncategorized) which goes with
/// [`IslandLevel::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    /// An error the runtime could not categorize.
    Uncategorized = 1,
    /// A channel pool was required but none was initialized.
    ChannelPoolRequired = 8,
    /// A component was used before it was initialized.
    NotInitialized = 13,
    /// An RPC did not complete within its budget.
    RpcTimeout = 23,
    /// An RPC request arrived without a reply-to queue.
    MissingReplyToInRpc = 26,
    /// A consumer was cancelled by the broker.
    ConsumerIsCanceled = 27,
    /// A request or response did not match its schema.
    WrongParameterSchema = 31,
    /// A message could not be handled.
    HandleMessageError = 34,
}

impl ErrorCode {
    /// Returns the numeric error code.
    #[must_use]
    pub const fn get(self) -> u16 {
        self as u16
    }
}

/// Decomposed form of a numeric error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitCode {
    /// The island code (`100..1000` for well-formed codes).
    pub island_code: u16,
    /// The raw island level digit.
    pub island_level: u8,
    /// The specific error condition.
    pub error_code: u16,
}

impl SplitCode {
    /// Returns the island level, if the digit names one.
    #[must_use]
    pub const fn level(&self) -> Option<IslandLevel> {
        IslandLevel::from_digit(self.island_level as u32)
    }
}

/// Merges an island code, level and error code into one number.
///
/// Returns `None` when the error code is above [`MAX_ERROR_CODE`], since it
/// would spill into the level digit.
///
/// # Examples
///
/// ```rust
/// use island::error::{merge_code, IslandCode, IslandLevel};
///
/// let island = IslandCode::UNKNOWN;
/// assert_eq!(merge_code(island, IslandLevel::Runtime, 23), Some(10010023));
/// assert_eq!(merge_code(island, IslandLevel::Runtime, 10_000), None);
/// ```
#[must_use]
pub const fn merge_code(island: IslandCode, level: IslandLevel, error_code: u16) -> Option<u32> {
    if error_code > MAX_ERROR_CODE {
        return None;
    }
    Some(pack(island, level, error_code))
}

const fn pack(island: IslandCode, level: IslandLevel, error_code: u16) -> u32 {
    island.0 as u32 * ISLAND_CODE_FACTOR + level as u32 * ISLAND_LEVEL_FACTOR + error_code as u32
}

/// Splits a code produced by [`merge_code`] back into its parts.
///
/// # Examples
///
/// ```rust
/// use island::error::{merge_code, split_code, IslandCode, IslandLevel};
///
/// let island = IslandCode::new(111).unwrap();
/// let split = split_code(merge_code(island, IslandLevel::Unknown, 1).unwrap());
/// assert_eq!(split.island_code, 111);
/// assert_eq!(split.level(), Some(IslandLevel::Unknown));
/// assert_eq!(split.error_code, 1);
/// ```
#[must_use]
pub const fn split_code(code: u32) -> SplitCode {
    SplitCode {
        island_code: ((code / ISLAND_CODE_FACTOR) % 1000) as u16,
        island_level: ((code / ISLAND_LEVEL_FACTOR) % 10) as u8,
        error_code: (code % ISLAND_LEVEL_FACTOR) as u16,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEVELS: [IslandLevel; 10] = [
        IslandLevel::Island,
        IslandLevel::Runtime,
        IslandLevel::Unknown,
        IslandLevel::Reserved3,
        IslandLevel::Reserved4,
        IslandLevel::Reserved5,
        IslandLevel::Reserved6,
        IslandLevel::Reserved7,
        IslandLevel::Reserved8,
        IslandLevel::Reserved9,
    ];

    #[test]
    fn test_split_inverts_merge() {
        for island in [100u16, 101, 250, 999] {
            let code = IslandCode::new(island).unwrap();
            for level in LEVELS {
                for error in [0u16, 1, 23, 4321, MAX_ERROR_CODE] {
                    let split = split_code(merge_code(code, level, error).unwrap());
                    assert_eq!(split.island_code, island);
                    assert_eq!(split.level(), Some(level));
                    assert_eq!(split.error_code, error);
                }
            }
        }
    }

    #[test]
    fn test_known_codes() {
        assert_eq!(
            IslandCode::UNKNOWN.merge(IslandLevel::Runtime, ErrorCode::RpcTimeout),
            10010023
        );
        assert_eq!(
            IslandCode::UNKNOWN.merge(IslandLevel::Unknown, ErrorCode::Uncategorized),
            10020001
        );
        let code = IslandCode::new(111).unwrap();
        assert_eq!(code.merge(IslandLevel::Runtime, ErrorCode::Uncategorized), 11110001);
    }

    #[test]
    fn test_error_code_cannot_spill_into_level() {
        let island = IslandCode::new(999).unwrap();
        assert_eq!(merge_code(island, IslandLevel::Reserved9, MAX_ERROR_CODE), Some(99999999));
        assert_eq!(merge_code(island, IslandLevel::Runtime, MAX_ERROR_CODE + 1), None);
        assert_eq!(merge_code(island, IslandLevel::Runtime, u16::MAX), None);

        // The largest merge still fits and splits back apart.
        let split = split_code(island.merge(IslandLevel::Reserved9, ErrorCode::HandleMessageError));
        assert_eq!(split.island_code, 999);
        assert_eq!(split.level(), Some(IslandLevel::Reserved9));
    }

    #[test]
    fn test_island_code_range() {
        assert!(IslandCode::new(100).is_some());
        assert!(IslandCode::new(999).is_some());
        assert!(IslandCode::new(0).is_none());
        assert!(IslandCode::new(1000).is_none());
        assert_eq!(IslandCode::default(), IslandCode::UNKNOWN);
    }

    #[test]
    fn test_level_names() {
        assert_eq!(IslandLevel::Runtime.name(), "RUNTIME");
        assert_eq!(IslandLevel::from_digit(10), None);
    }
}
