// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::message::EntityAddr;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// startup errors, never retried
    #[error("failed to bind {addr}: {cause}")]
    Bind { addr: String, cause: std::io::Error },

    #[error("rank is shutting down")]
    ShuttingDown,

    /// wire errors, fatal to a single connection
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("frame of length {0} is too large")]
    FrameTooLarge(usize),

    #[error("frame checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { expected: u32, computed: u32 },

    /// marker error
    #[error("incomplete frame")]
    Incomplete,

    /// directory errors, surfaced to the caller
    #[error("address {0} not found")]
    NotFound(EntityAddr),

    #[error("address {0} is already registered")]
    AlreadyRegistered(EntityAddr),

    #[error("timed out waiting for {0}")]
    Timeout(String),
}

impl AppError {
    /// Whether the error only concerns the connection it was raised on.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            AppError::IoError(_)
                | AppError::DetailedIoError(_)
                | AppError::MalformedFrame(_)
                | AppError::FrameTooLarge(_)
                | AppError::ChecksumMismatch { .. }
        )
    }
}
