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

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// durable store errors
    #[error("rocksdb error: {0}")]
    RocksDbError(#[from] rocksdb::Error),

    #[error("state store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("version conflict on key {0}")]
    VersionConflict(String),

    #[error("malformed state for partition {partition}: {reason}")]
    MalformedState { partition: i32, reason: String },

    /// delivery errors
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("outbound pipeline error: {0}")]
    PipelineError(String),
}

impl AppError {
    /// Faults that retrying cannot fix: a second owner wrote our state, or the stored
    /// state can no longer be decoded.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            AppError::VersionConflict(_) | AppError::MalformedState { .. }
        )
    }
}
