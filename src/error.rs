use std::{io, path::StripPrefixError, string::FromUtf8Error};

#[cfg(feature = "watch")]
use notify::{Error as NotifyError, ErrorKind as NotifyErrorKind};

use serde::{Deserialize, Serialize};
use sqlx::Error as SqlxError;
use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum SupertagError {
    #[error("Schema store error: {0}")]
    Store(String),
    #[error("Document codec error: {0}")]
    Codec(String),
    #[error("Invalid Command: {0}")]
    Command(String),
    #[error("Conflicting schema edit: {0}")]
    Conflict(String),
    #[error("Custom error: {0}")]
    Custom(String),
    #[error("File System error: {0}")]
    Io(String),
    #[error("Item Not Found: {0}")]
    NotFound(String),
    #[error("You do not have permission to access this resource")]
    PermissionDenied,
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
    #[error("Sync service error: {0}")]
    Service(String),
}

impl SupertagError {
    /// Failures of the storage or the worker that are expected to clear up on a later attempt.
    /// The debounced save retries these.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SupertagError::Io(_) | SupertagError::PermissionDenied | SupertagError::Service(_)
        )
    }
}

impl From<StripPrefixError> for SupertagError {
    fn from(src: StripPrefixError) -> SupertagError {
        SupertagError::NotFound(format!("Strip prefix failed for path. Error: {src}"))
    }
}

impl From<toml::de::Error> for SupertagError {
    fn from(src: toml::de::Error) -> SupertagError {
        SupertagError::Serialization(format!("Toml deserialization error: {src}"))
    }
}

impl From<toml::ser::Error> for SupertagError {
    fn from(src: toml::ser::Error) -> SupertagError {
        SupertagError::Serialization(format!("Toml serialization error: {src}"))
    }
}

impl From<uuid::Error> for SupertagError {
    fn from(src: uuid::Error) -> SupertagError {
        SupertagError::Serialization(format!("UUID conversion failed: {src}"))
    }
}

impl From<hex::FromHexError> for SupertagError {
    fn from(src: hex::FromHexError) -> SupertagError {
        SupertagError::Serialization(format!("Invalid hex token: {src}"))
    }
}

impl From<FromUtf8Error> for SupertagError {
    fn from(src: FromUtf8Error) -> SupertagError {
        SupertagError::Codec(format!("Document is not valid UTF-8: {src}"))
    }
}

impl From<io::Error> for SupertagError {
    fn from(x: io::Error) -> Self {
        match x.kind() {
            io::ErrorKind::NotFound => SupertagError::NotFound(format!("{x}")),
            io::ErrorKind::PermissionDenied => SupertagError::PermissionDenied,
            io::ErrorKind::InvalidData => SupertagError::Codec(format!("{x}")),
            _ => SupertagError::Io(format!("IOError: {}", x.kind())),
        }
    }
}

impl From<RecvError> for SupertagError {
    fn from(_: RecvError) -> Self {
        SupertagError::Service("sync worker dropped the reply channel".to_string())
    }
}

impl From<SqlxError> for SupertagError {
    fn from(db_error: SqlxError) -> Self {
        match db_error {
            SqlxError::RowNotFound => SupertagError::NotFound("database row".to_string()),
            SqlxError::Io(io_error) => SupertagError::from(io_error),
            other => SupertagError::Store(format!("database error: {other:?}")),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for SupertagError {
    fn from(src: sqlx::migrate::MigrateError) -> Self {
        SupertagError::Store(format!("schema migration failed: {src}"))
    }
}

#[cfg(feature = "watch")]
impl From<NotifyError> for SupertagError {
    fn from(notify_error: NotifyError) -> Self {
        match notify_error.kind {
            NotifyErrorKind::Generic(msg) => SupertagError::Custom(format!(
                "notify-debouncer: {}, paths: {:?}",
                msg, notify_error.paths
            )),
            NotifyErrorKind::Io(io_error) => SupertagError::Io(format!(
                "notify-debouncer: io error {}, paths: {:?}",
                io_error.kind(),
                notify_error.paths
            )),
            NotifyErrorKind::PathNotFound => SupertagError::NotFound(format!(
                "notify-debouncer: path(s) not found: {:?}",
                notify_error.paths
            )),
            NotifyErrorKind::WatchNotFound => SupertagError::NotFound(format!(
                "notify-debouncer: watch not found, paths: {:?}",
                notify_error.paths
            )),
            NotifyErrorKind::InvalidConfig(_) => {
                SupertagError::Custom("notify-debouncer invalid config".to_string())
            }
            NotifyErrorKind::MaxFilesWatch => {
                SupertagError::Custom("notify-debouncer max file watch limit reached".to_string())
            }
        }
    }
}
