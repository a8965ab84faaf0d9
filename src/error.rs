// Copyright 2015-2020 Parity Technologies (UK) Ltd.
// This file is part of OpenEthereum.

// OpenEthereum is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// OpenEthereum is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with OpenEthereum.  If not, see <http://www.gnu.org/licenses/>.

use std::{error, fmt, io, result};

/// Database error.
#[derive(Debug)]
pub enum DbError {
    /// Lookup reached a branch with no matching slot. Recoverable.
    KeyNotFound,
    /// The requested version fell out of history between selection and
    /// traversal. Retry at a fresher version.
    VersionUnknown,
    /// A decoded node failed length, mask or fingerprint validation.
    CorruptNode(&'static str),
    /// On-disk magic or configuration hash disagrees with this build.
    MetadataMismatch(String),
    /// OS-level I/O failure; the affected operation is aborted.
    Device(io::Error),
    /// No free chunks remain after compaction.
    PoolExhausted,
    /// A structural invariant does not hold; the store is not to be
    /// trusted past this point.
    InvariantViolation(String),
    /// The worker thread has terminated; the request was not serviced.
    Terminated,
}

/// Database result.
pub type Result<T> = result::Result<T, DbError>;

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DbError::KeyNotFound => write!(f, "key not found"),
            DbError::VersionUnknown => write!(f, "version no longer in history"),
            DbError::CorruptNode(what) => write!(f, "corrupt node: {what}"),
            DbError::MetadataMismatch(msg) => write!(f, "metadata mismatch: {msg}"),
            DbError::Device(err) => write!(f, "device error: {err}"),
            DbError::PoolExhausted => write!(f, "no free chunks remain in the pool"),
            DbError::InvariantViolation(msg) => write!(f, "invariant violated: {msg}"),
            DbError::Terminated => write!(f, "database worker has terminated"),
        }
    }
}

impl error::Error for DbError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            DbError::Device(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for DbError {
    fn from(err: io::Error) -> DbError {
        DbError::Device(err)
    }
}

impl From<triedb_pool::Error> for DbError {
    fn from(err: triedb_pool::Error) -> DbError {
        use triedb_pool::Error;
        match err {
            Error::Io(err) => DbError::Device(err),
            Error::MetadataMismatch(msg) => DbError::MetadataMismatch(msg),
            Error::NoFreeChunks => DbError::PoolExhausted,
            Error::ChunkNotFound => DbError::CorruptNode("offset references no chunk"),
            Error::Unsupported(what) => DbError::MetadataMismatch(format!("{what} is unsupported")),
            Error::ReadOnly => DbError::InvariantViolation("mutation through read-only pool".into()),
            Error::InvalidSource(msg) => DbError::MetadataMismatch(msg),
        }
    }
}
