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

/// Storage pool error.
#[derive(Debug)]
pub enum Error {
    /// OS-level failure talking to a backing device.
    Io(io::Error),
    /// On-disk magic or configuration hash disagrees with this pool.
    MetadataMismatch(String),
    /// The source demands a device class the pool does not implement.
    Unsupported(&'static str),
    /// A source cannot back a pool (too small, wrong file type, ...).
    InvalidSource(String),
    /// Requested chunk id is out of range for its class.
    ChunkNotFound,
    /// Mutation attempted through a read-only pool.
    ReadOnly,
    /// The free list is empty.
    NoFreeChunks,
}

/// Storage pool result.
pub type Result<T> = result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "pool i/o error: {err}"),
            Error::MetadataMismatch(msg) => write!(f, "pool metadata mismatch: {msg}"),
            Error::Unsupported(what) => write!(f, "{what} is not supported"),
            Error::InvalidSource(msg) => write!(f, "invalid pool source: {msg}"),
            Error::ChunkNotFound => write!(f, "requested chunk does not exist"),
            Error::ReadOnly => write!(f, "pool is read-only"),
            Error::NoFreeChunks => write!(f, "no chunks remain on the free list"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}
