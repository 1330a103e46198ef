// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of ldninbox.
//
// ldninbox is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// ldninbox is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with ldninbox.  If not,
// see <http://www.gnu.org/licenses/>.

//! # storage
//!
//! Abstractions for the ldninbox storage layer.
//!
//! The Notification Store is append-only & write-once: a notification is persisted exactly once
//! under a freshly-minted identifier, read zero or more times thereafter, and never updated or
//! deleted through this interface. The contract deliberately trades in raw bytes, not parsed
//! documents, so that the engine never re-serializes sender-supplied JSON-LD (clients may depend
//! on the canonical formatting they sent).
//!
//! A particular *implementation* of this API is chosen once, at startup, according to
//! configuration; backend choice has no effect on protocol behavior.

use crate::entities::NotificationId;

use async_trait::async_trait;
use bytes::Bytes;
use snafu::{Backtrace, Snafu};

/// Storage error taxonomy
///
/// Three buckets, deliberately coarse: the protocol engine only distinguishes "the identifier
/// was already taken" (a fatal surprise, never retried-- re-submitting the same statement
/// wouldn't change the outcome), "the backend couldn't be reached in time" and "everything
/// else". Context lives in the boxed source.
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Notification {id} already exists"))]
    Conflict {
        id: NotificationId,
        backtrace: Backtrace,
    },
    #[snafu(display("The storage backend could not be reached: {source}"))]
    Unavailable {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
    #[snafu(display("Storage backend fault: {source}"))]
    Internal {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

impl Error {
    pub fn conflict(id: &NotificationId) -> Error {
        ConflictSnafu { id: id.clone() }.build()
    }
    pub fn unavailable(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Unavailable {
            source: Box::new(err),
        }
    }
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Internal {
            source: Box::new(err),
        }
    }
}

#[async_trait]
pub trait Backend {
    /// Persist `payload` under `id`, assigning the creation time server-side
    ///
    /// The payload shall be stored as received, byte-for-byte. Fails with [Error::Conflict] if
    /// `id` already exists (should not occur, given the generator's guarantees, but must be
    /// handled), [Error::Unavailable] if the backend cannot be reached or the call times out,
    /// [Error::Internal] for any other persistence fault. The append must be atomic per
    /// identifier: no partial write is ever visible to a concurrent reader.
    async fn append(&self, id: &NotificationId, payload: &[u8]) -> Result<(), Error>;
    /// Retrieve all stored identifiers, ordered by creation time, newest first
    ///
    /// An empty store yields an empty `Vec`, not an error. Identifiers sharing a creation time
    /// (at the backend's timestamp resolution) appear in an implementation-defined but stable
    /// relative order.
    async fn list_ids_descending(&self) -> Result<Vec<NotificationId>, Error>;
    /// Retrieve the raw payload stored under `id`; `None` means no such notification
    async fn get(&self, id: &NotificationId) -> Result<Option<Bytes>, Error>;
}
