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

//! # scylla
//!
//! [Storage] implementation for ScyllaDB.
//!
//! [Storage]: crate::storage
//!
//! The schema is a single table in the `ldninbox` keyspace:
//!
//! ```text
//! create table notifications (
//!   id text primary key,
//!   created_at timestamp,
//!   payload blob
//! );
//! ```
//!
//! created via the provisioning tooling ahead of time; this module never issues DDL. Appends use
//! a Lightweight Transaction (`IF NOT EXISTS`) so that an identifier collision comes back as a
//! [Conflict](storage::Error::Conflict) rather than a silent overwrite. The container listing
//! reads `(id, created_at)` for every notification & sorts here rather than in CQL: with `id` as
//! the sole partition key there's no server-side ordering to be had, and the listing is expected
//! to stay small. CQL timestamps have millisecond resolution, so two notifications can share a
//! `created_at`; ties are broken by identifier, which keeps repeated listings stable.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use enum_map::{Enum, EnumMap};
use futures::stream;
use scylla::{SessionBuilder, prepared_statement::PreparedStatement};
use secrecy::{ExposeSecret, SecretString};
use snafu::{Backtrace, ResultExt, Snafu};

use crate::{entities::NotificationId, storage};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display(
        "The number of prepared statements isn't consistent; this is a bug & should be reported!"
    ))]
    BadPreparedStatementCount { backtrace: Backtrace },
    #[snafu(display("Failed to set keyspace: {source}"))]
    Keyspace {
        source: scylla::transport::errors::QueryError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to create a ScyllaDB session: {source}"))]
    NewSession {
        source: scylla::transport::errors::NewSessionError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to prepare statement: {stmt}: {source}"))]
    Prepare {
        stmt: String,
        source: scylla::transport::errors::QueryError,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// The set of prepared statements used by ldninbox
///
/// Used as both a mnemonic tag & as the key type in an [EnumMap] from tag to the actual
/// [PreparedStatement]; the index operator on such a map is guaranteed to succeed.
#[derive(Clone, Debug, Enum, Eq, PartialEq)]
enum PreparedStatements {
    InsertNotification,
    SelectIds,
    SelectPayload,
}

/// `ldninbox`-specific ScyllaDB Session type
///
/// Instantiate via [Session::new] with connection info & credentials if need be; when dropped
/// the ScyllaDB session will be terminated.
pub struct Session {
    session: ::scylla::Session,
    prepared_statements: EnumMap<PreparedStatements, PreparedStatement>,
    /// Per-query time limit; queries exceeding it surface as
    /// [Unavailable](storage::Error::Unavailable)
    timeout: Duration,
}

impl Session {
    /// Prepare a statement
    async fn prepare(scylla: &::scylla::Session, stmt: &str) -> Result<PreparedStatement> {
        scylla.prepare(stmt).await.context(PrepareSnafu {
            stmt: stmt.to_owned(),
        })
    }

    /// [Session] constructor
    ///
    /// Construct with a collection of ScyllaDB hosts. `credentials`, if non-None, should be a
    /// pair of strings consisting of the username & password.
    pub async fn new(
        hosts: impl IntoIterator<Item = impl AsRef<str>>,
        credentials: &Option<(SecretString, SecretString)>,
        timeout: Duration,
    ) -> Result<Session> {
        let mut builder = SessionBuilder::new().known_nodes(hosts);
        if let Some((user, pass)) = credentials {
            builder = builder.user(user.expose_secret(), pass.expose_secret())
        }
        let scylla = builder.build().await.context(NewSessionSnafu)?;
        scylla
            .use_keyspace("ldninbox", false)
            .await
            .context(KeyspaceSnafu)?;

        use futures::stream::StreamExt;
        // Listed in the same order as [PreparedStatements]:
        let prepared_statements = stream::iter(vec![
            "insert into notifications (id,created_at,payload) values (?,?,?) if not exists",
            "select id,created_at from notifications",
            "select payload from notifications where id=?",
        ])
        .then(|s| async { Self::prepare(&scylla, s).await })
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<Vec<PreparedStatement>>>()?;
        // An `EnumMap` needs a slice of `PreparedStatement` of *precisely the right length*, in
        // the right order. We can't test for the latter, but we can for the former.
        let prepared_statements: [PreparedStatement; 3] = prepared_statements
            .try_into()
            .map_err(|_| BadPreparedStatementCountSnafu.build())?;

        Ok(Session {
            session: scylla,
            prepared_statements: EnumMap::from_array(prepared_statements),
            timeout,
        })
    }

    /// Bound a driver call by [timeout](Session::timeout)
    ///
    /// A timed-out call maps to [Unavailable](storage::Error::Unavailable); a driver error to
    /// [Internal](storage::Error::Internal). The finer distinctions the driver's error type
    /// draws don't change what the protocol engine will do (fail the request, log the detail).
    async fn bounded<T, E, F>(&self, fut: F) -> std::result::Result<T, storage::Error>
    where
        E: std::error::Error + Send + Sync + 'static,
        F: std::future::Future<Output = std::result::Result<T, E>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(storage::Error::internal),
            Err(elapsed) => Err(storage::Error::unavailable(elapsed)),
        }
    }
}

/// Interpret an LWT insert outcome
///
/// `applied` is the `[applied]` column when the result carried rows, `None` when it didn't:
/// the driver returns a row-less result for an applied insert, so "no rows" *is* the success
/// case, and rows only come back when the insert lost to an existing row.
fn check_applied(
    id: &NotificationId,
    applied: Option<bool>,
) -> std::result::Result<(), storage::Error> {
    match applied {
        Some(false) => Err(storage::Error::conflict(id)),
        _ => Ok(()),
    }
}

/// Sort `(id, created_at)` pairs into listing order: newest first, ties broken by identifier
fn order_descending(mut rows: Vec<(NotificationId, DateTime<Utc>)>) -> Vec<NotificationId> {
    rows.sort_by(|lhs, rhs| {
        rhs.1
            .cmp(&lhs.1)
            .then_with(|| rhs.0.cmp(&lhs.0))
    });
    rows.into_iter().map(|(id, _)| id).collect()
}

#[async_trait]
impl storage::Backend for Session {
    async fn append(
        &self,
        id: &NotificationId,
        payload: &[u8],
    ) -> std::result::Result<(), storage::Error> {
        let created_at = Utc::now();
        let result = self
            .bounded(self.session.execute_unpaged(
                &self.prepared_statements[PreparedStatements::InsertNotification],
                (id.as_str(), created_at, payload),
            ))
            .await?;
        // If the insert was applied the result carries no rows; a not-applied LWT comes back
        // as `[applied]` plus the existing row's columns.
        let applied = if result.is_rows() {
            let (applied, _, _, _) = result
                .into_rows_result()
                .map_err(storage::Error::internal)?
                .first_row::<(bool, Option<String>, Option<DateTime<Utc>>, Option<Vec<u8>>)>()
                .map_err(storage::Error::internal)?;
            Some(applied)
        } else {
            None
        };
        check_applied(id, applied)
    }

    async fn list_ids_descending(
        &self,
    ) -> std::result::Result<Vec<NotificationId>, storage::Error> {
        let result = self
            .bounded(self.session.execute_unpaged(
                &self.prepared_statements[PreparedStatements::SelectIds],
                (),
            ))
            .await?;
        let rows = result
            .into_rows_result()
            .map_err(storage::Error::internal)?;
        let mut pairs = Vec::with_capacity(rows.rows_num());
        for row in rows
            .rows::<(String, DateTime<Utc>)>()
            .map_err(storage::Error::internal)?
        {
            let (id, created_at) = row.map_err(storage::Error::internal)?;
            // A malformed identifier in the table means someone's been writing to it behind
            // our back; surface that rather than silently skipping the row.
            let id = id
                .parse::<NotificationId>()
                .map_err(storage::Error::internal)?;
            pairs.push((id, created_at));
        }
        Ok(order_descending(pairs))
    }

    async fn get(
        &self,
        id: &NotificationId,
    ) -> std::result::Result<Option<Bytes>, storage::Error> {
        let result = self
            .bounded(self.session.execute_unpaged(
                &self.prepared_statements[PreparedStatements::SelectPayload],
                (id.as_str(),),
            ))
            .await?;
        Ok(result
            .into_rows_result()
            .map_err(storage::Error::internal)?
            .maybe_first_row::<(Vec<u8>,)>()
            .map_err(storage::Error::internal)?
            .map(|(payload,)| Bytes::from(payload)))
    }
}

#[cfg(test)]
mod test {

    use super::*;

    use chrono::TimeZone;

    #[test]
    fn applied_inserts_carry_no_rows() {
        let id = "00112233445566778899aabbccddeeff"
            .parse::<NotificationId>()
            .unwrap();
        // A row-less result means the insert went through; it must not be treated as a fault.
        assert!(check_applied(&id, None).is_ok());
        assert!(check_applied(&id, Some(true)).is_ok());
        match check_applied(&id, Some(false)) {
            Err(storage::Error::Conflict { id: conflicted, .. }) => assert_eq!(id, conflicted),
            other => panic!("expected a conflict, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn listing_order_breaks_ties_stably() {
        let t0 = Utc.timestamp_opt(1000, 0).unwrap();
        let t1 = Utc.timestamp_opt(2000, 0).unwrap();
        let a = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
            .parse::<NotificationId>()
            .unwrap();
        let b = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb"
            .parse::<NotificationId>()
            .unwrap();
        let c = "cccccccccccccccccccccccccccccccc"
            .parse::<NotificationId>()
            .unwrap();
        let rows = vec![
            (a.clone(), t0),
            (c.clone(), t1),
            (b.clone(), t0),
        ];
        // t1 first; then the t0 pair, in reverse identifier order, however the rows arrived
        let expected = vec![c, b.clone(), a.clone()];
        assert_eq!(expected, order_descending(rows.clone()));
        let mut shuffled = rows;
        shuffled.reverse();
        assert_eq!(expected, order_descending(shuffled));
    }
}
