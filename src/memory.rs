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

//! # memory
//!
//! [Storage] implementation backed by process memory: the reference backend.
//!
//! [Storage]: crate::storage
//!
//! Nothing survives a restart, which makes this suitable for tests & throwaway deployments
//! only. It is, however, the executable statement of the storage contract: creation order *is*
//! the append order (so "ties" are trivially stable), and the write lock makes each append
//! atomic with respect to concurrent readers.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use crate::{entities::NotificationId, storage};

#[derive(Default)]
struct Log {
    /// Identifiers in append order, oldest first
    order: Vec<NotificationId>,
    payloads: HashMap<NotificationId, Bytes>,
}

/// In-memory [Backend](storage::Backend)
#[derive(Default)]
pub struct Memory {
    log: RwLock<Log>,
}

impl Memory {
    pub fn new() -> Memory {
        Memory::default()
    }
}

#[async_trait]
impl storage::Backend for Memory {
    async fn append(
        &self,
        id: &NotificationId,
        payload: &[u8],
    ) -> std::result::Result<(), storage::Error> {
        let mut log = self.log.write().await;
        if log.payloads.contains_key(id) {
            return Err(storage::Error::conflict(id));
        }
        log.order.push(id.clone());
        log.payloads
            .insert(id.clone(), Bytes::copy_from_slice(payload));
        Ok(())
    }

    async fn list_ids_descending(
        &self,
    ) -> std::result::Result<Vec<NotificationId>, storage::Error> {
        let log = self.log.read().await;
        Ok(log.order.iter().rev().cloned().collect())
    }

    async fn get(
        &self,
        id: &NotificationId,
    ) -> std::result::Result<Option<Bytes>, storage::Error> {
        let log = self.log.read().await;
        Ok(log.payloads.get(id).cloned())
    }
}

#[cfg(test)]
mod test {

    use super::*;

    use crate::storage::Backend;

    #[tokio::test]
    async fn empty_store_lists_nothing() {
        let store = Memory::new();
        assert!(store.list_ids_descending().await.unwrap().is_empty());
        let id = NotificationId::mint();
        assert!(store.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn round_trip_is_byte_for_byte() {
        let store = Memory::new();
        let id = NotificationId::mint();
        // Deliberately *not* canonical JSON-- whitespace & key order must survive
        let payload = br#"{ "type":"Note",   "content": "hi" }"#;
        store.append(&id, payload).await.unwrap();
        assert_eq!(
            Bytes::from_static(payload),
            store.get(&id).await.unwrap().unwrap()
        );
    }

    #[tokio::test]
    async fn duplicate_append_is_a_conflict() {
        let store = Memory::new();
        let id = NotificationId::mint();
        store.append(&id, b"{}").await.unwrap();
        match store.append(&id, b"{}").await {
            Err(storage::Error::Conflict { id: conflicted, .. }) => assert_eq!(id, conflicted),
            other => panic!("expected a conflict, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn listing_is_newest_first() {
        let store = Memory::new();
        let ids: Vec<NotificationId> = (0..4).map(|_| NotificationId::mint()).collect();
        for id in &ids {
            store.append(id, b"{}").await.unwrap();
        }
        let listed = store.list_ids_descending().await.unwrap();
        assert_eq!(
            ids.iter().rev().cloned().collect::<Vec<_>>(),
            listed,
            "append-only log must list in reverse append order"
        );
    }
}
