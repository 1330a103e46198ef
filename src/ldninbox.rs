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

//! # ldninbox application state

use crate::{entities::InboxConfig, metrics, storage::Backend as StorageBackend};

/// Application state available to all handlers
///
/// Handlers receive this behind an `Arc`; everything in here is either immutable after startup
/// or internally synchronized.
pub struct LdnInbox {
    pub config: InboxConfig,
    pub storage: Box<dyn StorageBackend + Send + Sync>,
    pub registry: prometheus::Registry,
    pub instruments: metrics::Instruments,
}

impl LdnInbox {
    /// Assemble the application state, registering the instruments as a side-effect
    pub fn new(
        config: InboxConfig,
        storage: Box<dyn StorageBackend + Send + Sync>,
    ) -> std::result::Result<LdnInbox, metrics::Error> {
        let registry = prometheus::Registry::new();
        let instruments = metrics::Instruments::new(&registry)?;
        Ok(LdnInbox {
            config,
            storage,
            registry,
            instruments,
        })
    }
}
