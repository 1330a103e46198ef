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

//! # ldninbox
//!
//! A [Linked Data Notifications] inbox: notifications are POSTed to the inbox as JSON-LD
//! documents, persisted, and re-exposed both as an LDP container listing and as individually
//! addressable resources.
//!
//! [Linked Data Notifications]: https://www.w3.org/TR/ldn/
//!
//! The library holds everything with a design decision in it; the `ldninboxd` binary is
//! configuration, logging & socket plumbing around [inbox::make_router].
pub mod dynamodb;
pub mod entities;
pub mod http;
pub mod inbox;
pub mod ldninbox;
pub mod memory;
pub mod metrics;
pub mod scylla;
pub mod storage;
pub mod validate;
