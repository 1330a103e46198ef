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

//! # ldninbox models
//!
//! I hate these sort of "catch-all" modules named "models" or "entities", but these types are
//! truly foundational: the notification identifier and the inbox configuration.

use std::{fmt::Display, str::FromStr};

use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, Snafu};
use url::Url;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("The inbox path {path:?} does not begin with '/'"))]
    BadInboxPath { path: String, backtrace: Backtrace },
    #[snafu(display("{text} is not a valid notification ID"))]
    BadNotificationId { text: String, backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         NotificationId                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Length, in bytes, of the entropy behind a [NotificationId]
///
/// The identifier doubles as the notification's URL path segment, so it must be
/// statistically unguessable; sixteen bytes gives us 128 bits.
const ID_LEN: usize = 16;

/// Opaque, server-minted notification identifier
///
/// A [NotificationId] is minted exactly once, at POST-acceptance time, and is immutable
/// thereafter; it appears verbatim as the final path segment of the notification's URL. The
/// textual representation is thirty-two lower-case hex digits.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct NotificationId(String);

impl NotificationId {
    /// Mint a fresh identifier: 128 bits from the OS RNG, hex-encoded
    ///
    /// This will not block on external state; collisions are not expected in practice and are
    /// not defended against beyond the storage layer reporting a conflict.
    pub fn mint() -> NotificationId {
        let mut buf = [0u8; ID_LEN];
        OsRng.fill_bytes(&mut buf);
        NotificationId(hex::encode(buf))
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for NotificationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NotificationId {
    type Err = Error;
    /// Parse a path segment as a [NotificationId]
    ///
    /// Validating the shape here lets lookups for garbage segments be refused without a
    /// storage round-trip.
    fn from_str(text: &str) -> Result<NotificationId> {
        if text.len() == 2 * ID_LEN
            && text
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            Ok(NotificationId(text.to_owned()))
        } else {
            BadNotificationIdSnafu {
                text: text.to_owned(),
            }
            .fail()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          InboxConfig                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Default cap on notification payload size: 100KiB
const DEFAULT_MAX_NOTIFICATION_SIZE: usize = 100 * 1024;

/// Inbox configuration
///
/// The protocol engine receives this already parsed; reading it from file (or wherever) is the
/// caller's concern. `inbox_path` is normalized on use: the container is addressable with or
/// without a trailing slash, and notification URLs always carry exactly one slash between the
/// inbox path & the identifier.
#[derive(Clone, Debug, Deserialize)]
pub struct InboxConfig {
    /// The address at which this inbox may be reached from the public internet
    #[serde(rename = "base-url")]
    pub base_url: Url,
    /// Path under `base_url` at which the container resides
    #[serde(rename = "inbox-path", default = "InboxConfig::default_inbox_path")]
    pub inbox_path: String,
    /// Maximum acceptable notification payload, in bytes
    #[serde(
        rename = "max-notification-size",
        default = "InboxConfig::default_max_notification_size"
    )]
    pub max_notification_size: usize,
    /// Media types accepted for POST; matched by substring against the Content-Type header
    #[serde(
        rename = "supported-content-types",
        default = "InboxConfig::default_supported_content_types"
    )]
    pub supported_content_types: Vec<String>,
}

impl InboxConfig {
    fn default_inbox_path() -> String {
        "/inbox/".to_owned()
    }
    fn default_max_notification_size() -> usize {
        DEFAULT_MAX_NOTIFICATION_SIZE
    }
    fn default_supported_content_types() -> Vec<String> {
        ["application/ld+json", "application/activity+json", "application/json"]
            .into_iter()
            .map(String::from)
            .collect()
    }
    /// Check that the inbox path can be routed
    ///
    /// The router demands paths beginning with '/' & will panic on anything else; checking
    /// here lets the caller surface a configuration error instead.
    pub fn validate(&self) -> Result<()> {
        if self.inbox_path.starts_with('/') {
            Ok(())
        } else {
            BadInboxPathSnafu {
                path: self.inbox_path.clone(),
            }
            .fail()
        }
    }
    /// The inbox path with no trailing slash ("/inbox"); the container route root
    pub fn route_root(&self) -> &str {
        let trimmed = self.inbox_path.trim_end_matches('/');
        if trimmed.is_empty() {
            "/"
        } else {
            trimmed
        }
    }
    /// The container's absolute URL, with trailing slash
    pub fn container_url(&self) -> String {
        format!(
            "{}{}/",
            self.base_url.as_str().trim_end_matches('/'),
            self.route_root().trim_end_matches('/')
        )
    }
    /// A notification's absolute URL
    pub fn notification_url(&self, id: &NotificationId) -> String {
        format!("{}{}", self.container_url(), id)
    }
    /// The value of the `Accept-Post` header: the accepted types, comma-separated
    pub fn accept_post(&self) -> String {
        self.supported_content_types.join(", ")
    }
}

impl Default for InboxConfig {
    fn default() -> Self {
        InboxConfig {
            base_url: "http://localhost:20687".parse::<Url>().unwrap(/* known good */),
            inbox_path: InboxConfig::default_inbox_path(),
            max_notification_size: InboxConfig::default_max_notification_size(),
            supported_content_types: InboxConfig::default_supported_content_types(),
        }
    }
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn minted_ids_smoke() {
        let id = NotificationId::mint();
        assert_eq!(32, id.as_str().len());
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        // Round-trips through its textual representation
        assert_eq!(id, id.to_string().parse::<NotificationId>().unwrap());
        // and two mints don't collide (they *really* shouldn't)
        assert_ne!(id, NotificationId::mint());
    }

    #[test]
    fn id_parse_rejects_garbage() {
        assert!("".parse::<NotificationId>().is_err());
        assert!("cafe".parse::<NotificationId>().is_err());
        assert!("../../../etc/passwd".parse::<NotificationId>().is_err());
        // upper-case hex is not the canonical form
        assert!("DEADBEEFDEADBEEFDEADBEEFDEADBEEF"
            .parse::<NotificationId>()
            .is_err());
        assert!("00112233445566778899aabbccddeeff"
            .parse::<NotificationId>()
            .is_ok());
    }

    #[test]
    fn unroutable_inbox_paths_are_rejected() {
        assert!(InboxConfig::default().validate().is_ok());
        let cfg = InboxConfig {
            inbox_path: "inbox/".to_owned(),
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(Error::BadInboxPath { .. })
        ));
    }

    #[test]
    fn config_urls() {
        let cfg = InboxConfig {
            base_url: "https://example.com".parse().unwrap(),
            inbox_path: "/inbox/".to_owned(),
            ..Default::default()
        };
        assert_eq!("/inbox", cfg.route_root());
        assert_eq!("https://example.com/inbox/", cfg.container_url());
        let id = "00112233445566778899aabbccddeeff"
            .parse::<NotificationId>()
            .unwrap();
        assert_eq!(
            "https://example.com/inbox/00112233445566778899aabbccddeeff",
            cfg.notification_url(&id)
        );
    }
}
