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

//! # validate
//!
//! Validation of inbound notifications, applied in full before any persistence attempt: a
//! rejected POST leaves no partial state behind.
//!
//! Media-type acceptance is by substring containment, case-sensitive on the media-type token:
//! `application/ld+json; profile="..."` is accepted when `application/ld+json` is configured.
//! That matches the original LDN deployments this service interoperates with, which never
//! parsed Content-Type parameters. Payload semantics are never inspected here; syntactic JSON
//! well-formedness is a distinct check ([well_formed]) with a distinct failure mode, since an
//! unparseable body must be rejected even though accepted bodies are stored verbatim.

use crate::entities::InboxConfig;

use snafu::{Backtrace, ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Content type {content_type:?} is not accepted by this inbox"))]
    UnsupportedMediaType {
        content_type: String,
        backtrace: Backtrace,
    },
    #[snafu(display("Notification size {size} exceeds the maximum of {limit} bytes"))]
    PayloadTooLarge {
        size: usize,
        limit: usize,
        backtrace: Backtrace,
    },
    #[snafu(display("Invalid JSON: {source}"))]
    MalformedBody { source: serde_json::Error },
}

type Result<T> = std::result::Result<T, Error>;

/// Check an inbound Content-Type header value & body size against the configured limits
///
/// `content_type` is the raw header value; `None` (no header at all) is never accepted.
pub fn validate(content_type: Option<&str>, body_size: usize, config: &InboxConfig) -> Result<()> {
    let content_type = content_type.unwrap_or_default();
    if !config
        .supported_content_types
        .iter()
        .any(|accepted| content_type.contains(accepted.as_str()))
    {
        return UnsupportedMediaTypeSnafu {
            content_type: content_type.to_owned(),
        }
        .fail();
    }
    if body_size > config.max_notification_size {
        return PayloadTooLargeSnafu {
            size: body_size,
            limit: config.max_notification_size,
        }
        .fail();
    }
    Ok(())
}

/// Check that `body` is syntactically valid JSON
///
/// The parsed value is discarded; on acceptance the *raw bytes* are what gets stored.
pub fn well_formed(body: &[u8]) -> Result<()> {
    serde_json::from_slice::<serde::de::IgnoredAny>(body)
        .map(|_| ())
        .context(MalformedBodySnafu)
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn accepts_configured_types_by_substring() {
        let cfg = InboxConfig::default();
        assert!(validate(Some("application/ld+json"), 2, &cfg).is_ok());
        // parameters after the media-type token don't matter
        assert!(validate(
            Some(r#"application/ld+json; profile="https://www.w3.org/ns/activitystreams""#),
            2,
            &cfg
        )
        .is_ok());
        assert!(validate(Some("application/activity+json"), 2, &cfg).is_ok());
        assert!(matches!(
            validate(Some("text/turtle"), 2, &cfg),
            Err(Error::UnsupportedMediaType { .. })
        ));
        // matching is case-sensitive on the token
        assert!(matches!(
            validate(Some("Application/LD+JSON"), 2, &cfg),
            Err(Error::UnsupportedMediaType { .. })
        ));
        assert!(matches!(
            validate(None, 2, &cfg),
            Err(Error::UnsupportedMediaType { .. })
        ));
    }

    #[test]
    fn enforces_size_limit() {
        let cfg = InboxConfig {
            max_notification_size: 16,
            ..Default::default()
        };
        assert!(validate(Some("application/json"), 16, &cfg).is_ok());
        match validate(Some("application/json"), 17, &cfg) {
            Err(Error::PayloadTooLarge { size, limit, .. }) => {
                assert_eq!(17, size);
                assert_eq!(16, limit);
            }
            other => panic!("expected PayloadTooLarge, got {:?}", other),
        }
    }

    #[test]
    fn well_formedness() {
        assert!(well_formed(br#"{"type":"Note","content":"hi"}"#).is_ok());
        assert!(well_formed(b"[1, 2, 3]").is_ok());
        assert!(matches!(
            well_formed(b"{not json"),
            Err(Error::MalformedBody { .. })
        ));
        assert!(matches!(
            well_formed(b""),
            Err(Error::MalformedBody { .. })
        ));
    }
}
