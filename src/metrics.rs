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

//! # ldninbox metrics
//!
//! The actual counters are called "instruments" here, collected into one struct rather than
//! littering the application state with a field per counter. They're created once, at startup,
//! registered against the state's [Registry](prometheus::Registry), and scraped through the
//! `/metrics` endpoint in the Prometheus text exposition format.
//!
//! I'd prefer the instrument set be extensible without a centralized list, but for the handful
//! of counters an inbox needs the struct is simpler & the names can't clash by construction.

use prometheus::{IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("While registering an instrument: {source}"))]
    Register { source: prometheus::Error },
    #[snafu(display("While creating an instrument: {source}"))]
    Create { source: prometheus::Error },
    #[snafu(display("While encoding the registry: {source}"))]
    Encode { source: prometheus::Error },
}

type Result<T> = std::result::Result<T, Error>;

/// ldninbox instruments
///
/// Counters only, for now. `add` on a prometheus counter takes `&self`, so an instance of this
/// type can be shared behind an `Arc` with no further ceremony.
#[derive(Clone)]
pub struct Instruments {
    /// Notifications accepted & persisted
    pub notifications_posted: IntCounter,
    /// POSTs refused, by reason ("media-type", "too-large", "malformed")
    pub notifications_rejected: IntCounterVec,
    /// Container listings served
    pub containers_listed: IntCounter,
    /// Individual notifications served
    pub notifications_served: IntCounter,
    /// GETs for identifiers we don't have
    pub notifications_not_found: IntCounter,
    /// Requests that died in the storage layer
    pub storage_errors: IntCounter,
}

impl Instruments {
    /// Build the instruments & register each with `registry`
    pub fn new(registry: &Registry) -> Result<Instruments> {
        let notifications_posted = IntCounter::with_opts(Opts::new(
            "ldninbox_notifications_posted_total",
            "Notifications accepted & persisted",
        ))
        .context(CreateSnafu)?;
        let notifications_rejected = IntCounterVec::new(
            Opts::new(
                "ldninbox_notifications_rejected_total",
                "POSTs refused before persistence, labelled by reason",
            ),
            &["reason"],
        )
        .context(CreateSnafu)?;
        let containers_listed = IntCounter::with_opts(Opts::new(
            "ldninbox_containers_listed_total",
            "Container listings served",
        ))
        .context(CreateSnafu)?;
        let notifications_served = IntCounter::with_opts(Opts::new(
            "ldninbox_notifications_served_total",
            "Individual notifications served",
        ))
        .context(CreateSnafu)?;
        let notifications_not_found = IntCounter::with_opts(Opts::new(
            "ldninbox_notifications_not_found_total",
            "GETs for identifiers not in the store",
        ))
        .context(CreateSnafu)?;
        let storage_errors = IntCounter::with_opts(Opts::new(
            "ldninbox_storage_errors_total",
            "Requests that failed in the storage layer",
        ))
        .context(CreateSnafu)?;
        for collector in [
            Box::new(notifications_posted.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(notifications_rejected.clone()),
            Box::new(containers_listed.clone()),
            Box::new(notifications_served.clone()),
            Box::new(notifications_not_found.clone()),
            Box::new(storage_errors.clone()),
        ] {
            registry.register(collector).context(RegisterSnafu)?;
        }
        Ok(Instruments {
            notifications_posted,
            notifications_rejected,
            containers_listed,
            notifications_served,
            notifications_not_found,
            storage_errors,
        })
    }
}

/// Render `registry` in the Prometheus text exposition format
pub fn render(registry: &Registry) -> Result<String> {
    TextEncoder::new()
        .encode_to_string(&registry.gather())
        .context(EncodeSnafu)
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn instruments_register_and_render() {
        let registry = Registry::new();
        let instruments = Instruments::new(&registry).unwrap();
        instruments.notifications_posted.inc();
        instruments
            .notifications_rejected
            .with_label_values(&["too-large"])
            .inc();
        let text = render(&registry).unwrap();
        assert!(text.contains("ldninbox_notifications_posted_total 1"));
        assert!(text.contains(r#"reason="too-large""#));
        // double registration is a prometheus error, not a panic
        assert!(Instruments::new(&registry).is_err());
    }
}
