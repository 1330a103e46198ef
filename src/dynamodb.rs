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

//! # dynamodb
//!
//! [Storage] implementation for DynamoDB.
//!
//! [Storage]: crate::storage
//!
//! One table, `notifications`, with partition key `id` (S); each item carries `payload` (B) and
//! `created_at` (N, microseconds since the epoch-- DynamoDB numbers are strings on the wire, so
//! we pick the resolution). The table is created by the provisioning tooling ahead of time.
//!
//! Appends guard against identifier collisions with a `attribute_not_exists(id)` condition
//! expression; the SDK expresses a failed condition as a `ServiceError` wrapping a
//! `ConditionalCheckFailedException`, which we surface as [Conflict](storage::Error::Conflict).
//! The container listing is a paginated scan projecting `(id, created_at)`, sorted here
//! (descending, ties broken by identifier)-- same reasoning as the ScyllaDB backend: no
//! server-side ordering across partitions, and the listing is expected to stay small.

use std::time::Duration;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, meta::region::RegionProviderChain};
use aws_sdk_dynamodb::{
    config::Credentials,
    error::SdkError,
    operation::put_item::PutItemError::ConditionalCheckFailedException,
    primitives::Blob,
    types::AttributeValue,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use snafu::{Backtrace, ResultExt, Snafu};
use url::Url;

use crate::{entities::NotificationId, storage};

/// The table in which notifications reside
const TABLE: &str = "notifications";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Item is missing the {name} attribute"))]
    MissingAttribute { name: String, backtrace: Backtrace },
    #[snafu(display("Unexpected AttributeValue variant for {name}"))]
    UnexpectedAttributeValue { name: String, backtrace: Backtrace },
    #[snafu(display("Un-parseable created_at attribute {text}: {source}"))]
    BadTimestamp {
        text: String,
        source: std::num::ParseIntError,
        backtrace: Backtrace,
    },
    #[snafu(display("Out-of-range created_at attribute {micros}"))]
    TimestampOOR { micros: i64, backtrace: Backtrace },
    #[snafu(display("Un-parseable id attribute: {source}"))]
    BadStoredId {
        #[snafu(source(from(crate::entities::Error, Box::new)))]
        source: Box<crate::entities::Error>,
    },
}

/// Where to find DynamoDB: an AWS region, or an explicit endpoint (dynamodb-local, say)
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Location {
    Region(String),
    Endpoint(Url),
}

/// `ldninbox`-specific DynamoDB client
pub struct Client {
    client: ::aws_sdk_dynamodb::Client,
    /// Per-call time limit; calls exceeding it surface as
    /// [Unavailable](storage::Error::Unavailable)
    timeout: Duration,
}

impl Client {
    pub async fn new(
        location: &Location,
        credentials: &Option<(SecretString, SecretString)>,
        timeout: Duration,
    ) -> Client {
        let creds = credentials.as_ref().map(|(id, secret)| {
            Credentials::new(
                id.expose_secret(),
                secret.expose_secret(),
                None,
                None,
                "ldninbox",
            )
        });

        let config = match location {
            Location::Region(region) => {
                let region_provider =
                    RegionProviderChain::first_try(Some(Region::new(region.clone())))
                        .or_default_provider()
                        .or_else(Region::new("us-west-2"));
                let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(region_provider);
                if let Some(creds) = creds {
                    loader = loader.credentials_provider(creds);
                }
                loader.load().await
            }
            Location::Endpoint(endpoint) => {
                let mut loader =
                    aws_config::defaults(BehaviorVersion::latest()).endpoint_url(endpoint.as_str());
                if let Some(creds) = creds {
                    loader = loader.credentials_provider(creds);
                }
                loader.load().await
            }
        };
        Client {
            client: ::aws_sdk_dynamodb::Client::new(&config),
            timeout,
        }
    }

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

/// Pull a typed attribute out of an item
///
/// An "Item" is just a `HashMap<String, AttributeValue>`; the schema lives entirely in code
/// like this.
fn take_attr<'a>(
    item: &'a std::collections::HashMap<String, AttributeValue>,
    name: &str,
) -> std::result::Result<&'a AttributeValue, Error> {
    item.get(name).ok_or_else(|| {
        MissingAttributeSnafu {
            name: name.to_owned(),
        }
        .build()
    })
}

fn id_and_created_at(
    item: &std::collections::HashMap<String, AttributeValue>,
) -> std::result::Result<(NotificationId, DateTime<Utc>), Error> {
    let id = match take_attr(item, "id")? {
        AttributeValue::S(text) => text.parse::<NotificationId>().context(BadStoredIdSnafu)?,
        _ => {
            return UnexpectedAttributeValueSnafu {
                name: "id".to_owned(),
            }
            .fail()
        }
    };
    let created_at = match take_attr(item, "created_at")? {
        AttributeValue::N(text) => {
            let micros = text.parse::<i64>().context(BadTimestampSnafu {
                text: text.clone(),
            })?;
            DateTime::<Utc>::from_timestamp_micros(micros)
                .ok_or_else(|| TimestampOORSnafu { micros }.build())?
        }
        _ => {
            return UnexpectedAttributeValueSnafu {
                name: "created_at".to_owned(),
            }
            .fail()
        }
    };
    Ok((id, created_at))
}

#[async_trait]
impl storage::Backend for Client {
    async fn append(
        &self,
        id: &NotificationId,
        payload: &[u8],
    ) -> std::result::Result<(), storage::Error> {
        let request = self
            .client
            .put_item()
            .table_name(TABLE)
            .item("id", AttributeValue::S(id.to_string()))
            .item(
                "created_at",
                AttributeValue::N(Utc::now().timestamp_micros().to_string()),
            )
            .item("payload", AttributeValue::B(Blob::new(payload)))
            .condition_expression("attribute_not_exists(id)");
        match tokio::time::timeout(self.timeout, request.send()).await {
            Err(elapsed) => Err(storage::Error::unavailable(elapsed)),
            Ok(Ok(_)) => Ok(()),
            // A failed condition expression means the identifier was already taken; the SDK
            // expresses that as a `ServiceError` wrapping `ConditionalCheckFailedException`.
            Ok(Err(err)) => {
                if matches!(err, SdkError::ServiceError(ref inner) if matches!(inner.err(), ConditionalCheckFailedException(_)))
                {
                    Err(storage::Error::conflict(id))
                } else {
                    Err(storage::Error::internal(err))
                }
            }
        }
    }

    async fn list_ids_descending(
        &self,
    ) -> std::result::Result<Vec<NotificationId>, storage::Error> {
        use aws_sdk_dynamodb::operation::scan::ScanOutput;
        // A scan caps out at 1MB of results per page, so paginate even though most inboxes will
        // fit in one.
        let mut pairs = Vec::new();
        let mut pages = self
            .client
            .scan()
            .table_name(TABLE)
            .projection_expression("id, created_at")
            .into_paginator()
            .send();
        loop {
            let page: Option<std::result::Result<ScanOutput, _>> =
                match tokio::time::timeout(self.timeout, pages.next()).await {
                    Ok(page) => page,
                    Err(elapsed) => return Err(storage::Error::unavailable(elapsed)),
                };
            let page = match page {
                Some(page) => page.map_err(storage::Error::internal)?,
                None => break,
            };
            for item in page.items() {
                pairs.push(id_and_created_at(item).map_err(storage::Error::internal)?);
            }
        }
        pairs.sort_by(|lhs, rhs| rhs.1.cmp(&lhs.1).then_with(|| rhs.0.cmp(&lhs.0)));
        Ok(pairs.into_iter().map(|(id, _)| id).collect())
    }

    async fn get(
        &self,
        id: &NotificationId,
    ) -> std::result::Result<Option<Bytes>, storage::Error> {
        let output = self
            .bounded(
                self.client
                    .get_item()
                    .table_name(TABLE)
                    .key("id", AttributeValue::S(id.to_string()))
                    .send(),
            )
            .await?;
        let item = match output.item() {
            Some(item) => item,
            None => return Ok(None),
        };
        match take_attr(item, "payload").map_err(storage::Error::internal)? {
            AttributeValue::B(blob) => Ok(Some(Bytes::from(blob.clone().into_inner()))),
            _ => Err(storage::Error::internal(
                UnexpectedAttributeValueSnafu {
                    name: "payload".to_owned(),
                }
                .build(),
            )),
        }
    }
}
