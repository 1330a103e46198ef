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

//! # inbox
//!
//! The LDN protocol engine: request dispatch, protocol-mandated status codes & headers, and the
//! two document shapes this service ever builds (the container listing and the pass-through
//! notification body).
//!
//! The HTTP surface, in full:
//!
//! | method        | path            | behavior                                          |
//! |---------------|-----------------|---------------------------------------------------|
//! | POST          | inbox path      | validate, persist, 201 + Location                 |
//! | GET/HEAD      | inbox path      | 200, the container listing as JSON-LD             |
//! | GET/HEAD      | inbox path/{id} | 200 with the stored bytes, verbatim, or 404       |
//! | OPTIONS       | anywhere        | 200, `Allow` & `Accept-Post`, no body             |
//! | anything else | anywhere        | 405, `Allow`                                      |
//!
//! The container is addressable with & without the trailing slash. HEAD handling is axum's: a
//! `get` route serves HEAD by running the handler & discarding the body, which is exactly the
//! "same status & headers as GET" contract.
//!
//! Storage faults of any stripe map to 500 with a deliberately bland body; the interesting part
//! is logged server-side. In particular a [Conflict](storage::Error::Conflict) on append is
//! *not* retried with a fresh identifier: with 128 bits of entropy behind each one, a collision
//! is overwhelmingly more likely to mean a bug or a misbehaving backend than bad luck, and
//! retrying would just paper over it.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, HeaderName, StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use serde::Serialize;
use snafu::{Backtrace, ResultExt, Snafu};
use tracing::{debug, error, info};

use crate::{
    entities::{InboxConfig, NotificationId},
    http::ErrorResponseBody,
    ldninbox::LdnInbox,
    storage, validate,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{source}"))]
    Validation { source: validate::Error },
    #[snafu(display("No notification at {segment}"))]
    NoSuchNotification {
        segment: String,
        backtrace: Backtrace,
    },
    #[snafu(display("While appending a notification: {source}"))]
    Append { source: storage::Error },
    #[snafu(display("While listing the container: {source}"))]
    List { source: storage::Error },
    #[snafu(display("While fetching notification {id}: {source}"))]
    Fetch {
        id: NotificationId,
        source: storage::Error,
    },
    #[snafu(display("While serializing the container listing: {source}"))]
    Serialize { source: serde_json::Error },
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        response builder                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The media type under which both the container listing & stored notifications are served
pub const LD_JSON: &str = "application/ld+json";

/// Every method this surface answers; the `Allow` header on OPTIONS & 405 responses
pub const ALLOWED_METHODS: &str = "GET, HEAD, POST, OPTIONS";

/// `Accept-Post` isn't among the pre-defined [header](axum::http::header) constants
pub const ACCEPT_POST: HeaderName = HeaderName::from_static("accept-post");

/// The container listing
///
/// Field order is the serialization order, which keeps the document deterministic for a given
/// store state (nice for tests, & harmless to clients).
#[derive(Debug, Serialize)]
pub struct ContainerBody {
    #[serde(rename = "@context")]
    context: &'static str,
    #[serde(rename = "@id")]
    id: String,
    #[serde(rename = "@type")]
    rdf_types: [&'static str; 3],
    contains: Vec<String>,
}

impl ContainerBody {
    pub fn new(config: &InboxConfig, ids: Vec<NotificationId>) -> ContainerBody {
        ContainerBody {
            context: "https://www.w3.org/ns/ldp",
            id: config.container_url(),
            rdf_types: ["Container", "BasicContainer", "http://www.w3.org/ns/ldp#Inbox"],
            contains: ids
                .iter()
                .map(|id| config.notification_url(id))
                .collect(),
        }
    }
}

fn internal_server_error() -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponseBody {
            error: "Internal server error".to_owned(),
        }),
    )
        .into_response()
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            handlers                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// POST handler: receive a notification
pub async fn post_notification(
    State(state): State<Arc<LdnInbox>>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    async fn post1(state: &LdnInbox, content_type: Option<&str>, body: &[u8]) -> Result<NotificationId> {
        validate::validate(content_type, body.len(), &state.config).context(ValidationSnafu)?;
        validate::well_formed(body).context(ValidationSnafu)?;
        let id = NotificationId::mint();
        state.storage.append(&id, body).await.context(AppendSnafu)?;
        Ok(id)
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    match post1(&state, content_type, &body).await {
        Ok(id) => {
            state.instruments.notifications_posted.inc();
            info!(%id, "Accepted a notification");
            (
                StatusCode::CREATED,
                [(header::LOCATION, state.config.notification_url(&id))],
            )
                .into_response()
        }
        Err(err @ Error::Validation {
            source: validate::Error::UnsupportedMediaType { .. },
        }) => {
            state
                .instruments
                .notifications_rejected
                .with_label_values(&["media-type"])
                .inc();
            debug!("{}", err);
            (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                [(ACCEPT_POST, state.config.accept_post())],
                Json(ErrorResponseBody {
                    error: format!("{}", err),
                }),
            )
                .into_response()
        }
        Err(err @ Error::Validation {
            source: validate::Error::PayloadTooLarge { .. },
        }) => {
            state
                .instruments
                .notifications_rejected
                .with_label_values(&["too-large"])
                .inc();
            debug!("{}", err);
            (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(ErrorResponseBody {
                    error: format!("{}", err),
                }),
            )
                .into_response()
        }
        Err(err @ Error::Validation {
            source: validate::Error::MalformedBody { .. },
        }) => {
            state
                .instruments
                .notifications_rejected
                .with_label_values(&["malformed"])
                .inc();
            debug!("{}", err);
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponseBody {
                    error: format!("{}", err),
                }),
            )
                .into_response()
        }
        Err(err) => {
            state.instruments.storage_errors.inc();
            error!("{:?}", err);
            internal_server_error()
        }
    }
}

/// GET handler for the inbox path: the container listing
pub async fn get_inbox(State(state): State<Arc<LdnInbox>>) -> axum::response::Response {
    async fn get_inbox1(state: &LdnInbox) -> Result<String> {
        let ids = state
            .storage
            .list_ids_descending()
            .await
            .context(ListSnafu)?;
        serde_json::to_string(&ContainerBody::new(&state.config, ids)).context(SerializeSnafu)
    }

    match get_inbox1(&state).await {
        Ok(doc) => {
            state.instruments.containers_listed.inc();
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, LD_JSON)],
                doc,
            )
                .into_response()
        }
        Err(err) => {
            state.instruments.storage_errors.inc();
            error!("{:?}", err);
            internal_server_error()
        }
    }
}

/// GET handler for individual notifications
///
/// A path segment that doesn't even have the shape of an identifier is a 404 without troubling
/// the store.
pub async fn get_notification(
    State(state): State<Arc<LdnInbox>>,
    Path(segment): Path<String>,
) -> axum::response::Response {
    async fn get1(state: &LdnInbox, segment: &str) -> Result<Bytes> {
        let id = segment
            .parse::<NotificationId>()
            .map_err(|_| {
                NoSuchNotificationSnafu {
                    segment: segment.to_owned(),
                }
                .build()
            })?;
        match state
            .storage
            .get(&id)
            .await
            .context(FetchSnafu { id: id.clone() })?
        {
            Some(payload) => Ok(payload),
            None => NoSuchNotificationSnafu {
                segment: segment.to_owned(),
            }
            .fail(),
        }
    }

    match get1(&state, &segment).await {
        Ok(payload) => {
            state.instruments.notifications_served.inc();
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, LD_JSON)],
                payload,
            )
                .into_response()
        }
        Err(Error::NoSuchNotification { .. }) => {
            state.instruments.notifications_not_found.inc();
            info!(%segment, "No such notification");
            (
                StatusCode::NOT_FOUND,
                Json(ErrorResponseBody {
                    error: "No such notification".to_owned(),
                }),
            )
                .into_response()
        }
        Err(err) => {
            state.instruments.storage_errors.inc();
            error!("{:?}", err);
            internal_server_error()
        }
    }
}

/// OPTIONS handler: advertise the surface, touch nothing
pub async fn options_inbox(State(state): State<Arc<LdnInbox>>) -> axum::response::Response {
    (
        StatusCode::OK,
        [
            (header::ALLOW, ALLOWED_METHODS.to_owned()),
            (ACCEPT_POST, state.config.accept_post()),
        ],
    )
        .into_response()
}

/// Fallback for methods outside the surface
pub async fn method_not_allowed() -> axum::response::Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, ALLOWED_METHODS)],
    )
        .into_response()
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             router                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Build the inbox [Router]
///
/// The container is routed at the configured path both with & without a trailing slash (they
/// are distinct routes to axum).
pub fn make_router(state: Arc<LdnInbox>) -> Router {
    let root = state.config.route_root().to_owned();
    let container = get(get_inbox)
        .post(post_notification)
        .options(options_inbox)
        .fallback(method_not_allowed);
    let resource = get(get_notification)
        .options(options_inbox)
        .fallback(method_not_allowed);
    let router = if root == "/" {
        Router::new()
            .route("/", container)
            .route("/{segment}", resource)
    } else {
        Router::new()
            .route(&root, container.clone())
            .route(&format!("{}/", root), container)
            .route(&format!("{}/{{segment}}", root), resource)
    };
    router.with_state(state)
}

#[cfg(test)]
mod test {

    use super::*;

    use crate::memory::Memory;

    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt; // for `oneshot`

    fn test_config() -> InboxConfig {
        InboxConfig {
            base_url: "https://example.com".parse().unwrap(),
            inbox_path: "/inbox/".to_owned(),
            max_notification_size: 100 * 1024,
            supported_content_types: [
                "application/ld+json",
                "application/activity+json",
                "application/json",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }

    fn test_app() -> (Arc<LdnInbox>, Router) {
        let state = Arc::new(LdnInbox::new(test_config(), Box::new(Memory::new())).unwrap());
        let router = make_router(state.clone());
        (state, router)
    }

    async fn body_bytes(rsp: axum::response::Response) -> Bytes {
        rsp.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn post_then_fetch_is_byte_for_byte() {
        let (_state, app) = test_app();
        let payload = r#"{"type":"Note","content":"hi"}"#;
        let rsp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/inbox")
                    .header(header::CONTENT_TYPE, "application/ld+json")
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(StatusCode::CREATED, rsp.status());
        let location = rsp
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_owned();
        let (prefix, id) = location.split_at("https://example.com/inbox/".len());
        assert_eq!("https://example.com/inbox/", prefix);
        assert_eq!(32, id.len());
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));

        let rsp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/inbox/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(StatusCode::OK, rsp.status());
        assert_eq!(
            LD_JSON,
            rsp.headers()
                .get(header::CONTENT_TYPE)
                .unwrap()
                .to_str()
                .unwrap()
        );
        assert_eq!(payload.as_bytes(), &body_bytes(rsp).await[..]);
    }

    #[tokio::test]
    async fn container_lists_newest_first() {
        let (_state, app) = test_app();
        let mut locations = Vec::new();
        for i in 0..3 {
            let rsp = app
                .clone()
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/inbox/")
                        .header(header::CONTENT_TYPE, "application/activity+json")
                        .body(Body::from(format!(r#"{{"seq":{}}}"#, i)))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(StatusCode::CREATED, rsp.status());
            locations.push(
                rsp.headers()
                    .get(header::LOCATION)
                    .unwrap()
                    .to_str()
                    .unwrap()
                    .to_owned(),
            );
        }

        // With & without the trailing slash
        for uri in ["/inbox", "/inbox/"] {
            let rsp = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(StatusCode::OK, rsp.status());
            assert_eq!(
                LD_JSON,
                rsp.headers()
                    .get(header::CONTENT_TYPE)
                    .unwrap()
                    .to_str()
                    .unwrap()
            );
            let doc: serde_json::Value =
                serde_json::from_slice(&body_bytes(rsp).await).unwrap();
            assert_eq!("https://www.w3.org/ns/ldp", doc["@context"]);
            assert_eq!("https://example.com/inbox/", doc["@id"]);
            assert_eq!(
                serde_json::json!([
                    "Container",
                    "BasicContainer",
                    "http://www.w3.org/ns/ldp#Inbox"
                ]),
                doc["@type"]
            );
            let contains: Vec<String> = doc["contains"]
                .as_array()
                .unwrap()
                .iter()
                .map(|v| v.as_str().unwrap().to_owned())
                .collect();
            assert_eq!(
                locations.iter().rev().cloned().collect::<Vec<_>>(),
                contains,
                "most recent first"
            );
        }
    }

    #[tokio::test]
    async fn unsupported_media_type_is_415_and_persists_nothing() {
        let (_state, app) = test_app();
        for content_type in [Some("text/turtle"), None] {
            let mut builder = Request::builder().method("POST").uri("/inbox");
            if let Some(content_type) = content_type {
                builder = builder.header(header::CONTENT_TYPE, content_type);
            }
            let rsp = app
                .clone()
                .oneshot(builder.body(Body::from("{}")).unwrap())
                .await
                .unwrap();
            assert_eq!(StatusCode::UNSUPPORTED_MEDIA_TYPE, rsp.status());
            assert_eq!(
                "application/ld+json, application/activity+json, application/json",
                rsp.headers().get(&ACCEPT_POST).unwrap().to_str().unwrap()
            );
            let body: ErrorResponseBody =
                serde_json::from_slice(&body_bytes(rsp).await).unwrap();
            assert!(!body.error.is_empty());
        }
        // nothing was persisted
        let rsp = app
            .oneshot(Request::builder().uri("/inbox/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&body_bytes(rsp).await).unwrap();
        assert!(doc["contains"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversize_payload_is_413() {
        let state = Arc::new(
            LdnInbox::new(
                InboxConfig {
                    max_notification_size: 8,
                    ..test_config()
                },
                Box::new(Memory::new()),
            )
            .unwrap(),
        );
        let app = make_router(state);
        let rsp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/inbox")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"a":"bcdefghij"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(StatusCode::PAYLOAD_TOO_LARGE, rsp.status());
    }

    #[tokio::test]
    async fn malformed_json_is_400() {
        let (_state, app) = test_app();
        let rsp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/inbox")
                    .header(header::CONTENT_TYPE, "application/ld+json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(StatusCode::BAD_REQUEST, rsp.status());
    }

    #[tokio::test]
    async fn missing_notifications_are_404() {
        let (_state, app) = test_app();
        // well-formed identifier, nothing stored under it
        let rsp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/inbox/00112233445566778899aabbccddeeff")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(StatusCode::NOT_FOUND, rsp.status());
        // garbage segment: also 404, without a storage round-trip
        let rsp = app
            .oneshot(
                Request::builder()
                    .uri("/inbox/not-an-id")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(StatusCode::NOT_FOUND, rsp.status());
    }

    #[tokio::test]
    async fn head_matches_get_sans_body() {
        let (_state, app) = test_app();
        let rsp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("HEAD")
                    .uri("/inbox/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(StatusCode::OK, rsp.status());
        assert_eq!(
            LD_JSON,
            rsp.headers()
                .get(header::CONTENT_TYPE)
                .unwrap()
                .to_str()
                .unwrap()
        );
        assert!(body_bytes(rsp).await.is_empty());
    }

    #[tokio::test]
    async fn options_advertises_the_surface() {
        let (_state, app) = test_app();
        let rsp = app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/inbox")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(StatusCode::OK, rsp.status());
        assert_eq!(
            ALLOWED_METHODS,
            rsp.headers().get(header::ALLOW).unwrap().to_str().unwrap()
        );
        assert_eq!(
            "application/ld+json, application/activity+json, application/json",
            rsp.headers().get(&ACCEPT_POST).unwrap().to_str().unwrap()
        );
        assert!(body_bytes(rsp).await.is_empty());
    }

    #[tokio::test]
    async fn unknown_methods_are_405() {
        let (_state, app) = test_app();
        for (method, uri) in [
            ("DELETE", "/inbox"),
            ("PUT", "/inbox/"),
            ("PATCH", "/inbox/00112233445566778899aabbccddeeff"),
            ("POST", "/inbox/00112233445566778899aabbccddeeff"),
        ] {
            let rsp = app
                .clone()
                .oneshot(
                    Request::builder()
                        .method(method)
                        .uri(uri)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(StatusCode::METHOD_NOT_ALLOWED, rsp.status(), "{} {}", method, uri);
            assert_eq!(
                ALLOWED_METHODS,
                rsp.headers().get(header::ALLOW).unwrap().to_str().unwrap()
            );
        }
    }

    #[tokio::test]
    async fn instruments_track_the_traffic() {
        let (state, app) = test_app();
        let _ = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/inbox")
                    .header(header::CONTENT_TYPE, "application/ld+json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        let _ = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/inbox")
                    .header(header::CONTENT_TYPE, "text/plain")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(1, state.instruments.notifications_posted.get());
        assert_eq!(
            1,
            state
                .instruments
                .notifications_rejected
                .with_label_values(&["media-type"])
                .get()
        );
    }
}
