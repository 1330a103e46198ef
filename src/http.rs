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

//! # http
//!
//! Odds & ends shared across HTTP handlers.

use axum::Json;
use serde::{Deserialize, Serialize};

/// The machine-readable JSON error body
///
/// Every client-error path on the inbox surface (415/413/400/404, and the bland 500) carries
/// one of these; the protocol calls for a machine-readable body, and a single representation
/// keeps the handlers from each inventing their own. `Deserialize` is there for the tests,
/// which parse responses back.
#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorResponseBody {
    pub error: String,
}

impl axum::response::IntoResponse for ErrorResponseBody {
    fn into_response(self) -> axum::response::Response {
        Json(self).into_response()
    }
}
