//! Gzip response compression.

use std::io::Write;

use bytes::Bytes;
use flate2::write::GzEncoder;
use hyper::header::{HeaderMap, HeaderValue, ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH};
use serde::{Deserialize, Serialize};

use crate::context::ResponseEntity;

/// Compression settings of a proxy filter.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct CompressionSpec {
    /// Bodies shorter than this are left alone.
    pub min_length: usize,
}

/// Applies gzip to responses when the client accepts it.
pub struct Compression {
    min_length: usize,
}

impl Compression {
    pub fn new(spec: &CompressionSpec) -> Self {
        Self {
            min_length: spec.min_length,
        }
    }

    /// Compress the response body in place when all gates pass: the request
    /// accepts gzip, the response is not already encoded, and the body is at
    /// least `minLength` bytes. Returns whether compression was applied.
    pub fn apply(&self, request_headers: &HeaderMap, response: &mut ResponseEntity) -> bool {
        if !accepts_gzip(request_headers) {
            return false;
        }
        if response.headers.contains_key(CONTENT_ENCODING) {
            return false;
        }
        if response.body().len() < self.min_length {
            return false;
        }

        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        if encoder.write_all(response.body()).is_err() {
            return false;
        }
        let compressed = match encoder.finish() {
            Ok(c) => c,
            Err(_) => return false,
        };

        response.set_body(Bytes::from(compressed));
        response.headers.remove(CONTENT_LENGTH);
        response
            .headers
            .insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        true
    }
}

fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(ACCEPT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains("gzip") || v.contains('*'))
}
