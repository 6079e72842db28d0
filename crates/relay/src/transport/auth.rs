// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use axum::http::HeaderMap;

use crate::error::RelayError;

/// Constant-time string comparison to prevent timing side-channel attacks.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Extract the token from an `Authorization: Bearer` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Validate the admin token. Admin endpoints are disabled entirely when no
/// token is configured.
pub fn validate_admin(headers: &HeaderMap, expected: Option<&str>) -> Result<(), RelayError> {
    let expected = expected.ok_or(RelayError::Unauthorized)?;
    let token = bearer_token(headers).ok_or(RelayError::Unauthorized)?;
    if constant_time_eq(token, expected) {
        Ok(())
    } else {
        Err(RelayError::Unauthorized)
    }
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
