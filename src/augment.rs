use http::HeaderMap;
use http::header::{AUTHORIZATION, HeaderValue};

/// Returns a copy of `headers` carrying `Authorization: Bearer <token>` when an
/// access token is present, and an unchanged copy otherwise.
///
/// Token validity is never checked here. A token that is empty or cannot be
/// encoded as a header value is treated as absent; the server's 401 then
/// routes the request into the refresh path.
pub(crate) fn authorize_headers(headers: &HeaderMap, access_token: Option<&str>) -> HeaderMap {
    let mut authorized = headers.clone();
    if let Some(value) = access_token.and_then(bearer_header_value) {
        authorized.insert(AUTHORIZATION, value);
    }
    authorized
}

fn bearer_header_value(token: &str) -> Option<HeaderValue> {
    if token.is_empty() {
        return None;
    }
    let mut value = HeaderValue::from_str(&format!("Bearer {token}")).ok()?;
    value.set_sensitive(true);
    Some(value)
}
