use std::sync::Mutex;

use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Uri};
use url::Url;

use crate::error::Error;

const MAX_BODY_EXCERPT_CHARS: usize = 2048;

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Request headers replace defaults of the same name; repeated request
/// values are all kept.
pub(crate) fn merge_headers(default_headers: &HeaderMap, request_headers: HeaderMap) -> HeaderMap {
    let mut merged = default_headers.clone();
    merged.extend(request_headers);
    merged
}

pub(crate) fn parse_header(name: &str, value: &str) -> Result<(HeaderName, HeaderValue), Error> {
    let header_name = HeaderName::try_from(name).map_err(|source| Error::InvalidHeaderName {
        name: name.to_owned(),
        source,
    })?;
    let header_value =
        HeaderValue::try_from(value).map_err(|source| Error::InvalidHeaderValue {
            name: name.to_owned(),
            source,
        })?;
    Ok((header_name, header_value))
}

fn invalid_uri(uri: &str) -> Error {
    Error::InvalidUri {
        uri: uri.to_owned(),
    }
}

fn is_http(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https") && url.has_host()
}

/// Accepts only `http(s)://host[:port][/path]`: no surrounding whitespace,
/// credentials, query or fragment.
pub(crate) fn parse_base_url(base_url: &str) -> Result<Url, Error> {
    let url = Url::parse(base_url).map_err(|_| invalid_uri(base_url))?;
    let plain = base_url.trim() == base_url
        && is_http(&url)
        && url.username().is_empty()
        && url.password().is_none()
        && url.query().is_none()
        && url.fragment().is_none();
    if plain {
        Ok(url)
    } else {
        Err(invalid_uri(base_url))
    }
}

/// Appends `path` to the base URL's path, or takes it as-is when it is an
/// absolute http(s) URL, then adds `query_pairs` after any query already in
/// `path`. The fragment is dropped.
pub(crate) fn request_url(
    base_url: &Url,
    path: &str,
    query_pairs: &[(String, String)],
) -> Result<Url, Error> {
    let mut url = match Url::parse(path) {
        Ok(absolute) if is_http(&absolute) => absolute,
        Ok(_) => return Err(invalid_uri(path)),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let relative = path.trim_start_matches('/');
            if relative.is_empty() {
                base_url.clone()
            } else {
                let base = base_url.as_str().trim_end_matches('/');
                Url::parse(&format!("{base}/{relative}")).map_err(|_| invalid_uri(path))?
            }
        }
        Err(_) => return Err(invalid_uri(path)),
    };

    url.set_fragment(None);
    if !query_pairs.is_empty() {
        url.query_pairs_mut().extend_pairs(query_pairs);
    }
    Ok(url)
}

pub(crate) fn to_http_uri(url: &Url) -> Result<Uri, Error> {
    url.as_str().parse().map_err(|_| invalid_uri(url.as_str()))
}

/// Scheme, host, port and path only; userinfo and query never reach logs or
/// error messages.
pub(crate) fn redact_uri(uri: &Uri) -> String {
    let scheme = uri.scheme_str().unwrap_or("http");
    let host = uri.host().unwrap_or_default();
    match uri.port_u16() {
        Some(port) => format!("{scheme}://{host}:{port}{}", uri.path()),
        None => format!("{scheme}://{host}{}", uri.path()),
    }
}

pub(crate) fn body_excerpt(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    match text.char_indices().nth(MAX_BODY_EXCERPT_CHARS) {
        Some((cut, _)) => format!("{}...(truncated)", &text[..cut]),
        None => text.into_owned(),
    }
}
