use std::borrow::Cow;

use super::Request;
use crate::http::Method;

/// Value of a request parameter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParamValue {
    /// Key present in only one source.
    Single(String),
    /// Key present in both the query string and a POST body, query value first.
    Both([String; 2]),
}

impl ParamValue {
    /// Returns the single value, or the query value when present in both sources.
    #[inline]
    pub fn first(&self) -> &str {
        match self {
            Self::Single(value) => value,
            Self::Both([query, _]) => query,
        }
    }

    /// Returns every value in source order.
    #[inline]
    pub fn as_slice(&self) -> &[String] {
        match self {
            Self::Single(value) => std::slice::from_ref(value),
            Self::Both(values) => values,
        }
    }
}

/// Decoded request parameters, in order of first appearance.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Params {
    entries: Vec<(String, ParamValue)>,
}

impl Params {
    /// Collect parameters of a parsed request.
    ///
    /// GET and every other method except POST only use the query string. POST also decodes a
    /// form encoded body, then merges both sources: a key present in only one source keeps that
    /// value, a key present in both becomes [`ParamValue::Both`] with the query value first.
    ///
    /// A POST body is ignored when its `Content-Type` is present and is not
    /// `application/x-www-form-urlencoded`.
    pub fn from_request(req: &Request) -> Params {
        let query = decode_form(req.query());

        if req.method() != Method::POST || !is_form(req.header("content-type")) {
            return Params::from_pairs(query);
        }

        let body = decode_form(&String::from_utf8_lossy(req.body()));
        Params::merge(query, body)
    }

    fn from_pairs(pairs: Vec<(String, String)>) -> Params {
        let mut params = Params::default();
        for (key, value) in pairs {
            params.insert(key, ParamValue::Single(value));
        }
        params
    }

    fn merge(query: Vec<(String, String)>, body: Vec<(String, String)>) -> Params {
        let mut params = Params::from_pairs(query);
        for (key, value) in body {
            match params.entries.iter_mut().find(|(k, _)| *k == key) {
                Some((_, slot)) => {
                    let query = match slot {
                        ParamValue::Single(query) | ParamValue::Both([query, _]) => std::mem::take(query),
                    };
                    *slot = ParamValue::Both([query, value]);
                }
                None => params.entries.push((key, ParamValue::Single(value))),
            }
        }
        params
    }

    /// Insert, replacing the value of an existing key in place.
    fn insert(&mut self, key: String, value: ParamValue) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

fn is_form(content_type: Option<&str>) -> bool {
    match content_type {
        None => true,
        Some(ct) => ct
            .split(';')
            .next()
            .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/x-www-form-urlencoded")),
    }
}

// ===== Decoding =====

/// Split `key=value&...` pairs and decode both sides with [`decode_component`].
///
/// Empty pairs are skipped, a pair without `=` has an empty value. When a key repeats, the last
/// value wins.
pub fn decode_form(src: &str) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = Vec::new();
    for pair in src.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = decode_component(key);
        let value = decode_component(value);
        match pairs.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => pairs.push((key, value)),
        }
    }
    pairs
}

/// Decode form component, `+` as space then percent-decoding.
pub fn decode_component(src: &str) -> String {
    let spaced: Cow<str> = if src.contains('+') {
        Cow::Owned(src.replace('+', " "))
    } else {
        Cow::Borrowed(src)
    };
    percent_decode(&spaced)
}

/// Percent-decode a request path, `+` is kept as is.
pub(crate) fn decode_path(src: &str) -> String {
    percent_decode(src)
}

fn percent_decode(src: &str) -> String {
    match urlencoding::decode_binary(src.as_bytes()) {
        Cow::Borrowed(_) => src.to_owned(),
        Cow::Owned(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
    }
}
