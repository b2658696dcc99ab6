use std::collections::HashMap;

/// A single header field, name stored in its original case.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderField {
    name: String,
    value: String,
}

impl HeaderField {
    /// Create new [`HeaderField`].
    #[inline]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into() }
    }

    /// Returns the header name as it was received.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the header value.
    #[inline]
    pub fn value(&self) -> &str {
        &self.value
    }
}

/// Ordered HTTP headers.
///
/// Every field is stored twice in spirit: under its original name, preserved in insertion order,
/// and under its lower-cased name in a lookup index. When the same name appears more than once,
/// lookup returns the last one.
#[derive(Clone, Debug, Default)]
pub struct HeaderMap {
    fields: Vec<HeaderField>,
    index: HashMap<String, usize>,
}

impl HeaderMap {
    /// Create new empty [`HeaderMap`].
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of fields, duplicates included.
    #[inline]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns `true` if there are no fields.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Append a field, keeping any previous field with the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let field = HeaderField::new(name, value);
        self.index.insert(field.name.to_ascii_lowercase(), self.fields.len());
        self.fields.push(field);
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Option<&str> {
        let idx = match self.index.get(name) {
            Some(idx) => *idx,
            None => *self.index.get(&name.to_ascii_lowercase())?,
        };
        Some(self.fields[idx].value())
    }

    /// Lookup by the exact, case-sensitive original name.
    pub fn get_exact(&self, name: &str) -> Option<&str> {
        self.fields.iter().rev().find(|f| f.name == name).map(HeaderField::value)
    }

    /// Returns `true` if the map contains field with given name, case-insensitive.
    #[inline]
    pub fn contains_key(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Iterate fields in insertion order.
    #[inline]
    pub fn iter(&self) -> Iter<'_> {
        Iter { inner: self.fields.iter() }
    }

    /// Removes all fields.
    pub fn clear(&mut self) {
        self.fields.clear();
        self.index.clear();
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for HeaderMap {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        let mut map = HeaderMap::new();
        for (name, value) in iter {
            map.append(name, value);
        }
        map
    }
}

impl<'a> IntoIterator for &'a HeaderMap {
    type Item = &'a HeaderField;

    type IntoIter = Iter<'a>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

// ===== Iterator =====

/// Iterator over [`HeaderMap`] fields, see [`HeaderMap::iter`].
#[derive(Debug)]
pub struct Iter<'a> {
    inner: std::slice::Iter<'a, HeaderField>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a HeaderField;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Iter<'_> { }
