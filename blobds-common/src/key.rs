use std::fmt;

/// A hierarchical, slash-separated datastore key.
///
/// Keys are kept verbatim: no path cleaning, case folding or validation
/// happens here. Two keys are equal only if their bytes are equal, and
/// ordering is plain byte order. Segments such as `.` or `..` and embedded
/// NUL bytes are passed through unchanged, so callers that need sanitised
/// keys must sanitise them before handing them to a datastore.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(String);

impl Key {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Last segment of the key (`/a/b/c` -> `c`).
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or("")
    }

    /// Key with the last segment removed. The parent of a single-segment key
    /// is `/`.
    pub fn parent(&self) -> Key {
        match self.0.rfind('/') {
            Some(0) | None => Key::new("/"),
            Some(idx) => Key::new(&self.0[..idx]),
        }
    }

    /// Append a segment, inserting exactly one separator.
    pub fn child(&self, segment: &str) -> Key {
        let base = self.0.trim_end_matches('/');
        let segment = segment.trim_start_matches('/');
        Key::new(format!("{}/{}", base, segment))
    }

    /// Non-empty segments of the key in order.
    pub fn namespaces(&self) -> Vec<&str> {
        self.0.split('/').filter(|s| !s.is_empty()).collect()
    }

    /// True if `other` lives strictly below this key.
    pub fn is_ancestor_of(&self, other: &Key) -> bool {
        let base = self.0.trim_end_matches('/');
        other
            .0
            .strip_prefix(base)
            .is_some_and(|rest| rest.starts_with('/') && rest.len() > 1)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Key {
    fn from(key: &str) -> Self {
        Key::new(key)
    }
}

impl From<String> for Key {
    fn from(key: String) -> Self {
        Key::new(key)
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
