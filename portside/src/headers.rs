//! Ordered, case-insensitive header multimap.
//!
//! Names are stored lowercase; append order is preserved globally and per
//! name, which matters for `Set-Cookie` and for faithful relay of
//! repeated fields.

use portside_h1::HeaderList;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `name`, in append order.
    pub fn get_all<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> {
        let name = name.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(move |(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace all values of `name` with one value.
    pub fn set(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        let name = name.as_ref().to_ascii_lowercase();
        self.entries.retain(|(n, _)| *n != name);
        self.entries.push((name, value.into()));
    }

    /// Append a value, keeping existing ones.
    pub fn add(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.entries
            .push((name.as_ref().to_ascii_lowercase(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        let name = name.to_ascii_lowercase();
        self.entries.retain(|(n, _)| *n != name);
    }

    /// Whether any value of `name` contains `token` in its comma-separated
    /// list (e.g. `Connection: keep-alive, close`).
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_list(self) -> HeaderList {
        self.entries
    }

    pub fn as_list(&self) -> HeaderList {
        self.entries.clone()
    }
}

impl From<HeaderList> for HeaderMap {
    fn from(entries: HeaderList) -> Self {
        // Parser output is already lowercase; normalise anyway for maps
        // built by hand.
        let entries = entries
            .into_iter()
            .map(|(n, v)| (n.to_ascii_lowercase(), v))
            .collect();
        Self { entries }
    }
}

impl FromIterator<(String, String)> for HeaderMap {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from(iter.into_iter().collect::<HeaderList>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive_access_preserves_order() {
        let mut h = HeaderMap::new();
        h.add("X-One", "a");
        h.add("x-two", "b");
        h.add("X-ONE", "c");

        assert_eq!(h.get("x-one"), Some("a"));
        assert_eq!(h.get_all("X-One").collect::<Vec<_>>(), vec!["a", "c"]);
        assert_eq!(
            h.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            vec!["x-one", "x-two", "x-one"]
        );
    }

    #[test]
    fn set_replaces_every_occurrence() {
        let mut h = HeaderMap::new();
        h.add("a", "1");
        h.add("a", "2");
        h.set("A", "3");
        assert_eq!(h.get_all("a").collect::<Vec<_>>(), vec!["3"]);
    }

    #[test]
    fn token_lists() {
        let mut h = HeaderMap::new();
        h.add("connection", "keep-alive, Close");
        assert!(h.has_token("Connection", "close"));
        assert!(h.has_token("connection", "keep-alive"));
        assert!(!h.has_token("connection", "upgrade"));
    }

    #[test]
    fn te_trailers_detection() {
        let mut h = HeaderMap::new();
        h.add("te", "trailers");
        assert!(h.has_token("te", "trailers"));
    }
}
