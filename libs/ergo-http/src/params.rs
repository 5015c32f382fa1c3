use crate::error::HttpError;

/// Insertion-ordered multimap of string parameters.
///
/// Used for query parameters, form fields and the
/// [`RequestOption::Values`](crate::RequestOption::Values) option. Keys keep
/// the position of their first insertion; repeated keys append values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamSet {
    entries: Vec<(String, Vec<String>)>,
}

impl ParamSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `value` under `key`.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, values)) => values.push(value),
            None => self.entries.push((key, vec![value])),
        }
    }

    /// Builder-style [`add`](Self::add).
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.add(key, value);
        self
    }

    /// Replaces all values of `key` with `value`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, values)) => *values = vec![value],
            None => self.entries.push((key, vec![value])),
        }
    }

    /// First value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_all(key).first().map(String::as_str)
    }

    /// All values stored under `key`, in insertion order.
    #[must_use]
    pub fn get_all(&self, key: &str) -> &[String] {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map_or(&[][..], |(_, values)| values.as_slice())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of distinct keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Appends every pair of `other`, preserving its order.
    pub fn extend_from(&mut self, other: &ParamSet) {
        for (key, value) in other.pairs() {
            self.add(key, value);
        }
    }

    /// Flattened `(key, value)` pairs in insertion order.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().flat_map(|(key, values)| {
            values
                .iter()
                .map(move |value| (key.as_str(), value.as_str()))
        })
    }

    /// `application/x-www-form-urlencoded` form of the pairs.
    ///
    /// # Errors
    /// Returns `HttpError::FormEncode` if the serializer rejects a pair.
    pub fn encode(&self) -> Result<String, HttpError> {
        let pairs: Vec<(&str, &str)> = self.pairs().collect();
        Ok(serde_urlencoded::to_string(pairs)?)
    }
}

impl<K, V> FromIterator<(K, V)> for ParamSet
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut set = ParamSet::new();
        for (key, value) in iter {
            set.add(key, value);
        }
        set
    }
}

impl<K, V, const N: usize> From<[(K, V); N]> for ParamSet
where
    K: Into<String>,
    V: Into<String>,
{
    fn from(pairs: [(K, V); N]) -> Self {
        pairs.into_iter().collect()
    }
}
