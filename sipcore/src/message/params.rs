use std::fmt;
use std::sync::Arc;

/// A single `;name` or `;name=value` parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: Arc<str>,
    pub value: Option<Arc<str>>,
}

impl Param {
    pub fn new(name: impl Into<Arc<str>>, value: Option<impl Into<Arc<str>>>) -> Self {
        Param {
            name: name.into(),
            value: value.map(Into::into),
        }
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}={}", self.name, value),
            None => write!(f, "{}", self.name),
        }
    }
}

/// An ordered list of parameters.
///
/// Order and case are preserved as parsed; lookups compare names
/// case-insensitively (RFC 3261 §19.1.4).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Params(Vec<Param>);

impl Params {
    pub fn new() -> Self {
        Params(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn push(&mut self, param: Param) {
        self.0.push(param);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Param> {
        self.0.iter()
    }

    /// The value of `name`, if present with a value.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .and_then(|p| p.value.as_deref())
    }

    /// `true` when `name` is present, valued or not.
    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Sets or replaces `name`, keeping its original position on replace.
    pub fn set(&mut self, name: impl Into<Arc<str>>, value: Option<impl Into<Arc<str>>>) {
        let name = name.into();
        let value = value.map(Into::into);
        match self.0.iter_mut().find(|p| p.name.eq_ignore_ascii_case(&name)) {
            Some(param) => param.value = value,
            None => self.0.push(Param { name, value }),
        }
    }

    /// Removes `name`, returning its parameter when it was present.
    pub fn remove(&mut self, name: &str) -> Option<Param> {
        let idx = self.0.iter().position(|p| p.name.eq_ignore_ascii_case(name))?;
        Some(self.0.remove(idx))
    }
}

impl FromIterator<Param> for Params {
    fn from_iter<T: IntoIterator<Item = Param>>(iter: T) -> Self {
        Params(iter.into_iter().collect())
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, param) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ";")?;
            }
            write!(f, "{param}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        let mut params = Params::new();
        params.push(Param::new("Transport", Some("tcp")));
        assert_eq!(params.get("transport"), Some("tcp"));
        assert!(params.contains("TRANSPORT"));
    }

    #[test]
    fn test_order_preserved() {
        let mut params = Params::new();
        params.push(Param::new("b", Some("2")));
        params.push(Param::new("a", None::<&str>));
        assert_eq!(params.to_string(), "b=2;a");
        params.set("b", Some("3"));
        assert_eq!(params.to_string(), "b=3;a");
    }
}
