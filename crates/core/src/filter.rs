//! Include / exclude / rename rules over namespaces
//!
//! Patterns are `db.collection` strings where `*` matches any run of
//! characters (including dots). A rename maps each `*` captured by the source
//! pattern into the matching `*` of the target pattern, in order.

use crate::error::{Error, Result};
use crate::namespace::Namespace;

/// A namespace pattern with `*` wildcards
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespacePattern {
    raw: String,
}

impl NamespacePattern {
    /// Parse a pattern; a bare database name means `db.*`.
    pub fn new(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(Error::Config("namespace pattern cannot be empty".into()));
        }
        let raw = if pattern.contains('.') {
            pattern.to_string()
        } else {
            format!("{pattern}.*")
        };
        Ok(Self { raw })
    }

    /// The pattern text
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Number of wildcards
    pub fn wildcards(&self) -> usize {
        self.raw.matches('*').count()
    }

    /// Whether `ns` matches
    pub fn matches(&self, ns: &str) -> bool {
        self.captures(ns).is_some()
    }

    /// Match and return the text captured by each `*`.
    pub fn captures(&self, ns: &str) -> Option<Vec<String>> {
        let parts: Vec<&str> = self.raw.split('*').collect();
        let mut caps = Vec::with_capacity(parts.len().saturating_sub(1));
        if capture_from(&parts, ns, &mut caps) {
            Some(caps)
        } else {
            None
        }
    }

    fn substitute(&self, caps: &[String]) -> String {
        let mut out = String::new();
        for (i, part) in self.raw.split('*').enumerate() {
            if i > 0 {
                out.push_str(caps.get(i - 1).map(String::as_str).unwrap_or(""));
            }
            out.push_str(part);
        }
        out
    }
}

fn capture_from(parts: &[&str], input: &str, caps: &mut Vec<String>) -> bool {
    let Some((first, rest)) = parts.split_first() else {
        return input.is_empty();
    };
    let Some(remaining) = input.strip_prefix(first) else {
        return false;
    };
    if rest.is_empty() {
        return remaining.is_empty();
    }
    // Try every split point for the wildcard that follows `first`, shortest first.
    for end in (0..=remaining.len()).filter(|i| remaining.is_char_boundary(*i)) {
        caps.push(remaining[..end].to_string());
        if capture_from(rest, &remaining[end..], caps) {
            return true;
        }
        caps.pop();
    }
    false
}

/// Filtering configuration consulted during discovery.
#[derive(Debug, Clone, Default)]
pub struct NamespaceFilter {
    include: Vec<NamespacePattern>,
    exclude: Vec<NamespacePattern>,
    renames: Vec<(NamespacePattern, NamespacePattern)>,
}

impl NamespaceFilter {
    /// A filter that includes everything and renames nothing
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an include pattern. With no include patterns everything is included.
    pub fn include(mut self, pattern: &str) -> Result<Self> {
        self.include.push(NamespacePattern::new(pattern)?);
        Ok(self)
    }

    /// Add an exclude pattern
    pub fn exclude(mut self, pattern: &str) -> Result<Self> {
        self.exclude.push(NamespacePattern::new(pattern)?);
        Ok(self)
    }

    /// Add a rename rule; both sides must have the same number of wildcards.
    pub fn rename(mut self, from: &str, to: &str) -> Result<Self> {
        let from = NamespacePattern::new(from)?;
        let to = NamespacePattern::new(to)?;
        if from.wildcards() != to.wildcards() {
            return Err(Error::Config(format!(
                "rename {} -> {} has mismatched wildcards",
                from.as_str(),
                to.as_str()
            )));
        }
        self.renames.push((from, to));
        Ok(self)
    }

    /// Whether the source namespace passes the include list.
    ///
    /// Bucket collections are judged under their view name.
    pub fn is_included(&self, source: &Namespace) -> bool {
        if self.include.is_empty() {
            return true;
        }
        let key = source.view_namespace().to_string();
        self.include.iter().any(|p| p.matches(&key))
    }

    /// Whether the source namespace is on the exclude list.
    pub fn is_excluded(&self, source: &Namespace) -> bool {
        let key = source.view_namespace().to_string();
        self.exclude.iter().any(|p| p.matches(&key))
    }

    /// Destination for a source namespace; the first matching rename wins.
    pub fn rename_target(&self, source: &Namespace) -> Namespace {
        let key = source.to_string();
        for (from, to) in &self.renames {
            if let Some(caps) = from.captures(&key) {
                return Namespace::parse(&to.substitute(&caps));
            }
        }
        source.clone()
    }

    /// Whether any include, exclude or rename rule is configured
    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty() && self.renames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_matching() {
        let p = NamespacePattern::new("mydb.*").unwrap();
        assert!(p.matches("mydb.orders"));
        assert!(p.matches("mydb.orders.archive"));
        assert!(!p.matches("other.orders"));

        let bare = NamespacePattern::new("mydb").unwrap();
        assert_eq!(bare.as_str(), "mydb.*");

        let exact = NamespacePattern::new("mydb.orders").unwrap();
        assert!(exact.matches("mydb.orders"));
        assert!(!exact.matches("mydb.orders2"));
    }

    #[test]
    fn test_empty_include_means_everything() {
        let f = NamespaceFilter::new();
        assert!(f.is_included(&Namespace::new("a", "b")));
        assert!(!f.is_excluded(&Namespace::new("a", "b")));
        assert!(f.is_empty());
    }

    #[test]
    fn test_include_exclude() {
        let f = NamespaceFilter::new()
            .include("shop.*")
            .unwrap()
            .exclude("shop.tmp_*")
            .unwrap();
        assert!(f.is_included(&Namespace::new("shop", "orders")));
        assert!(!f.is_included(&Namespace::new("blog", "posts")));
        assert!(f.is_excluded(&Namespace::new("shop", "tmp_1")));
    }

    #[test]
    fn test_buckets_filtered_under_view_name() {
        let f = NamespaceFilter::new().exclude("metrics.cpu").unwrap();
        assert!(f.is_excluded(&Namespace::new("metrics", "system.buckets.cpu")));
        assert!(!f.is_excluded(&Namespace::new("metrics", "system.buckets.mem")));
    }

    #[test]
    fn test_rename_with_wildcards() {
        let f = NamespaceFilter::new()
            .rename("shop.*", "shop_restored.*")
            .unwrap()
            .rename("a.b", "c.d")
            .unwrap();
        assert_eq!(
            f.rename_target(&Namespace::new("shop", "orders")),
            Namespace::new("shop_restored", "orders")
        );
        assert_eq!(
            f.rename_target(&Namespace::new("a", "b")),
            Namespace::new("c", "d")
        );
        assert_eq!(
            f.rename_target(&Namespace::new("x", "y")),
            Namespace::new("x", "y")
        );
    }

    #[test]
    fn test_rename_rejects_mismatched_wildcards() {
        assert!(NamespaceFilter::new().rename("a.*", "b.c").is_err());
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_two_wildcard_rename_swaps_parts(
                db in "[a-z][a-z0-9_]{0,12}",
                coll in "[a-z][a-z0-9_.]{0,24}",
            ) {
                let f = NamespaceFilter::new().rename("*.*", "restored_*.*").unwrap();
                let target = f.rename_target(&Namespace::new(db.clone(), coll.clone()));
                prop_assert_eq!(target, Namespace::new(format!("restored_{db}"), coll));
            }
        }
    }
}
