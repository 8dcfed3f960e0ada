//! Prefix route table: immutable after construction.
//!
//! Prefixes are matched longest-first so that, given `/`, `/fo` and
//! `/foo`, a request for `/foo/bar` always lands on `/foo`, `/fox`
//! on `/fo`, and everything else on `/`. Equal-length prefixes keep
//! their configuration order.

use ahash::AHashMap;
use std::sync::Arc;

use crate::config::RouteRule;
use crate::error::{Error, Result};
use crate::peer::Peer;

pub struct RouteTable {
    // Sorted by descending prefix length, stable on ties.
    longest_prefix_first: Vec<String>,
    primaries: AHashMap<String, Arc<Peer>>,
}

impl RouteTable {
    /// Build the table from ordered route rules: one freshly
    /// allocated primary per prefix, one secondary per non-blank
    /// backend address.
    pub fn build(rules: &[RouteRule]) -> Result<Self> {
        let mut primaries = AHashMap::with_capacity(rules.len());
        let mut prefixes = Vec::with_capacity(rules.len());

        for rule in rules {
            if rule.prefix.is_empty() {
                return Err(Error::config("route prefix must not be empty"));
            }
            if !rule.prefix.starts_with('/') {
                return Err(Error::config(format!(
                    "route prefix {:?} must begin with '/'",
                    rule.prefix
                )));
            }
            if primaries.contains_key(&rule.prefix) {
                return Err(Error::config(format!(
                    "duplicate route prefix {:?}",
                    rule.prefix
                )));
            }

            let primary = Peer::primary();
            for addr in &rule.backends {
                let addr = addr.trim();
                if addr.is_empty() {
                    continue;
                }
                primary.add_peer(Peer::secondary(addr))?;
            }
            prefixes.push(rule.prefix.clone());
            primaries.insert(rule.prefix.clone(), primary);
        }

        // Stable sort keeps insertion order between equal lengths.
        prefixes.sort_by(|a, b| b.len().cmp(&a.len()));

        Ok(Self {
            longest_prefix_first: prefixes,
            primaries,
        })
    }

    /// Longest-prefix match against a request path.
    pub fn match_prefix(&self, path: &str) -> Option<&str> {
        self.longest_prefix_first
            .iter()
            .find(|prefix| path.starts_with(prefix.as_str()))
            .map(String::as_str)
    }

    pub fn primary(&self, prefix: &str) -> Option<&Arc<Peer>> {
        self.primaries.get(prefix)
    }

    /// Prefixes in matching order.
    pub fn prefixes(&self) -> &[String] {
        &self.longest_prefix_first
    }

    /// Iterate (prefix, primary) pairs in matching order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Arc<Peer>)> {
        self.longest_prefix_first
            .iter()
            .filter_map(move |prefix| Some((prefix.as_str(), self.primaries.get(prefix)?)))
    }

    pub fn len(&self) -> usize {
        self.longest_prefix_first.len()
    }

    pub fn is_empty(&self) -> bool {
        self.longest_prefix_first.is_empty()
    }
}

impl std::fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteTable")
            .field("prefixes", &self.longest_prefix_first)
            .finish()
    }
}
