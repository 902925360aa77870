// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};

/// Value that matches any attribute value in a filter.
pub const ATTR_WILDCARD: &str = "*";

/// Weight assigned when none is given.
pub const ATTR_WEIGHT_DEFAULT: u32 = 1;

/// Weight a forwarder uses to mark "negative" attributes that veto a match.
pub const ATTR_WEIGHT_NO_MATCH: u32 = 0;

/// A weighted (name, value) tag.
///
/// Attributes are what content addressing, interest matching and filter
/// subscriptions all operate on. Two attributes are the same attribute only
/// if name, value and weight all agree.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Attribute {
    name: String,
    value: String,
    weight: u32,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::with_weight(name, value, ATTR_WEIGHT_DEFAULT)
    }

    pub fn with_weight(name: impl Into<String>, value: impl Into<String>, weight: u32) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            weight,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// True when the value is the `*` wildcard (only meaningful in filters).
    pub fn is_wildcard(&self) -> bool {
        self.value == ATTR_WILDCARD
    }

    /// Name and value agree, treating a `*` value on `self` as matching any
    /// value of `other`.
    pub fn matches(&self, other: &Attribute) -> bool {
        self.name == other.name && (self.is_wildcard() || self.value == other.value)
    }
}

impl Display for Attribute {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.weight == ATTR_WEIGHT_DEFAULT {
            write!(f, "{}={}", self.name, self.value)
        } else {
            write!(f, "{}={}:{}", self.name, self.value, self.weight)
        }
    }
}

/// An ordered multiset of attributes.
///
/// Iteration order is (name, value, weight) ascending; the data object id
/// hash depends on this order, so it must not change. Exact duplicates
/// (same triple) are collapsed; the same (name, value) under different
/// weights are distinct entries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Attributes {
    set: BTreeSet<Attribute>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the exact triple was already present.
    pub fn add(&mut self, attr: Attribute) -> bool {
        self.set.insert(attr)
    }

    pub fn remove(&mut self, attr: &Attribute) -> bool {
        self.set.remove(attr)
    }

    /// Remove all entries with the given name and value; a `*` value removes
    /// every entry with the name.
    pub fn remove_matching(&mut self, name: &str, value: &str) -> usize {
        let before = self.set.len();
        self.set
            .retain(|a| !(a.name() == name && (value == ATTR_WILDCARD || a.value() == value)));
        before - self.set.len()
    }

    /// First entry with this (name, value), any weight.
    pub fn get(&self, name: &str, value: &str) -> Option<&Attribute> {
        self.iter()
            .find(|a| a.name() == name && a.value() == value)
    }

    pub fn contains(&self, attr: &Attribute) -> bool {
        self.set.contains(attr)
    }

    pub fn contains_name_value(&self, name: &str, value: &str) -> bool {
        self.get(name, value).is_some()
    }

    /// First entry with this name, if any.
    pub fn first_by_name(&self, name: &str) -> Option<&Attribute> {
        self.iter().find(|a| a.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.set.iter()
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Sum of all weights; the denominator of the match ratio.
    pub fn sum_weights(&self) -> u64 {
        self.iter().map(|a| a.weight() as u64).sum()
    }
}

impl FromIterator<Attribute> for Attributes {
    fn from_iter<I: IntoIterator<Item = Attribute>>(iter: I) -> Self {
        Self {
            set: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Attributes {
    type Item = &'a Attribute;
    type IntoIter = std::collections::btree_set::Iter<'a, Attribute>;

    fn into_iter(self) -> Self::IntoIter {
        self.set.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_duplicates_collapse() {
        let mut attrs = Attributes::new();
        assert!(attrs.add(Attribute::new("Topic", "Weather")));
        assert!(!attrs.add(Attribute::new("Topic", "Weather")));
        // Same (name, value) under a different weight is a distinct entry.
        assert!(attrs.add(Attribute::with_weight("Topic", "Weather", 3)));
        assert_eq!(attrs.len(), 2);
    }

    #[test]
    fn iteration_is_ordered() {
        let mut attrs = Attributes::new();
        let _ = attrs.add(Attribute::new("Color", "Black"));
        let _ = attrs.add(Attribute::new("Animal", "Dog"));
        let _ = attrs.add(Attribute::new("Animal", "Cat"));

        let names: Vec<_> = attrs.iter().map(|a| format!("{a}")).collect();
        assert_eq!(names, ["Animal=Cat", "Animal=Dog", "Color=Black"]);
    }

    #[test]
    fn wildcard_removal() {
        let mut attrs = Attributes::new();
        let _ = attrs.add(Attribute::new("Topic", "Weather"));
        let _ = attrs.add(Attribute::new("Topic", "News"));
        let _ = attrs.add(Attribute::new("Color", "Black"));

        assert_eq!(attrs.remove_matching("Topic", ATTR_WILDCARD), 2);
        assert_eq!(attrs.len(), 1);
        assert!(attrs.contains_name_value("Color", "Black"));
    }

    #[test]
    fn wildcard_matching() {
        let pattern = Attribute::new("Topic", ATTR_WILDCARD);
        assert!(pattern.matches(&Attribute::new("Topic", "Weather")));
        assert!(!pattern.matches(&Attribute::new("Color", "Black")));
        // The wildcard only works one way around.
        assert!(!Attribute::new("Topic", "Weather").matches(&pattern));
    }

    #[test]
    fn sum_weights() {
        let mut attrs = Attributes::new();
        let _ = attrs.add(Attribute::with_weight("Topic", "Weather", 3));
        let _ = attrs.add(Attribute::with_weight("Topic", "News", 1));
        assert_eq!(attrs.sum_weights(), 4);
    }
}
