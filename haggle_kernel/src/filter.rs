// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::event::FilterEventId;
use haggle_protocol::{Attribute, Attributes, DataObject, Node};

/// A subscription: an attribute pattern (wildcard values allowed) paired
/// with the event id its deliveries are posted under.
#[derive(Clone, Debug)]
pub struct Filter {
    event: FilterEventId,
    attributes: Attributes,
}

impl Filter {
    pub fn new(event: FilterEventId, attributes: impl IntoIterator<Item = Attribute>) -> Self {
        Self {
            event,
            attributes: attributes.into_iter().collect(),
        }
    }

    pub fn event(&self) -> FilterEventId {
        self.event
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// A filter matches a data object iff every filter attribute is matched
    /// by some attribute of the object (same name; same value or `*`).
    pub fn matches_data_object(&self, dobj: &DataObject) -> bool {
        self.matches(dobj.attributes())
    }

    /// Symmetric matching against a node's interests; used to resolve
    /// subscriptions against newly learned node descriptions.
    pub fn matches_node(&self, node: &Node) -> bool {
        self.matches(node.interests())
    }

    fn matches(&self, attrs: &Attributes) -> bool {
        !self.attributes.is_empty()
            && self
                .attributes
                .iter()
                .all(|pattern| attrs.iter().any(|a| pattern.matches(a)))
    }

    /// Percent of filter attributes matched, used for result ordering.
    pub fn match_ratio(&self, attrs: &Attributes) -> u32 {
        if self.attributes.is_empty() {
            return 0;
        }
        let matched = self
            .attributes
            .iter()
            .filter(|pattern| attrs.iter().any(|a| pattern.matches(a)))
            .count();
        (100 * matched / self.attributes.len()) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haggle_protocol::ATTR_WILDCARD;

    fn dobj(attrs: &[(&str, &str)]) -> DataObject {
        let mut dobj = DataObject::new(std::env::temp_dir());
        for (name, value) in attrs {
            let _ = dobj.add_attribute(Attribute::new(*name, *value));
        }
        dobj
    }

    #[test]
    fn all_filter_attributes_must_match() {
        let filter = Filter::new(
            5001,
            [
                Attribute::new("Topic", "Weather"),
                Attribute::new("Lang", ATTR_WILDCARD),
            ],
        );

        assert!(filter.matches_data_object(&dobj(&[
            ("Topic", "Weather"),
            ("Lang", "sv"),
            ("Extra", "x"),
        ])));
        assert!(!filter.matches_data_object(&dobj(&[("Topic", "Weather")])));
        assert!(!filter.matches_data_object(&dobj(&[("Topic", "Sports"), ("Lang", "sv")])));
    }

    #[test]
    fn empty_filter_matches_nothing() {
        let filter = Filter::new(5001, []);
        assert!(!filter.matches_data_object(&dobj(&[("Topic", "Weather")])));
    }

    #[test]
    fn ratio_counts_matched_patterns() {
        let filter = Filter::new(
            5001,
            [
                Attribute::new("Topic", "Weather"),
                Attribute::new("Lang", "en"),
            ],
        );
        let half = dobj(&[("Topic", "Weather")]);
        assert_eq!(filter.match_ratio(half.attributes()), 50);
    }
}
