// topic_matcher.rs
//
// Subscription filters, as the loopback broker routes with them.
//
// This file is part of the Polar MQTT bridge library.
//

/*******************************************************************************
 * Copyright (c) 2021-2023 Frank Pagliughi <fpagliughi@mindspring.com>
 *
 * All rights reserved. This program and the accompanying materials
 * are made available under the terms of the Eclipse Public License v2.0
 * and Eclipse Distribution License v1.0 which accompany this distribution.
 *
 * The Eclipse Public License is available at
 *    http://www.eclipse.org/legal/epl-v20.html
 * and the Eclipse Distribution License is available at
 *   http://www.eclipse.org/org/documents/edl-v10.php.
 *
 * Contributors:
 *    Frank Pagliughi - initial implementation and documentation
 *******************************************************************************/

//! Code to match MQTT topics to filters that may contain wildcards.
//!
//! The filters are kept in a prefix tree (trie) keyed on the topic levels.
//! A single topic can match several filters; for example the topic
//! `data/temperature/engine` matches both `data/temperature/#` and
//! `data/+/engine`.

use std::collections::HashMap;

/// A collection of topic filters, each mapped to a value.
pub struct TopicMatcher<T> {
    root: Node<T>,
}

impl<T> TopicMatcher<T> {
    /// Creates a new, empty, topic matcher collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Determines if the collection contains no filters.
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Inserts a topic filter into the collection, replacing any value
    /// that was already there for the same filter.
    pub fn insert<S>(&mut self, filter: S, val: T)
    where
        S: Into<String>,
    {
        let filter = filter.into();
        let mut node = &mut self.root;

        for level in filter.split('/') {
            node = node.children.entry(level.to_string()).or_default();
        }
        node.content = Some((filter, val));
    }

    /// Gets a value using an exact filter match.
    pub fn get(&self, filter: &str) -> Option<&T> {
        let mut node = &self.root;
        for level in filter.split('/') {
            node = node.children.get(level)?;
        }
        node.content.as_ref().map(|(_, v)| v)
    }

    /// Removes a filter, returning its value if it was present.
    pub fn remove(&mut self, filter: &str) -> Option<T> {
        let levels: Vec<_> = filter.split('/').collect();
        self.root.remove(&levels)
    }

    /// Gets all the (filter, value) entries that match the topic.
    ///
    /// Wildcards at the first level do not match topics that start with
    /// `$`, as those are reserved for the broker.
    pub fn matches(&self, topic: &str) -> Vec<&(String, T)> {
        let levels: Vec<_> = topic.split('/').collect();
        let mut found = Vec::new();
        let system = topic.starts_with('$');
        self.root.collect(&levels, !system, &mut found);
        found
    }

    /// Determines if the topic matches any of the filters in the collection.
    pub fn has_match(&self, topic: &str) -> bool {
        !self.matches(topic).is_empty()
    }
}

// Implemented by hand, as a derived one would require T: Default.

impl<T> Default for TopicMatcher<T> {
    fn default() -> Self {
        TopicMatcher {
            root: Node::default(),
        }
    }
}

/// A single node in the topic matcher collection.
struct Node<T> {
    /// The filter that ends at this node, with its value.
    content: Option<(String, T)>,
    /// The child nodes mapped by the next level of the filter.
    children: HashMap<String, Node<T>>,
}

impl<T> Node<T> {
    fn is_empty(&self) -> bool {
        self.content.is_none() && self.children.is_empty()
    }

    fn remove(&mut self, levels: &[&str]) -> Option<T> {
        match levels.split_first() {
            None => self.content.take().map(|(_, v)| v),
            Some((first, rest)) => {
                let child = self.children.get_mut(*first)?;
                let val = child.remove(rest);
                if child.is_empty() {
                    self.children.remove(*first);
                }
                val
            }
        }
    }

    fn collect<'a>(&'a self, levels: &[&str], wild: bool, found: &mut Vec<&'a (String, T)>) {
        // A trailing '#' also matches the parent level.
        if wild {
            if let Some(content) = self.children.get("#").and_then(|n| n.content.as_ref()) {
                found.push(content);
            }
        }

        match levels.split_first() {
            None => {
                if let Some(content) = self.content.as_ref() {
                    found.push(content);
                }
            }
            Some((first, rest)) => {
                if let Some(child) = self.children.get(*first) {
                    child.collect(rest, true, found);
                }
                if wild {
                    if let Some(child) = self.children.get("+") {
                        child.collect(rest, true, found);
                    }
                }
            }
        }
    }
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Node {
            content: None,
            children: HashMap::new(),
        }
    }
}

/////////////////////////////////////////////////////////////////////////////
//                              Unit Tests
/////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn matched(matcher: &TopicMatcher<i32>, topic: &str) -> HashSet<i32> {
        matcher.matches(topic).into_iter().map(|(_, v)| *v).collect()
    }

    #[test]
    fn test_route_to_overlapping_filters() {
        let mut subs: TopicMatcher<i32> = TopicMatcher::new();
        subs.insert("plant/line1/temp", 1);

        assert_eq!(Some(&1), subs.get("plant/line1/temp"));
        assert_eq!(None, subs.get("plant/line1/pressure"));

        subs.insert("plant/+/temp", 2);
        subs.insert("plant/line1/#", 3);
        subs.insert("plant/line2/temp", 4);

        assert!(subs.has_match("plant/line7/temp"));
        assert!(!subs.has_match("plant/line7/pressure"));

        let expected: HashSet<_> = [1, 2, 3].into_iter().collect();
        assert_eq!(expected, matched(&subs, "plant/line1/temp"));
    }

    #[test]
    fn test_hash_matches_parent_level() {
        let mut matcher = TopicMatcher::new();
        matcher.insert("sport/#", 1);

        assert!(matcher.has_match("sport"));
        assert!(matcher.has_match("sport/tennis/player1"));
        assert!(!matcher.has_match("sports"));
    }

    #[test]
    fn test_system_topics_skip_root_wildcards() {
        let mut matcher = TopicMatcher::new();
        matcher.insert("#", 1);
        matcher.insert("+/broker", 2);
        matcher.insert("$SYS/#", 3);

        let expected: HashSet<_> = [3].into_iter().collect();
        assert_eq!(expected, matched(&matcher, "$SYS/broker"));
    }

    #[test]
    fn test_remove() {
        let mut matcher = TopicMatcher::new();
        matcher.insert("a/b/c", 1);
        matcher.insert("a/+", 2);

        assert_eq!(Some(1), matcher.remove("a/b/c"));
        assert_eq!(None, matcher.remove("a/b/c"));
        assert!(!matcher.has_match("a/b/c"));
        assert!(matcher.has_match("a/b"));

        assert_eq!(Some(2), matcher.remove("a/+"));
        assert!(matcher.is_empty());
    }
}
