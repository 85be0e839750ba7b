//
// Copyright 2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Topic routing patterns.
//!
//! A routing key is a list of words separated by `.`. A pattern matches
//! routing keys word by word, where `*` stands for exactly one word and `#`
//! for zero or more words.
//!
//! The same compiled pattern is used for broker-side topic bindings and for
//! in-process subscriber filtering, so both always agree on what matches.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Word(String),
    Star,
    Hash,
}

/// A compiled topic pattern.
///
/// # Examples
///
/// ```rust
/// use island::broker::TopicPattern;
///
/// let one = TopicPattern::new("a.*.c");
/// assert!(one.matches("a.b.c"));
/// assert!(!one.matches("a.b.b.c"));
///
/// let many = TopicPattern::new("a.#");
/// assert!(many.matches("a.b.c"));
/// assert!(many.matches("a"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    source: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    /// Compiles a pattern.
    #[must_use]
    pub fn new(pattern: impl Into<String>) -> Self {
        let source = pattern.into();
        let segments = source
            .split('.')
            .map(|word| match word {
                "*" => Segment::Star,
                "#" => Segment::Hash,
                word => Segment::Word(word.to_string()),
            })
            .collect();
        Self { source, segments }
    }

    /// Returns the pattern text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Returns `true` if the pattern contains no wildcard.
    #[must_use]
    pub fn is_exact(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Word(_)))
    }

    /// Tests a routing key against the pattern.
    #[must_use]
    pub fn matches(&self, routing_key: &str) -> bool {
        let words: Vec<&str> = routing_key.split('.').collect();
        match_segments(&self.segments, &words)
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Walks the pattern one segment at a time, tracking every word position the
/// prefix can end at. Runs in `segments * words` steps however many `#` the
/// pattern has.
fn match_segments(segments: &[Segment], words: &[&str]) -> bool {
    let mut reachable = vec![false; words.len() + 1];
    reachable[0] = true;
    for segment in segments {
        let mut next = vec![false; words.len() + 1];
        match segment {
            Segment::Hash => {
                let mut seen = false;
                for (at, slot) in next.iter_mut().enumerate() {
                    seen |= reachable[at];
                    *slot = seen;
                }
            }
            Segment::Star => {
                for (at, word_reachable) in reachable.iter().take(words.len()).enumerate() {
                    next[at + 1] = *word_reachable;
                }
            }
            Segment::Word(word) => {
                for (at, candidate) in words.iter().enumerate() {
                    next[at + 1] = reachable[at] && *candidate == word.as_str();
                }
            }
        }
        if !next.contains(&true) {
            return false;
        }
        reachable = next;
    }
    reachable[words.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact() {
        let pattern = TopicPattern::new("user.created");
        assert!(pattern.is_exact());
        assert!(pattern.matches("user.created"));
        assert!(!pattern.matches("user.created.v2"));
        assert!(!pattern.matches("user"));
    }

    #[test]
    fn test_star_matches_exactly_one_word() {
        let pattern = TopicPattern::new("a.*.c");
        assert!(pattern.matches("a.b.c"));
        assert!(pattern.matches("a.xyz.c"));
        assert!(!pattern.matches("a.b.b.c"));
        assert!(!pattern.matches("a.c"));
    }

    #[test]
    fn test_hash_matches_zero_or_more_words() {
        let pattern = TopicPattern::new("a.#");
        assert!(pattern.matches("a"));
        assert!(pattern.matches("a.b"));
        assert!(pattern.matches("a.b.c"));
        assert!(!pattern.matches("b.a"));

        let middle = TopicPattern::new("log.#.error");
        assert!(middle.matches("log.error"));
        assert!(middle.matches("log.db.pool.error"));
        assert!(!middle.matches("log.db.warn"));
    }

    #[test]
    fn test_lone_hash_matches_everything() {
        let pattern = TopicPattern::new("#");
        assert!(pattern.matches("anything.at.all"));
        assert!(pattern.matches("x"));
    }

    #[test]
    fn test_many_hashes_on_a_long_key() {
        let pattern = TopicPattern::new(["#"; 24].join(".") + ".never");
        let key = vec!["w"; 64].join(".");
        assert!(!pattern.matches(&key));
        assert!(pattern.matches(&(key.clone() + ".never")));

        let spread = TopicPattern::new("#.a.#.b.#.*.#");
        assert!(spread.matches("a.b.c"));
        assert!(spread.matches("x.a.y.b.z.q"));
        assert!(!spread.matches("a.b"));
        assert!(!spread.matches("b.a.c"));
    }

    #[test]
    fn test_dot_is_a_literal_separator() {
        let pattern = TopicPattern::new("a.b");
        assert!(!pattern.matches("axb"));
    }
}
