// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Routing Keys
//!
//! Domain events are keyed `<category>.<identity>`. Consumers bind either
//! `<category>.*` to see every instance of a category or the full key to see
//! only their own.

/// Segment separator
pub const SEPARATOR: char = '.';
/// Matches exactly one segment
pub const SINGLE_WORD: &str = "*";
/// Matches zero or more segments
pub const MULTI_WORD: &str = "#";

/// Builds `<category>.<identity>`.
pub fn key(category: &str, identity: &str) -> String {
    format!("{category}{SEPARATOR}{identity}")
}

/// Builds `<category>.*`.
pub fn category_pattern(category: &str) -> String {
    format!("{category}{SEPARATOR}{SINGLE_WORD}")
}

/// Topic-exchange match of `routing_key` against a binding `pattern`.
///
/// Runs in `O(pattern segments * key segments)` however many `#` the
/// pattern holds.
pub fn matches(pattern: &str, routing_key: &str) -> bool {
    let key: Vec<&str> = routing_key.split(SEPARATOR).collect();

    // reachable[j]: the pattern segments seen so far match key[..j]
    let mut reachable = vec![false; key.len() + 1];
    reachable[0] = true;

    for segment in pattern.split(SEPARATOR) {
        let mut next = vec![false; key.len() + 1];
        if segment == MULTI_WORD {
            let mut seen = false;
            for (j, slot) in next.iter_mut().enumerate() {
                seen |= reachable[j];
                *slot = seen;
            }
        } else {
            for (j, word) in key.iter().enumerate() {
                if reachable[j] && (segment == SINGLE_WORD || segment == *word) {
                    next[j + 1] = true;
                }
            }
        }
        reachable = next;
    }

    reachable[key.len()]
}
