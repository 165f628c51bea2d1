use super::RoutingStrategy;
use crate::binding::BindingTable;
use std::collections::BTreeSet;
use warren_internals::{ExchangeKind, QueueName, WarrenError};

/// Topic routing strategy with pattern matching support.
///
/// Routing keys and binding patterns are dot-separated words (e.g., "stock.usd.nyse").
/// Patterns support wildcards:
/// - `*` matches exactly one word
/// - `#` matches zero or more words
///
/// Examples:
/// - Pattern `stock.*.nyse` matches `stock.usd.nyse` but not `stock.nyse` or `stock.usd.nasdaq`
/// - Pattern `stock.#` matches `stock.usd.nyse`, `stock.usd`, and `stock`
/// - Pattern `#.nyse` matches `stock.usd.nyse`, `usd.nyse`, and `nyse`
///
/// The empty string has zero words, so the empty key matches only `#`-only
/// patterns and the empty pattern.
pub struct TopicStrategy;

impl TopicStrategy {
    /// Check if a routing key matches a binding pattern.
    ///
    /// Iterative glob match over words. Only the most recent `#` is kept as a
    /// resume point: when a later word fails, that `#` absorbs one more key
    /// word and matching restarts right after it. Earlier `#`s never need to
    /// be revisited because the later one can absorb anything they could.
    pub fn matches_pattern(routing_key: &str, pattern: &str) -> bool {
        let key = words(routing_key);
        let pattern = words(pattern);

        let (mut k, mut p) = (0, 0);
        // (pattern index after the last '#', key index that '#' currently stops at)
        let mut resume: Option<(usize, usize)> = None;

        loop {
            if p < pattern.len() {
                match pattern[p] {
                    "#" => {
                        resume = Some((p + 1, k));
                        p += 1;
                        continue;
                    }
                    "*" if k < key.len() => {
                        p += 1;
                        k += 1;
                        continue;
                    }
                    word if k < key.len() && key[k] == word => {
                        p += 1;
                        k += 1;
                        continue;
                    }
                    _ => {}
                }
            } else if k == key.len() {
                return true;
            }

            match resume {
                Some((after_hash, absorbed)) if absorbed < key.len() => {
                    resume = Some((after_hash, absorbed + 1));
                    p = after_hash;
                    k = absorbed + 1;
                }
                _ => return false,
            }
        }
    }
}

fn words(s: &str) -> Vec<&str> {
    if s.is_empty() {
        Vec::new()
    } else {
        s.split('.').collect()
    }
}

impl RoutingStrategy for TopicStrategy {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Topic
    }

    fn route(
        &self,
        routing_key: &str,
        bindings: &BindingTable,
    ) -> Result<BTreeSet<QueueName>, WarrenError> {
        bindings.queues_matching(|pattern| Self::matches_pattern(routing_key, pattern))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn reference_match(key: &[&str], pattern: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| reference_match(&key[skip..], rest)),
            Some((&"*", rest)) => !key.is_empty() && reference_match(&key[1..], rest),
            Some((word, rest)) => key.first() == Some(word) && reference_match(&key[1..], rest),
        }
    }

    #[test]
    fn test_exact_match() {
        assert!(TopicStrategy::matches_pattern("stock.usd", "stock.usd"));
        assert!(!TopicStrategy::matches_pattern("stock.usd", "stock.eur"));
        assert!(!TopicStrategy::matches_pattern("stock", "stock.usd"));
    }

    #[test]
    fn test_star_wildcard() {
        assert!(TopicStrategy::matches_pattern("quick.orange.fox", "*.orange.*"));
        assert!(!TopicStrategy::matches_pattern("quick.orange.male.rabbit", "*.orange.*"));
        assert!(TopicStrategy::matches_pattern("stock.usd", "*.usd"));

        // Must match exactly one word
        assert!(!TopicStrategy::matches_pattern("stock", "stock.*"));
        assert!(!TopicStrategy::matches_pattern("", "*"));
    }

    #[test]
    fn test_hash_wildcard() {
        assert!(TopicStrategy::matches_pattern("lazy.orange.male.rabbit", "lazy.#"));
        assert!(TopicStrategy::matches_pattern("lazy", "lazy.#"));
        assert!(!TopicStrategy::matches_pattern("quick.lazy", "lazy.#"));

        assert!(TopicStrategy::matches_pattern("stock.usd.nyse", "#.nyse"));
        assert!(TopicStrategy::matches_pattern("nyse", "#.nyse"));

        assert!(TopicStrategy::matches_pattern("anything.at.all", "#"));
        assert!(TopicStrategy::matches_pattern("", "#"));
    }

    #[test]
    fn test_combined_wildcards() {
        assert!(TopicStrategy::matches_pattern("stock.usd.extra.nyse", "stock.#.nyse"));
        assert!(TopicStrategy::matches_pattern("stock.nyse", "stock.#.nyse"));
        assert!(!TopicStrategy::matches_pattern("stock.nyse", "*.*.nyse"));

        // Needs '#' to give back words it first absorbed
        assert!(TopicStrategy::matches_pattern("a.b.a.b.c", "#.a.b.c"));
        assert!(TopicStrategy::matches_pattern("kern.x.critical", "#.*.critical"));
        assert!(!TopicStrategy::matches_pattern("critical", "#.*.critical"));
    }

    #[test]
    fn test_adjacent_and_edge_hashes() {
        assert!(TopicStrategy::matches_pattern("a", "#.#"));
        assert!(TopicStrategy::matches_pattern("", "#.#"));
        assert!(TopicStrategy::matches_pattern("a.b.c", "#.b.#"));
        assert!(TopicStrategy::matches_pattern("b", "#.b.#"));
        assert!(!TopicStrategy::matches_pattern("a.c", "#.b.#"));
        assert!(TopicStrategy::matches_pattern("", ""));
        assert!(!TopicStrategy::matches_pattern("a", ""));
    }

    #[test]
    fn test_topic_routing_deduplicates_queues() {
        let bindings = BindingTable::new();
        bindings.bind("critical", "*.critical").unwrap();
        bindings.bind("critical", "kernel.#").unwrap();
        bindings.bind("cron", "cron.*").unwrap();

        let targets = TopicStrategy.route("kernel.critical", &bindings).unwrap();
        assert_eq!(targets, BTreeSet::from(["critical".to_string()]));
    }

    #[test]
    fn test_topic_routing_multiple_matches() {
        let bindings = BindingTable::new();
        bindings.bind("all", "#").unwrap();
        bindings.bind("stock", "stock.*").unwrap();
        bindings.bind("usd", "*.usd").unwrap();
        bindings.bind("eur", "*.eur").unwrap();

        let targets = TopicStrategy.route("stock.usd", &bindings).unwrap();
        assert_eq!(targets.len(), 3);
        assert!(!targets.contains("eur"));
    }

    fn word_seq(alphabet: Vec<&'static str>) -> impl Strategy<Value = Vec<&'static str>> {
        prop::collection::vec(prop::sample::select(alphabet), 0..7)
    }

    proptest! {
        #[test]
        fn test_matcher_agrees_with_recursive_reference(
            key in word_seq(vec!["a", "b", "c"]),
            pattern in word_seq(vec!["a", "b", "*", "#"]),
        ) {
            let expected = reference_match(&key, &pattern);
            let actual = TopicStrategy::matches_pattern(&key.join("."), &pattern.join("."));
            prop_assert_eq!(actual, expected, "key {:?} pattern {:?}", key, pattern);
        }

        #[test]
        fn test_hash_alone_matches_everything(key in word_seq(vec!["a", "b", "c"])) {
            prop_assert!(TopicStrategy::matches_pattern(&key.join("."), "#"));
        }
    }
}
