//! Name-stable ordering of observed workloads.
//!
//! Items already known from a previous pass keep their previous relative
//! order; unseen items follow in the order they were observed. Fields the
//! node never reports back are copied from the previous item.

use std::collections::HashMap;

pub trait Matchable {
    fn name(&self) -> &str;

    /// Copy fields the node does not report back from the previous pass.
    fn carry_over(&mut self, _previous: &Self) {}
}

/// Reorder `observed` against `previous` by name.
pub fn match_by_name<T: Matchable>(previous: &[T], mut observed: Vec<T>) -> Vec<T> {
    let mut rank: HashMap<&str, usize> = HashMap::with_capacity(previous.len());
    for (index, item) in previous.iter().enumerate() {
        rank.entry(item.name()).or_insert(index);
    }

    // Stable: ties (all unseen items) keep their observed order.
    observed.sort_by_key(|item| rank.get(item.name()).copied().unwrap_or(usize::MAX));

    for item in &mut observed {
        if let Some(&index) = rank.get(item.name()) {
            item.carry_over(&previous[index]);
        }
    }
    observed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        name: String,
        secret: String,
    }

    impl Matchable for Item {
        fn name(&self) -> &str {
            &self.name
        }

        fn carry_over(&mut self, previous: &Self) {
            if self.secret.is_empty() {
                self.secret = previous.secret.clone();
            }
        }
    }

    fn items(names: &[&str]) -> Vec<Item> {
        names
            .iter()
            .map(|n| Item {
                name: n.to_string(),
                secret: String::new(),
            })
            .collect()
    }

    fn names(items: &[Item]) -> Vec<&str> {
        items.iter().map(|i| i.name.as_str()).collect()
    }

    #[test]
    fn previous_order_wins_and_new_items_append() {
        let out = match_by_name(&items(&["a", "b", "c"]), items(&["c", "a", "d"]));
        assert_eq!(names(&out), vec!["a", "c", "d"]);
    }

    #[test]
    fn unseen_items_keep_observed_order() {
        let out = match_by_name(&items(&["x"]), items(&["d", "x", "b", "a"]));
        assert_eq!(names(&out), vec!["x", "d", "b", "a"]);
    }

    #[test]
    fn second_pass_is_a_fixed_point() {
        let first = match_by_name(&items(&["a", "b", "c"]), items(&["c", "a", "d"]));
        let second = match_by_name(&first, items(&["c", "a", "d"]));
        assert_eq!(second, first);
        let third = match_by_name(&second, second.clone());
        assert_eq!(third, second);
    }

    #[test]
    fn carries_unreported_fields() {
        let mut previous = items(&["a", "b"]);
        previous[1].secret = "hunter2".into();
        let out = match_by_name(&previous, items(&["b"]));
        assert_eq!(out[0].secret, "hunter2");
    }

    #[test]
    fn empty_previous_keeps_everything() {
        let out = match_by_name(&[], items(&["z", "y"]));
        assert_eq!(names(&out), vec!["z", "y"]);
    }
}
