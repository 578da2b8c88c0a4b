//! Definition merge: overlay a descendant tree onto its resolved ancestor.
//!
//! The merge is a pure function over [`DefValue`] trees. Key-by-key rules:
//!
//! - a `!delete`-marked descendant value removes the key (in a list merge,
//!   removes elements matching the marker's payload);
//! - a `!replace`-marked value wins verbatim, with no recursive merge and
//!   no list concatenation;
//! - mapping-onto-mapping recurses with the same rules;
//! - list-onto-list concatenates (ancestor elements first), then scrubs
//!   delete-marked elements and their matches from the combined list;
//! - any other descendant value overwrites the ancestor's.

use std::collections::BTreeMap;

use super::value::DefValue;

/// Merges `descendant` onto `ancestor`, descendant taking precedence.
pub fn merge(ancestor: BTreeMap<String, DefValue>, descendant: BTreeMap<String, DefValue>) -> BTreeMap<String, DefValue> {
    let mut acc = ancestor;
    for (key, value) in descendant {
        match merge_value(acc.remove(&key), value) {
            Some(v) => {
                acc.insert(key, v);
            }
            None => {
                // delete marker: key stays removed
            }
        }
    }
    acc
}

fn merge_value(accumulated: Option<DefValue>, descendant: DefValue) -> Option<DefValue> {
    match descendant {
        DefValue::Delete(_) => None,
        DefValue::Replace(payload) => Some(*payload),
        DefValue::Map(d) => {
            let base = match accumulated {
                Some(DefValue::Map(a)) => a,
                _ => BTreeMap::new(),
            };
            Some(DefValue::Map(merge(base, d)))
        }
        DefValue::List(d) => {
            let mut combined = match accumulated {
                Some(DefValue::List(a)) => a,
                _ => Vec::new(),
            };
            combined.extend(d);
            Some(DefValue::List(scrub_deletes(combined)))
        }
        scalar => Some(scalar),
    }
}

/// Removes every delete marker from a combined list, along with all
/// elements equal to each marker's payload.
fn scrub_deletes(list: Vec<DefValue>) -> Vec<DefValue> {
    let doomed: Vec<DefValue> = list
        .iter()
        .filter_map(|e| match e {
            DefValue::Delete(payload) => Some((**payload).clone()),
            _ => None,
        })
        .collect();
    list.into_iter()
        .filter(|e| !matches!(e, DefValue::Delete(_)) && !doomed.contains(e))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(src: &str) -> BTreeMap<String, DefValue> {
        let yaml: serde_yaml::Value = serde_yaml::from_str(src).unwrap();
        match DefValue::from_yaml(yaml, "test").unwrap() {
            DefValue::Map(m) => m,
            other => panic!("expected map, got {other:?}"),
        }
    }

    #[test]
    fn scalar_overwrites() {
        let merged = merge(tree("a: 1\nb: 2"), tree("b: 3"));
        assert_eq!(merged["a"], DefValue::Int(1));
        assert_eq!(merged["b"], DefValue::Int(3));
    }

    #[test]
    fn lists_concatenate_ancestor_first() {
        let merged = merge(tree("xs: [1, 2]"), tree("xs: [3]"));
        assert_eq!(
            merged["xs"],
            DefValue::List(vec![DefValue::Int(1), DefValue::Int(2), DefValue::Int(3)])
        );
    }

    #[test]
    fn nested_maps_recurse() {
        let merged = merge(tree("m: {a: 1, b: 2}"), tree("m: {b: 9, c: 3}"));
        let m = merged["m"].as_map().unwrap();
        assert_eq!(m["a"], DefValue::Int(1));
        assert_eq!(m["b"], DefValue::Int(9));
        assert_eq!(m["c"], DefValue::Int(3));
    }

    #[test]
    fn delete_removes_key_defined_by_deeper_ancestor() {
        // grandparent defines n, parent leaves it alone, child deletes it
        let step1 = merge(tree("n: 4\nkeep: 1"), tree("keep: 2"));
        let step2 = merge(step1, tree("n: !delete"));
        assert!(!step2.contains_key("n"));
        assert_eq!(step2["keep"], DefValue::Int(2));
    }

    #[test]
    fn delete_removes_matching_list_elements() {
        let merged = merge(
            tree("msg: [Running, case, now]"),
            tree("msg: [!delete case]"),
        );
        assert_eq!(
            merged["msg"],
            DefValue::List(vec![
                DefValue::Str("Running".into()),
                DefValue::Str("now".into())
            ])
        );
    }

    #[test]
    fn replace_discards_ancestor_list_content() {
        let merged = merge(tree("xs: [1, 2, 3]"), tree("xs: !replace [9]"));
        assert_eq!(merged["xs"], DefValue::List(vec![DefValue::Int(9)]));
    }

    #[test]
    fn replace_discards_ancestor_map_content() {
        let merged = merge(tree("m: {a: 1}"), tree("m: !replace {b: 2}"));
        let m = merged["m"].as_map().unwrap();
        assert!(!m.contains_key("a"));
        assert_eq!(m["b"], DefValue::Int(2));
    }

    #[test]
    fn fresh_descendant_map_merges_onto_nothing() {
        let merged = merge(tree("a: 1"), tree("m: {x: 1}"));
        assert_eq!(merged["m"].as_map().unwrap()["x"], DefValue::Int(1));
    }
}
