use crate::util::{levenshtein_distance, normalize};

/// Edit-distance similarity in `[0.0, 1.0]` between the trimmed, lower-cased
/// forms of `a` and `b`. Two empty inputs score 0.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = normalize(a);
    let b = normalize(b);

    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }

    1.0 - (levenshtein_distance(&a, &b) as f64 / max_len as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn case_and_whitespace_insensitive() {
        assert_eq!(similarity("  Jane DOE", "jane doe "), 1.0);
    }

    #[test]
    fn one_deletion() {
        let s = similarity("Sunshine Home Helth", "Sunshine Home Health");
        assert!((s - 0.95).abs() < 1e-9, "got {s}");
    }

    #[test]
    fn empty_inputs() {
        assert_eq!(similarity("", ""), 0.0);
        assert_eq!(similarity("   ", ""), 0.0);
        assert_eq!(similarity("abc", ""), 0.0);
    }

    #[test]
    fn unrelated_names_score_low() {
        assert!(similarity("Totally Different Co", "Sunshine Home Health") < 0.5);
    }

    proptest! {
        #[test]
        fn symmetric(a in "[a-zA-Z ]{0,24}", b in "[a-zA-Z ]{0,24}") {
            prop_assert_eq!(similarity(&a, &b), similarity(&b, &a));
        }

        #[test]
        fn identity(a in "[a-zA-Z][a-zA-Z ]{0,24}") {
            prop_assert_eq!(similarity(&a, &a), 1.0);
        }

        #[test]
        fn bounded(a in ".{0,16}", b in ".{0,16}") {
            let s = similarity(&a, &b);
            prop_assert!((0.0..=1.0).contains(&s));
        }
    }
}
