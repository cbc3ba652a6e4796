/// Edit distance counted in characters, so accented names cost one edit per
/// letter. Keeps a single row sized to the shorter name.
pub fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let (long, short) = if s1.chars().count() >= s2.chars().count() { (s1, s2) } else { (s2, s1) };
    let short: Vec<char> = short.chars().collect();
    let mut row: Vec<usize> = (0..=short.len()).collect();

    for (i, lc) in long.chars().enumerate() {
        let mut diagonal = row[0];
        row[0] = i + 1;
        for (j, &sc) in short.iter().enumerate() {
            let substitute = diagonal + usize::from(lc != sc);
            diagonal = row[j + 1];
            row[j + 1] = substitute.min(row[j] + 1).min(diagonal + 1);
        }
    }
    row[short.len()]
}

/// Trimmed, lower-cased form used for both exact and fuzzy comparison.
pub fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_names_cost_the_other_length() {
        assert_eq!(levenshtein_distance("", ""), 0);
        assert_eq!(levenshtein_distance("", "Acme"), 4);
        assert_eq!(levenshtein_distance("Acme", ""), 4);
    }

    #[test]
    fn ocr_misreads() {
        assert_eq!(levenshtein_distance("Jane Doe", "Jane Doe"), 0);
        assert_eq!(levenshtein_distance("Jane Doe", "Jame Doe"), 1);
        assert_eq!(levenshtein_distance("Maria Lopez", "Maria Lopes"), 1);
        assert_eq!(levenshtein_distance("Sunrise Care", "Sunrise Care Inc"), 4);
        assert_eq!(levenshtein_distance("Sunrise Care Inc", "Sunrise Care"), 4);
    }

    #[test]
    fn accents_are_one_edit() {
        assert_eq!(levenshtein_distance("José", "Jose"), 1);
        assert_eq!(levenshtein_distance("Núñez", "Nunez"), 2);
    }

    #[test]
    fn transposition_is_two_edits() {
        assert_eq!(levenshtein_distance("Smith", "Smtih"), 2);
    }

    #[test]
    fn normalize_trims_and_lowercases() {
        assert_eq!(normalize("  Sunshine HOME Health "), "sunshine home health");
    }
}
