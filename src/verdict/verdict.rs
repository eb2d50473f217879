/// Verdict comparison
/// Pure function over the normalized output and the configured answer
use crate::config::types::Verdict;

/// Verdict comparator - no state, no I/O
pub struct VerdictComparator;

impl VerdictComparator {
    /// Compare `actual` against `expected`.
    ///
    /// Leading and trailing whitespace is trimmed from each side on its
    /// own; the rest must match exactly, case included. No expected
    /// output means there is nothing to grade against.
    pub fn compare(actual: &str, expected: Option<&str>) -> Verdict {
        match expected {
            None => Verdict::NotApplicable,
            Some(expected) if actual.trim() == expected.trim() => Verdict::Correct,
            Some(_) => Verdict::Incorrect,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_expected_output_is_not_applicable() {
        assert_eq!(VerdictComparator::compare("anything", None), Verdict::NotApplicable);
        assert_eq!(VerdictComparator::compare("", None), Verdict::NotApplicable);
    }

    #[test]
    fn test_trims_each_side_independently() {
        assert_eq!(VerdictComparator::compare(" x ", Some("x")), Verdict::Correct);
        assert_eq!(VerdictComparator::compare("x", Some(" x ")), Verdict::Correct);
        assert_eq!(VerdictComparator::compare("\n7\n", Some("7")), Verdict::Correct);
    }

    #[test]
    fn test_case_sensitive() {
        assert_eq!(VerdictComparator::compare("x", Some("X")), Verdict::Incorrect);
    }

    #[test]
    fn test_interior_whitespace_matters() {
        assert_eq!(VerdictComparator::compare("a b", Some("a  b")), Verdict::Incorrect);
        assert_eq!(VerdictComparator::compare("a\nb", Some("a\nb")), Verdict::Correct);
        assert_eq!(VerdictComparator::compare("a\r\nb", Some("a\nb")), Verdict::Incorrect);
    }

    #[test]
    fn test_empty_matches_blank_expected() {
        assert_eq!(VerdictComparator::compare("", Some("  ")), Verdict::Correct);
        assert_eq!(VerdictComparator::compare("6", Some("7")), Verdict::Incorrect);
    }
}
