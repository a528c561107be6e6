//! Loose dotted-version comparison.

use std::cmp::Ordering;

/// Compare two dotted version strings part by part.
///
/// Each part contributes its leading digits only (`"2-beta"` counts as 2),
/// and missing parts count as zero, so `"0.1"` equals `"0.1.0"`.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let left = parts(a);
    let right = parts(b);
    let len = left.len().max(right.len());
    for i in 0..len {
        let l = left.get(i).copied().unwrap_or(0);
        let r = right.get(i).copied().unwrap_or(0);
        match l.cmp(&r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// `a > b` under [`compare_versions`].
pub fn is_newer(a: &str, b: &str) -> bool {
    compare_versions(a, b) == Ordering::Greater
}

fn parts(version: &str) -> Vec<u64> {
    version
        .trim()
        .trim_start_matches('v')
        .split('.')
        .map(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().unwrap_or(0)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compares_numerically_not_lexically() {
        assert_eq!(compare_versions("0.1.10", "0.1.9"), Ordering::Greater);
        assert_eq!(compare_versions("0.1", "0.1.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.2.0-rc1", "1.2.0"), Ordering::Equal);
        assert!(is_newer("0.1.6", "0.1.5"));
        assert!(!is_newer("0.1.5", "0.1.5"));
    }
}
