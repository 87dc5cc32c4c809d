//! Shared bounds for query payloads and result pages.

use pyo3::prelude::*;

pub const MAX_QUERY_LENGTH: usize = 512;
pub const DEFAULT_PAGE_SIZE: i64 = 25;
pub const MAX_PAGE_SIZE: i64 = 200;
pub const MAX_PAGE: i64 = 1_000_000;

#[pyfunction]
pub fn clamp_int(value: i64, minimum: i64, maximum: i64) -> i64 {
    value.max(minimum).min(maximum)
}

#[pyfunction]
pub fn clamp_page_size(value: i64) -> i64 {
    clamp_int(value, 1, MAX_PAGE_SIZE)
}

/// Pages are 1-based; anything lower reads as the first page.
#[pyfunction]
pub fn clamp_page(value: i64) -> i64 {
    clamp_int(value, 1, MAX_PAGE)
}

/// Trim and cap a query at [`MAX_QUERY_LENGTH`] characters.
#[pyfunction]
pub fn truncate_query(query: &str) -> String {
    let stripped = query.trim();
    match stripped.char_indices().nth(MAX_QUERY_LENGTH) {
        Some((idx, _)) => stripped[..idx].to_string(),
        None => stripped.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamps() {
        assert_eq!(clamp_page_size(0), 1);
        assert_eq!(clamp_page_size(10_000), MAX_PAGE_SIZE);
        assert_eq!(clamp_page(-3), 1);
        assert_eq!(clamp_page(i64::MAX), MAX_PAGE);
        assert_eq!(clamp_int(5, 1, 3), 3);
    }

    #[test]
    fn test_truncate_query_respects_char_boundaries() {
        let long = "é".repeat(MAX_QUERY_LENGTH + 10);
        let truncated = truncate_query(&long);
        assert_eq!(truncated.chars().count(), MAX_QUERY_LENGTH);
        assert_eq!(truncate_query("  ip:1.2.3.4  "), "ip:1.2.3.4");
    }
}
