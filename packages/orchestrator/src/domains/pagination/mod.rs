//! Pagination pattern detection and target URL generation.

pub mod pattern;

pub use pattern::{
    base_url, detect_pattern, extract_page_number, next_page_url, validate_url, PatternInfo,
    PatternKind, Paginator, DEFAULT_ITEMS_PER_PAGE,
};
