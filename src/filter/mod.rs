pub mod entropy_filter;

pub use entropy_filter::{filter_on_entropy, Filtered, DEFAULT_PERCENTILE};
