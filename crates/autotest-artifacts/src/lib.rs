pub mod coverage;
pub mod results;
mod xml;

pub use coverage::{parse_coverage, parse_coverage_str};
pub use results::{parse_results, parse_results_str, TestCounts};
