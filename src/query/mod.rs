//! Strata Query Boundary
//!
//! Turns request text into what the storage engine searches with:
//!
//! - **Parser**: series selectors into tag filters, time expressions into
//!   millisecond timestamps
//!
//! # Selector Syntax
//!
//! ```text
//! cpu_usage
//! cpu_usage{host="a", dc!="eu"}
//! {__name__=~"cpu_.*", host!~"db-.*"}
//! ```
//!
//! # Examples
//!
//! ```rust
//! use strata::query::parse_selector;
//!
//! let filters = parse_selector(r#"cpu{host=~"web-.*"}"#).unwrap();
//! assert_eq!(filters.len(), 2);
//! ```

mod error;
mod parser;

pub use error::{QueryError, QueryResult};
pub use parser::{parse_duration, parse_selector, parse_series, parse_time, parse_time_range};
