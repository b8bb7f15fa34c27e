//! Fuzz target for column-match expression parsing.
//!
//! Parsing must never panic. Parsed clauses always name a non-empty,
//! upper-case column.

#![no_main]

use libfuzzer_sys::fuzz_target;
use trigger_replication::router::parse_column_expressions;

fuzz_target!(|expression: &str| {
    if let Ok(clauses) = parse_column_expressions(expression) {
        for clause in clauses {
            assert!(!clause.column.is_empty());
            assert_eq!(clause.column, clause.column.to_ascii_uppercase());
        }
    }
});
