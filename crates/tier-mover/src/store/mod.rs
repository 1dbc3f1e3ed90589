//! Tier1 and Tier2 storage backends.
//!
//! PostgreSQL implementations move rows as JSON objects (`row_to_json` on
//! read, `jsonb_populate_recordset` on write) so no per-column type mapping is
//! needed. The in-memory implementations back tests and dry runs.

mod memory;
mod pool;
mod tier1;
mod tier2;
mod tls;

pub use memory::{MemoryTier1, MemoryTier2};
pub use pool::connect;
pub use tier1::PgTier1;
pub use tier2::PgTier2;
pub use tls::SslMode;

/// Quote a PostgreSQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Schema-qualified, quoted table name.
pub fn qualify(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("ComputeNode"), "\"ComputeNode\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(qualify("tier", "Job"), "\"tier\".\"Job\"");
    }
}
