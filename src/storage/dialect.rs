/// The handful of places where Postgres and SQLite genuinely diverge and
/// cannot be pushed out into application code (bucket boundaries and ids are
/// computed in Rust; see `storage::mod` docs). Both supported dialects use
/// `?`-style bind parameters through `sqlx::Any`, share `RETURNING` and
/// `ON CONFLICT (...) DO UPDATE` syntax, and store every id/timestamp as
/// `TEXT` (UUID-as-string, RFC3339), so the remaining divergence is limited
/// to boolean literals in hand-written migration DDL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    /// Column type used for arbitrary JSON payloads (headers, webhook
    /// metadata). Both backends accept the value as text; Postgres gets the
    /// richer `jsonb` type for the handful of columns large enough to
    /// benefit from it.
    pub fn json_column_type(self) -> &'static str {
        match self {
            Dialect::Postgres => "jsonb",
            Dialect::Sqlite => "text",
        }
    }

    pub fn boolean_literal(self, value: bool) -> &'static str {
        match (self, value) {
            (Dialect::Postgres, true) => "TRUE",
            (Dialect::Postgres, false) => "FALSE",
            (Dialect::Sqlite, true) => "1",
            (Dialect::Sqlite, false) => "0",
        }
    }
}
