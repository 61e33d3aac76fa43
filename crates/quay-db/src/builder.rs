use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A bind argument for [`SelectBuilder`] clauses.
///
/// The set of types is deliberately small: everything the core's own
/// queries bind. Embedding services with richer needs write their SQL
/// directly against sqlx.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Bool(bool),
    Int(i32),
    BigInt(i64),
    Text(String),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
    Null,
}

impl From<bool> for Arg {
    fn from(v: bool) -> Self {
        Arg::Bool(v)
    }
}

impl From<i32> for Arg {
    fn from(v: i32) -> Self {
        Arg::Int(v)
    }
}

impl From<i64> for Arg {
    fn from(v: i64) -> Self {
        Arg::BigInt(v)
    }
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Arg::Text(v.to_string())
    }
}

impl From<String> for Arg {
    fn from(v: String) -> Self {
        Arg::Text(v)
    }
}

impl From<Uuid> for Arg {
    fn from(v: Uuid) -> Self {
        Arg::Uuid(v)
    }
}

impl From<DateTime<Utc>> for Arg {
    fn from(v: DateTime<Utc>) -> Self {
        Arg::Timestamp(v)
    }
}

/// An incrementally assembled SELECT statement.
///
/// Callers write conditions with `?` placeholders; [`SelectBuilder::build`]
/// renders them to PostgreSQL's `$1`, `$2`, … in order. The webhook queues
/// accept a partially built select (FROM plus refining WHERE clauses) and
/// complete the column list and event filter themselves.
#[derive(Debug, Clone, Default)]
pub struct SelectBuilder {
    columns: Vec<String>,
    from: String,
    joins: Vec<String>,
    wheres: Vec<String>,
    args: Vec<Arg>,
    limit: Option<i64>,
}

impl SelectBuilder {
    /// Start a new, empty select.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a result column.
    #[must_use]
    pub fn column(mut self, column: &str) -> Self {
        self.columns.push(column.to_string());
        self
    }

    /// Append several result columns.
    #[must_use]
    pub fn columns(mut self, columns: &[&str]) -> Self {
        self.columns.extend(columns.iter().map(|c| (*c).to_string()));
        self
    }

    /// Set the FROM clause, e.g. `"user_webhook_subscription sub"`.
    #[must_use]
    pub fn from(mut self, from: &str) -> Self {
        self.from = from.to_string();
        self
    }

    /// Append `JOIN <join>`.
    #[must_use]
    pub fn join(mut self, join: &str) -> Self {
        self.joins.push(format!("JOIN {join}"));
        self
    }

    /// Append `LEFT JOIN <join>`.
    #[must_use]
    pub fn left_join(mut self, join: &str) -> Self {
        self.joins.push(format!("LEFT JOIN {join}"));
        self
    }

    /// Append a WHERE condition with `?` placeholders and its arguments.
    /// Conditions are ANDed together.
    #[must_use]
    pub fn where_(mut self, clause: &str, args: impl IntoIterator<Item = Arg>) -> Self {
        self.wheres.push(clause.to_string());
        self.args.extend(args);
        self
    }

    /// Set a LIMIT.
    #[must_use]
    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Render the statement and hand back the collected arguments.
    ///
    /// Panics when the number of `?` placeholders disagrees with the number
    /// of collected arguments; that is a programming error at the call site.
    #[must_use]
    pub fn build(self) -> (String, Vec<Arg>) {
        let mut sql = String::from("SELECT ");
        sql.push_str(&self.columns.join(", "));
        sql.push_str(" FROM ");
        sql.push_str(&self.from);
        for join in &self.joins {
            sql.push(' ');
            sql.push_str(join);
        }
        if !self.wheres.is_empty() {
            sql.push_str(" WHERE (");
            sql.push_str(&self.wheres.join(") AND ("));
            sql.push(')');
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut rendered = String::with_capacity(sql.len());
        let mut n = 0usize;
        for ch in sql.chars() {
            if ch == '?' {
                n += 1;
                rendered.push_str(&format!("${n}"));
            } else {
                rendered.push(ch);
            }
        }
        assert_eq!(
            n,
            self.args.len(),
            "select has {n} placeholders but {} arguments",
            self.args.len()
        );

        (rendered, self.args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_dollar_placeholders_in_order() {
        let (sql, args) = SelectBuilder::new()
            .columns(&["sub.id", "sub.url"])
            .from("user_webhook_subscription sub")
            .where_("sub.user_id = ?", [Arg::Int(42)])
            .where_("sub.events LIKE ?", [Arg::from("%profile:update%")])
            .build();

        assert_eq!(
            sql,
            "SELECT sub.id, sub.url FROM user_webhook_subscription sub \
             WHERE (sub.user_id = $1) AND (sub.events LIKE $2)"
        );
        assert_eq!(
            args,
            vec![Arg::Int(42), Arg::Text("%profile:update%".into())]
        );
    }

    #[test]
    fn renders_joins_and_limit() {
        let (sql, _) = SelectBuilder::new()
            .column("u.id")
            .from("oauthtoken ot")
            .join(r#""user" u ON u.id = ot.user_id"#)
            .left_join("pgpkey p ON p.id = u.pgp_key_id")
            .where_("ot.token_hash = ?", [Arg::from("cafe")])
            .limit(2)
            .build();

        assert_eq!(
            sql,
            r#"SELECT u.id FROM oauthtoken ot JOIN "user" u ON u.id = ot.user_id LEFT JOIN pgpkey p ON p.id = u.pgp_key_id WHERE (ot.token_hash = $1) LIMIT 2"#
        );
    }

    #[test]
    fn no_where_renders_cleanly() {
        let (sql, args) = SelectBuilder::new().column("1").from("x").build();
        assert_eq!(sql, "SELECT 1 FROM x");
        assert!(args.is_empty());
    }

    #[test]
    #[should_panic(expected = "placeholders")]
    fn placeholder_arity_mismatch_panics() {
        let _ = SelectBuilder::new()
            .column("1")
            .from("x")
            .where_("a = ? AND b = ?", [Arg::Int(1)])
            .build();
    }
}
