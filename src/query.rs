//! Typed composition of replica queries.
//!
//! The replicas expose the revision/archive/logging family with predictable
//! column prefixes (`rev_`, `ar_`, `log_`) and per-table actor/comment
//! views (`actor_revision`, `comment_logging`, ...). [`QueryComposer`] is a
//! plain value that accumulates joins, filters, and parameters, and renders
//! SQL text with `?` placeholders for sqlx.
//!
//! The replicas carry no archive→log foreign keys; [`join_deletion_log`]
//! therefore yields *candidate* rows (possibly several per archive row)
//! that callers disambiguate afterwards.
//!
//! [`join_deletion_log`]: QueryComposer::join_deletion_log

use sqlx::mysql::MySqlArguments;
use sqlx::MySql;

/// A positional bind parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    U64(u64),
    I64(i64),
    Str(String),
}

/// Which table family the composer is rooted at; determines the column
/// prefix and the userindex variant name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKind {
    Revision,
    Archive,
    Logging,
}

impl RowKind {
    fn table(self) -> &'static str {
        match self {
            RowKind::Revision => "revision",
            RowKind::Archive => "archive",
            RowKind::Logging => "logging",
        }
    }

    fn userindex(self) -> &'static str {
        match self {
            RowKind::Revision => "revision_userindex",
            RowKind::Archive => "archive_userindex",
            RowKind::Logging => "logging_userindex",
        }
    }

    /// Column prefix: `rev`, `ar`, or `log`.
    pub fn prefix(self) -> &'static str {
        match self {
            RowKind::Revision => "rev",
            RowKind::Archive => "ar",
            RowKind::Logging => "log",
        }
    }
}

/// Builder for one replica query shape.
///
/// Parameters are tracked per section: placeholders inside JOIN clauses are
/// rendered ahead of the WHERE clause, so their binds must come first
/// regardless of the order the builder methods were chained in.
#[derive(Debug, Clone)]
pub struct QueryComposer {
    kind: RowKind,
    base_alias: String,
    from: String,
    select: Vec<String>,
    joins: Vec<String>,
    wheres: Vec<String>,
    join_params: Vec<Param>,
    where_params: Vec<Param>,
    order: Option<String>,
    limit: Option<u64>,
    offset: Option<u64>,
    tag_joins: usize,
}

impl QueryComposer {
    /// Starts a query over `kind`, aliased as `alias`. `userindex` selects
    /// the actor-indexed variant of the table.
    pub fn new(kind: RowKind, alias: &str, userindex: bool) -> Self {
        let table = if userindex {
            kind.userindex()
        } else {
            kind.table()
        };
        Self {
            kind,
            base_alias: alias.to_string(),
            from: format!("{table} {alias}"),
            select: Vec::new(),
            joins: Vec::new(),
            wheres: Vec::new(),
            join_params: Vec::new(),
            where_params: Vec::new(),
            order: None,
            limit: None,
            offset: None,
            tag_joins: 0,
        }
    }

    /// Selects columns. With an alias the reference keeps the prefix
    /// (`alias.col`); without one the raw name is used.
    pub fn columns(mut self, alias: Option<&str>, cols: &[&str]) -> Self {
        for col in cols {
            match alias {
                Some(alias) => self.select.push(format!("{alias}.{col}")),
                None => self.select.push((*col).to_string()),
            }
        }
        self
    }

    /// Selects a raw expression, e.g. an aggregate with an output alias.
    pub fn raw_column(mut self, expr: &str) -> Self {
        self.select.push(expr.to_string());
        self
    }

    /// Self-joins the base table on the parent id. The parent copy must
    /// carry a distinct alias so the two column sets stay apart.
    pub fn join_parents(mut self, parent_alias: &str) -> Self {
        assert!(
            parent_alias != self.base_alias,
            "parent join requires a distinct alias"
        );
        let prefix = self.kind.prefix();
        let base = &self.base_alias;
        self.joins.push(format!(
            "LEFT JOIN {table} {parent} ON {parent}.{prefix}_id = {base}.{prefix}_parent_id",
            table = self.kind.table(),
            parent = parent_alias,
        ));
        self
    }

    /// Joins the actor view for the base table. Left join: the view nulls
    /// the actor column when the user field is deletion-hidden.
    pub fn join_actor(mut self) -> Self {
        let prefix = self.kind.prefix();
        let base = &self.base_alias;
        self.joins.push(format!(
            "LEFT JOIN actor_{table} actor ON actor.actor_id = {base}.{prefix}_actor",
            table = self.kind.table(),
        ));
        self
    }

    /// Joins the comment view for the base table. Left join for the same
    /// reason as [`join_actor`](Self::join_actor).
    pub fn join_comment(mut self) -> Self {
        let prefix = self.kind.prefix();
        let base = &self.base_alias;
        self.joins.push(format!(
            "LEFT JOIN comment_{table} comment ON comment.comment_id = {base}.{prefix}_comment_id",
            table = self.kind.table(),
        ));
        self
    }

    /// Joins `page` on the base table's page foreign key.
    pub fn join_page(mut self) -> Self {
        assert!(
            self.kind != RowKind::Archive,
            "archive rows carry their own namespace and title"
        );
        let prefix = self.kind.prefix();
        let base = &self.base_alias;
        self.joins.push(format!(
            "JOIN page ON page.page_id = {base}.{prefix}_page"
        ));
        self
    }

    /// For archive rows: left-joins candidate deletion log rows — type
    /// `delete`, action starting with `delete`, log timestamp strictly
    /// after the archive timestamp, matching namespace and title.
    pub fn join_deletion_log(mut self, log_alias: &str) -> Self {
        assert!(
            self.kind == RowKind::Archive,
            "deletion-log join applies to archive rows"
        );
        let base = &self.base_alias;
        self.joins.push(format!(
            "LEFT JOIN logging {log} ON {log}.log_type = 'delete' \
             AND {log}.log_action LIKE 'delete%' \
             AND {log}.log_timestamp > {base}.ar_timestamp \
             AND {log}.log_namespace = {base}.ar_namespace \
             AND {log}.log_title = {base}.ar_title",
            log = log_alias,
        ));
        self
    }

    /// Restricts to rows carrying every one of `tags`.
    pub fn has_tag(self, tags: &[&str]) -> Self {
        self.tag_filter(tags, true)
    }

    /// Restricts to rows carrying none of `tags`.
    pub fn lacks_tag(self, tags: &[&str]) -> Self {
        self.tag_filter(tags, false)
    }

    // One left join per tag, guarded by a null check on the joined row.
    // The tag name binds inside the join, so it goes to the join params.
    fn tag_filter(mut self, tags: &[&str], present: bool) -> Self {
        let prefix = self.kind.prefix();
        for tag in tags {
            let n = self.tag_joins;
            self.tag_joins += 1;
            let base = &self.base_alias;
            self.joins.push(format!(
                "LEFT JOIN change_tag ct{n} ON ct{n}.ct_{prefix}_id = {base}.{prefix}_id \
                 AND ct{n}.ct_tag_id = (SELECT ctd_id FROM change_tag_def WHERE ctd_name = ?)"
            ));
            self.join_params.push(Param::Str((*tag).to_string()));
            let check = if present { "IS NOT NULL" } else { "IS NULL" };
            self.wheres.push(format!("ct{n}.ct_id {check}"));
        }
        self
    }

    /// Appends an AND-ed predicate with its parameters.
    pub fn filter(mut self, expr: &str, params: Vec<Param>) -> Self {
        self.wheres.push(expr.to_string());
        self.where_params.extend(params);
        self
    }

    /// `column IN (?, ?, ...)`; a no-op guard clause when `values` is empty.
    pub fn filter_in(mut self, column: &str, values: Vec<Param>) -> Self {
        if values.is_empty() {
            self.wheres.push("1 = 0".to_string());
            return self;
        }
        let placeholders = vec!["?"; values.len()].join(", ");
        self.wheres.push(format!("{column} IN ({placeholders})"));
        self.where_params.extend(values);
        self
    }

    pub fn order_by(mut self, expr: &str) -> Self {
        self.order = Some(expr.to_string());
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Renders SQL text and the positional parameters, in bind order:
    /// join-clause parameters first, then WHERE parameters, matching the
    /// order their placeholders appear in the text.
    pub fn render(&self) -> (String, Vec<Param>) {
        let mut sql = format!("SELECT {} FROM {}", self.select.join(", "), self.from);
        for join in &self.joins {
            sql.push(' ');
            sql.push_str(join);
        }
        if !self.wheres.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.wheres.join(" AND "));
        }
        if let Some(order) = &self.order {
            sql.push_str(" ORDER BY ");
            sql.push_str(order);
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = self.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
        let mut params = Vec::with_capacity(self.join_params.len() + self.where_params.len());
        params.extend(self.join_params.iter().cloned());
        params.extend(self.where_params.iter().cloned());
        (sql, params)
    }
}

/// Binds rendered parameters onto a sqlx query in order.
pub fn bind_all<'q>(
    mut query: sqlx::query::Query<'q, MySql, MySqlArguments>,
    params: &'q [Param],
) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
    for param in params {
        query = match param {
            Param::U64(value) => query.bind(*value),
            Param::I64(value) => query.bind(*value),
            Param::Str(value) => query.bind(value.as_str()),
        };
    }
    query
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_selection_uses_raw_names_without_alias() {
        let (sql, params) = QueryComposer::new(RowKind::Logging, "log", false)
            .columns(None, &["log_id", "log_params"])
            .filter("log_type = ?", vec![Param::Str("delete".into())])
            .render();
        assert_eq!(
            sql,
            "SELECT log_id, log_params FROM logging log WHERE log_type = ?"
        );
        assert_eq!(params, vec![Param::Str("delete".into())]);
    }

    #[test]
    fn aliased_selection_keeps_prefix() {
        let (sql, _) = QueryComposer::new(RowKind::Revision, "rev", true)
            .columns(Some("rev"), &["rev_id", "rev_timestamp"])
            .columns(Some("actor"), &["actor_name"])
            .join_actor()
            .render();
        assert!(sql.starts_with(
            "SELECT rev.rev_id, rev.rev_timestamp, actor.actor_name FROM revision_userindex rev"
        ));
        assert!(sql.contains("LEFT JOIN actor_revision actor ON actor.actor_id = rev.rev_actor"));
    }

    #[test]
    fn parent_self_join_pairs_aliases() {
        let (sql, _) = QueryComposer::new(RowKind::Revision, "rev", true)
            .columns(Some("rev"), &["rev_id", "rev_len"])
            .columns(Some("parent"), &["rev_len"])
            .join_parents("parent")
            .render();
        assert!(sql.contains(
            "LEFT JOIN revision parent ON parent.rev_id = rev.rev_parent_id"
        ));
        assert!(sql.contains("parent.rev_len"));
    }

    #[test]
    #[should_panic(expected = "distinct alias")]
    fn parent_join_rejects_duplicate_alias() {
        let _ = QueryComposer::new(RowKind::Revision, "rev", false).join_parents("rev");
    }

    #[test]
    fn deletion_log_join_shape() {
        let (sql, _) = QueryComposer::new(RowKind::Archive, "ar", true)
            .columns(Some("ar"), &["ar_id", "ar_timestamp"])
            .columns(Some("dlog"), &["log_id", "log_timestamp", "log_page"])
            .join_deletion_log("dlog")
            .render();
        assert!(sql.contains("LEFT JOIN logging dlog ON dlog.log_type = 'delete'"));
        assert!(sql.contains("dlog.log_action LIKE 'delete%'"));
        assert!(sql.contains("dlog.log_timestamp > ar.ar_timestamp"));
        assert!(sql.contains("dlog.log_namespace = ar.ar_namespace"));
        assert!(sql.contains("dlog.log_title = ar.ar_title"));
    }

    #[test]
    fn tag_joins_are_guarded_by_null_checks() {
        let (sql, params) = QueryComposer::new(RowKind::Revision, "rev", true)
            .columns(Some("rev"), &["rev_id"])
            .has_tag(&["mw-rollback"])
            .lacks_tag(&["mw-reverted", "mw-undo"])
            .render();
        assert!(sql.contains("LEFT JOIN change_tag ct0 ON ct0.ct_rev_id = rev.rev_id"));
        assert!(sql.contains("ct0.ct_id IS NOT NULL"));
        assert!(sql.contains("ct1.ct_id IS NULL"));
        assert!(sql.contains("ct2.ct_id IS NULL"));
        assert_eq!(
            params,
            vec![
                Param::Str("mw-rollback".into()),
                Param::Str("mw-reverted".into()),
                Param::Str("mw-undo".into()),
            ]
        );
    }

    #[test]
    fn where_binds_follow_join_binds_regardless_of_chain_order() {
        // The WHERE filter is chained before the tag join, but the tag's
        // placeholder renders first; bind order must match the text, not
        // the call sequence.
        let (sql, params) = QueryComposer::new(RowKind::Revision, "rev", true)
            .columns(Some("rev"), &["rev_id"])
            .filter("actor.actor_name = ?", vec![Param::Str("Example".into())])
            .lacks_tag(&["mw-reverted"])
            .render();
        assert_eq!(
            sql,
            "SELECT rev.rev_id FROM revision_userindex rev \
             LEFT JOIN change_tag ct0 ON ct0.ct_rev_id = rev.rev_id \
             AND ct0.ct_tag_id = (SELECT ctd_id FROM change_tag_def WHERE ctd_name = ?) \
             WHERE actor.actor_name = ? AND ct0.ct_id IS NULL"
        );
        assert_eq!(
            params,
            vec![
                Param::Str("mw-reverted".into()),
                Param::Str("Example".into()),
            ]
        );
    }

    #[test]
    fn filter_in_and_paging_render_in_order() {
        let (sql, params) = QueryComposer::new(RowKind::Revision, "rev", true)
            .columns(Some("rev"), &["rev_id"])
            .filter_in("rev.rev_id", vec![Param::U64(1), Param::U64(2)])
            .order_by("rev.rev_timestamp DESC")
            .limit(50)
            .offset(100)
            .render();
        assert!(sql.contains("rev.rev_id IN (?, ?)"));
        assert!(sql.ends_with("ORDER BY rev.rev_timestamp DESC LIMIT 50 OFFSET 100"));
        assert_eq!(params, vec![Param::U64(1), Param::U64(2)]);
    }

    #[test]
    fn empty_in_list_matches_nothing() {
        let (sql, params) = QueryComposer::new(RowKind::Logging, "log", false)
            .columns(None, &["log_id"])
            .filter_in("log_id", vec![])
            .render();
        assert!(sql.contains("WHERE 1 = 0"));
        assert!(params.is_empty());
    }
}
