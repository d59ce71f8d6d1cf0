//! Generic depth-1 hierarchical/relational mapping: a tagged condition map
//! for building `WHERE` clauses, and the collapse step that turns a
//! `LEFT JOIN`'s flat row stream back into `parent -> Vec<child>` records.
//!
//! This is the typed-record replacement for the original `Mapper` /
//! `MyCursor.where_str`, which threaded plain dictionaries through string
//! templating. Generalizing past one foreign-key depth is out of scope
//! (see DESIGN.md).

/// A comparison operator in a condition map. Closed set, matching the
/// original `name_to_operator` table (`lt`, `le`, `eq`, `ge`, `gt`, `ne`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Lt,
    Le,
    Eq,
    Ge,
    Gt,
    Ne,
}

impl Op {
    pub fn as_sql(self) -> &'static str {
        match self {
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Eq => "=",
            Op::Ge => ">=",
            Op::Gt => ">",
            Op::Ne => "!=",
        }
    }
}

/// A bound value for a condition. `wud-db` is the only consumer and binds
/// these straight into a `sqlx::query`.
#[derive(Debug, Clone)]
pub enum Value {
    Int(i64),
    Text(String),
}

/// One `(column, operator, value)` triple. A `ConditionSet` is a list of
/// these, AND-joined, mirroring `where_str(**{eq: {...}, lt: {...}, ...})`.
#[derive(Debug, Clone)]
pub struct Condition {
    pub column: &'static str,
    pub op: Op,
    pub value: Value,
}

#[derive(Debug, Clone, Default)]
pub struct ConditionSet(Vec<Condition>);

impl ConditionSet {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(mut self, column: &'static str, op: Op, value: Value) -> Self {
        self.0.push(Condition { column, op, value });
        self
    }

    pub fn eq_int(self, column: &'static str, value: i64) -> Self {
        self.push(column, Op::Eq, Value::Int(value))
    }

    pub fn eq_text(self, column: &'static str, value: impl Into<String>) -> Self {
        self.push(column, Op::Eq, Value::Text(value.into()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Render `" WHERE col op ? AND col2 op2 ? ..."` (empty string if there
    /// are no conditions) plus the values in bind order.
    pub fn to_where_sql(&self) -> (String, Vec<&Value>) {
        if self.0.is_empty() {
            return (String::new(), Vec::new());
        }
        let mut sql = String::from(" WHERE ");
        let mut values = Vec::with_capacity(self.0.len());
        for (i, cond) in self.0.iter().enumerate() {
            if i > 0 {
                sql.push_str(" AND ");
            }
            sql.push_str(cond.column);
            sql.push(' ');
            sql.push_str(cond.op.as_sql());
            sql.push_str(" ?");
            values.push(&cond.value);
        }
        (sql, values)
    }
}

/// A flat row coming back from a parent/child `LEFT JOIN`, before the
/// collapse step groups it. `parent_pk` must be stable and the rows must
/// arrive sorted by it (the mapper's query always appends `ORDER BY`
/// parent primary key, or relies on `row_id` ordering, to make this true).
pub trait JoinRow {
    fn parent_pk(&self) -> i64;
}

/// Collapse successive flat rows sharing a parent key into one
/// `(parent, children)` record, the depth-1 analogue of the original
/// `Mapper.where`'s row-collapsing loop. `rows` must already be sorted by
/// `parent_pk`; `split` pulls the parent-shaped value and an optional
/// child out of one flat row.
pub fn collapse<Row, Parent, Child, F>(rows: Vec<Row>, mut split: F) -> Vec<(Parent, Vec<Child>)>
where
    Row: JoinRow,
    F: FnMut(Row) -> (Parent, Option<Child>),
{
    let mut out: Vec<(i64, Parent, Vec<Child>)> = Vec::new();
    for row in rows {
        let pk = row.parent_pk();
        let (parent, child) = split(row);
        match out.last_mut() {
            Some((last_pk, _, children)) if *last_pk == pk => {
                if let Some(c) = child {
                    children.push(c);
                }
            }
            _ => {
                let mut children = Vec::new();
                if let Some(c) = child {
                    children.push(c);
                }
                out.push((pk, parent, children));
            }
        }
    }
    out.into_iter().map(|(_, p, c)| (p, c)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Flat {
        pk: i64,
        parent_name: &'static str,
        child: Option<&'static str>,
    }
    impl JoinRow for Flat {
        fn parent_pk(&self) -> i64 {
            self.pk
        }
    }

    #[test]
    fn condition_set_renders_and_joins() {
        let cs = ConditionSet::new()
            .eq_int("status", 0)
            .push("priority", Op::Ge, Value::Int(5));
        let (sql, values) = cs.to_where_sql();
        assert_eq!(sql, " WHERE status = ? AND priority >= ?");
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn empty_condition_set_renders_nothing() {
        let (sql, values) = ConditionSet::new().to_where_sql();
        assert_eq!(sql, "");
        assert!(values.is_empty());
    }

    #[test]
    fn collapse_groups_children_under_one_parent() {
        let rows = vec![
            Flat { pk: 1, parent_name: "a", child: Some("f1") },
            Flat { pk: 1, parent_name: "a", child: Some("f2") },
            Flat { pk: 2, parent_name: "b", child: None },
        ];
        let grouped = collapse(rows, |r| (r.parent_name, r.child));
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0], ("a", vec!["f1", "f2"]));
        assert_eq!(grouped[1], ("b", vec![]));
    }
}
