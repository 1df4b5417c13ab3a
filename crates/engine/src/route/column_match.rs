//! Column-match router expressions.
//!
//! An expression is a list of terms joined by newlines, ` or ` or ` OR `.
//! A row is routed to the union of the nodes every term selects.
//!
//! ```text
//! STORE_ID=:EXTERNAL_ID
//! REGION = 'north' or STATUS != NULL
//! TAGS contains 'vip'
//! ```

use std::collections::{BTreeSet, HashMap};

use sync_core::{Node, SyncError};

const NODE_ID: &str = ":NODE_ID";
const EXTERNAL_ID: &str = ":EXTERNAL_ID";
const NODE_GROUP_ID: &str = ":NODE_GROUP_ID";
const REDIRECT_NODE: &str = ":REDIRECT_NODE";
const EXTERNAL_DATA: &str = ":EXTERNAL_DATA";
const NULL: &str = "NULL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
}

impl Operator {
    fn is_positive(&self) -> bool {
        matches!(self, Operator::Equals | Operator::Contains)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Term {
    column: String,
    operator: Operator,
    value: String,
}

/// Column values of the row being routed, keyed by upper-case column name.
/// Old values are present with an `OLD_` prefix.
pub type ColumnValues = HashMap<String, Option<String>>;

/// A parsed column-match expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMatchExpression {
    terms: Vec<Term>,
}

impl ColumnMatchExpression {
    pub fn parse(router_id: &str, expression: &str) -> Result<Self, SyncError> {
        let syntax = |message: String| SyncError::RouterSyntax {
            router_id: router_id.to_string(),
            message,
        };

        let mut terms = Vec::new();
        for line in expression.lines() {
            for part in line.split(" or ").flat_map(|p| p.split(" OR ")) {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                let (column, operator, value) = split_term(part)
                    .ok_or_else(|| syntax(format!("Could not parse the expression '{part}'")))?;
                let column = column.trim().to_uppercase();
                if column.is_empty() {
                    return Err(syntax(format!("Missing column name in '{part}'")));
                }
                terms.push(Term {
                    column,
                    operator,
                    value: unquote(value.trim()),
                });
            }
        }
        if terms.is_empty() {
            return Err(syntax("The router expression is empty".to_string()));
        }
        Ok(Self { terms })
    }

    /// Ids of the nodes in `nodes` this row should go to.
    pub fn route(
        &self,
        columns: &ColumnValues,
        nodes: &[Node],
        external_data: Option<&str>,
        redirects: &HashMap<String, String>,
    ) -> BTreeSet<String> {
        let mut selected = BTreeSet::new();
        let all = |selected: &mut BTreeSet<String>| {
            selected.extend(nodes.iter().map(|n| n.node_id.clone()));
        };

        for term in &self.terms {
            let column_value = columns.get(&term.column).cloned().flatten();
            let column_value = column_value.as_deref();
            let matches = |candidate: Option<&str>| compare(term.operator, column_value, candidate);

            match term.value.as_str() {
                NODE_ID => selected.extend(
                    nodes
                        .iter()
                        .filter(|n| matches(Some(&n.node_id)))
                        .map(|n| n.node_id.clone()),
                ),
                EXTERNAL_ID => selected.extend(
                    nodes
                        .iter()
                        .filter(|n| matches(Some(&n.external_id)))
                        .map(|n| n.node_id.clone()),
                ),
                NODE_GROUP_ID => selected.extend(
                    nodes
                        .iter()
                        .filter(|n| matches(Some(&n.node_group_id)))
                        .map(|n| n.node_id.clone()),
                ),
                REDIRECT_NODE => {
                    let target = column_value.and_then(|v| redirects.get(v));
                    selected.extend(
                        nodes
                            .iter()
                            .filter(|n| (target == Some(&n.node_id)) == term.operator.is_positive())
                            .map(|n| n.node_id.clone()),
                    );
                }
                EXTERNAL_DATA => {
                    if matches(external_data) {
                        all(&mut selected);
                    }
                }
                value if value.eq_ignore_ascii_case(NULL) => {
                    if matches(None) {
                        all(&mut selected);
                    }
                }
                value if value.starts_with(':') => {
                    let other = columns.get(&value[1..].to_uppercase()).cloned().flatten();
                    if matches(other.as_deref()) {
                        all(&mut selected);
                    }
                }
                value => {
                    if matches(Some(value)) {
                        all(&mut selected);
                    }
                }
            }
        }
        selected
    }
}

fn split_term(term: &str) -> Option<(&str, Operator, &str)> {
    if let Some((column, value)) = term.split_once("!=") {
        return Some((column, Operator::NotEquals, value));
    }
    if let Some((column, value)) = term.split_once('=') {
        return Some((column, Operator::Equals, value));
    }
    if let Some(index) = term.find(" not contains ") {
        return Some((&term[..index], Operator::NotContains, &term[index + 14..]));
    }
    if let Some(index) = term.find(" contains ") {
        return Some((&term[..index], Operator::Contains, &term[index + 10..]));
    }
    None
}

fn unquote(value: &str) -> String {
    if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
        value[1..value.len() - 1].replace("''", "'")
    } else {
        value.to_string()
    }
}

fn compare(operator: Operator, column: Option<&str>, candidate: Option<&str>) -> bool {
    match operator {
        Operator::Equals => column == candidate,
        Operator::NotEquals => column != candidate,
        Operator::Contains => contains(column, candidate),
        Operator::NotContains => !contains(column, candidate),
    }
}

fn contains(column: Option<&str>, candidate: Option<&str>) -> bool {
    match (column, candidate) {
        (Some(column), Some(candidate)) => column.split(',').any(|part| part.trim() == candidate),
        (None, None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes() -> Vec<Node> {
        vec![
            Node::new("001", "store", "s1"),
            Node::new("002", "store", "s2"),
            Node::new("003", "kiosk", "k1"),
        ]
    }

    fn columns(pairs: &[(&str, Option<&str>)]) -> ColumnValues {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
            .collect()
    }

    fn route(expression: &str, cols: &ColumnValues) -> Vec<String> {
        ColumnMatchExpression::parse("r1", expression)
            .unwrap()
            .route(cols, &nodes(), None, &HashMap::new())
            .into_iter()
            .collect()
    }

    #[test]
    fn test_node_tokens() {
        let cols = columns(&[("STORE", Some("s2")), ("NODE", Some("001")), ("GROUP", Some("kiosk"))]);
        assert_eq!(route("STORE=:EXTERNAL_ID", &cols), vec!["002"]);
        assert_eq!(route("NODE = :NODE_ID", &cols), vec!["001"]);
        assert_eq!(route("GROUP=:NODE_GROUP_ID", &cols), vec!["003"]);
        assert_eq!(route("NODE!=:NODE_ID", &cols), vec!["002", "003"]);
    }

    #[test]
    fn test_literals_route_to_all_nodes() {
        let cols = columns(&[("REGION", Some("north")), ("NOTE", None)]);
        assert_eq!(route("REGION='north'", &cols).len(), 3);
        assert!(route("REGION='south'", &cols).is_empty());
        assert_eq!(route("NOTE=NULL", &cols).len(), 3);
        assert!(route("NOTE!=null", &cols).is_empty());
    }

    #[test]
    fn test_or_and_newlines_union() {
        let cols = columns(&[("A", Some("001")), ("B", Some("k1"))]);
        assert_eq!(route("A=:NODE_ID or B=:EXTERNAL_ID", &cols), vec!["001", "003"]);
        assert_eq!(route("A=:NODE_ID\nB=:EXTERNAL_ID", &cols), vec!["001", "003"]);
        assert_eq!(route("A=:NODE_ID OR B=:EXTERNAL_ID", &cols), vec!["001", "003"]);
    }

    #[test]
    fn test_contains_splits_on_commas() {
        let cols = columns(&[("TAGS", Some("vip, gold"))]);
        assert_eq!(route("TAGS contains 'gold'", &cols).len(), 3);
        assert!(route("TAGS not contains 'gold'", &cols).is_empty());
        assert_eq!(route("TAGS not contains silver", &cols).len(), 3);
    }

    #[test]
    fn test_quoted_literal_unescapes() {
        let cols = columns(&[("NAME", Some("o'brien"))]);
        assert_eq!(route("NAME='o''brien'", &cols).len(), 3);
    }

    #[test]
    fn test_column_reference_and_old_values() {
        let cols = columns(&[("STATUS", Some("open")), ("OLD_STATUS", Some("closed"))]);
        assert_eq!(route("STATUS!=:OLD_STATUS", &cols).len(), 3);
        assert!(route("STATUS=:OLD_STATUS", &cols).is_empty());
        assert!(route("OLD_STATUS='open'", &cols).is_empty());
    }

    #[test]
    fn test_redirect_and_external_data() {
        let expr = ColumnMatchExpression::parse("r1", "STORE=:REDIRECT_NODE").unwrap();
        let redirects: HashMap<String, String> =
            [("s9".to_string(), "002".to_string())].into_iter().collect();
        let cols = columns(&[("STORE", Some("s9"))]);
        let routed = expr.route(&cols, &nodes(), None, &redirects);
        assert_eq!(routed.into_iter().collect::<Vec<_>>(), vec!["002"]);

        let expr = ColumnMatchExpression::parse("r1", "STORE=:EXTERNAL_DATA").unwrap();
        assert_eq!(expr.route(&cols, &nodes(), Some("s9"), &redirects).len(), 3);
        assert!(expr.route(&cols, &nodes(), Some("s1"), &redirects).is_empty());
    }

    #[test]
    fn test_parse_errors() {
        let err = ColumnMatchExpression::parse("r7", "STORE :EXTERNAL_ID").unwrap_err();
        match err {
            SyncError::RouterSyntax { router_id, .. } => assert_eq!(router_id, "r7"),
            other => panic!("unexpected error {other}"),
        }
        assert!(ColumnMatchExpression::parse("r7", "  ").is_err());
        assert!(ColumnMatchExpression::parse("r7", "='x'").is_err());
    }
}
