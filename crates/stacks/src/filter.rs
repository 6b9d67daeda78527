//! The filter algebra: from a [`PatchFilter`] to one SQL statement.
//!
//! Filters compile into a small boolean expression tree which is rendered
//! exactly once, with named parameters throughout. The visibility flags
//! combine by a fixed rule: selected flags OR together, the complements of
//! the unselected ones AND onto the result, and with no flag at all the
//! query is restricted to non-hidden rows.

use librarian::category::{raw_set_as_bitfield, CategorySet};
use rusqlite::types::Value;

/// How query results are ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PatchOrdering {
    #[default]
    None,
    ByName,
    ByImportId,
    ByPlaceInList,
    ByProgramNo,
    ByBankNo,
}

/// A compositional patch query.
#[derive(Debug, Clone, Default)]
pub struct PatchFilter {
    /// Synth names to search. Empty means all synths.
    pub synths: Vec<String>,
    /// Restrict to members of this import list.
    pub import_id: Option<String>,
    /// Restrict to members of this list.
    pub list_id: Option<String>,
    /// Case-insensitive substring over name, comment, author and info.
    pub name: Option<String>,
    /// Restrict to one data type.
    pub type_id: Option<i32>,
    /// Category bits to match.
    pub categories: CategorySet,
    /// `true`: every listed category must be set; `false`: any of them.
    pub and_categories: bool,
    pub only_faves: bool,
    pub show_hidden: bool,
    pub show_regular: bool,
    pub show_undecided: bool,
    /// Only rows with no category bits at all.
    pub only_untagged: bool,
    /// Only rows whose name occurs more than once for the synth.
    pub only_duplicate_names: bool,
    pub order: PatchOrdering,
}

impl PatchFilter {
    pub fn for_synth(synth: impl Into<String>) -> Self {
        Self {
            synths: vec![synth.into()],
            ..Self::default()
        }
    }

    pub fn all_for_synths(synths: Vec<String>) -> Self {
        Self {
            synths,
            ..Self::default()
        }
    }
}

/// Minimal SQL expression tree; rendered bottom-up with parentheses where
/// the structure needs them.
#[derive(Debug, Clone)]
pub enum SqlExpr {
    Atom(String),
    And(Vec<SqlExpr>),
    Or(Vec<SqlExpr>),
}

impl SqlExpr {
    pub fn atom(text: impl Into<String>) -> Self {
        SqlExpr::Atom(text.into())
    }

    pub fn to_sql(&self) -> String {
        let mut out = String::new();
        self.render(&mut out);
        out
    }

    fn render(&self, out: &mut String) {
        match self {
            SqlExpr::Atom(text) => out.push_str(text),
            SqlExpr::And(children) | SqlExpr::Or(children) => {
                if children.is_empty() {
                    return;
                }
                if children.len() == 1 {
                    children[0].render(out);
                    return;
                }
                let op = if matches!(self, SqlExpr::And(_)) {
                    " AND "
                } else {
                    " OR "
                };
                out.push('(');
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        out.push_str(op);
                    }
                    child.render(out);
                }
                out.push(')');
            }
        }
    }
}

/// A filter rendered to SQL fragments plus its named parameters.
pub struct CompiledFilter {
    pub cte: String,
    pub join: String,
    pub where_clause: String,
    pub order_clause: String,
    pub params: Vec<(String, Value)>,
}

impl CompiledFilter {
    /// Parameter slice in the form rusqlite wants.
    pub fn bind_params(&self) -> Vec<(&str, &dyn rusqlite::ToSql)> {
        self.params
            .iter()
            .map(|(name, value)| (name.as_str(), value as &dyn rusqlite::ToSql))
            .collect()
    }
}

fn visibility_expression(filter: &PatchFilter) -> SqlExpr {
    struct Flag {
        selected: bool,
        atom: &'static str,
        complement: &'static str,
    }
    let flags = [
        Flag {
            selected: filter.only_faves,
            atom: "patches.favorite = 1",
            complement: "(patches.favorite IS NULL OR patches.favorite != 1)",
        },
        Flag {
            selected: filter.show_hidden,
            atom: "patches.hidden = 1",
            complement: "(patches.hidden IS NULL OR patches.hidden != 1)",
        },
        Flag {
            selected: filter.show_regular,
            atom: "patches.regular = 1",
            complement: "(patches.regular IS NULL OR patches.regular != 1)",
        },
        Flag {
            selected: filter.show_undecided,
            atom: "(patches.favorite IS NULL OR patches.favorite < 0)",
            complement: "(patches.favorite IS NOT NULL AND patches.favorite >= 0)",
        },
    ];

    if flags.iter().all(|f| !f.selected) {
        return SqlExpr::atom("(patches.hidden IS NULL OR patches.hidden != 1)");
    }

    let positives: Vec<SqlExpr> = flags
        .iter()
        .filter(|f| f.selected)
        .map(|f| SqlExpr::atom(f.atom))
        .collect();
    let negatives: Vec<SqlExpr> = flags
        .iter()
        .filter(|f| !f.selected)
        .map(|f| SqlExpr::atom(f.complement))
        .collect();

    let mut clauses = vec![SqlExpr::Or(positives)];
    clauses.extend(negatives);
    SqlExpr::And(clauses)
}

/// Compile a filter. `needs_collate` adds case-insensitive matching for the
/// name search (wanted on SELECTs, not on DELETE subqueries).
pub fn compile_filter(filter: &PatchFilter, needs_collate: bool) -> CompiledFilter {
    let mut clauses: Vec<SqlExpr> = Vec::new();
    let mut params: Vec<(String, Value)> = Vec::new();

    if !filter.synths.is_empty() {
        let mut synth_terms = Vec::new();
        for (i, synth) in filter.synths.iter().enumerate() {
            let variable = format!(":syn{i:02}");
            synth_terms.push(SqlExpr::atom(format!("patches.synth = {variable}")));
            params.push((variable, Value::Text(synth.clone())));
        }
        clauses.push(SqlExpr::Or(synth_terms));
    }

    let list_reference = filter.import_id.as_ref().or(filter.list_id.as_ref());
    if let Some(list_id) = list_reference {
        clauses.push(SqlExpr::atom("patch_in_list.id = :lid"));
        params.push((":lid".to_string(), Value::Text(list_id.clone())));
    }

    if let Some(name) = &filter.name {
        let collate = if needs_collate { " COLLATE NOCASE" } else { "" };
        clauses.push(SqlExpr::Or(vec![
            SqlExpr::atom(format!("patches.name LIKE :nam{collate}")),
            SqlExpr::atom(format!("patches.comment LIKE :nam{collate}")),
            SqlExpr::atom(format!("patches.author LIKE :nam{collate}")),
            SqlExpr::atom(format!("patches.info LIKE :nam{collate}")),
        ]));
        params.push((":nam".to_string(), Value::Text(format!("%{name}%"))));
    }

    if let Some(type_id) = filter.type_id {
        clauses.push(SqlExpr::atom("patches.type = :typ"));
        params.push((":typ".to_string(), Value::Integer(type_id as i64)));
    }

    clauses.push(visibility_expression(filter));

    if filter.only_untagged {
        clauses.push(SqlExpr::atom(
            "(patches.categories IS NULL OR patches.categories = 0)",
        ));
    } else if !filter.categories.is_empty() {
        let mask = raw_set_as_bitfield(&filter.categories);
        if filter.and_categories {
            clauses.push(SqlExpr::atom("(patches.categories & :cat) = :cat"));
        } else {
            clauses.push(SqlExpr::atom("(patches.categories & :cat) != 0"));
        }
        params.push((":cat".to_string(), Value::Integer(mask)));
    }

    if filter.only_duplicate_names {
        clauses.push(SqlExpr::atom("patches_count.count > 1"));
    }

    let where_clause = format!("WHERE {}", SqlExpr::And(clauses).to_sql());

    let mut join = String::new();
    if list_reference.is_some() {
        join.push_str(
            " INNER JOIN patch_in_list ON patches.md5 = patch_in_list.md5 \
             AND patches.synth = patch_in_list.synth",
        );
    }
    if filter.only_duplicate_names {
        join.push_str(
            " INNER JOIN patches_count ON patches.synth = patches_count.synth \
             AND patches.name = patches_count.dup_name",
        );
    }

    let cte = if filter.only_duplicate_names {
        "WITH patches_count AS (\
         SELECT synth, name AS dup_name, COUNT(*) AS count \
         FROM patches GROUP BY synth, name) "
            .to_string()
    } else {
        String::new()
    };

    let order_clause = match filter.order {
        PatchOrdering::None => String::new(),
        PatchOrdering::ByName => {
            " ORDER BY patches.name, patches.midi_bank_no, patches.midi_program_no".to_string()
        }
        PatchOrdering::ByImportId => {
            if list_reference.is_some() {
                " ORDER BY patch_in_list.id, patches.midi_bank_no, patches.midi_program_no"
                    .to_string()
            } else {
                " ORDER BY patches.midi_bank_no, patches.midi_program_no".to_string()
            }
        }
        PatchOrdering::ByPlaceInList => " ORDER BY patch_in_list.order_num".to_string(),
        PatchOrdering::ByProgramNo => {
            " ORDER BY patches.midi_program_no, patches.name".to_string()
        }
        PatchOrdering::ByBankNo => {
            " ORDER BY patches.midi_bank_no, patches.midi_program_no, patches.name".to_string()
        }
    };

    CompiledFilter {
        cte,
        join,
        where_clause,
        order_clause,
        params,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expression_tree_rendering() {
        let expr = SqlExpr::And(vec![
            SqlExpr::atom("a = 1"),
            SqlExpr::Or(vec![SqlExpr::atom("b = 2"), SqlExpr::atom("c = 3")]),
        ]);
        assert_eq!(expr.to_sql(), "(a = 1 AND (b = 2 OR c = 3))");
    }

    #[test]
    fn test_single_child_needs_no_parens() {
        let expr = SqlExpr::Or(vec![SqlExpr::atom("x = 1")]);
        assert_eq!(expr.to_sql(), "x = 1");
        assert_eq!(SqlExpr::And(Vec::new()).to_sql(), "");
    }

    #[test]
    fn test_default_filter_hides_hidden() {
        let compiled = compile_filter(&PatchFilter::for_synth("Test"), true);
        assert!(compiled
            .where_clause
            .contains("patches.hidden IS NULL OR patches.hidden != 1"));
        assert!(!compiled.where_clause.contains("favorite = 1"));
    }

    #[test]
    fn test_faves_selected() {
        let filter = PatchFilter {
            only_faves: true,
            ..PatchFilter::for_synth("Test")
        };
        let compiled = compile_filter(&filter, true);
        assert!(compiled.where_clause.contains("patches.favorite = 1"));
        // The unselected hidden flag becomes its complement.
        assert!(compiled
            .where_clause
            .contains("patches.hidden IS NULL OR patches.hidden != 1"));
    }

    #[test]
    fn test_hidden_and_faves_or_combined() {
        let filter = PatchFilter {
            only_faves: true,
            show_hidden: true,
            ..PatchFilter::for_synth("Test")
        };
        let compiled = compile_filter(&filter, true);
        assert!(compiled
            .where_clause
            .contains("patches.favorite = 1 OR patches.hidden = 1"));
    }

    #[test]
    fn test_category_masks() {
        let mut filter = PatchFilter::for_synth("Test");
        filter.categories = [1u8, 3].into_iter().collect();
        let compiled = compile_filter(&filter, true);
        assert!(compiled.where_clause.contains("(patches.categories & :cat) != 0"));
        let mask = compiled
            .params
            .iter()
            .find(|(name, _)| name == ":cat")
            .map(|(_, value)| value.clone());
        assert_eq!(mask, Some(Value::Integer((1 << 1) | (1 << 3))));

        filter.and_categories = true;
        let compiled = compile_filter(&filter, true);
        assert!(compiled
            .where_clause
            .contains("(patches.categories & :cat) = :cat"));
    }

    #[test]
    fn test_untagged_wins_over_categories() {
        let mut filter = PatchFilter::for_synth("Test");
        filter.categories = [1u8].into_iter().collect();
        filter.only_untagged = true;
        let compiled = compile_filter(&filter, true);
        assert!(compiled.where_clause.contains("patches.categories = 0"));
        assert!(!compiled.params.iter().any(|(name, _)| name == ":cat"));
    }

    #[test]
    fn test_list_filter_adds_join() {
        let filter = PatchFilter {
            list_id: Some("some-list".to_string()),
            ..PatchFilter::for_synth("Test")
        };
        let compiled = compile_filter(&filter, true);
        assert!(compiled.join.contains("INNER JOIN patch_in_list"));
        assert!(compiled.where_clause.contains("patch_in_list.id = :lid"));
    }

    #[test]
    fn test_duplicate_names_build_cte() {
        let filter = PatchFilter {
            only_duplicate_names: true,
            ..PatchFilter::for_synth("Test")
        };
        let compiled = compile_filter(&filter, true);
        assert!(compiled.cte.starts_with("WITH patches_count"));
        assert!(compiled.join.contains("patches_count"));
        assert!(compiled.where_clause.contains("patches_count.count > 1"));
    }

    #[test]
    fn test_multi_synth_parameters() {
        let filter = PatchFilter::all_for_synths(vec!["A".to_string(), "B".to_string()]);
        let compiled = compile_filter(&filter, true);
        assert!(compiled.where_clause.contains(":syn00"));
        assert!(compiled.where_clause.contains(":syn01"));
        assert_eq!(compiled.params.len(), 2);
    }

    #[test]
    fn test_name_search_collation() {
        let filter = PatchFilter {
            name: Some("pad".to_string()),
            ..PatchFilter::for_synth("Test")
        };
        let with = compile_filter(&filter, true);
        assert!(with.where_clause.contains("COLLATE NOCASE"));
        let without = compile_filter(&filter, false);
        assert!(!without.where_clause.contains("COLLATE NOCASE"));
        assert!(without.where_clause.contains("patches.comment LIKE :nam"));
    }

    #[test]
    fn test_order_clauses() {
        let mut filter = PatchFilter::for_synth("Test");
        filter.order = PatchOrdering::ByName;
        assert!(compile_filter(&filter, true)
            .order_clause
            .contains("ORDER BY patches.name"));
        filter.order = PatchOrdering::ByBankNo;
        assert!(compile_filter(&filter, true)
            .order_clause
            .contains("ORDER BY patches.midi_bank_no"));
        filter.order = PatchOrdering::None;
        assert!(compile_filter(&filter, true).order_clause.is_empty());
    }
}
