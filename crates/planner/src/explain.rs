use crate::actions::{Action, ActionList};
use crate::analysis::{AnalysisResult, FilterStep};

/// Render an analysis result as human-readable multiline text.
pub fn explain_analysis(res: &AnalysisResult) -> String {
    let mut s = String::new();
    s.push_str(&format!(
        "Analysis first_stage={} second_stage={} need_aggregate={}\n",
        res.first_stage, res.second_stage, res.need_aggregate
    ));
    s.push_str(&format!(
        "  required_source_columns={:?}\n",
        res.required_source_columns
    ));
    if let Some(a) = &res.before_join {
        fmt_actions("before_join", a, 1, &mut s);
    }
    if let Some(f) = &res.before_where {
        fmt_filter("before_where", f, &mut s);
    }
    if let Some(a) = &res.before_aggregation {
        fmt_actions("before_aggregation", a, 1, &mut s);
        s.push_str(&format!("    keys={:?}\n", res.aggregation_keys));
        for agg in &res.aggregates {
            s.push_str(&format!("    aggregate {}\n", agg.column_name));
        }
    }
    if let Some(f) = &res.before_having {
        fmt_filter("before_having", f, &mut s);
    }
    if let Some(a) = &res.before_order_and_select {
        fmt_actions("before_order_and_select", a, 1, &mut s);
    }
    if !res.order_by.is_empty() {
        let keys = res
            .order_by
            .iter()
            .map(|c| format!("{}{}", c.name, if c.descending { " DESC" } else { "" }))
            .collect::<Vec<_>>();
        s.push_str(&format!("  order_by=[{}]\n", keys.join(", ")));
    }
    if let Some(a) = &res.before_limit_by {
        fmt_actions("before_limit_by", a, 1, &mut s);
    }
    if let Some(a) = &res.final_projection {
        fmt_actions("final_projection", a, 1, &mut s);
    }
    for sub in &res.subqueries_for_sets {
        s.push_str(&format!("  subquery {}\n", sub.name));
    }
    s
}

/// Render one action list.
pub fn explain_actions(actions: &ActionList) -> String {
    let mut s = String::new();
    fmt_actions("actions", actions, 0, &mut s);
    s
}

fn fmt_filter(label: &str, f: &FilterStep, out: &mut String) {
    fmt_actions(label, &f.actions, 1, out);
    out.push_str(&format!(
        "    filter={} remove={}\n",
        f.column, f.remove_column
    ));
}

fn fmt_actions(label: &str, list: &ActionList, indent: usize, out: &mut String) {
    let pad = "  ".repeat(indent);
    out.push_str(&format!("{pad}{label}\n"));
    for action in &list.actions {
        match action {
            Action::Compute { name, .. } => out.push_str(&format!("{pad}  COMPUTE {name}\n")),
            Action::Join(j) => out.push_str(&format!(
                "{pad}  JOIN {:?} USING {:?} ADD {:?}\n",
                j.kind, j.keys, j.right_columns
            )),
            Action::Project(pairs) => {
                let cols = pairs
                    .iter()
                    .map(|(src, alias)| {
                        if src == alias {
                            src.clone()
                        } else {
                            format!("{src} AS {alias}")
                        }
                    })
                    .collect::<Vec<_>>();
                out.push_str(&format!("{pad}  PROJECT {}\n", cols.join(", ")));
            }
            Action::Retain(cols) => {
                out.push_str(&format!("{pad}  RETAIN {}\n", cols.join(", ")))
            }
        }
    }
}
