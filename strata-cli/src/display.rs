//! Rendering of plans, apply reports and state for the terminal

use std::fmt::Write;

use colored::{ColoredString, Colorize};
use similar::{ChangeTag, TextDiff};
use strata_core::executor::{ApplyReport, EntryStatus};
use strata_core::plan::{Action, AttributeDiff, ChangeEntry, DeleteReason, Plan};
use strata_core::refresh::RefreshReport;
use strata_core::resource::Value;
use strata_state::{ResourceState, StateFile};

fn colored_symbol(entry: &ChangeEntry) -> ColoredString {
    let symbol = entry.symbol();
    match entry.action {
        Action::Create if entry.replacement => symbol.yellow().bold(),
        Action::Create => symbol.green().bold(),
        Action::Update => symbol.yellow().bold(),
        Action::Delete => symbol.red().bold(),
        Action::NoOp => symbol.normal(),
    }
}

fn entry_note(entry: &ChangeEntry) -> &'static str {
    match (entry.action, entry.delete_reason) {
        (Action::Delete, Some(DeleteReason::Orphaned)) => " (no longer declared)",
        (Action::Delete, Some(DeleteReason::Replaced)) => " (replaced)",
        (Action::Delete, Some(DeleteReason::Destroy)) => " (destroy)",
        (Action::Create, _) if entry.replacement => " (new instance)",
        _ => "",
    }
}

pub fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => format!("\"{}\"", s),
        Value::Int(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::List(items) => {
            let items: Vec<String> = items.iter().map(format_value).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Map(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();
            let pairs: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{} = {}", k, format_value(&map[k])))
                .collect();
            format!("{{{}}}", pairs.join(", "))
        }
        Value::Ref { target, attribute } => format!("{}.{}", target, attribute),
        Value::Concat(parts) => {
            let parts: Vec<String> = parts.iter().map(format_value).collect();
            parts.join(" + ")
        }
        Value::Unknown => "(known after apply)".to_string(),
    }
}

fn is_multiline_change(diff: &AttributeDiff) -> bool {
    let multiline = |v: &Option<Value>| matches!(v, Some(Value::String(s)) if s.contains('\n'));
    multiline(&diff.before) || multiline(&diff.after)
}

fn render_text_diff(out: &mut String, before: &str, after: &str, indent: &str) {
    let diff = TextDiff::from_lines(before, after);
    for change in diff.iter_all_changes() {
        let line = change.value().trim_end_matches('\n');
        let _ = match change.tag() {
            ChangeTag::Delete => writeln!(out, "{}{}", indent, format!("- {}", line).red()),
            ChangeTag::Insert => writeln!(out, "{}{}", indent, format!("+ {}", line).green()),
            ChangeTag::Equal => writeln!(out, "{}  {}", indent, line),
        };
    }
}

fn render_attribute_diff(out: &mut String, diff: &AttributeDiff) {
    let forces = if diff.requires_replacement {
        format!(" {}", "# forces replacement".red())
    } else {
        String::new()
    };

    if is_multiline_change(diff) {
        let text = |v: &Option<Value>| match v {
            Some(Value::String(s)) => s.clone(),
            Some(other) => format_value(other),
            None => String::new(),
        };
        let _ = writeln!(out, "      {}:{}", diff.key, forces);
        render_text_diff(out, &text(&diff.before), &text(&diff.after), "        ");
        return;
    }

    let _ = match (&diff.before, &diff.after) {
        (None, Some(after)) => writeln!(
            out,
            "      {} {}: {}{}",
            "+".green(),
            diff.key,
            format_value(after),
            forces
        ),
        (Some(before), None) => writeln!(
            out,
            "      {} {}: {}{}",
            "-".red(),
            diff.key,
            format_value(before).dimmed(),
            forces
        ),
        (Some(before), Some(after)) => writeln!(
            out,
            "      {} {}: {} => {}{}",
            "~".yellow(),
            diff.key,
            format_value(before).dimmed(),
            format_value(after),
            forces
        ),
        (None, None) => Ok(()),
    };
}

/// Render the mutating entries of a plan followed by its summary
pub fn render_plan(plan: &Plan) -> String {
    let mut out = String::new();
    if !plan.has_changes() {
        let _ = writeln!(out, "{}", "No changes. Infrastructure is up-to-date.".green());
        return out;
    }

    let _ = writeln!(out, "{}", "Execution Plan:".cyan().bold());
    let _ = writeln!(out);
    for entry in plan.entries().iter().filter(|e| e.is_mutating()) {
        let _ = writeln!(
            out,
            "  {} {}{}",
            colored_symbol(entry),
            entry.id.to_string().bold(),
            entry_note(entry).dimmed()
        );
        // The delete half of a replacement shows no attributes; the create half carries them
        if entry.action != Action::Delete {
            for diff in &entry.diffs {
                render_attribute_diff(&mut out, diff);
            }
        }
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "{}", plan.summary().to_string().bold());
    out
}

pub fn print_plan(plan: &Plan) {
    print!("{}", render_plan(plan));
}

/// Render per-entry results, failure details and the summary line
pub fn render_report(report: &ApplyReport) -> String {
    let mut out = String::new();
    for entry in &report.entries {
        let line = match entry.status {
            EntryStatus::Applied => format!("  {} {} {}", "✓".green(), entry.action, entry.id),
            EntryStatus::Failed => format!(
                "  {} {} {}",
                "✗".red(),
                entry.action,
                entry.id.to_string().red()
            ),
            EntryStatus::Skipped => format!(
                "  {} {} {} ({})",
                "-".yellow(),
                entry.action,
                entry.id,
                entry.skip_reason.as_deref().unwrap_or("skipped")
            ),
            EntryStatus::Unchanged | EntryStatus::Pending | EntryStatus::Running => continue,
        };
        let _ = writeln!(out, "{}", line);
    }

    let failures: Vec<_> = report.failures().collect();
    if !failures.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "{}", "Errors:".red().bold());
        for entry in failures {
            let message = entry
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "unknown error".to_string());
            let _ = writeln!(out, "  {}: {}", entry.id, message);
        }
    }

    let _ = writeln!(out);
    let summary = report.summary().to_string();
    let summary = if report.cancelled {
        format!("Apply cancelled. {}", summary).yellow().bold()
    } else if report.is_success() {
        format!("Apply complete! {}", summary).green().bold()
    } else {
        format!("Apply finished with errors. {}", summary).red().bold()
    };
    let _ = writeln!(out, "{}", summary);
    out
}

pub fn print_report(report: &ApplyReport) {
    print!("{}", render_report(report));
}

pub fn render_refresh(report: &RefreshReport) -> String {
    let mut out = String::new();
    for id in &report.removed {
        let _ = writeln!(out, "  {} {} {}", "!".red(), id, "deleted outside Strata".dimmed());
    }
    for id in &report.drifted {
        let _ = writeln!(out, "  {} {} {}", "~".yellow(), id, "changed outside Strata".dimmed());
    }
    let _ = writeln!(
        out,
        "Refreshed {} resources: {} removed, {} drifted",
        report.states.len() + report.removed.len(),
        report.removed.len(),
        report.drifted.len()
    );
    out
}

pub fn print_refresh(report: &RefreshReport) {
    print!("{}", render_refresh(report));
}

/// One line per recorded resource
pub fn render_state_list(state: &StateFile) -> String {
    let mut out = String::new();
    for resource in &state.resources {
        let protected = if resource.protected { " [protected]" } else { "" };
        let _ = writeln!(
            out,
            "{}\t{}{}",
            resource.id(),
            resource.identifier.as_deref().unwrap_or("-"),
            protected
        );
    }
    out
}

pub fn render_resource(resource: &ResourceState) -> String {
    serde_json::to_string_pretty(resource).unwrap_or_else(|e| format!("<unprintable: {}>", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use strata_core::executor::EntryReport;
    use strata_core::provider::ProviderError;
    use strata_core::resource::{ResourceId, State};

    fn plain() {
        colored::control::set_override(false);
    }

    fn table_id() -> ResourceId {
        ResourceId::new("dynamodb.table", "users")
    }

    #[test]
    fn format_values() {
        assert_eq!(format_value(&Value::string("Users")), "\"Users\"");
        assert_eq!(format_value(&Value::Unknown), "(known after apply)");
        assert_eq!(
            format_value(&Value::reference(table_id(), "arn")),
            "dynamodb.table.users.arn"
        );
        let map = Value::Map(HashMap::from([
            ("b".to_string(), Value::Int(2)),
            ("a".to_string(), Value::Bool(true)),
        ]));
        assert_eq!(format_value(&map), "{a = true, b = 2}");
    }

    #[test]
    fn empty_plan_reports_no_changes() {
        plain();
        assert_eq!(
            render_plan(&Plan::new()),
            "No changes. Infrastructure is up-to-date.\n"
        );
    }

    #[test]
    fn replacement_is_rendered_with_reason() {
        plain();
        let mut plan = Plan::new();
        let delete = plan.add(ChangeEntry {
            delete_reason: Some(DeleteReason::Replaced),
            replacement: true,
            ..ChangeEntry::new(table_id(), Action::Delete)
        });
        plan.add(ChangeEntry {
            replacement: true,
            diffs: vec![AttributeDiff {
                key: "hash_key".to_string(),
                before: Some(Value::string("UserID")),
                after: Some(Value::string("Email")),
                requires_replacement: true,
            }],
            predecessors: vec![delete],
            ..ChangeEntry::new(table_id(), Action::Create)
        });

        let rendered = render_plan(&plan);
        assert!(rendered.contains("-/+ dynamodb.table.users (replaced)"));
        assert!(rendered.contains("+/- dynamodb.table.users (new instance)"));
        assert!(rendered.contains("~ hash_key: \"UserID\" => \"Email\" # forces replacement"));
        assert!(rendered.ends_with("Plan: 0 to add, 0 to change, 1 to replace, 0 to destroy\n"));
    }

    #[test]
    fn multiline_strings_are_diffed_by_line() {
        plain();
        let mut plan = Plan::new();
        plan.add(ChangeEntry {
            diffs: vec![AttributeDiff {
                key: "policy".to_string(),
                before: Some(Value::string("{\n  \"Effect\": \"Allow\"\n}")),
                after: Some(Value::string("{\n  \"Effect\": \"Deny\"\n}")),
                requires_replacement: false,
            }],
            ..ChangeEntry::new(ResourceId::new("iam.role_policy", "table"), Action::Update)
        });

        let rendered = render_plan(&plan);
        assert!(rendered.contains("-   \"Effect\": \"Allow\""));
        assert!(rendered.contains("+   \"Effect\": \"Deny\""));
    }

    #[test]
    fn report_lists_failures() {
        plain();
        let report = ApplyReport {
            entries: vec![
                EntryReport {
                    index: 0,
                    id: table_id(),
                    action: Action::Create,
                    status: EntryStatus::Failed,
                    outcome: None,
                    error: Some(ProviderError::new("AccessDenied")),
                    skip_reason: None,
                },
                EntryReport {
                    index: 1,
                    id: ResourceId::new("lambda.function", "api"),
                    action: Action::Create,
                    status: EntryStatus::Skipped,
                    outcome: None,
                    error: None,
                    skip_reason: Some("dependency failed".to_string()),
                },
            ],
            cancelled: false,
        };

        let rendered = render_report(&report);
        assert!(rendered.contains("✗ create dynamodb.table.users"));
        assert!(rendered.contains("- create lambda.function.api (dependency failed)"));
        assert!(rendered.contains("dynamodb.table.users: AccessDenied"));
        assert!(rendered.contains("Apply finished with errors. 0 applied, 1 failed, 1 skipped, 0 unchanged"));
    }

    #[test]
    fn refresh_summary() {
        plain();
        let report = RefreshReport {
            states: HashMap::from([(
                table_id(),
                State::existing(table_id(), HashMap::new()),
            )]),
            removed: vec![ResourceId::new("iam.role", "exec")],
            drifted: vec![table_id()],
        };
        let rendered = render_refresh(&report);
        assert!(rendered.contains("! iam.role.exec deleted outside Strata"));
        assert!(rendered.contains("Refreshed 2 resources: 1 removed, 1 drifted"));
    }

    #[test]
    fn state_list_marks_protected() {
        let mut state = StateFile::new();
        state.upsert_resource(
            ResourceState::new("dynamodb.table", "users", "local").with_protected(true),
        );
        assert_eq!(
            render_state_list(&state),
            "dynamodb.table.users\t- [protected]\n"
        );
    }
}
