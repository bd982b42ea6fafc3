//! Plain-text rendering of daemon responses.

use chrono::{Local, TimeZone};
use tabflow_core::{
    CommandOutcome, Millis, Rule, RuleConflict, Settings, SoonTab, StashedTab, Trigger,
    TriggerKind,
};
use tabflow_protocol::ErrorInfo;

/// Compact countdown, e.g. `1h 05m`, `4m 10s`, `12s`.
pub fn format_remaining(ms: Millis) -> String {
    let total_secs = ms.max(0) / 1000;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{}h {:02}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

pub fn format_trigger(trigger: &Trigger) -> String {
    let kind = match trigger.kind {
        TriggerKind::Inactive => "inactive",
        TriggerKind::OpenDuration => "open",
    };
    if trigger.minutes >= 60 && trigger.minutes % 60 == 0 {
        format!("{} {}h", kind, trigger.minutes / 60)
    } else {
        format!("{} {}m", kind, trigger.minutes)
    }
}

fn format_time(ms: Millis) -> String {
    Local
        .timestamp_millis_opt(ms)
        .single()
        .map(|time| time.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ms.to_string())
}

pub fn rules(rules: &[Rule]) -> String {
    if rules.is_empty() {
        return "No rules.".to_string();
    }
    rules
        .iter()
        .map(|rule| {
            format!(
                "{}  {}  {}  [{}]  {}  closed {}",
                rule.id,
                if rule.enabled { "on " } else { "off" },
                rule.name,
                rule.domains.join(", "),
                format_trigger(&rule.trigger),
                rule.stats.triggered_count
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Newest first.
pub fn stash(items: &[StashedTab]) -> String {
    if items.is_empty() {
        return "Stash is empty.".to_string();
    }
    let mut items: Vec<&StashedTab> = items.iter().collect();
    items.sort_by(|a, b| b.closed_at.cmp(&a.closed_at));
    items
        .iter()
        .map(|item| {
            let title = if item.title.is_empty() {
                item.url.as_str()
            } else {
                item.title.as_str()
            };
            format!(
                "{}  {}  {}\n    {}  (by {}, expires {})",
                item.id,
                format_time(item.closed_at),
                title,
                item.url,
                item.closed_by,
                format_time(item.expires_at)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn soon(tabs: &[SoonTab]) -> String {
    if tabs.is_empty() {
        return "No tabs are counting down.".to_string();
    }
    tabs.iter()
        .map(|tab| {
            format!(
                "tab {}  in {}  ({})",
                tab.tab_id,
                format_remaining(tab.remaining_ms),
                tab.rule_name
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn settings(settings: &Settings) -> String {
    let protected = if settings.protected_domains.is_empty() {
        "none".to_string()
    } else {
        settings.protected_domains.join(", ")
    };
    format!(
        "stash expiry: {} days\nprotected: {}\nclosed since last check: {}",
        settings.stash_expiry_days, protected, settings.pending_clean_count
    )
}

pub fn outcome(outcome: &CommandOutcome) -> String {
    match outcome {
        CommandOutcome::RuleSaved { rule, registered } => format!(
            "Saved rule {} ({}), tracking {} tab(s)",
            rule.name, rule.id, registered
        ),
        CommandOutcome::RuleDeleted {
            removed,
            unregistered,
        } => {
            if *removed {
                format!("Deleted rule, released {} tab(s)", unregistered)
            } else {
                "No such rule".to_string()
            }
        }
        CommandOutcome::PresetApplied { created, skipped } => {
            let mut lines: Vec<String> = created
                .iter()
                .map(|rule| format!("Created {} ({})", rule.name, rule.id))
                .collect();
            if !skipped.is_empty() {
                lines.push(format!("Skipped (already covered): {}", skipped.join(", ")));
            }
            if lines.is_empty() {
                lines.push("Nothing to add".to_string());
            }
            lines.join("\n")
        }
        CommandOutcome::DomainProtected {
            domain,
            unregistered,
        } => format!("Protected {}, released {} tab(s)", domain, unregistered),
        CommandOutcome::DomainUnprotected { domain, registered } => {
            format!("Unprotected {}, tracking {} tab(s)", domain, registered)
        }
        CommandOutcome::Restored { count } => format!("Restored {} tab(s)", count),
        CommandOutcome::StashDeleted { count } => format!("Deleted {} stash item(s)", count),
        CommandOutcome::SettingsUpdated { settings: updated } => settings(updated),
    }
}

pub fn error(err: &ErrorInfo) -> String {
    if err.code == "rule_conflict" {
        let conflicts: Vec<RuleConflict> = err
            .details
            .clone()
            .and_then(|details| serde_json::from_value(details).ok())
            .unwrap_or_default();
        if !conflicts.is_empty() {
            let mut lines = vec!["Domains already covered by other rules:".to_string()];
            lines.extend(conflicts.iter().map(|conflict| {
                format!("  {} -> {} ({})", conflict.domain, conflict.rule_name, conflict.rule_id)
            }));
            lines.push("Re-run with --replace to move them to this rule.".to_string());
            return lines.join("\n");
        }
    }
    format!("{}: {}", err.code, err.message)
}
