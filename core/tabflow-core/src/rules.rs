//! Commands issued by the UI layer: rule management, protected domains,
//! undo/restore, and settings.
//!
//! Every command runs against one [`Snapshot`] and keeps the scheduler
//! invariant intact: removing or narrowing a rule cancels the timers it owned,
//! and adding or widening one registers the tabs it now covers.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::info;
use ulid::Ulid;

use crate::domain::{domains_overlap, find_conflicts, match_domain, normalize_domain};
use crate::error::{Result, TabflowError};
use crate::host::{Effects, TabInventory};
use crate::scheduler::{rebuild_all, rebuild_for_rule, unregister, unregister_rule};
use crate::stash;
use crate::store::Snapshot;
use crate::types::{Millis, Rule, RuleAction, RuleSource, RuleStats, Settings, Trigger, TriggerKind};

/// Rule fields supplied by the caller. Domains are normalized on save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub domains: Vec<String>,
    pub trigger: Trigger,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    CreateRule {
        rule: RuleDraft,
        #[serde(default)]
        replace: bool,
    },
    UpdateRule {
        rule_id: String,
        rule: RuleDraft,
        #[serde(default)]
        replace: bool,
    },
    DeleteRule {
        rule_id: String,
    },
    SetRuleEnabled {
        rule_id: String,
        enabled: bool,
        #[serde(default)]
        replace: bool,
    },
    DuplicateRule {
        rule_id: String,
    },
    ApplyPreset {
        preset: String,
    },
    ProtectDomain {
        domain: String,
    },
    UnprotectDomain {
        domain: String,
    },
    Undo,
    Restore {
        stash_id: String,
    },
    RestoreAll {
        stash_ids: Vec<String>,
    },
    DeleteStash {
        stash_ids: Vec<String>,
    },
    AcknowledgeCleaned,
    UpdateSettings {
        #[serde(default)]
        stash_expiry_days: Option<u32>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    RuleSaved { rule: Rule, registered: usize },
    RuleDeleted { removed: bool, unregistered: usize },
    PresetApplied { created: Vec<Rule>, skipped: Vec<String> },
    DomainProtected { domain: String, unregistered: usize },
    DomainUnprotected { domain: String, registered: usize },
    Restored { count: usize },
    StashDeleted { count: usize },
    SettingsUpdated { settings: Settings },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Presets
// ═══════════════════════════════════════════════════════════════════════════════

pub struct Preset {
    pub key: &'static str,
    pub name: &'static str,
    pub domains: &'static [&'static str],
    pub trigger: Trigger,
}

pub const PRESETS: &[Preset] = &[
    Preset {
        key: "social",
        name: "Social Media",
        domains: &["x.com", "twitter.com", "reddit.com", "instagram.com", "weibo.com"],
        trigger: Trigger {
            kind: TriggerKind::Inactive,
            minutes: 30,
        },
    },
    Preset {
        key: "video",
        name: "Video",
        domains: &["youtube.com", "bilibili.com"],
        trigger: Trigger {
            kind: TriggerKind::OpenDuration,
            minutes: 60,
        },
    },
    Preset {
        key: "shopping",
        name: "Shopping",
        domains: &["amazon.com", "taobao.com", "jd.com"],
        trigger: Trigger {
            kind: TriggerKind::Inactive,
            minutes: 20,
        },
    },
];

pub fn find_preset(key: &str) -> Option<&'static Preset> {
    let key = key.trim();
    PRESETS
        .iter()
        .find(|preset| preset.key.eq_ignore_ascii_case(key) || preset.name.eq_ignore_ascii_case(key))
}

/// `x.com · 30min`, `youtube.com · 1hr`, `x.com +2 · 30min`.
pub fn generate_rule_name(domains: &[String], minutes: u32) -> String {
    let first = domains.first().map(String::as_str).unwrap_or("rule");
    let extra = if domains.len() > 1 {
        format!(" +{}", domains.len() - 1)
    } else {
        String::new()
    };
    let duration = if minutes >= 60 && minutes % 60 == 0 {
        format!("{}hr", minutes / 60)
    } else {
        format!("{}min", minutes)
    };
    format!("{}{} · {}", first, extra, duration)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Dispatch
// ═══════════════════════════════════════════════════════════════════════════════

pub fn apply_command(
    snapshot: &mut Snapshot,
    effects: &mut Effects,
    tabs: &dyn TabInventory,
    now: Millis,
    command: Command,
) -> Result<CommandOutcome> {
    match command {
        Command::CreateRule { rule, replace } => create_rule(snapshot, effects, tabs, now, rule, replace),
        Command::UpdateRule {
            rule_id,
            rule,
            replace,
        } => update_rule(snapshot, effects, tabs, now, &rule_id, rule, replace),
        Command::DeleteRule { rule_id } => Ok(delete_rule(snapshot, effects, &rule_id)),
        Command::SetRuleEnabled {
            rule_id,
            enabled,
            replace,
        } => set_rule_enabled(snapshot, effects, tabs, now, &rule_id, enabled, replace),
        Command::DuplicateRule { rule_id } => duplicate_rule(snapshot, now, &rule_id),
        Command::ApplyPreset { preset } => apply_preset(snapshot, effects, tabs, now, &preset),
        Command::ProtectDomain { domain } => protect_domain(snapshot, effects, tabs, &domain),
        Command::UnprotectDomain { domain } => unprotect_domain(snapshot, effects, tabs, now, &domain),
        Command::Undo => Ok(CommandOutcome::Restored {
            count: stash::undo(snapshot, effects),
        }),
        Command::Restore { stash_id } => Ok(CommandOutcome::Restored {
            count: stash::restore(snapshot, effects, &[stash_id]),
        }),
        Command::RestoreAll { stash_ids } => Ok(CommandOutcome::Restored {
            count: stash::restore(snapshot, effects, &stash_ids),
        }),
        Command::DeleteStash { stash_ids } => Ok(CommandOutcome::StashDeleted {
            count: stash::delete(&mut snapshot.stash, &stash_ids),
        }),
        Command::AcknowledgeCleaned => {
            snapshot.settings.pending_clean_count = 0;
            Ok(CommandOutcome::SettingsUpdated {
                settings: snapshot.settings.clone(),
            })
        }
        Command::UpdateSettings { stash_expiry_days } => {
            if let Some(days) = stash_expiry_days {
                if days == 0 {
                    return Err(TabflowError::InvalidSettings(
                        "stash_expiry_days must be at least 1".to_string(),
                    ));
                }
                snapshot.settings.stash_expiry_days = days;
            }
            Ok(CommandOutcome::SettingsUpdated {
                settings: snapshot.settings.clone(),
            })
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Rules
// ═══════════════════════════════════════════════════════════════════════════════

fn create_rule(
    snapshot: &mut Snapshot,
    effects: &mut Effects,
    tabs: &dyn TabInventory,
    now: Millis,
    draft: RuleDraft,
    replace: bool,
) -> Result<CommandOutcome> {
    let domains = validate_draft(&draft)?;
    let enabled = draft.enabled.unwrap_or(true);
    if enabled {
        resolve_conflicts(snapshot, effects, tabs, now, &domains, None, replace)?;
    }

    let rule = Rule {
        id: Ulid::new().to_string(),
        name: rule_name(draft.name, &domains, draft.trigger.minutes),
        enabled,
        domains,
        trigger: draft.trigger,
        action: RuleAction::CloseStash,
        source: RuleSource::Manual,
        stats: RuleStats::default(),
        created_at: now,
        updated_at: now,
    };
    snapshot.rules.push(rule.clone());
    let registered = rebuild_for_rule(
        &mut snapshot.runtime,
        effects,
        &rule,
        &snapshot.settings.protected_domains,
        tabs,
        now,
    );
    info!(rule_id = %rule.id, name = %rule.name, registered, "Rule created");
    Ok(CommandOutcome::RuleSaved { rule, registered })
}

fn update_rule(
    snapshot: &mut Snapshot,
    effects: &mut Effects,
    tabs: &dyn TabInventory,
    now: Millis,
    rule_id: &str,
    draft: RuleDraft,
    replace: bool,
) -> Result<CommandOutcome> {
    let existing = snapshot
        .rule(rule_id)
        .cloned()
        .ok_or_else(|| TabflowError::RuleNotFound(rule_id.to_string()))?;
    let domains = validate_draft(&draft)?;
    let enabled = draft.enabled.unwrap_or(existing.enabled);
    if enabled {
        resolve_conflicts(snapshot, effects, tabs, now, &domains, Some(rule_id), replace)?;
    }

    // Domains or trigger may have changed; restart from a clean slate.
    unregister_rule(&mut snapshot.runtime, effects, rule_id);
    let rule = Rule {
        name: rule_name(draft.name, &domains, draft.trigger.minutes),
        enabled,
        domains,
        trigger: draft.trigger,
        updated_at: now,
        ..existing
    };
    if let Some(slot) = snapshot.rules.iter_mut().find(|slot| slot.id == rule_id) {
        *slot = rule.clone();
    }

    let registered = rebuild_for_rule(
        &mut snapshot.runtime,
        effects,
        &rule,
        &snapshot.settings.protected_domains,
        tabs,
        now,
    );
    info!(rule_id = %rule.id, registered, "Rule updated");
    Ok(CommandOutcome::RuleSaved { rule, registered })
}

fn delete_rule(snapshot: &mut Snapshot, effects: &mut Effects, rule_id: &str) -> CommandOutcome {
    let before = snapshot.rules.len();
    snapshot.rules.retain(|rule| rule.id != rule_id);
    let removed = snapshot.rules.len() != before;
    let unregistered = unregister_rule(&mut snapshot.runtime, effects, rule_id);
    if removed {
        info!(rule_id, unregistered, "Rule deleted");
    }
    CommandOutcome::RuleDeleted {
        removed,
        unregistered,
    }
}

fn set_rule_enabled(
    snapshot: &mut Snapshot,
    effects: &mut Effects,
    tabs: &dyn TabInventory,
    now: Millis,
    rule_id: &str,
    enabled: bool,
    replace: bool,
) -> Result<CommandOutcome> {
    let domains = snapshot
        .rule(rule_id)
        .map(|rule| rule.domains.clone())
        .ok_or_else(|| TabflowError::RuleNotFound(rule_id.to_string()))?;
    if enabled {
        resolve_conflicts(snapshot, effects, tabs, now, &domains, Some(rule_id), replace)?;
    }

    let rule = snapshot
        .rules
        .iter_mut()
        .find(|rule| rule.id == rule_id)
        .ok_or_else(|| TabflowError::RuleNotFound(rule_id.to_string()))?;
    rule.enabled = enabled;
    rule.updated_at = now;
    let rule = rule.clone();

    let registered = if enabled {
        rebuild_for_rule(
            &mut snapshot.runtime,
            effects,
            &rule,
            &snapshot.settings.protected_domains,
            tabs,
            now,
        )
    } else {
        unregister_rule(&mut snapshot.runtime, effects, rule_id);
        0
    };
    info!(rule_id, enabled, registered, "Rule toggled");
    Ok(CommandOutcome::RuleSaved { rule, registered })
}

fn duplicate_rule(snapshot: &mut Snapshot, now: Millis, rule_id: &str) -> Result<CommandOutcome> {
    let original = snapshot
        .rule(rule_id)
        .ok_or_else(|| TabflowError::RuleNotFound(rule_id.to_string()))?;
    let copy = Rule {
        id: Ulid::new().to_string(),
        name: format!("{} (copy)", original.name),
        enabled: false,
        stats: RuleStats::default(),
        created_at: now,
        updated_at: now,
        ..original.clone()
    };
    snapshot.rules.push(copy.clone());
    Ok(CommandOutcome::RuleSaved {
        rule: copy,
        registered: 0,
    })
}

fn apply_preset(
    snapshot: &mut Snapshot,
    effects: &mut Effects,
    tabs: &dyn TabInventory,
    now: Millis,
    key: &str,
) -> Result<CommandOutcome> {
    let preset = find_preset(key).ok_or_else(|| TabflowError::UnknownPreset(key.to_string()))?;
    let mut created = Vec::new();
    let mut skipped = Vec::new();

    for domain in preset.domains {
        let domains = vec![(*domain).to_string()];
        if !find_conflicts(&domains, &snapshot.rules, None).is_empty() {
            skipped.push((*domain).to_string());
            continue;
        }
        let rule = Rule {
            id: Ulid::new().to_string(),
            name: generate_rule_name(&domains, preset.trigger.minutes),
            enabled: true,
            domains,
            trigger: preset.trigger,
            action: RuleAction::CloseStash,
            source: RuleSource::Template,
            stats: RuleStats::default(),
            created_at: now,
            updated_at: now,
        };
        snapshot.rules.push(rule.clone());
        rebuild_for_rule(
            &mut snapshot.runtime,
            effects,
            &rule,
            &snapshot.settings.protected_domains,
            tabs,
            now,
        );
        created.push(rule);
    }

    info!(
        preset = preset.name,
        created = created.len(),
        skipped = skipped.len(),
        "Preset applied"
    );
    Ok(CommandOutcome::PresetApplied { created, skipped })
}

/// Normalized, de-duplicated domains of a draft, or why it cannot be saved.
fn validate_draft(draft: &RuleDraft) -> Result<Vec<String>> {
    let mut domains: Vec<String> = Vec::new();
    for domain in draft.domains.iter().map(|domain| normalize_domain(domain)) {
        if !domain.is_empty() && !domains.contains(&domain) {
            domains.push(domain);
        }
    }
    if domains.is_empty() {
        return Err(TabflowError::InvalidRule(
            "a rule needs at least one domain".to_string(),
        ));
    }
    if draft.trigger.minutes == 0 {
        return Err(TabflowError::InvalidRule(
            "trigger minutes must be at least 1".to_string(),
        ));
    }
    Ok(domains)
}

fn rule_name(requested: Option<String>, domains: &[String], minutes: u32) -> String {
    requested
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| generate_rule_name(domains, minutes))
}

/// Rejects the save on overlap, unless `replace` is set: then the overlapping
/// domains are taken away from the other rules, and rules left empty are deleted.
fn resolve_conflicts(
    snapshot: &mut Snapshot,
    effects: &mut Effects,
    tabs: &dyn TabInventory,
    now: Millis,
    domains: &[String],
    exclude_rule_id: Option<&str>,
    replace: bool,
) -> Result<()> {
    let conflicts = find_conflicts(domains, &snapshot.rules, exclude_rule_id);
    if conflicts.is_empty() {
        return Ok(());
    }
    if !replace {
        return Err(TabflowError::RuleConflict { conflicts });
    }

    let affected: BTreeSet<String> = conflicts.into_iter().map(|c| c.rule_id).collect();
    for rule_id in &affected {
        unregister_rule(&mut snapshot.runtime, effects, rule_id);
        if let Some(rule) = snapshot.rules.iter_mut().find(|rule| &rule.id == rule_id) {
            rule.domains
                .retain(|existing| !domains.iter().any(|domain| domains_overlap(domain, existing)));
            rule.updated_at = now;
        }
    }
    snapshot
        .rules
        .retain(|rule| !(affected.contains(&rule.id) && rule.domains.is_empty()));

    for rule_id in &affected {
        let Some(rule) = snapshot.rule(rule_id).cloned() else {
            info!(rule_id = %rule_id, "Rule removed by replacement");
            continue;
        };
        rebuild_for_rule(
            &mut snapshot.runtime,
            effects,
            &rule,
            &snapshot.settings.protected_domains,
            tabs,
            now,
        );
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Protected domains
// ═══════════════════════════════════════════════════════════════════════════════

fn protect_domain(
    snapshot: &mut Snapshot,
    effects: &mut Effects,
    tabs: &dyn TabInventory,
    input: &str,
) -> Result<CommandOutcome> {
    let domain = normalize_domain(input);
    if domain.is_empty() {
        return Err(TabflowError::InvalidDomain(input.to_string()));
    }
    if !snapshot.settings.protected_domains.contains(&domain) {
        snapshot.settings.protected_domains.push(domain.clone());
    }

    let mut unregistered = 0;
    for tab in tabs.all_tabs() {
        let covered = tab
            .url
            .as_deref()
            .map(|url| match_domain(url, &domain))
            .unwrap_or(false);
        if covered && unregister(&mut snapshot.runtime, effects, tab.id).is_some() {
            unregistered += 1;
        }
    }
    info!(domain = %domain, unregistered, "Domain protected");
    Ok(CommandOutcome::DomainProtected {
        domain,
        unregistered,
    })
}

fn unprotect_domain(
    snapshot: &mut Snapshot,
    effects: &mut Effects,
    tabs: &dyn TabInventory,
    now: Millis,
    input: &str,
) -> Result<CommandOutcome> {
    let domain = normalize_domain(input);
    if domain.is_empty() {
        return Err(TabflowError::InvalidDomain(input.to_string()));
    }
    snapshot
        .settings
        .protected_domains
        .retain(|existing| existing != &domain);

    let registered = rebuild_all(
        &mut snapshot.runtime,
        effects,
        &snapshot.rules,
        &snapshot.settings.protected_domains,
        tabs,
        now,
    );
    info!(domain = %domain, registered, "Domain unprotected");
    Ok(CommandOutcome::DomainUnprotected { domain, registered })
}
