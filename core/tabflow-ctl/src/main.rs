//! tabflow-ctl: command-line client for the TabFlow daemon.
//!
//! Manages rules, protected domains and the stash over the daemon socket
//! (`~/.tabflow/daemon.sock`, or `TABFLOW_SOCKET`).
//!
//! ## Subcommands
//!
//! - `rules`, `add-rule`, `edit-rule`, `delete-rule`, `enable`, `disable`, `duplicate`
//! - `presets`, `preset`: built-in rule bundles
//! - `protect`, `unprotect`: domains no rule may close
//! - `stash`, `undo`, `restore`, `delete-stash`: closed tabs
//! - `soon`, `settings`, `ack`, `health`, `runtime`, `changes`

mod daemon_client;
mod render;

use clap::{Args, Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tabflow_core::{
    Command, CommandOutcome, Rule, RuleDraft, Settings, SoonTab, StashedTab, Trigger, PRESETS,
};
use tabflow_protocol::{ErrorInfo, Method};
use tracing_subscriber::EnvFilter;

use daemon_client::DaemonClient;

#[derive(Parser)]
#[command(name = "tabflow-ctl")]
#[command(about = "Manage TabFlow auto-close rules and the tab stash")]
#[command(version)]
struct Cli {
    /// Print raw JSON responses
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone, Copy)]
#[group(required = true, multiple = false)]
struct TriggerArgs {
    /// Close after this many minutes without being viewed
    #[arg(long, value_name = "MINUTES")]
    inactive: Option<u32>,

    /// Close this many minutes after the tab starts matching
    #[arg(long, value_name = "MINUTES")]
    open: Option<u32>,
}

impl TriggerArgs {
    fn trigger(self) -> Trigger {
        match (self.inactive, self.open) {
            (Some(minutes), _) => Trigger::inactive(minutes),
            (None, Some(minutes)) => Trigger::open_duration(minutes),
            (None, None) => Trigger::inactive(0),
        }
    }
}

#[derive(Args, Debug, Clone)]
struct RuleArgs {
    /// Domains the rule applies to (subdomains included)
    #[arg(value_name = "DOMAIN", required = true)]
    domains: Vec<String>,

    #[command(flatten)]
    trigger: TriggerArgs,

    /// Rule name (generated from the first domain when omitted)
    #[arg(long)]
    name: Option<String>,

    /// Save the rule disabled
    #[arg(long)]
    disabled: bool,

    /// Take over domains already covered by other rules
    #[arg(long)]
    replace: bool,
}

impl RuleArgs {
    fn draft(&self) -> RuleDraft {
        RuleDraft {
            name: self.name.clone(),
            domains: self.domains.clone(),
            trigger: self.trigger.trigger(),
            enabled: self.disabled.then_some(false),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check that the daemon is running
    Health,

    /// List rules
    Rules,

    /// Create a rule
    AddRule(RuleArgs),

    /// Replace a rule's domains, trigger and name
    EditRule {
        #[arg(value_name = "RULE_ID")]
        rule_id: String,

        #[command(flatten)]
        rule: RuleArgs,
    },

    /// Delete a rule and release the tabs it was tracking
    DeleteRule {
        #[arg(value_name = "RULE_ID")]
        rule_id: String,
    },

    /// Enable a rule
    Enable {
        #[arg(value_name = "RULE_ID")]
        rule_id: String,

        /// Take over domains already covered by other rules
        #[arg(long)]
        replace: bool,
    },

    /// Disable a rule
    Disable {
        #[arg(value_name = "RULE_ID")]
        rule_id: String,
    },

    /// Copy a rule (the copy starts disabled)
    Duplicate {
        #[arg(value_name = "RULE_ID")]
        rule_id: String,
    },

    /// List built-in presets
    Presets,

    /// Create rules from a built-in preset
    Preset {
        /// Preset key or name
        #[arg(value_name = "PRESET")]
        preset: String,
    },

    /// Never auto-close tabs on a domain
    Protect {
        #[arg(value_name = "DOMAIN")]
        domain: String,
    },

    /// Remove a domain from the protected list
    Unprotect {
        #[arg(value_name = "DOMAIN")]
        domain: String,
    },

    /// Reopen the most recent group of auto-closed tabs
    Undo,

    /// List stashed tabs
    Stash,

    /// Reopen stashed tabs
    Restore {
        #[arg(value_name = "STASH_ID", required_unless_present = "all")]
        stash_ids: Vec<String>,

        /// Restore every stashed tab
        #[arg(long, conflicts_with = "stash_ids")]
        all: bool,
    },

    /// Delete stashed tabs without reopening them
    DeleteStash {
        #[arg(value_name = "STASH_ID", required = true)]
        stash_ids: Vec<String>,
    },

    /// Tabs that are counting down, soonest first
    Soon,

    /// Show settings, or change them
    Settings {
        /// Days a stashed tab is kept
        #[arg(long, value_name = "DAYS")]
        stash_expiry_days: Option<u32>,
    },

    /// Reset the "closed since last check" counter
    Ack,

    /// Dump the runtime state
    Runtime,

    /// Keys changed after a revision
    Changes {
        #[arg(long, default_value_t = 0)]
        since: i64,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(output) => println!("{}", output),
        Err(err) => {
            eprintln!("{}", render::error(&err));
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<String, ErrorInfo> {
    if let Commands::Presets = cli.command {
        return Ok(presets());
    }

    let client = DaemonClient::from_env()?;

    if let Some(command) = command_for(&cli.command) {
        return send_command(&client, command, cli.json);
    }

    match cli.command {
        Commands::Restore { all: true, .. } => {
            let stash: Vec<StashedTab> = decode(client.call(Method::GetStash, None)?)?;
            let stash_ids = stash.into_iter().map(|item| item.id).collect();
            send_command(&client, Command::RestoreAll { stash_ids }, cli.json)
        }
        Commands::Health => {
            let data = client.call(Method::GetHealth, None)?;
            if cli.json {
                return pretty(&data);
            }
            Ok(format!(
                "status: {}\npid: {}\nversion: {}\ntabs: {}\ntimers: {}",
                data["status"].as_str().unwrap_or("unknown"),
                data["pid"],
                data["version"].as_str().unwrap_or("unknown"),
                data["tabs"],
                data["timers"]
            ))
        }
        Commands::Rules => {
            let data = client.call(Method::GetRules, None)?;
            if cli.json {
                return pretty(&data);
            }
            let rules: Vec<Rule> = decode(data)?;
            Ok(render::rules(&rules))
        }
        Commands::Stash => {
            let data = client.call(Method::GetStash, None)?;
            if cli.json {
                return pretty(&data);
            }
            let items: Vec<StashedTab> = decode(data)?;
            Ok(render::stash(&items))
        }
        Commands::Soon => {
            let data = client.call(Method::GetSoonTabs, None)?;
            if cli.json {
                return pretty(&data);
            }
            let tabs: Vec<SoonTab> = decode(data)?;
            Ok(render::soon(&tabs))
        }
        Commands::Settings { .. } => {
            let data = client.call(Method::GetSettings, None)?;
            if cli.json {
                return pretty(&data);
            }
            let settings: Settings = decode(data)?;
            Ok(render::settings(&settings))
        }
        Commands::Runtime => pretty(&client.call(Method::GetRuntime, None)?),
        Commands::Changes { since } => pretty(&client.call(
            Method::GetChanges,
            Some(serde_json::json!({ "since": since })),
        )?),
        _ => Err(ErrorInfo::new("client_error", "unsupported subcommand")),
    }
}

/// The engine command a subcommand maps to, if it is a mutation.
fn command_for(command: &Commands) -> Option<Command> {
    let command = match command {
        Commands::AddRule(rule) => Command::CreateRule {
            rule: rule.draft(),
            replace: rule.replace,
        },
        Commands::EditRule { rule_id, rule } => Command::UpdateRule {
            rule_id: rule_id.clone(),
            rule: rule.draft(),
            replace: rule.replace,
        },
        Commands::DeleteRule { rule_id } => Command::DeleteRule {
            rule_id: rule_id.clone(),
        },
        Commands::Enable { rule_id, replace } => Command::SetRuleEnabled {
            rule_id: rule_id.clone(),
            enabled: true,
            replace: *replace,
        },
        Commands::Disable { rule_id } => Command::SetRuleEnabled {
            rule_id: rule_id.clone(),
            enabled: false,
            replace: false,
        },
        Commands::Duplicate { rule_id } => Command::DuplicateRule {
            rule_id: rule_id.clone(),
        },
        Commands::Preset { preset } => Command::ApplyPreset {
            preset: preset.clone(),
        },
        Commands::Protect { domain } => Command::ProtectDomain {
            domain: domain.clone(),
        },
        Commands::Unprotect { domain } => Command::UnprotectDomain {
            domain: domain.clone(),
        },
        Commands::Undo => Command::Undo,
        Commands::Restore {
            stash_ids,
            all: false,
        } => match stash_ids.as_slice() {
            [single] => Command::Restore {
                stash_id: single.clone(),
            },
            _ => Command::RestoreAll {
                stash_ids: stash_ids.clone(),
            },
        },
        Commands::DeleteStash { stash_ids } => Command::DeleteStash {
            stash_ids: stash_ids.clone(),
        },
        Commands::Settings {
            stash_expiry_days: Some(days),
        } => Command::UpdateSettings {
            stash_expiry_days: Some(*days),
        },
        Commands::Ack => Command::AcknowledgeCleaned,
        _ => return None,
    };
    Some(command)
}

fn send_command(client: &DaemonClient, command: Command, json: bool) -> Result<String, ErrorInfo> {
    let params = serde_json::to_value(&command)
        .map_err(|err| ErrorInfo::new("client_error", format!("Failed to encode command: {}", err)))?;
    let data = client.call(Method::Command, Some(params))?;
    if json {
        return pretty(&data);
    }
    let outcome: CommandOutcome = decode(data)?;
    Ok(render::outcome(&outcome))
}

fn presets() -> String {
    PRESETS
        .iter()
        .map(|preset| {
            format!(
                "{}  {}  [{}]  {}",
                preset.key,
                preset.name,
                preset.domains.join(", "),
                render::format_trigger(&preset.trigger)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn decode<T: DeserializeOwned>(data: Value) -> Result<T, ErrorInfo> {
    serde_json::from_value(data).map_err(|err| {
        ErrorInfo::new(
            "client_error",
            format!("Unexpected daemon response: {}", err),
        )
    })
}

fn pretty(data: &Value) -> Result<String, ErrorInfo> {
    serde_json::to_string_pretty(data)
        .map_err(|err| ErrorInfo::new("client_error", format!("Failed to format JSON: {}", err)))
}
