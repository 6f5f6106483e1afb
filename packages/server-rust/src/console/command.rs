use std::fmt::Write as _;
use std::str::FromStr;

use serde_json::Value;

use super::ConsoleError;
use crate::service::domain::{LaddersService, RoomsService, ValidatorService, VerifierService};
use crate::service::ServiceContext;

pub const HELP: &str = "\
help              this text
status            health, sessions, config version, subsystems
config            the live config (secrets redacted)
reload            re-read the config file now
lockdown [reason] stop accepting sessions and drain
workers           worker pool states
crashes           recent crash reports";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Status,
    Config,
    Reload,
    Lockdown { reason: Option<String> },
    Workers,
    Crashes,
}

impl FromStr for Command {
    type Err = ConsoleError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        match word.to_ascii_lowercase().as_str() {
            "help" | "?" => Ok(Self::Help),
            "status" => Ok(Self::Status),
            "config" => Ok(Self::Config),
            "reload" => Ok(Self::Reload),
            "lockdown" => Ok(Self::Lockdown {
                reason: (!rest.is_empty()).then(|| rest.to_string()),
            }),
            "workers" => Ok(Self::Workers),
            "crashes" => Ok(Self::Crashes),
            _ => Err(ConsoleError::UnknownCommand(word.to_string())),
        }
    }
}

/// Runs one command and renders its reply. Replies may span lines.
pub async fn execute(command: &Command, ctx: &ServiceContext) -> String {
    match command {
        Command::Help => HELP.to_string(),
        Command::Status => status(ctx),
        Command::Config => redacted_config(ctx),
        Command::Reload => match ctx.reloader.reload_now().await {
            Ok(outcome) => format!("{outcome:?}"),
            Err(err) => format!("reload failed: {err}"),
        },
        Command::Lockdown { reason } => {
            let reason = reason.as_deref().unwrap_or("operator request");
            match ctx.services.get::<RoomsService>() {
                Some(rooms) if rooms.start_lockdown(reason) => "lockdown started".to_string(),
                Some(_) => "already in lockdown".to_string(),
                None => "rooms are not initialized".to_string(),
            }
        }
        Command::Workers => workers(ctx),
        Command::Crashes => crashes(ctx),
    }
}

fn status(ctx: &ServiceContext) -> String {
    let lockdown = &ctx.lockdown;
    let mut out = String::new();
    let _ = writeln!(out, "state: {}", lockdown.health_state().as_str());
    if let Some(reason) = lockdown.lockdown_reason() {
        let _ = writeln!(out, "lockdown reason: {reason}");
    }
    let _ = writeln!(out, "sessions: {}", lockdown.active_sessions());
    let _ = writeln!(out, "config version: {}", ctx.config.version());
    if let Some(backend) = ctx.services.get::<LaddersService>().and_then(|l| l.backend()) {
        let _ = writeln!(out, "ladders: {backend}");
    }
    let _ = write!(out, "subsystems: {}", ctx.services.init_order().join(", "));
    out
}

fn redacted_config(ctx: &ServiceContext) -> String {
    let config = ctx.config.current();
    let mut value = match serde_json::to_value(config.as_ref()) {
        Ok(value) => value,
        Err(err) => return format!("config cannot be rendered: {err}"),
    };
    if let Some(token) = value.get_mut("consoletoken") {
        if !token.is_null() {
            *token = Value::String("<redacted>".to_string());
        }
    }
    serde_json::to_string_pretty(&value).unwrap_or_else(|err| err.to_string())
}

fn workers(ctx: &ServiceContext) -> String {
    let pools = [
        ctx.services.get::<VerifierService>().and_then(|s| s.pool().cloned()),
        ctx.services.get::<ValidatorService>().and_then(|s| s.pool().cloned()),
    ];
    let lines: Vec<String> = pools
        .iter()
        .flatten()
        .map(|pool| {
            let states: Vec<&str> = pool.states().into_iter().map(|s| s.as_str()).collect();
            format!("{}: {} live [{}]", pool.name(), pool.live_count(), states.join(" "))
        })
        .collect();
    if lines.is_empty() {
        "no worker pools".to_string()
    } else {
        lines.join("\n")
    }
}

fn crashes(ctx: &ServiceContext) -> String {
    let Some(rooms) = ctx.services.get::<RoomsService>() else {
        return "rooms are not initialized".to_string();
    };
    let reports = rooms.recent_crashes();
    if reports.is_empty() {
        return "no crashes recorded".to_string();
    }
    reports
        .iter()
        .map(|r| format!("{} {} [{}] {}", r.timestamp_ms, r.id, r.origin.label(), r.message))
        .collect::<Vec<_>>()
        .join("\n")
}
