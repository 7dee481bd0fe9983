use crate::instance::ServerInstance;
use std::sync::Arc;

/// Commands whose arguments would make every server identical or touch the
/// host filesystem when sent to all servers at once.
pub const SEND_ALL_DENYLIST: &[&str] = &["sv_hostname", "sv_website", "logfile"];

/// Commands whose argument is free text and gets quoted.
const QUOTED_ARG_COMMANDS: &[&str] = &["sv_hostname", "echo", "say"];

const BRAND_TOKEN: &str = "$brand";

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no command given")]
    Empty,
    #[error("`{0}` cannot be sent to every server")]
    Denied(String),
    #[error("could not write to the server console: {0}")]
    Io(#[from] std::io::Error),
}

/// Prefix every double quote with a backslash so user text cannot close the
/// console string it is embedded in.
pub fn escape_quotes(text: &str) -> String {
    text.replace('"', "\\\"")
}

/// Split `raw` into command name and argument text. Only the first
/// `;`-separated segment of the first line is kept.
pub fn split_command(raw: &str) -> Option<(String, String)> {
    let segment = raw.split(['\n', '\r', ';']).next().unwrap_or_default();
    let segment = segment.trim_start();
    if segment.trim().is_empty() {
        return None;
    }
    match segment.split_once(char::is_whitespace) {
        Some((cmd, args)) => Some((cmd.to_string(), args.trim().to_string())),
        None => Some((segment.trim_end().to_string(), String::new())),
    }
}

/// Console lines for one RCON-style command: an echo naming the sender,
/// then the command itself. `brand` replaces `$brand` in `sv_hostname`.
pub fn prepare_command(
    raw: &str,
    who: &str,
    brand: Option<&str>,
) -> Result<Vec<String>, DispatchError> {
    let (cmd, mut args) = split_command(raw).ok_or(DispatchError::Empty)?;

    if QUOTED_ARG_COMMANDS.contains(&cmd.to_lowercase().as_str()) && !args.is_empty() {
        if cmd.eq_ignore_ascii_case("sv_hostname")
            && let Some(brand) = brand
        {
            args = args.replace(BRAND_TOKEN, brand);
        }
        args = format!("\"{}\"", escape_quotes(&args));
    }

    let shown = if args.is_empty() {
        cmd.clone()
    } else {
        format!("{cmd} {}", escape_quotes(&args))
    };
    let echo = format!("echo \"-> {shown} (RCON by {})\";", escape_quotes(who));
    let command = if args.is_empty() {
        format!("{cmd};")
    } else {
        format!("{cmd} {args};")
    };
    Ok(vec![echo, command])
}

async fn write_all_lines(instance: &ServerInstance, lines: &[String]) -> std::io::Result<()> {
    for line in lines {
        instance.write_line(line).await?;
    }
    Ok(())
}

/// Send one command to one server.
pub async fn send(
    instance: &ServerInstance,
    raw: &str,
    who: &str,
    brand: &str,
) -> Result<(), DispatchError> {
    let lines = prepare_command(raw, who, Some(brand))?;
    write_all_lines(instance, &lines).await?;
    tracing::info!(port = instance.port(), %who, command = %lines[1], "sent command");
    Ok(())
}

/// Send one command to every server in `instances`. Returns how many
/// servers accepted it.
pub async fn send_all(
    instances: &[Arc<ServerInstance>],
    raw: &str,
    who: &str,
) -> Result<usize, DispatchError> {
    let (cmd, args) = split_command(raw).ok_or(DispatchError::Empty)?;
    if !args.is_empty() && SEND_ALL_DENYLIST.contains(&cmd.to_lowercase().as_str()) {
        return Err(DispatchError::Denied(cmd));
    }
    let lines = prepare_command(raw, who, None)?;

    let mut sent = 0;
    for instance in instances {
        match write_all_lines(instance, &lines).await {
            Ok(()) => sent += 1,
            Err(e) => tracing::warn!(port = instance.port(), error = %e, "send_all skipped server"),
        }
    }
    Ok(sent)
}

pub fn broadcast_lines(message: &str) -> Vec<String> {
    vec![
        "say \"\\cf--------------\\cc\";".to_string(),
        format!("say \"GLOBAL ANNOUNCEMENT: {}\";", escape_quotes(message)),
        "say \"\\cf--------------\\cc\";".to_string(),
    ]
}

/// Permanent ban pushed to a server when a globally banned player joins.
pub fn ban_command(ip: &str, service_short: &str, reason: &str) -> String {
    format!(
        "addban {ip} perm \"\\ciBanned from all {service_short} servers: {}\";",
        escape_quotes(reason)
    )
}

pub fn proxy_ban_command(ip: &str, service_short: &str) -> String {
    format!(
        "addban {ip} 10minute \"\\ciProxy connections are not allowed on {service_short} servers.\";"
    )
}

/// Announce `message` on every server. Returns how many received it.
pub async fn broadcast(instances: &[Arc<ServerInstance>], message: &str) -> usize {
    let first_line = message.lines().next().unwrap_or_default();
    let lines = broadcast_lines(first_line);
    let mut sent = 0;
    for instance in instances {
        match write_all_lines(instance, &lines).await {
            Ok(()) => sent += 1,
            Err(e) => tracing::warn!(port = instance.port(), error = %e, "broadcast skipped server"),
        }
    }
    sent
}
