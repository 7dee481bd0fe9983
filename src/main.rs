use clap::{CommandFactory, Parser};
use comfy_table::{Attribute, Cell, Color, Table, presets::UTF8_FULL_CONDENSED};
use gamehost::cli::{Cli, Command};
use gamehost::instance::{InstanceState, InstanceSummary};
use gamehost::protocol::{Request, Response};
use owo_colors::OwoColorize;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    if cli.daemon {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .init();
        let paths = gamehost::paths::Paths::new()?;
        gamehost::daemon::run(paths).await?;
    } else if let Some(command) = cli.command {
        let paths = gamehost::paths::Paths::new()?;
        let account = cli.as_account.unwrap_or_else(default_account);
        let request = command_to_request(command, account);

        let response = gamehost::client::send_request(&paths, &request)?;
        if cli.json {
            print_response_json(&response)?;
        } else {
            print_response(&response);
        }
        if matches!(response, Response::Error { .. }) {
            std::process::exit(1);
        }
    } else {
        Cli::command().print_help()?;
    }

    Ok(())
}

fn default_account() -> String {
    std::env::var("USER").unwrap_or_else(|_| "local".to_string())
}

fn command_to_request(command: Command, requester: String) -> Request {
    match command {
        Command::Host {
            options,
            port,
            recovering,
        } => Request::Host {
            owner: requester,
            options: Command::join_options(options),
            port,
            recovering,
        },
        Command::Kill { port } => Request::Kill { requester, port },
        Command::Killmine => Request::KillMine { requester },
        Command::List { owner } => Request::List { owner },
        Command::Send { port, command } => Request::Send {
            requester,
            port,
            command: Command::join_words(command),
        },
        Command::Sendall { command } => Request::SendAll {
            requester,
            command: Command::join_words(command),
        },
        Command::Broadcast { message } => Request::Broadcast {
            requester,
            message: Command::join_words(message),
        },
        Command::Killall => Request::KillAll { requester },
        Command::Killversion { version } => Request::KillVersion { requester, version },
        Command::Killinactive { days } => Request::KillInactive { requester, days },
        Command::Protect { port } => Request::Protect { requester, port },
        Command::Info { port } => Request::Info { requester, port },
        Command::Log { port, lines } => Request::Log {
            requester,
            port,
            lines,
        },
        Command::Query { port } => Request::Query { port },
        Command::Cleanup => Request::Cleanup { requester },
        Command::Accepting { state } => Request::Accepting {
            requester,
            enabled: state,
        },
        Command::Shutdown => Request::Shutdown,
    }
}

fn print_response_json(response: &Response) -> color_eyre::Result<()> {
    println!("{}", serde_json::to_string(response)?);
    Ok(())
}

fn state_color(state: InstanceState) -> Color {
    match state {
        InstanceState::Running => Color::Green,
        InstanceState::Launching => Color::Yellow,
        InstanceState::Stopped => Color::Red,
    }
}

fn print_servers(servers: &[InstanceSummary]) {
    if servers.is_empty() {
        println!("{}", "no servers running".yellow());
        return;
    }
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(
        ["port", "owner", "hostname", "version", "iwad", "state", "uptime", "restarts", "flags"]
            .map(|h| Cell::new(h).add_attribute(Attribute::Bold)),
    );
    for s in servers {
        let restarts = s.restarts.to_string();
        let restarts_cell = if s.restarts > 0 {
            Cell::new(&restarts).fg(Color::Yellow)
        } else {
            Cell::new(&restarts)
        };
        let mut flags = Vec::new();
        if s.protected {
            flags.push("protected");
        }
        if s.auto_restart {
            flags.push("autorestart");
        }
        table.add_row(vec![
            Cell::new(s.port).fg(Color::Cyan),
            Cell::new(&s.owner),
            Cell::new(&s.hostname),
            Cell::new(&s.version).fg(Color::Magenta),
            Cell::new(&s.iwad),
            Cell::new(s.state.to_string()).fg(state_color(s.state)),
            Cell::new(format_uptime(s.uptime)),
            restarts_cell,
            Cell::new(flags.join(",")),
        ]);
    }
    println!("{table}");
}

fn print_response(response: &Response) {
    match response {
        Response::Success { message } => {
            if let Some(msg) = message {
                println!("{}", msg.green());
            } else {
                println!("{}", "ok".green());
            }
        }
        Response::Error { message } => {
            eprintln!("{} {}", "error:".red().bold(), message);
        }
        Response::Hosted { server } => {
            println!(
                "{} {} on port {}",
                "launching".green(),
                server.hostname.cyan().bold(),
                server.port
            );
            println!("  {} {}", "id:".dimmed(), server.id);
        }
        Response::ServerList { servers } => print_servers(servers),
        Response::ServerInfo { info } => {
            println!("{}: {}", "port".cyan().bold(), info.port);
            println!("  {} {}", "id:".dimmed(), info.id);
            println!("  {} {}", "rcon password:".dimmed(), info.rcon_password);
            println!("  {} {}", "join password:".dimmed(), info.join_password);
            println!("  {} {}", "connect password:".dimmed(), info.connect_password);
            println!("  {} {}", "log:".dimmed(), info.log_path);
        }
        Response::LogLines { port, lines } => {
            let tag = format!("[{port}]");
            for line in lines {
                println!("{} {line}", tag.cyan().bold());
            }
        }
        Response::QueryResult { report } => {
            print_servers(std::slice::from_ref(&report.summary));
            for line in &report.recent {
                println!("  {}", line.dimmed());
            }
        }
    }
}

fn format_uptime(s: u64) -> String {
    match s {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m {}s", s / 60, s % 60),
        s if s < 86400 => format!("{}h {}m", s / 3600, (s % 3600) / 60),
        s => format!("{}d {}h", s / 86400, (s % 86400) / 3600),
    }
}
