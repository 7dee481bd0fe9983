use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "gamehost", about = "Game server hosting daemon", version)]
pub struct Cli {
    #[arg(long, hide = true)]
    pub daemon: bool,

    #[arg(long, global = true)]
    pub json: bool,

    /// Account to act as (defaults to $USER)
    #[arg(long = "as", global = true, value_name = "ACCOUNT")]
    pub as_account: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Host a new server from key=value options
    Host {
        /// e.g. iwad=doom2 hostname="My Server" wad=x.wad
        #[arg(required = true, num_args = 1..)]
        options: Vec<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Relaunch a saved server without owner notices
        #[arg(long)]
        recovering: bool,
    },
    /// Kill the server on a port
    Kill { port: u16 },
    /// Kill every server you own
    Killmine,
    /// List running servers
    #[command(visible_alias = "ls")]
    List {
        /// Only servers owned by this account
        #[arg(long)]
        owner: Option<String>,
    },
    /// Send a console command to one server
    Send {
        port: u16,
        #[arg(required = true, num_args = 1..)]
        command: Vec<String>,
    },
    /// Send a console command to every server
    Sendall {
        #[arg(required = true, num_args = 1..)]
        command: Vec<String>,
    },
    /// Announce a message on every server
    Broadcast {
        #[arg(required = true, num_args = 1..)]
        message: Vec<String>,
    },
    /// Kill every server
    Killall,
    /// Kill every server running a version
    Killversion { version: String },
    /// Kill unprotected servers idle for at least this many days
    Killinactive { days: u64 },
    /// Toggle inactivity protection on a server
    Protect { port: u16 },
    /// Show passwords and log location for a server
    Info { port: u16 },
    /// Show the tail of a server's log
    Log {
        port: u16,
        #[arg(long, default_value_t = 15)]
        lines: usize,
    },
    /// Status probe through the daemon's query queue
    Query { port: u16 },
    /// Run the inactivity sweep now
    Cleanup,
    /// Turn hosting on or off
    Accepting {
        #[arg(value_parser = parse_switch, action = clap::ArgAction::Set)]
        state: bool,
    },
    /// Kill every server and stop the daemon
    Shutdown,
}

fn parse_switch(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "enable" | "1" => Ok(true),
        "off" | "false" | "no" | "disable" | "0" => Ok(false),
        other => Err(format!("expected on or off, got `{other}`")),
    }
}

impl Command {
    /// Rejoin words the shell split apart.
    pub fn join_words(words: Vec<String>) -> String {
        words.join(" ")
    }

    /// Words for the option string, quoting any that contain whitespace so
    /// the daemon's tokenizer sees the same pairs.
    pub fn join_options(words: Vec<String>) -> String {
        words
            .iter()
            .map(|w| match w.split_once('=') {
                Some((k, v)) if v.contains(char::is_whitespace) => {
                    format!("{k}={}", shell_words::quote(v))
                }
                _ => w.clone(),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}
