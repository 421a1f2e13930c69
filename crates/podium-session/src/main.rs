//! podium: Host or join a classroom session from the terminal.
//!
//! The composition root: builds the configured transport, starts the
//! session service, and drives it from stdin lines while printing state
//! changes and operator log entries.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use podium_core::{DisplaySelection, ResponseId, RoomCode, SessionState, Severity};
use podium_session::{SessionConfig, SessionHandle, SessionService, TransportKind};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "podium")]
#[command(about = "Host-authoritative classroom session sync")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Transport strategy
    #[arg(long, value_enum, default_value_t = TransportKind::Relay)]
    transport: TransportKind,

    /// Relay/rendezvous server URL
    #[arg(long, default_value = "ws://127.0.0.1:9350")]
    server: String,

    /// Address mesh hosts accept direct links on (port 0 = ephemeral)
    #[arg(long, default_value = "127.0.0.1:0")]
    listen: String,

    /// Directory the durable session mirror lives under
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host a session (resumes the prior room code if a mirror exists)
    Host,
    /// Join a session as a follower
    Join {
        /// Room code shown by the host
        code: String,
        /// Display name shown with your submissions
        #[arg(long)]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,podium_session=debug"
    } else {
        "info,podium_session=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = SessionConfig {
        transport: args.transport,
        server_url: args.server.clone(),
        listen_addr: args.listen.clone(),
        data_dir: args.data_dir.clone(),
    };

    match args.command {
        Command::Host => {
            let handle = SessionService::host(&config).await?;
            let code = handle
                .room_code()
                .map(|c| c.to_string())
                .unwrap_or_default();
            println!("Hosting room {} ({} transport)", code, args.transport);
            print_host_help();
            repl(handle, true).await
        }
        Command::Join { code, name } => {
            let room: RoomCode = code.parse().context("Invalid room code")?;
            let handle = SessionService::join(&config, room, &name).await?;
            println!("Joined room {} as {}", room, name);
            print_follower_help();
            repl(handle, false).await
        }
    }
}

/// Drive the session from stdin until EOF, `quit`, or ctrl-c.
async fn repl(handle: SessionHandle, hosting: bool) -> Result<()> {
    let _log_sub = handle.subscribe_logs(|entry| {
        let tag = match entry.severity {
            Severity::Info => "i",
            Severity::Success => "+",
            Severity::Error => "!",
        };
        println!("[{}] {}", tag, entry.message);
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    if line == "quit" {
                        break;
                    }
                    if hosting {
                        host_command(&handle, line);
                    } else {
                        follower_command(&handle, line);
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    handle.shutdown();
    Ok(())
}

fn host_command(handle: &SessionHandle, line: &str) {
    let (verb, rest) = split_verb(line);
    match verb {
        "prompt" => {
            // prompt <max-score> <text...>
            let (max, text) = split_verb(rest);
            match max.parse::<u32>() {
                Ok(max) if !text.is_empty() => handle.set_prompt(text, max),
                _ => println!("usage: prompt <max-score> <text>"),
            }
        }
        "accepting" => match rest {
            "on" => handle.toggle_accepting(true),
            "off" => handle.toggle_accepting(false),
            _ => println!("usage: accepting on|off"),
        },
        "score" => {
            // score <response-id> <n>
            let (id, n) = split_verb(rest);
            match n.parse::<u32>() {
                Ok(n) if !id.is_empty() => handle.set_score(ResponseId::from(id), n),
                _ => println!("usage: score <response-id> <n>"),
            }
        }
        "assist" => {
            // assist <response-id> <n> <feedback...>
            let (id, rest) = split_verb(rest);
            let (n, feedback) = split_verb(rest);
            match n.parse::<u32>() {
                Ok(n) if !id.is_empty() => {
                    handle.set_ai_assist(ResponseId::from(id), n, feedback)
                }
                _ => println!("usage: assist <response-id> <n> <feedback>"),
            }
        }
        "display" => {
            if rest == "prompt" {
                handle.set_display(DisplaySelection::ShowingPrompt);
            } else if !rest.is_empty() {
                handle.set_display(DisplaySelection::ShowingResponse {
                    response_id: ResponseId::from(rest),
                });
            } else {
                println!("usage: display prompt|<response-id>");
            }
        }
        "reset" => handle.reset_round(),
        "new-class" => handle.start_new_class(),
        "state" => print_state(&handle.state()),
        "logs" => {
            for entry in handle.logs() {
                println!("[{}] {}", entry.severity, entry.message);
            }
        }
        "status" => println!("{}", handle.status()),
        "help" => print_host_help(),
        _ => println!("Unknown command; try 'help'"),
    }
}

fn follower_command(handle: &SessionHandle, line: &str) {
    let (verb, rest) = split_verb(line);
    match verb {
        "submit" => {
            if rest.is_empty() {
                println!("usage: submit <text>");
            } else {
                handle.submit_answer(rest);
            }
        }
        "state" => print_state(&handle.state()),
        "status" => println!("{}", handle.status()),
        "help" => print_follower_help(),
        _ => println!("Unknown command; try 'help'"),
    }
}

fn split_verb(line: &str) -> (&str, &str) {
    match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    }
}

fn print_state(state: &SessionState) {
    let code = state
        .room_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "----".to_string());
    println!(
        "room {} | prompt: {:?} (max {}) | accepting: {}",
        code, state.prompt, state.max_score, state.accepting
    );
    for response in state.responses.values() {
        let score = response
            .score
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {} | {}: {:?} | score {}",
            response.id, response.name, response.text, score
        );
    }
}

fn print_host_help() {
    println!("commands: prompt <max> <text> | accepting on|off | score <id> <n>");
    println!("          assist <id> <n> <feedback> | display prompt|<id>");
    println!("          reset | new-class | state | logs | status | quit");
}

fn print_follower_help() {
    println!("commands: submit <text> | state | status | quit");
}
