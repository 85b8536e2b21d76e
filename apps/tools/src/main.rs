use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use server_api::{ApiContext, NoopSink};
use shared::{
    domain::{ClockId, LobbyId},
    error::ApiError,
    lobby::Lobby,
    protocol::{CreateLobbyRequest, LobbySnapshot, NewClock},
};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/gametime.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Creates a lobby with clocks in turn order.
    CreateLobby {
        /// NAME:INITIAL_SECS[:INCREMENT_SECS], repeat once per clock.
        #[arg(long = "clock", value_parser = parse_clock, required = true)]
        clocks: Vec<NewClock>,
    },
    Show {
        lobby_id: String,
    },
    Start {
        lobby_id: String,
    },
    Press {
        clock_id: String,
    },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;
    let ctx = ApiContext::new(Arc::new(storage.clone()), Arc::new(NoopSink));

    match cli.command {
        Command::CreateLobby { clocks } => {
            let lobby = server_api::create_lobby(&ctx, CreateLobbyRequest { clocks })
                .await
                .map_err(failed)?;
            println!("created lobby_id={}", lobby.id);
            for clock in &lobby.state.clocks {
                println!("  clock_id={} name={}", clock.id, clock.name);
            }
        }
        Command::Show { lobby_id } => {
            let lobby = server_api::get_lobby(&ctx, &LobbyId(lobby_id))
                .await
                .map_err(failed)?;
            print_snapshot(&lobby)?;
        }
        Command::Start { lobby_id } => {
            let lobby = server_api::start_lobby(&ctx, &LobbyId(lobby_id))
                .await
                .map_err(failed)?;
            print_snapshot(&lobby)?;
        }
        Command::Press { clock_id } => {
            let lobby = server_api::press_clock(&ctx, &ClockId(clock_id))
                .await
                .map_err(failed)?;
            print_snapshot(&lobby)?;
        }
        Command::List => {
            for lobby_id in storage.list_lobby_ids().await? {
                println!("{lobby_id}");
            }
        }
    }

    Ok(())
}

fn print_snapshot(lobby: &Lobby) -> Result<()> {
    let snapshot = LobbySnapshot::at(lobby, Utc::now());
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn failed(err: ApiError) -> anyhow::Error {
    anyhow!("{:?}: {}", err.code, err.message)
}

fn parse_clock(raw: &str) -> Result<NewClock> {
    let mut parts = raw.rsplitn(3, ':').collect::<Vec<_>>();
    parts.reverse();
    let (name, initial, increment) = match parts.as_slice() {
        [name, initial, increment] => (*name, *initial, *increment),
        [name, initial] => (*name, *initial, "0"),
        _ => bail!("expected NAME:INITIAL_SECS[:INCREMENT_SECS], got '{raw}'"),
    };
    Ok(NewClock {
        name: name.to_string(),
        initial_time_secs: initial.parse()?,
        increment_secs: increment.parse()?,
    })
}
