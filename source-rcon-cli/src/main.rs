use ansi_term::Colour::{Fixed, Green, Yellow};
use clap::Parser;
use log::{error, info, LevelFilter};
use rpassword::read_password;
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};
use source_rcon_client::query::{self, QueryFamily, QueryInfo};
use source_rcon_client::{AuthError, RconClient, RconConfig};
use std::fmt::{Display, Formatter};
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

const DEFAULT_PORT: u16 = 27015;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Address of the server, e.g. `127.0.0.1:27015`. The port defaults to 27015.
    address: String,

    /// Reassemble responses that are split across several packets.
    #[clap(long)]
    multi_packet: bool,

    /// Seconds to wait for the server before giving up.
    #[clap(long, default_value_t = 5)]
    timeout: u64,

    /// Print server information using the UDP query protocol (`source` or `minecraft`) and exit.
    #[clap(long, value_name = "FAMILY")]
    query: Option<QueryFamily>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    TermLogger::init(
        LevelFilter::Info,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .unwrap();

    let args = Args::parse();
    let address = with_default_port(&args.address);
    let timeout = Duration::from_secs(args.timeout);

    if let Some(family) = args.query {
        if let Err(err) = print_query(&address, family, timeout).await {
            error!("Query failed: {}", err);
            std::process::exit(1);
        }
        return;
    }

    print!("{}'s password: ", address);
    std::io::stdout().flush().unwrap();
    let password = read_password().unwrap();

    let config = RconConfig::new(address.clone(), password)
        .with_multi_packet(args.multi_packet)
        .with_connect_timeout(timeout)
        .with_command_timeout(timeout);
    let client = RconClient::new(config);

    match client.connect().await {
        Ok(()) => {}
        Err(err) if err.is_auth_failed() => loop {
            println!("Invalid password.");
            print!("{}'s password: ", address);
            std::io::stdout().flush().unwrap();
            let password = read_password().unwrap();

            match client.authenticate(&password).await {
                Ok(()) => break,
                Err(AuthError::InvalidPassword) => {}
                Err(AuthError::Fatal(err)) => {
                    error!("Connection failed: {}", err);
                    std::process::exit(1);
                }
            }
        },
        Err(err) => {
            error!("Connection failed: {}", err);
            std::process::exit(1);
        }
    }

    info!(
        "Connected. View builtins with `!help`. {} {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let quitting = Arc::new(AtomicBool::new(false));
    let closed_by_user = quitting.clone();
    client.on_disconnected(move || {
        if !closed_by_user.load(Ordering::SeqCst) {
            eprint!("\r");
            error!("Connection closed by the server");
            std::process::exit(1);
        }
    });

    let prompt = Prompt { address };
    repl_loop(&client, prompt).await;

    quitting.store(true, Ordering::SeqCst);
    client.disconnect().await;
}

/// Appends the default port if `address` doesn't carry one.
fn with_default_port(address: &str) -> String {
    if address.parse::<SocketAddr>().is_ok() {
        return address.to_string();
    }

    match address.parse::<IpAddr>() {
        Ok(ip_addr) => SocketAddr::new(ip_addr, DEFAULT_PORT).to_string(),
        Err(_) if address.contains(':') => address.to_string(),
        Err(_) => format!("{}:{}", address, DEFAULT_PORT),
    }
}

async fn print_query(
    address: &str,
    family: QueryFamily,
    timeout: Duration,
) -> source_rcon_client::Result<()> {
    match query::info(address, family, timeout).await? {
        QueryInfo::Source(info) => {
            println!("{}", Green.paint(info.name.as_str()));
            println!("    map        {}", info.map);
            println!("    game       {} ({})", info.game, info.folder);
            println!(
                "    players    {}/{} ({} bots)",
                info.players, info.max_players, info.bots
            );
            println!("    vac        {}", info.vac_secured);

            let players = query::players(address, timeout).await?;
            if !players.is_empty() {
                println!();
                println!("{}", Yellow.paint("PLAYERS"));
                for player in players {
                    println!(
                        "    {:<32} {:>6} {:>8.0}s",
                        player.name, player.score, player.duration
                    );
                }
            }
        }
        QueryInfo::Minecraft(info) => {
            println!("{}", Green.paint(info.motd.as_str()));
            println!("    version    {}", info.version);
            println!("    map        {}", info.map);
            println!("    players    {}/{}", info.num_players, info.max_players);
            for player in info.players {
                println!("    - {}", player);
            }
        }
    }

    Ok(())
}

#[derive(Clone)]
struct Prompt {
    address: String,
}

impl Display for Prompt {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}> ", Fixed(10).paint(self.address.as_str()))
    }
}

async fn repl_loop(client: &RconClient, prompt: Prompt) {
    let mut input_lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("{}", prompt);
        std::io::stdout().flush().unwrap();

        let line = match input_lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(err) => {
                error!("Failed to read input: {}", err);
                return;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(builtin) = line.strip_prefix('!') {
            match builtin.trim() {
                "help" => print_help(),
                "status" => println!("{:?}", client.state()),
                "quit" => return,
                _ => eprintln!("Unknown builtin."),
            }
            continue;
        }

        match client.send_command(line).await {
            Ok(response) if response.is_empty() => {}
            Ok(response) => println!("{}", response),
            Err(err) => eprintln!("An error occurred: {}", err),
        }
    }
}

fn print_help() {
    println!(
        "{} {}",
        Green.paint(env!("CARGO_PKG_NAME")),
        env!("CARGO_PKG_VERSION")
    );
    println!();
    println!("{}", Yellow.paint("BUILTINS"));
    println!("    !help                View this help listing");
    println!("    !status              Show the connection state");
    println!("    !quit                Disconnect and exit");
    println!(
        "    {}  Run a command on the server",
        Green.paint("<COMMAND> [ARGS...]")
    );
}
