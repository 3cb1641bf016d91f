// Sheet Sync CLI
// Talks to a running sheet sync server: health checks, manual room
// creation and joining, and an end-to-end validation run

use clap::{Parser, Subcommand};
use colored::*;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use sheet_sync_server::session::{ClientMessage, Role, ServerMessage};
use std::io::{self, Write};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Parser)]
#[command(name = "sheet-sync-cli")]
#[command(about = "Sheet Sync Server CLI", long_about = None)]
struct Cli {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:3000")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check server health endpoint
    Health,

    /// Create a room as master
    CreateRoom {
        /// Master display name
        #[arg(short, long)]
        master: String,

        /// Session display name
        #[arg(short = 'n', long)]
        session: String,

        /// Keep connection alive and print traffic (press Ctrl+C to exit)
        #[arg(short, long)]
        keep_alive: bool,
    },

    /// Join a room as player
    JoinRoom {
        /// Room code to join
        #[arg(short, long)]
        room_code: String,

        /// Player display name
        #[arg(short, long)]
        name: String,

        /// JSON sheet to push after joining
        #[arg(short, long)]
        ficha: Option<String>,
    },

    /// Run the create / join / update / reconnect scenario against the server
    Validate,

    /// Interactive mode - send raw JSON messages
    Interactive,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Health => check_health(&cli.server).await,
        Commands::CreateRoom {
            master,
            session,
            keep_alive,
        } => create_room(&cli.server, master, session, *keep_alive).await,
        Commands::JoinRoom {
            room_code,
            name,
            ficha,
        } => join_room(&cli.server, room_code, name, ficha.as_deref()).await,
        Commands::Validate => {
            if !run_validation(&cli.server).await {
                std::process::exit(1);
            }
        }
        Commands::Interactive => interactive_mode(&cli.server).await,
    }
}

async fn check_health(server: &str) {
    println!("{}", "Checking server health...".cyan());

    let url = format!("http://{}/health", server);
    match reqwest::get(&url).await {
        Ok(resp) if resp.status().is_success() => {
            println!("{} Health check passed", "✓".green());
            if let Ok(body) = resp.json::<Value>().await {
                println!("  Status: {}", body["status"].as_str().unwrap_or("unknown"));
                println!("  Service: {}", body["service"].as_str().unwrap_or("unknown"));
                println!("  Version: {}", body["version"].as_str().unwrap_or("unknown"));
            }
        }
        Ok(resp) => println!("{} Health check failed: HTTP {}", "✗".red(), resp.status()),
        Err(e) => println!("{} Cannot reach server: {}", "✗".red(), e),
    }
}

async fn connect(server: &str) -> Result<Socket, String> {
    let url = format!("ws://{}/", server);
    connect_async(&url)
        .await
        .map(|(stream, _)| stream)
        .map_err(|e| format!("Cannot connect to {}: {}", url, e))
}

async fn send(socket: &mut Socket, message: &ClientMessage) -> Result<(), String> {
    let text = serde_json::to_string(message).map_err(|e| e.to_string())?;
    socket
        .send(Message::Text(text))
        .await
        .map_err(|e| format!("Failed to send {}: {}", message.kind(), e))
}

/// Wait for the next protocol message, skipping control frames
async fn next_message(socket: &mut Socket, wait: Duration) -> Result<ServerMessage, String> {
    loop {
        match timeout(wait, socket.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                return serde_json::from_str(&text).map_err(|e| format!("Unreadable message {}: {}", text, e));
            }
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => return Err("Connection closed by server".to_string()),
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(e))) => return Err(format!("Connection error: {}", e)),
            Err(_) => return Err("Timeout waiting for response".to_string()),
        }
    }
}

/// Wait until a message matching `pick` arrives
async fn expect<T>(
    socket: &mut Socket,
    what: &str,
    pick: impl Fn(ServerMessage) -> Option<T>,
) -> Result<T, String> {
    loop {
        let message = next_message(socket, Duration::from_secs(5)).await?;
        if let ServerMessage::RoomError { message } = &message {
            return Err(format!("Server error while waiting for {}: {}", what, message));
        }
        if let Some(found) = pick(message) {
            return Ok(found);
        }
    }
}

async fn create_room(server: &str, master: &str, session: &str, keep_alive: bool) {
    println!("{}", "Creating room...".cyan());
    println!("  Master: {}", master);
    println!("  Session: {}", session);

    let mut socket = match connect(server).await {
        Ok(socket) => socket,
        Err(e) => return println!("{} {}", "✗".red(), e),
    };

    let create = ClientMessage::CreateRoom {
        master_name: Some(master.to_string()),
        session_name: Some(session.to_string()),
    };
    if let Err(e) = send(&mut socket, &create).await {
        return println!("{} {}", "✗".red(), e);
    }

    let code = match expect(&mut socket, "room_created", |m| match m {
        ServerMessage::RoomCreated { room_code, .. } => Some(room_code),
        _ => None,
    })
    .await
    {
        Ok(code) => code,
        Err(e) => return println!("{} {}", "✗".red(), e),
    };

    println!("{} Room created successfully!", "✓".green());
    println!("\n{}", "═".repeat(50).green());
    println!("{} {}", "Room code:".bold(), code.green().bold());
    println!("{}", "═".repeat(50).green());

    if !keep_alive {
        println!("\nThe room persists after this connection closes.");
        println!("Use {} to watch player traffic.", "--keep-alive".cyan());
        return;
    }

    println!("\n{}", "Connection is being kept alive...".yellow());
    println!("Press {} to disconnect.", "Ctrl+C".bold());
    print_traffic(&mut socket).await;
}

async fn join_room(server: &str, room_code: &str, name: &str, ficha: Option<&str>) {
    println!("{}", "Joining room...".cyan());
    println!("  Room code: {}", room_code);
    println!("  Name: {}", name);

    let ficha_data = match ficha.map(serde_json::from_str::<Value>).transpose() {
        Ok(data) => data,
        Err(e) => return println!("{} --ficha is not valid JSON: {}", "✗".red(), e),
    };

    let mut socket = match connect(server).await {
        Ok(socket) => socket,
        Err(e) => return println!("{} {}", "✗".red(), e),
    };

    let join = ClientMessage::JoinRoom {
        player_name: Some(name.to_string()),
        room_code: Some(room_code.to_string()),
    };
    if let Err(e) = send(&mut socket, &join).await {
        return println!("{} {}", "✗".red(), e);
    }

    match expect(&mut socket, "room_joined", |m| match m {
        ServerMessage::RoomJoined {
            player_id,
            session_name,
            ..
        } => Some((player_id, session_name)),
        _ => None,
    })
    .await
    {
        Ok((player_id, session_name)) => {
            println!("{} Joined \"{}\"", "✓".green(), session_name);
            println!("  Player id: {}", player_id.green().bold());
        }
        Err(e) => return println!("{} {}", "✗".red(), e),
    }

    if let Some(ficha_data) = ficha_data {
        match send(&mut socket, &ClientMessage::FichaData { ficha_data }).await {
            Ok(()) => println!("{} Sheet sent", "✓".green()),
            Err(e) => println!("{} {}", "✗".red(), e),
        }
    }

    println!("Listening for room traffic. Press {} to leave.", "Ctrl+C".bold());
    print_traffic(&mut socket).await;
}

async fn print_traffic(socket: &mut Socket) {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => println!("{} {}", "◀".green(), text.bright_white()),
            Some(Ok(Message::Close(_))) | None => {
                println!("{} Server closed the connection", "✗".yellow());
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                println!("{} Connection error: {}", "✗".red(), e);
                break;
            }
        }
    }
}

async fn run_validation(server: &str) -> bool {
    println!("\n{}", "Running session validation".bold());
    println!("{}", "═".repeat(60));

    match validate_scenario(server).await {
        Ok(()) => {
            println!("\n{} All steps passed", "✓".green().bold());
            true
        }
        Err(e) => {
            println!("{} {}", "✗".red(), e);
            println!("\n{} Validation failed", "✗".red().bold());
            false
        }
    }
}

fn step(name: &str) {
    println!("{} {}", "✓".green(), name);
}

async fn validate_scenario(server: &str) -> Result<(), String> {
    let mut master = connect(server).await?;
    send(
        &mut master,
        &ClientMessage::CreateRoom {
            master_name: Some("Validator".to_string()),
            session_name: Some("Validation".to_string()),
        },
    )
    .await?;
    let code = expect(&mut master, "room_created", |m| match m {
        ServerMessage::RoomCreated { room_code, .. } => Some(room_code),
        _ => None,
    })
    .await?;
    step(&format!("Room created: {}", code));

    let mut stranger = connect(server).await?;
    send(
        &mut stranger,
        &ClientMessage::JoinRoom {
            player_name: Some("Nobody".to_string()),
            room_code: Some("RPG-ZZZZ".to_string()),
        },
    )
    .await?;
    match next_message(&mut stranger, Duration::from_secs(5)).await? {
        ServerMessage::RoomError { .. } => step("Unknown room rejected"),
        other => return Err(format!("Expected room_error, got {:?}", other)),
    }

    let mut player = connect(server).await?;
    send(
        &mut player,
        &ClientMessage::JoinRoom {
            player_name: Some("Probe".to_string()),
            room_code: Some(code.clone()),
        },
    )
    .await?;
    let player_id = expect(&mut player, "room_joined", |m| match m {
        ServerMessage::RoomJoined { player_id, .. } => Some(player_id),
        _ => None,
    })
    .await?;
    step(&format!("Player joined: {}", player_id));

    let sheet = serde_json::json!({"hp": 10});
    send(&mut player, &ClientMessage::FichaData { ficha_data: sheet.clone() }).await?;
    let forwarded = expect(&mut master, "ficha_update", |m| match m {
        ServerMessage::FichaUpdate { ficha_data, .. } => Some(ficha_data),
        _ => None,
    })
    .await?;
    if forwarded != sheet {
        return Err(format!("Forwarded sheet {} differs from {}", forwarded, sheet));
    }
    step("Sheet forwarded to master");

    drop(master);
    let _ = expect(&mut player, "master_left", |m| match m {
        ServerMessage::MasterLeft => Some(()),
        _ => None,
    })
    .await?;
    step("Master departure broadcast");

    let mut master = connect(server).await?;
    send(
        &mut master,
        &ClientMessage::Reconnect {
            role: Some(Role::Master),
            name: Some("Validator".to_string()),
            room_code: Some(code.clone()),
            player_id: None,
        },
    )
    .await?;
    let players = expect(&mut master, "players_update", |m| match m {
        ServerMessage::PlayersUpdate { players } => Some(players),
        _ => None,
    })
    .await?;
    if !players.contains_key(&player_id) {
        return Err("Reconnected master does not see the player".to_string());
    }
    step("Master reconnected with presence intact");

    drop(player);
    tokio::time::sleep(Duration::from_millis(200)).await;
    send(
        &mut master,
        &ClientMessage::RequestFicha {
            player_id: player_id.clone(),
        },
    )
    .await?;
    let cached = expect(&mut master, "ficha_update", |m| match m {
        ServerMessage::FichaUpdate { ficha_data, .. } => Some(ficha_data),
        _ => None,
    })
    .await?;
    if cached != sheet {
        return Err(format!("Cached sheet {} differs from {}", cached, sheet));
    }
    step("Offline sheet served from store");

    Ok(())
}

async fn interactive_mode(server: &str) {
    println!("\n{}", "Interactive Mode".bold().green());
    println!("{}", "═".repeat(60).green());
    println!("Type {} for help, {} to quit\n", "help".cyan(), "quit".cyan());

    let socket = match connect(server).await {
        Ok(socket) => socket,
        Err(e) => return println!("{} {}", "✗".red(), e),
    };
    println!("{} Connected to server", "✓".green());

    let (mut write, mut read) = socket.split();

    let receive_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = read.next().await {
            if let Message::Text(text) = msg {
                println!("\n{} {}", "◀".green(), text.bright_white());
            }
        }
    });

    loop {
        print!("{} ", "►".cyan());
        let _ = io::stdout().flush();

        let mut input = String::new();
        if io::stdin().read_line(&mut input).is_err() {
            break;
        }

        let input = input.trim();
        if input.is_empty() {
            continue;
        }
        if input == "quit" || input == "exit" {
            println!("Goodbye!");
            break;
        }
        if input == "help" {
            print_interactive_help();
            continue;
        }

        match serde_json::from_str::<Value>(input) {
            Ok(parsed) => {
                if write.send(Message::Text(parsed.to_string())).await.is_ok() {
                    println!("{} Message sent", "✓".green());
                } else {
                    println!("{} Failed to send message", "✗".red());
                    break;
                }
            }
            Err(_) => println!("{} Invalid JSON. Type 'help' for examples.", "✗".yellow()),
        }
    }

    receive_task.abort();
}

fn print_interactive_help() {
    println!("\n{}", "Interactive Mode Commands".bold());
    println!("{}", "─".repeat(60));
    println!("Send JSON messages directly to the server.\n");

    println!("{}", "Example Messages:".bold());
    println!("\n{}:", "Create Room".cyan());
    println!(r#"  {{"type":"create_room","masterName":"Ana","sessionName":"Campaign 1"}}"#);

    println!("\n{}:", "Join Room".cyan());
    println!(r#"  {{"type":"join_room","playerName":"Bo","roomCode":"RPG-K7QX"}}"#);

    println!("\n{}:", "Reconnect".cyan());
    println!(r#"  {{"type":"reconnect","role":"master","name":"Ana","roomCode":"RPG-K7QX"}}"#);

    println!("\n{}:", "Push Sheet".cyan());
    println!(r#"  {{"type":"ficha_data","fichaData":{{"hp":10}}}}"#);

    println!("\n{}:", "Request Sheet".cyan());
    println!(r#"  {{"type":"request_ficha","playerId":"<player id>"}}"#);

    println!("\n{}: quit, exit", "Commands".bold());
    println!();
}
