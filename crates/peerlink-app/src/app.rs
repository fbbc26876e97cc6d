use anyhow::{Context, Result};
use peerlink_core::{ClientConfig, ConnectionState};
use peerlink_signaling::{ChannelObserver, SessionSettings, SignalingClient, SignalingEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::console::{ConsoleCommand, HELP};

/// Console session against a signaling server.
///
/// # Flow
/// 1. Load `ClientConfig` (file, then `PEERLINK_*` overrides)
/// 2. Spawn the signaling session; sign in when `autoconnect` is set
/// 3. Print observer events and run typed commands until `/quit`, Ctrl-C or
///    end of input
/// 4. Sign out and wait for the server to confirm before exiting
pub async fn run() -> Result<()> {
    let config = ClientConfig::load().context("loading configuration")?;
    info!("Server {} | name {:?}", config.endpoint(), config.client_name);

    let (observer, mut events) = ChannelObserver::new();
    let client = SignalingClient::spawn(observer, SessionSettings::from(&config));

    if config.autoconnect {
        connect(&client, &config).await;
    } else {
        info!("Autoconnect disabled; type /connect to sign in.");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    // ── Main loop ──────────────────────────────────────────────────────────
    loop {
        tokio::select! {
            Some(event) = events.recv() => print_event(&event),
            line = lines.next_line() => match line.context("reading stdin")? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match line.parse::<ConsoleCommand>() {
                    Ok(ConsoleCommand::Quit) => break,
                    Ok(command) => execute(&client, &config, command).await,
                    Err(e) => println!("{}", e),
                },
                None => {
                    info!("Input closed; signing out.");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received; signing out.");
                break;
            }
        }
    }

    sign_out_and_wait(&client, &mut events).await;
    client.shutdown().await;
    Ok(())
}

async fn connect(client: &SignalingClient, config: &ClientConfig) {
    if let Err(e) = client.connect(config.endpoint(), &config.client_name).await {
        warn!("Connect failed: {}", e);
    }
}

async fn execute(client: &SignalingClient, config: &ClientConfig, command: ConsoleCommand) {
    let result = match command {
        ConsoleCommand::Connect => {
            connect(client, config).await;
            Ok(())
        }
        ConsoleCommand::SignOut => client.sign_out().await,
        ConsoleCommand::Peers => match client.snapshot().await {
            Ok(snapshot) => {
                print_peers(&snapshot);
                Ok(())
            }
            Err(e) => Err(e),
        },
        ConsoleCommand::Send { to, text } => client.send_to_peer(to, text).await,
        ConsoleCommand::Bye { to } => client.send_hang_up(to).await,
        ConsoleCommand::Help => {
            println!("{}", HELP);
            Ok(())
        }
        ConsoleCommand::Quit => Ok(()),
    };
    if let Err(e) = result {
        println!("! {}", e);
    }
}

/// Sign out, then drain events until the server confirms or the session
/// was never up.
async fn sign_out_and_wait(
    client: &SignalingClient,
    events: &mut mpsc::UnboundedReceiver<SignalingEvent>,
) {
    match client.snapshot().await {
        Ok(snapshot) if snapshot.state != ConnectionState::Disconnected => {}
        _ => return,
    }
    if let Err(e) = client.sign_out().await {
        warn!("Sign-out failed: {}", e);
        return;
    }

    let drain = async {
        while let Some(event) = events.recv().await {
            print_event(&event);
            if event == SignalingEvent::Disconnected {
                break;
            }
        }
    };
    if tokio::time::timeout(std::time::Duration::from_secs(5), drain).await.is_err() {
        warn!("Server did not confirm sign-out; closing.");
        client.close();
    }
}

// ── Output ─────────────────────────────────────────────────────────────────────

fn print_event(event: &SignalingEvent) {
    match event {
        SignalingEvent::ConnectionFailed { reason } => println!("! connection failed: {}", reason),
        SignalingEvent::SignedIn { self_id } => println!("* signed in as peer {}", self_id),
        SignalingEvent::Disconnected => println!("* disconnected"),
        SignalingEvent::PeerConnected { id, name } => println!("+ {} ({})", name, id),
        SignalingEvent::PeerDisconnected { id } => println!("- peer {}", id),
        SignalingEvent::MessageFromPeer { id, payload } => {
            println!("[{}] {}", id, String::from_utf8_lossy(payload))
        }
        SignalingEvent::MessageSent { status } => println!("  (delivered, status {})", status),
    }
}

fn print_peers(snapshot: &peerlink_signaling::SessionSnapshot) {
    println!("state: {}", snapshot.state);
    if let Some(me) = snapshot.self_id {
        println!("self:  {}", me);
    }
    let mut peers: Vec<_> = snapshot.peers.iter().collect();
    peers.sort_by_key(|(id, _)| **id);
    if peers.is_empty() {
        println!("no other peers online");
    }
    for (id, name) in peers {
        println!("  {:>5}  {}", id.0, name);
    }
}
