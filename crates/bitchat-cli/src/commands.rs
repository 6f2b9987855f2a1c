//! CLI command implementations.

use anyhow::{bail, Context, Result};
use bitchat_core::{
    engine::{spawn, EngineEvent, EngineHandle},
    identity::{load_or_generate, Identity, Peer, PeerId, TrustStore},
    storage::{Database, DatabaseConfig, DEFAULT_DB_NAME},
    transport::LoopbackTransport,
    EngineConfig, ProtocolEngine,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Read an engine configuration file, or use defaults.
pub fn load_config(path: Option<&str>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };

    let path = shellexpand::tilde(path).to_string();
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file {}", path))?;
    let config: EngineConfig =
        serde_json::from_str(&raw).with_context(|| format!("Invalid config file {}", path))?;
    config.validate().context("Invalid configuration")?;

    debug!(path = %path, "Loaded configuration");
    Ok(config)
}

fn open_database(data_dir: &str) -> Result<Database> {
    let config = DatabaseConfig {
        path: Path::new(data_dir)
            .join(DEFAULT_DB_NAME)
            .to_string_lossy()
            .into_owned(),
        in_memory: false,
    };
    Database::open(&config).context("Failed to open database")
}

/// Show the local identity, generating it on first run.
pub fn show_identity(data_dir: &str, config: &EngineConfig) -> Result<()> {
    let db = open_database(data_dir)?;
    let identity = load_or_generate(&db).context("Failed to load identity")?;

    println!("Nickname:    {}", config.nickname);
    println!("Peer ID:     {}", identity.peer_id());
    println!("Fingerprint: {}", identity.fingerprint().formatted());
    println!("Signing key: {}", hex::encode(identity.signing_public_key()));
    println!("Data dir:    {}", data_dir);
    Ok(())
}

/// List peers stored in the database.
pub fn list_peers(data_dir: &str) -> Result<()> {
    let db = open_database(data_dir)?;
    let peers = db.load_peers().context("Failed to load peers")?;

    if peers.is_empty() {
        println!("No stored peers.");
        return Ok(());
    }

    println!(
        "{:<18} {:<16} {:<9} {:<5} {}",
        "PEER ID", "NICKNAME", "TRUST", "FLAGS", "LAST SEEN"
    );
    for peer in &peers {
        println!(
            "{:<18} {:<16} {:<9} {:<5} {}",
            peer.id.to_string(),
            truncate(&peer.nickname, 16),
            peer.trust_level.as_str(),
            flags(peer),
            format_last_seen(peer.last_seen),
        );
    }
    println!("\n{} peer(s)", peers.len());
    Ok(())
}

/// Load the stored peer table, apply `change` to one peer and save it back.
fn update_stored_peer(
    data_dir: &str,
    peer_id: &str,
    change: impl FnOnce(&mut TrustStore, &PeerId) -> bitchat_core::Result<()>,
) -> Result<Peer> {
    let id = PeerId::from_hex(peer_id).context("Invalid peer ID")?;
    let db = open_database(data_dir)?;
    let mut store = TrustStore::from_peers(db.load_peers().context("Failed to load peers")?);

    if store.get_peer(&id).is_none() {
        bail!("No stored peer {}. Run `bitchat peers` to list them.", id);
    }
    change(&mut store, &id)?;

    let peer = store
        .get_peer(&id)
        .cloned()
        .with_context(|| format!("peer {} vanished", id))?;
    db.save_peer(&peer).context("Failed to save peer")?;
    Ok(peer)
}

/// Escalate trust in a stored peer.
pub fn verify_peer(data_dir: &str, peer_id: &str, trusted: bool) -> Result<()> {
    let peer = update_stored_peer(data_dir, peer_id, |store, id| {
        store.verify_peer(id)?;
        if trusted {
            store.promote_to_trusted(id)?;
        }
        Ok(())
    })?;

    println!("{} ({}) is now {}", peer.nickname, peer.id, peer.trust_level.as_str());
    println!("Fingerprint: {}", peer.fingerprint.formatted());
    Ok(())
}

/// Block or unblock a stored peer.
pub fn block_peer(data_dir: &str, peer_id: &str, block: bool) -> Result<()> {
    let peer = update_stored_peer(data_dir, peer_id, |store, id| {
        if block {
            store.block_peer(id)
        } else {
            store.unblock_peer(id)
        }
    })?;

    println!(
        "{} ({}) {}",
        peer.nickname,
        peer.id,
        if peer.is_blocked { "blocked" } else { "unblocked" }
    );
    Ok(())
}

fn flags(peer: &Peer) -> String {
    let mut flags = String::new();
    if peer.is_favorite {
        flags.push('*');
    }
    if peer.is_blocked {
        flags.push('B');
    }
    if flags.is_empty() {
        flags.push('-');
    }
    flags
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max - 1).collect();
        format!("{}~", cut)
    }
}

fn format_last_seen(ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(ms as i64)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

struct SimNode {
    label: String,
    handle: EngineHandle,
    task: JoinHandle<()>,
    printer: JoinHandle<()>,
}

/// Run `count` nodes in a line, handshake the two ends and send a message.
///
/// Node 0 uses the identity from the data directory; its peer table is
/// saved to the database afterwards.
pub async fn simulate(
    data_dir: &str,
    config: EngineConfig,
    count: usize,
    message: &str,
    step_timeout: u64,
) -> Result<()> {
    if count < 2 {
        bail!("A simulation needs at least 2 nodes");
    }
    config.validate().context("Invalid configuration")?;
    let hops = count - 1;
    if usize::from(config.effective_ttl()) < hops {
        bail!(
            "TTL {} cannot cross {} hops; pass --ttl {} or more",
            config.effective_ttl(),
            hops,
            hops
        );
    }
    let step = Duration::from_secs(step_timeout);

    let mut db = open_database(data_dir)?;
    let local = load_or_generate(&db).context("Failed to load identity")?;
    let stored = db.load_peers().context("Failed to load peers")?;

    let mut nodes = Vec::with_capacity(count);
    for i in 0..count {
        let (identity, nickname) = if i == 0 {
            (local.clone(), config.nickname.clone())
        } else {
            (Identity::generate(), format!("node{}", i))
        };
        let node_config = EngineConfig {
            nickname: nickname.clone(),
            ..config.clone()
        };

        let mut engine = ProtocolEngine::new(identity, node_config)?;
        if i == 0 {
            engine.load_peers(stored.clone());
        }
        let (handle, task) = spawn(engine)?;
        let label = format!("{}[{}]", nickname, handle.peer_id());
        let printer = tokio::spawn(print_events(label.clone(), handle.subscribe()));
        nodes.push(SimNode {
            label,
            handle,
            task,
            printer,
        });
    }

    for pair in nodes.windows(2) {
        let (left, right) = LoopbackTransport::named_pair(&pair[0].label, &pair[1].label);
        pair[0].handle.add_transport(Arc::new(left)).await?;
        pair[1].handle.add_transport(Arc::new(right)).await?;
    }
    info!(nodes = count, "Mesh line ready");

    let first = &nodes[0];
    let last = &nodes[count - 1];
    let first_id = first.handle.peer_id();
    let last_id = last.handle.peer_id();
    let mut first_events = first.handle.subscribe();
    let mut last_events = last.handle.subscribe();

    for node in &nodes {
        node.handle.announce().await?;
    }
    wait_for(&mut last_events, step, "announcement", |e| {
        matches!(e, EngineEvent::PeerDiscovered(p) | EngineEvent::PeerUpdated(p) if p.id == first_id)
    })
    .await?;

    first.handle.initiate_handshake(last_id).await?;
    wait_for(&mut first_events, step, "handshake", |e| match e {
        EngineEvent::HandshakeCompleted { peer_id, .. } => *peer_id == last_id,
        EngineEvent::HandshakeFailed { peer_id, reason } if *peer_id == last_id => {
            eprintln!("handshake failed: {}", reason);
            true
        }
        _ => false,
    })
    .await?;
    if !first.handle.has_session(last_id).await? {
        bail!("Handshake with {} failed", last_id);
    }

    let sent = first.handle.send_private(last_id, message).await?;
    wait_for(&mut last_events, step, "private message", |e| {
        matches!(e, EngineEvent::MessageReceived { message, .. } if message.id == sent.id)
    })
    .await?;
    wait_for(&mut first_events, step, "delivery ack", |e| {
        matches!(e, EngineEvent::DeliveryAckReceived { ack, .. } if ack.message_id == sent.id)
    })
    .await?;

    let peers = first.handle.peers().await?;
    let saved = db.save_peers(&peers).context("Failed to save peers")?;
    println!(
        "\nDelivered \"{}\" across {} hop(s); saved {} peer(s).",
        message, hops, saved
    );

    for node in nodes {
        node.handle.shutdown().await?;
        node.task.await.context("engine task panicked")?;
        node.printer.abort();
    }
    Ok(())
}

async fn wait_for(
    events: &mut broadcast::Receiver<EngineEvent>,
    limit: Duration,
    what: &str,
    mut pred: impl FnMut(&EngineEvent) -> bool,
) -> Result<EngineEvent> {
    let waited = tokio::time::timeout(limit, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return Ok(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => bail!("engine stopped"),
            }
        }
    })
    .await;

    match waited {
        Ok(result) => result,
        Err(_) => bail!("Timed out waiting for {}", what),
    }
}

async fn print_events(label: String, mut events: broadcast::Receiver<EngineEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => println!("{:<28} {}", label, describe(&event)),
            Err(broadcast::error::RecvError::Lagged(n)) => println!("{:<28} ({} events dropped)", label, n),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn describe(event: &EngineEvent) -> String {
    match event {
        EngineEvent::MessageReceived {
            from,
            message,
            is_private,
        } => format!(
            "{} message from {} ({}): {}",
            if *is_private { "private" } else { "public" },
            message.sender_nickname,
            from,
            message.content
        ),
        EngineEvent::PeerDiscovered(peer) => format!("discovered {} ({})", peer.nickname, peer.id),
        EngineEvent::PeerUpdated(peer) => format!(
            "updated {} ({}) trust={} connected={}",
            peer.nickname,
            peer.id,
            peer.trust_level.as_str(),
            peer.is_connected
        ),
        EngineEvent::DeliveryAckReceived { from, ack } => {
            format!("delivery ack for {} from {}", ack.message_id, from)
        }
        EngineEvent::ReadReceiptReceived { from, receipt } => {
            format!("read receipt for {} from {}", receipt.message_id, from)
        }
        EngineEvent::HandshakeCompleted {
            peer_id,
            fingerprint,
        } => format!("session with {} (fingerprint {})", peer_id, fingerprint.formatted()),
        EngineEvent::HandshakeFailed { peer_id, reason } => {
            format!("handshake with {} failed: {}", peer_id, reason)
        }
        EngineEvent::HandshakeTimedOut { peer_id } => format!("handshake with {} timed out", peer_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("alice", 16), "alice");
        assert_eq!(truncate("abcdefghij", 5), "abcd~");
    }

    #[test]
    fn test_load_config_defaults_without_file() {
        let config = load_config(None).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"nickname": "zoe", "max_ttl": 4}"#).unwrap();

        let config = load_config(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(config.nickname, "zoe");
        assert_eq!(config.max_ttl, 4);

        std::fs::write(&path, r#"{"max_ttl": 0}"#).unwrap();
        assert!(load_config(Some(path.to_str().unwrap())).is_err());
    }

    #[test]
    fn test_verify_and_block_stored_peer() {
        let dir = tempfile::TempDir::new().unwrap();
        let data_dir = dir.path().to_str().unwrap();

        let other = Identity::generate();
        let peer = Peer::new(*other.static_public_key(), "mia", 1_700_000_000_000);
        open_database(data_dir).unwrap().save_peer(&peer).unwrap();
        let id = other.peer_id().to_string();

        // trusted requires verified first; --trusted does both
        verify_peer(data_dir, &id, true).unwrap();
        block_peer(data_dir, &id, true).unwrap();

        let stored = open_database(data_dir).unwrap().load_peer(&other.peer_id()).unwrap().unwrap();
        assert_eq!(stored.trust_level.as_str(), "trusted");
        assert!(stored.is_blocked);

        assert!(verify_peer(data_dir, "00112233aabbccdd", false).is_err());
        assert!(verify_peer(data_dir, "not-hex", false).is_err());
    }

    #[tokio::test]
    async fn test_simulate_rejects_short_ttl() {
        let config = EngineConfig {
            max_ttl: 1,
            ..EngineConfig::default()
        };
        let err = simulate("/nonexistent", config, 4, "hi", 1).await.unwrap_err();
        assert!(err.to_string().contains("hops"));
    }
}
