//! atmosphere - peer-to-peer mesh runtime for capability-based intent routing
//!
//! One binary replaces what used to be four independent daemons: gossip
//! replication, intent routing, connection supervision, and mesh
//! membership now all run inside a single process (§9).

mod config;
mod runtime;
mod store;
mod token;

use atmosphere_core::{AntiEntropyReq, AntiEntropyResp, RecordKind, RequestId, TransportKind};
use atmosphere_net::{Frame, FrameKind};
use atmosphere_supervisor::SupervisorEvent;
use clap::{Parser, Subcommand};
use config::Config;
use runtime::Runtime;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::signal;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[derive(Parser, Debug)]
#[command(name = "atmosphere")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run this node: accept connections, replicate gossip, and route intents
    Serve,
    /// Join a mesh using an invite token (base64url, or its short code)
    Join {
        token: String,
    },
    /// Issue an invite token for the active mesh (founder only)
    Invite {
        #[arg(long, default_value = "24")]
        ttl: u64,
    },
    /// Print known peers and their liveness
    Peers,
    /// Print this node's identity and active mesh
    Status,
    /// Print the locally-known capability set
    Network,
}

fn init_logging(config: &Config) {
    let directive = config
        .log_level
        .clone()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "atmosphere=info".to_string());

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::new(directive))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.config);

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!(%err, "fatal error");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Command::Serve => serve(cli.config).await,
        Command::Join { token: raw } => join(cli.config, &raw).await,
        Command::Invite { ttl } => invite(cli.config, ttl).await,
        Command::Peers => peers(cli.config).await,
        Command::Status => status(cli.config).await,
        Command::Network => network(cli.config).await,
    }
}

async fn serve(config: Config) -> anyhow::Result<ExitCode> {
    info!("atmosphere v{}", env!("CARGO_PKG_VERSION"));

    let rt = Runtime::bootstrap(config).await?;
    rt.ensure_mesh()?;
    rt.reconnect_saved_meshes();
    info!(node_id = %rt.node_id, "node running");

    let supervisor = rt.supervisor.clone();
    let maintenance = tokio::spawn({
        let supervisor = supervisor.clone();
        async move {
            let mut ticker = interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                supervisor.tick(8).await;
            }
        }
    });

    let stats = tokio::spawn({
        let rt = rt.clone();
        async move {
            let mut ticker = interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                let peers = rt.peer_snapshot().len();
                let caps = rt.capability_snapshot().len();
                info!(peers, capabilities = caps, "status");
                if let Err(err) = rt.persist_capabilities() {
                    warn!(%err, "failed to persist capabilities.cbor");
                }
            }
        }
    });

    let lan_listener = tokio::spawn({
        let bind_addr: SocketAddr = ([0, 0, 0, 0], rt.config.port).into();
        let sink = rt.supervisor.inbound_event_sink();
        async move {
            if let Err(err) = atmosphere_net::transport::run_lan_listener(bind_addr, sink).await {
                error!(%err, "LAN accept loop exited");
            }
        }
    });

    let events = tokio::spawn({
        let rt = rt.clone();
        async move {
            let mut events_rx = rt
                .take_event_receiver()
                .expect("supervisor event receiver already taken");
            while let Some(event) = events_rx.recv().await {
                handle_supervisor_event(&rt, event).await;
            }
        }
    });

    let anti_entropy = tokio::spawn({
        let rt = rt.clone();
        async move {
            let mut ticker = interval(Duration::from_secs(atmosphere_gossip::engine::ANTI_ENTROPY_INTERVAL_SECS));
            loop {
                ticker.tick().await;
                run_anti_entropy_round(&rt).await;
            }
        }
    });

    signal::ctrl_c().await?;
    info!("shutting down");
    maintenance.abort();
    stats.abort();
    lan_listener.abort();
    events.abort();
    anti_entropy.abort();

    Ok(ExitCode::SUCCESS)
}

/// Routes one decoded frame up from the connection layer into the gossip
/// engine, the route table, or a waiting `dispatch` call (§4.5-§4.8).
async fn handle_supervisor_event(rt: &Runtime, event: SupervisorEvent) {
    match event {
        SupervisorEvent::Gossip { from: _, via_transport, envelope } => {
            ingest_gossip_envelope(rt, envelope, via_transport);
        }
        SupervisorEvent::AntiEntropyReq { from, req } => {
            respond_to_anti_entropy_req(rt, from, req).await;
        }
        SupervisorEvent::AntiEntropyResp { from, resp } => {
            let via_transport = rt
                .supervisor
                .peers()
                .snapshot(&from)
                .and_then(|state| state.active_transport)
                .unwrap_or(TransportKind::Lan);
            for envelope in resp.missing_records {
                ingest_gossip_envelope(rt, envelope, via_transport);
            }
        }
        SupervisorEvent::IntentRequest { from, request } => {
            serve_inbound_intent(rt, from, request).await;
        }
        SupervisorEvent::IntentResponse { from: _, response } => {
            rt.complete_intent_response(response);
        }
    }
}

/// Verifies and applies one gossiped record, then bridges it into the
/// router's registry/route table so `route()` can actually see it (§4.5,
/// §4.7). Envelopes from an origin we haven't identified yet are buffered by
/// the gossip engine itself, not dropped here.
fn ingest_gossip_envelope(rt: &Runtime, envelope: atmosphere_core::GossipEnvelope, via_transport: TransportKind) {
    let origin_node_id = envelope.origin_node_id;
    let record_kind = envelope.record_kind;
    let origin_key = rt.supervisor.peers().snapshot(&origin_node_id).map(|state| state.public_key);

    match rt.gossip.ingest(envelope.clone(), origin_key.as_ref(), now_unix()) {
        Ok(atmosphere_gossip::IngestOutcome::Applied) => {
            bridge_applied_record(rt, &envelope, via_transport, now_unix());
        }
        Ok(_) => {}
        Err(err) => warn!(%err, origin = %origin_node_id, ?record_kind, "rejected gossip envelope"),
    }
}

/// Once the gossip engine has accepted a record as new, feed it to whichever
/// of the registry/route table actually needs it (§4.7: the route table is
/// otherwise never populated by anything other than local self-registration).
fn bridge_applied_record(
    rt: &Runtime,
    envelope: &atmosphere_core::GossipEnvelope,
    via_transport: TransportKind,
    now: u64,
) {
    match envelope.record_kind {
        RecordKind::Capability => {
            match atmosphere_core::canonical::from_canonical_bytes::<atmosphere_core::CapabilityRecord>(
                &envelope.record_bytes,
            ) {
                Ok(record) => {
                    rt.router.table().observe(
                        &record.capability_id,
                        envelope.origin_node_id,
                        via_transport,
                        0,
                        0.0,
                        0.0,
                        1.0,
                        now,
                    );
                    rt.router.registry().upsert_capability(record);
                }
                Err(err) => warn!(%err, "failed to decode gossiped capability record"),
            }
        }
        RecordKind::Route => {
            match atmosphere_core::canonical::from_canonical_bytes::<atmosphere_core::RouteEntry>(
                &envelope.record_bytes,
            ) {
                Ok(entry) => {
                    rt.router.table().observe(
                        &entry.capability_id,
                        entry.next_hop_node_id,
                        entry.via_transport,
                        entry.hop_count,
                        0.0,
                        entry.measured_latency_ms,
                        entry.cost_multiplier,
                        now,
                    );
                }
                Err(err) => warn!(%err, "failed to decode gossiped route entry"),
            }
        }
        RecordKind::Cost | RecordKind::Revoke | RecordKind::Liveness => {}
    }
}

async fn respond_to_anti_entropy_req(rt: &Runtime, from: atmosphere_core::NodeId, req: AntiEntropyReq) {
    let missing_records = match rt.gossip.missing_for_peer(&req.digest) {
        Ok(records) => records,
        Err(err) => {
            warn!(%err, peer = %from, "failed to compute anti-entropy response");
            return;
        }
    };
    let resp = AntiEntropyResp { missing_records };
    let frame = match Frame::encode(FrameKind::AntiEntropyResp, &resp) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(%err, "failed to encode anti-entropy response");
            return;
        }
    };
    if let Err(err) = rt.supervisor.send(from, RequestId::generate(), frame).await {
        debug!(%err, peer = %from, "failed to send anti-entropy response");
    }
}

/// One round of the §4.5 anti-entropy loop: push this node's digest to every
/// connected peer so each can reply with whatever it's missing.
async fn run_anti_entropy_round(rt: &Arc<Runtime>) {
    let digest = match rt.gossip.digest() {
        Ok(digest) => digest,
        Err(err) => {
            warn!(%err, "failed to compute gossip digest");
            return;
        }
    };
    let req = AntiEntropyReq { digest };
    let frame = match Frame::encode(FrameKind::AntiEntropyReq, &req) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(%err, "failed to encode anti-entropy request");
            return;
        }
    };

    for peer in rt.peer_snapshot() {
        if peer.active_transport.is_none() {
            continue;
        }
        let frame = frame.clone();
        let supervisor = rt.supervisor.clone();
        tokio::spawn(async move {
            if let Err(err) = supervisor.send(peer.node_id, RequestId::generate(), frame).await {
                debug!(%err, peer = %peer.node_id, "anti-entropy push failed");
            }
        });
    }
}

/// Serves an `IntentRequest` that some other node's router dispatched to us,
/// and signs+sends the matching `IntentResponse` back (§4.8 step 7).
async fn serve_inbound_intent(rt: &Runtime, from: atmosphere_core::NodeId, request: atmosphere_core::IntentRequest) {
    let response = rt.router.handle_inbound_intent(&request);
    let signed = match atmosphere_core::crypto::sign_intent_response(response, &rt.keypair) {
        Ok(signed) => signed,
        Err(err) => {
            warn!(%err, "failed to sign intent response");
            return;
        }
    };
    let frame = match Frame::encode(FrameKind::IntentResponse, &signed) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(%err, "failed to encode intent response");
            return;
        }
    };
    if let Err(err) = rt.supervisor.send(from, signed.request_id, frame).await {
        warn!(%err, peer = %from, "failed to send intent response");
    }
}

async fn join(config: Config, raw: &str) -> anyhow::Result<ExitCode> {
    let parsed = token::decode(raw);
    let invite = match parsed {
        Ok(invite) => invite,
        Err(err) => {
            error!(%err, "invalid invite token");
            return Ok(ExitCode::from(2));
        }
    };

    let rt = Runtime::bootstrap(config).await?;
    match rt.join(&invite) {
        Ok(mesh_id) => {
            info!(mesh_id = %mesh_id, "joined mesh");
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            error!(%err, "could not join mesh");
            Ok(ExitCode::from(2))
        }
    }
}

async fn invite(config: Config, ttl_hours: u64) -> anyhow::Result<ExitCode> {
    let rt = Runtime::bootstrap(config).await?;
    rt.ensure_mesh()?;
    let invite = rt.invite(ttl_hours)?;
    println!("{}", token::encode(&invite)?);
    println!("short code: {}", token::short_code(&invite)?);
    Ok(ExitCode::SUCCESS)
}

async fn peers(config: Config) -> anyhow::Result<ExitCode> {
    let rt = Runtime::bootstrap(config).await?;
    rt.reconnect_saved_meshes();
    for peer in rt.peer_snapshot() {
        println!(
            "{}  transport={:?}  liveness={:?}",
            peer.node_id, peer.active_transport, peer.liveness
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn status(config: Config) -> anyhow::Result<ExitCode> {
    let rt = Runtime::bootstrap(config).await?;
    println!("node_id: {}", rt.node_id);
    match rt.meshes.lock().active() {
        Some(mesh) => println!("active mesh: {} ({})", mesh.mesh_name, mesh.mesh_id),
        None => println!("active mesh: none"),
    }
    Ok(ExitCode::SUCCESS)
}

async fn network(config: Config) -> anyhow::Result<ExitCode> {
    let rt = Runtime::bootstrap(config).await?;
    for entry in rt.capability_snapshot().values() {
        println!(
            "{}  owner={}  type={:?}  v{}",
            entry.record.capability_id, entry.record.owner_node_id, entry.record.type_tag, entry.record.version
        );
    }
    Ok(ExitCode::SUCCESS)
}
