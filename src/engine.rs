//! Top-level engine (§6): the single owner task that wires together
//! the session manager, peer manager, bandwidth limiter, per-torrent
//! disk managers, and every per-peer connection into one cancellable
//! unit, driven entirely by commands and internal events over channels.
//!
//! Every public [`Engine`] method sends a [`Command`] to the actor and
//! awaits a reply; the actor is the sole owner of every piece of
//! mutable state below, so nothing here needs a `Mutex`.
use crate::bandwidth::{BandwidthLimiter, Direction};
use crate::choking::ChokingDecision;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::events::EngineEvent;
use crate::metainfo::{InfoHash, Metainfo};
use crate::peer::connect::smart_connect;
use crate::peer::connection::Connection;
use crate::peer::manager::{PeerEvent, PeerHandle, PeerManager};
use crate::peer::message::{Block, BlockRequest, ExtendedMessage, ExtensionHandshake, PexPeers};
use crate::peer::wire::Wire;
use crate::peer::{Bitfield, DisconnectReason, Handshake, Message, PeerError, PeerKey};
use crate::piece::PieceEvent;
use crate::session::disk::DiskManager;
use crate::session::manager::SessionManager;
use crate::session::{RateWindow, SessionState, TorrentSession};
use crate::tracker::coordinator::{Coordinator, TrackerEvent};
use crate::tracker::{AnnounceEvent, AnnounceRequest};
use rand::RngCore;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// BEP-11: the extension id this engine advertises for `ut_pex`.
const EXT_UT_PEX: u8 = 1;
const BANDWIDTH_TICK: Duration = Duration::from_millis(100);
const TRACKER_TICK: Duration = Duration::from_millis(100);

/// Public snapshot of a torrent's progress, returned by [`Engine::get_stats`]
/// and [`Engine::get_all`] — never holds a borrow into the actor's state.
#[derive(Debug, Clone)]
pub struct TorrentStats {
    pub info_hash: InfoHash,
    pub state: SessionState,
    pub downloaded: u64,
    pub uploaded: u64,
    pub have_pieces: usize,
    pub piece_count: usize,
    pub download_speed: f64,
    pub upload_speed: f64,
}

fn torrent_stats(session: &TorrentSession) -> TorrentStats {
    TorrentStats {
        info_hash: session.info_hash,
        state: session.state,
        downloaded: session.metrics.downloaded,
        uploaded: session.metrics.uploaded,
        have_pieces: session.piece_manager.have().count_have(),
        piece_count: session.metainfo.piece_count,
        download_speed: session.metrics.download_speed(),
        upload_speed: session.metrics.upload_speed(),
    }
}

/// What a newly-linked peer needs to build its `Wire`/reader loop,
/// handed back across the registration round-trip (§4.10).
struct LinkAccepted {
    piece_count: usize,
    have: Bitfield,
}

enum Command {
    AddTorrent { metainfo: Box<Metainfo>, disk: Box<dyn DiskManager>, reply: oneshot::Sender<Result<InfoHash>> },
    RemoveTorrent { info_hash: InfoHash, reply: oneshot::Sender<()> },
    StartTorrent { info_hash: InfoHash, reply: oneshot::Sender<bool> },
    PauseTorrent { info_hash: InfoHash, reply: oneshot::Sender<()> },
    StopTorrent { info_hash: InfoHash, reply: oneshot::Sender<()> },
    GetStats { info_hash: InfoHash, reply: oneshot::Sender<Option<TorrentStats>> },
    GetAll { reply: oneshot::Sender<Vec<TorrentStats>> },
    PeerLinked {
        key: PeerKey,
        outbound: mpsc::UnboundedSender<Message>,
        cancel: CancellationToken,
        reply: oneshot::Sender<Option<LinkAccepted>>,
    },
    PeerDisconnected { key: PeerKey, reason: DisconnectReason },
    Shutdown,
}

enum Internal {
    Peer(PeerEvent),
    Tracker { info_hash: InfoHash, event: TrackerEvent },
    /// A bandwidth-deferred upload whose token bucket has since freed
    /// up; routed back through the actor since the task that awaited
    /// the bandwidth receiver can't mutate session state itself.
    SendPiece { info_hash: InfoHash, key: PeerKey, request: BlockRequest, data: Vec<u8> },
}

/// Handle to the running engine. Cloning is cheap; every method just
/// round-trips a command to the actor task.
pub struct Engine {
    cmd_tx: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
}

impl Engine {
    /// Start the engine: spawns the actor task and the inbound TCP
    /// accept loop, and returns immediately.
    pub fn start(config: EngineConfig, events: mpsc::UnboundedSender<EngineEvent>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let forward_internal = internal_tx.clone();
        tokio::spawn(async move {
            let mut peer_rx = peer_rx;
            while let Some(event) = peer_rx.recv().await {
                if forward_internal.send(Internal::Peer(event)).is_err() {
                    break;
                }
            }
        });

        let mut peer_id_bytes = [0u8; 20];
        peer_id_bytes[0..8].copy_from_slice(b"-RS0001-");
        rand::rng().fill_bytes(&mut peer_id_bytes[8..]);

        let actor = EngineActor {
            max_connections: config.max_connections,
            port: config.port,
            pex_enabled: config.pex_enabled,
            encryption_mode: config.encryption_mode,
            verify_on_add: config.verify_on_add,
            start_on_add: config.start_on_add,
            events,
            cmd_tx: cmd_tx.clone(),
            cmd_rx,
            internal_tx: internal_tx.clone(),
            internal_rx,
            peer_tx,
            cancel: cancel.clone(),
            peer_id: peer_id_bytes,
            sessions: SessionManager::new(config.max_active_torrents),
            peers: PeerManager::new(config.max_connections, config.max_connections_per_torrent),
            bandwidth: BandwidthLimiter::new(config.max_download_speed, config.max_upload_speed),
            disks: HashMap::new(),
            peer_download_rates: HashMap::new(),
            peer_upload_rates: HashMap::new(),
            choked_by: HashSet::new(),
            peer_cancels: HashMap::new(),
        };

        tokio::spawn(accept_loop(
            config.port,
            peer_id_bytes,
            config.pex_enabled,
            cmd_tx.clone(),
            internal_tx,
            cancel.child_token(),
        ));
        tokio::spawn(actor.run());

        Self { cmd_tx, cancel }
    }

    pub async fn add_torrent(&self, metainfo: Metainfo, disk: Box<dyn DiskManager>) -> Result<InfoHash> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::AddTorrent { metainfo: Box::new(metainfo), disk, reply })
            .map_err(|_| Error::InvalidState("engine shut down".into()))?;
        rx.await.map_err(|_| Error::InvalidState("engine shut down".into()))?
    }

    pub async fn remove_torrent(&self, info_hash: InfoHash) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::RemoveTorrent { info_hash, reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn start_torrent(&self, info_hash: InfoHash) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::StartTorrent { info_hash, reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn pause_torrent(&self, info_hash: InfoHash) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::PauseTorrent { info_hash, reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn stop_torrent(&self, info_hash: InfoHash) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::StopTorrent { info_hash, reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn get_stats(&self, info_hash: InfoHash) -> Option<TorrentStats> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(Command::GetStats { info_hash, reply }).ok()?;
        rx.await.ok().flatten()
    }

    pub async fn get_all(&self) -> Vec<TorrentStats> {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetAll { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Tear down the engine: stops the actor loop and cancels every
    /// spawned peer/accept task.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
        self.cancel.cancel();
    }
}

struct EngineActor {
    max_connections: usize,
    port: u16,
    pex_enabled: bool,
    encryption_mode: crate::peer::encryption::EncryptionMode,
    verify_on_add: bool,
    start_on_add: bool,
    events: mpsc::UnboundedSender<EngineEvent>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    peer_tx: mpsc::UnboundedSender<PeerEvent>,
    cancel: CancellationToken,
    peer_id: [u8; 20],
    sessions: SessionManager,
    peers: PeerManager,
    bandwidth: BandwidthLimiter,
    disks: HashMap<InfoHash, Box<dyn DiskManager>>,
    /// Per-peer rolling download-rate-to-us, separate from upload so the
    /// choking round can pick the direction §4.12 actually asks for.
    peer_download_rates: HashMap<PeerKey, RateWindow>,
    /// Per-peer rolling upload-rate-from-us.
    peer_upload_rates: HashMap<PeerKey, RateWindow>,
    /// Peers who currently have us choked (can't request from them).
    choked_by: HashSet<PeerKey>,
    peer_cancels: HashMap<PeerKey, CancellationToken>,
}

impl EngineActor {
    async fn run(mut self) {
        let _ = self.events.send(EngineEvent::EngineStarted);
        let mut bandwidth_tick = tokio::time::interval(BANDWIDTH_TICK);
        let mut choking_tick = tokio::time::interval(crate::choking::REGULAR_ROUND_INTERVAL);
        let mut tracker_tick_interval = tokio::time::interval(TRACKER_TICK);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(command) = self.cmd_rx.recv() => {
                    if self.handle_command(command).await {
                        break;
                    }
                }
                Some(internal) = self.internal_rx.recv() => {
                    self.handle_internal(internal).await;
                }
                _ = bandwidth_tick.tick() => self.bandwidth.tick(),
                _ = choking_tick.tick() => self.run_choking_round(),
                _ = tracker_tick_interval.tick() => self.tracker_tick().await,
            }
        }

        let _ = self.events.send(EngineEvent::EngineStopped);
    }

    /// Returns `true` if the actor should stop running.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::AddTorrent { metainfo, mut disk, reply } => {
                let info_hash = metainfo.info_hash;
                if self.verify_on_add {
                    if let Err(e) = disk.verify_existing_pieces().await {
                        let _ = reply.send(Err(e.into()));
                        return false;
                    }
                }
                let already_verified = match disk.start().await {
                    Ok(set) => set,
                    Err(e) => {
                        let _ = reply.send(Err(e.into()));
                        return false;
                    }
                };
                let session = TorrentSession::new(*metainfo, already_verified);
                self.peers.register_torrent(info_hash, self.peer_tx.clone());
                self.bandwidth.add_torrent(info_hash, 0, 0);
                self.disks.insert(info_hash, disk);
                self.sessions.add_torrent(session);
                let _ = self.events.send(EngineEvent::TorrentAdded { info_hash });
                let _ = reply.send(Ok(info_hash));
                if self.start_on_add {
                    self.start_torrent(info_hash).await;
                }
            }
            Command::RemoveTorrent { info_hash, reply } => {
                self.disconnect_all(info_hash, DisconnectReason::Manual).await;
                self.peers.unregister_torrent(&info_hash);
                self.bandwidth.remove_torrent(&info_hash);
                self.disks.remove(&info_hash);
                self.sessions.remove_torrent(&info_hash);
                self.promote_queued().await;
                let _ = self.events.send(EngineEvent::TorrentRemoved { info_hash });
                let _ = reply.send(());
            }
            Command::StartTorrent { info_hash, reply } => {
                let started = self.start_torrent(info_hash).await;
                let _ = reply.send(started);
            }
            Command::PauseTorrent { info_hash, reply } => {
                self.disconnect_all(info_hash, DisconnectReason::Manual).await;
                self.sessions.pause(&info_hash);
                self.promote_queued().await;
                let _ = self.events.send(EngineEvent::TorrentPaused { info_hash });
                let _ = reply.send(());
            }
            Command::StopTorrent { info_hash, reply } => {
                self.disconnect_all(info_hash, DisconnectReason::Manual).await;
                if let Some(session) = self.sessions.get_mut(&info_hash) {
                    session.stop();
                }
                self.promote_queued().await;
                let _ = reply.send(());
            }
            Command::GetStats { info_hash, reply } => {
                let stats = self.sessions.get_mut(&info_hash).map(|s| torrent_stats(s));
                let _ = reply.send(stats);
            }
            Command::GetAll { reply } => {
                let stats: Vec<TorrentStats> = self.sessions.get_all().map(torrent_stats).collect();
                let _ = reply.send(stats);
            }
            Command::PeerLinked { key, outbound, cancel, reply } => {
                let accepted = match self.sessions.get_mut(&key.info_hash) {
                    Some(session) if self.peers.can_accept(&key) => Some(LinkAccepted {
                        piece_count: session.metainfo.piece_count,
                        have: session.piece_manager.have().clone(),
                    }),
                    _ => None,
                };
                if accepted.is_some() {
                    self.peer_cancels.insert(key, cancel);
                    self.peers.insert(key, PeerHandle { outbound, addr: key.addr });
                }
                let _ = reply.send(accepted);
            }
            Command::PeerDisconnected { key, reason } => {
                self.disconnect_peer(key, reason);
            }
            Command::Shutdown => return true,
        }
        false
    }

    /// Admission-controlled start (§4.15); spawns the tracker-event
    /// forwarder for the freshly-built coordinator only if the session
    /// actually transitions. Emits `TorrentResumed` rather than
    /// `TorrentStarted` when resuming from `Paused`, matching §6's
    /// distinct `started`/`resumed` event tags.
    async fn start_torrent(&mut self, info_hash: InfoHash) -> bool {
        let internal_tx = self.internal_tx.clone();
        let prior_state = self.sessions.get_mut(&info_hash).map(|s| s.state);
        let was_paused = prior_state == Some(SessionState::Paused);
        let was_queued_or_paused =
            matches!(prior_state, Some(SessionState::Queued) | Some(SessionState::Checking) | Some(SessionState::Paused));

        let started = self.sessions.start_with(&info_hash, move |tiers| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(spawn_tracker_forwarder(info_hash, rx, internal_tx));
            Coordinator::new(tiers, tx)
        });

        if started && was_queued_or_paused {
            let event = if was_paused { EngineEvent::TorrentResumed { info_hash } } else { EngineEvent::TorrentStarted { info_hash } };
            let _ = self.events.send(event);
        }
        started
    }

    /// Fill every active slot freed by a pause/stop/remove with queued
    /// torrents (§4.15), routing each through [`start_torrent`](Self::start_torrent)
    /// so the promoted session's coordinator gets the same tagged
    /// tracker-event forwarder a manual start gets.
    async fn promote_queued(&mut self) {
        while let Some(info_hash) = self.sessions.next_promotable() {
            self.start_torrent(info_hash).await;
        }
    }

    async fn disconnect_all(&mut self, info_hash: InfoHash, reason: DisconnectReason) {
        let keys: Vec<PeerKey> = self.peers.connected_keys().into_iter().filter(|k| k.info_hash == info_hash).collect();
        for key in keys {
            self.disconnect_peer(key, reason);
        }
    }

    fn disconnect_peer(&mut self, key: PeerKey, reason: DisconnectReason) {
        self.peers.remove(&key, reason);
        self.peer_download_rates.remove(&key);
        self.peer_upload_rates.remove(&key);
        self.choked_by.remove(&key);
        if let Some(cancel) = self.peer_cancels.remove(&key) {
            cancel.cancel();
        }
    }

    fn send_to(&self, key: PeerKey, message: Message) {
        if let Some(handle) = self.peers.handle(&key) {
            let _ = handle.outbound.send(message);
        }
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Peer(event) => {
                let info_hash = peer_event_info_hash(&event);
                self.handle_peer_event(info_hash, event).await;
            }
            Internal::Tracker { info_hash, event } => self.handle_tracker_event(info_hash, event).await,
            Internal::SendPiece { info_hash, key, request, data } => self.send_piece(info_hash, key, request, data),
        }
    }

    async fn handle_peer_event(&mut self, info_hash: InfoHash, event: PeerEvent) {
        match event {
            PeerEvent::PeerConnected { key } => {
                let _ = self.events.send(EngineEvent::Peer { info_hash, event: PeerEvent::PeerConnected { key } });
            }
            PeerEvent::PeerDisconnected { key, reason } => {
                if let Some(session) = self.sessions.get_mut(&info_hash) {
                    session.piece_manager.remove_peer(&key);
                    session.choking.remove_peer(&key);
                }
                self.peer_download_rates.remove(&key);
                self.peer_upload_rates.remove(&key);
                self.choked_by.remove(&key);
                let _ = self.events.send(EngineEvent::Peer { info_hash, event: PeerEvent::PeerDisconnected { key, reason } });
            }
            PeerEvent::PeerBitfield { key, bitfield } => {
                if let Some(session) = self.sessions.get_mut(&info_hash) {
                    session.piece_manager.update_peer_bitfield(key, bitfield);
                }
                self.update_interest(info_hash, key);
            }
            PeerEvent::PeerHave { key, piece_index } => {
                if let Some(session) = self.sessions.get_mut(&info_hash) {
                    session.piece_manager.update_peer_have(key, piece_index as usize);
                }
                self.update_interest(info_hash, key);
            }
            PeerEvent::PeerChoked { key } => {
                self.choked_by.insert(key);
            }
            PeerEvent::PeerUnchoked { key } => {
                self.choked_by.remove(&key);
                self.request_more_blocks(info_hash, key);
            }
            PeerEvent::PeerInterested { key } => {
                if let Some(session) = self.sessions.get_mut(&info_hash) {
                    session.choking.set_interested(key, true);
                }
            }
            PeerEvent::PeerNotInterested { key } => {
                if let Some(session) = self.sessions.get_mut(&info_hash) {
                    session.choking.set_interested(key, false);
                }
            }
            PeerEvent::PieceReceived { key, block } => {
                self.handle_piece_received(info_hash, key, block).await;
            }
            PeerEvent::RequestReceived { key, request } => {
                self.handle_request_received(info_hash, key, request).await;
            }
            PeerEvent::PexPeers { key: _, peers } => {
                if self.pex_enabled {
                    let addrs: Vec<SocketAddr> = peers.into_iter().map(|(addr, _flags)| addr).collect();
                    self.connect_to_discovered(info_hash, addrs).await;
                }
            }
        }
    }

    /// Recompute interest toward `key` and (if we're already unchoked
    /// by them) immediately top up our outstanding block requests.
    fn update_interest(&mut self, info_hash: InfoHash, key: PeerKey) {
        let interesting = match self.sessions.get_mut(&info_hash) {
            Some(session) => session.piece_manager.is_interesting(&key),
            None => return,
        };
        self.send_to(key, if interesting { Message::Interested } else { Message::NotInterested });
        if interesting && !self.choked_by.contains(&key) {
            self.request_more_blocks(info_hash, key);
        }
    }

    fn request_more_blocks(&mut self, info_hash: InfoHash, key: PeerKey) {
        let requests = match self.sessions.get_mut(&info_hash) {
            Some(session) => session.piece_manager.get_block_requests(key),
            None => return,
        };
        for request in requests {
            self.send_to(key, Message::Request(request));
        }
    }

    fn record_download_rate(&mut self, key: PeerKey, bytes: u64) {
        self.peer_download_rates.entry(key).or_insert_with(|| RateWindow::new(Duration::from_secs(5))).record(bytes);
    }

    fn record_upload_rate(&mut self, key: PeerKey, bytes: u64) {
        self.peer_upload_rates.entry(key).or_insert_with(|| RateWindow::new(Duration::from_secs(5))).record(bytes);
    }

    async fn handle_piece_received(&mut self, info_hash: InfoHash, key: PeerKey, block: Block) {
        self.record_download_rate(key, block.data.len() as u64);

        let outcome = {
            let Some(session) = self.sessions.get_mut(&info_hash) else { return };
            session.metrics.record_download(block.data.len() as u64);
            session.choking.record_activity(key);
            let index = block.index as usize;
            let piece_hash = session.metainfo.piece_hash(index).map(|h| h.to_vec());
            match piece_hash {
                Some(hash) => Some(session.piece_manager.handle_block(key, block, &hash)),
                None => None,
            }
        };

        let Some((event, cancels)) = outcome else {
            self.request_more_blocks(info_hash, key);
            return;
        };

        for (peer, request) in cancels {
            self.send_to(peer, Message::Cancel(request));
        }

        match event {
            Some(PieceEvent::PieceComplete { index, data }) => {
                self.on_piece_complete(info_hash, index, data).await;
            }
            Some(PieceEvent::PieceFailed { index, offending_peers }) => {
                warn!(?info_hash, index, "piece failed hash verification");
                let banned: Vec<PeerKey> = {
                    let Some(session) = self.sessions.get_mut(&info_hash) else {
                        return;
                    };
                    offending_peers.into_iter().filter(|p| session.piece_manager.is_banned(p)).collect()
                };
                for peer in banned {
                    self.disconnect_peer(peer, DisconnectReason::ProtocolError);
                }
            }
            Some(PieceEvent::PeerBanned { peer }) => {
                self.disconnect_peer(peer, DisconnectReason::ProtocolError);
            }
            None => {}
        }

        self.request_more_blocks(info_hash, key);
    }

    async fn on_piece_complete(&mut self, info_hash: InfoHash, index: usize, data: Vec<u8>) {
        if let Some(disk) = self.disks.get_mut(&info_hash) {
            if let Err(e) = disk.write_piece(index, data).await {
                warn!(?info_hash, index, error = %e, "failed to write completed piece to disk");
                return;
            }
        }

        let keys: Vec<PeerKey> = self.peers.connected_keys().into_iter().filter(|k| k.info_hash == info_hash).collect();
        for key in keys {
            self.send_to(key, Message::Have(index as u32));
        }

        let Some(session) = self.sessions.get_mut(&info_hash) else { return };
        let was_downloading = session.state == SessionState::Downloading;
        session.on_piece_complete();
        let became_seeding = was_downloading && session.state == SessionState::Seeding;
        let downloaded = session.metrics.downloaded;
        let uploaded = session.metrics.uploaded;
        let have_pieces = session.piece_manager.have().count_have();

        let _ = self.events.send(EngineEvent::TorrentProgress { info_hash, downloaded, uploaded, have_pieces });
        if became_seeding {
            info!(?info_hash, "torrent completed");
            let _ = self.events.send(EngineEvent::TorrentCompleted { info_hash });
        }
    }

    async fn handle_request_received(&mut self, info_hash: InfoHash, key: PeerKey, request: BlockRequest) {
        let unchoked = match self.sessions.get_mut(&info_hash) {
            Some(session) => {
                session.choking.record_activity(key);
                session.choking.is_unchoked(&key)
            }
            None => return,
        };
        if !unchoked {
            return;
        }

        let data = match self.disks.get(&info_hash) {
            Some(disk) => match disk.read_block(request.index as usize, request.begin, request.length).await {
                Ok(data) => data,
                Err(e) => {
                    debug!(?info_hash, ?request, error = %e, "failed to read requested block");
                    return;
                }
            },
            None => return,
        };

        match self.bandwidth.try_request(data.len() as u64, Direction::Upload, info_hash) {
            Ok(()) => self.send_piece(info_hash, key, request, data),
            Err(rx) => {
                let internal_tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    if rx.await.is_ok() {
                        let _ = internal_tx.send(Internal::SendPiece { info_hash, key, request, data });
                    }
                });
            }
        }
    }

    fn send_piece(&mut self, info_hash: InfoHash, key: PeerKey, request: BlockRequest, data: Vec<u8>) {
        self.record_upload_rate(key, data.len() as u64);
        if let Some(session) = self.sessions.get_mut(&info_hash) {
            session.metrics.record_upload(data.len() as u64);
        }
        self.send_to(key, Message::Piece(Block { index: request.index, begin: request.begin, data }));
    }

    fn run_choking_round(&mut self) {
        let info_hashes: Vec<InfoHash> = self.sessions.get_all().map(|s| s.info_hash).collect();
        for info_hash in info_hashes {
            let peer_keys: Vec<PeerKey> =
                self.peers.connected_keys().into_iter().filter(|k| k.info_hash == info_hash).collect();
            // §4.12: rank by download-rate-to-us while downloading, by
            // upload-rate-from-us while seeding.
            let seeding = self.sessions.get_mut(&info_hash).map(|s| s.state == SessionState::Seeding).unwrap_or(false);
            let rate_table = if seeding { &self.peer_upload_rates } else { &self.peer_download_rates };
            let rates: Vec<(PeerKey, f64)> =
                peer_keys.iter().map(|key| (*key, rate_table.get(key).map(|w| w.rate()).unwrap_or(0.0))).collect();

            let decision: ChokingDecision = {
                let Some(session) = self.sessions.get_mut(&info_hash) else { continue };
                for (key, rate) in rates {
                    session.choking.update_rate(key, rate);
                }
                session.choking.run_round()
            };

            for key in decision.newly_unchoked {
                self.send_to(key, Message::Unchoke);
            }
            for key in decision.newly_choked {
                self.send_to(key, Message::Choke);
            }
        }
    }

    async fn tracker_tick(&mut self) {
        let info_hashes: Vec<InfoHash> =
            self.sessions.get_all().filter(|s| s.is_active() && s.coordinator.is_some()).map(|s| s.info_hash).collect();

        for info_hash in info_hashes {
            let Some(session) = self.sessions.get_mut(&info_hash) else { continue };
            let request = build_announce_request(self.peer_id, self.port, session);
            if let Some(coordinator) = session.coordinator.as_mut() {
                coordinator.announce_due(&request).await;
            }
            session.piece_manager.reap_stale_requests();
        }
    }

    async fn handle_tracker_event(&mut self, info_hash: InfoHash, event: TrackerEvent) {
        if let TrackerEvent::PeersDiscovered { peers, .. } = &event {
            let peers = peers.clone();
            let _ = self.events.send(EngineEvent::Tracker { info_hash, event: event.clone() });
            self.connect_to_discovered(info_hash, peers).await;
        } else {
            let _ = self.events.send(EngineEvent::Tracker { info_hash, event });
        }
    }

    async fn connect_to_discovered(&mut self, info_hash: InfoHash, addrs: Vec<SocketAddr>) {
        if self.peers.connection_count() >= self.max_connections {
            return;
        }
        let piece_count = match self.sessions.get_mut(&info_hash) {
            Some(session) => session.metainfo.piece_count,
            None => return,
        };
        let handshake = Handshake::new(info_hash, self.peer_id).with_reserved(reserved_bytes(self.pex_enabled));

        for addr in addrs {
            let key = PeerKey { info_hash, addr };
            if !self.peers.can_accept(&key) {
                continue;
            }
            tokio::spawn(connect_and_serve(
                addr,
                key,
                self.encryption_mode,
                handshake.clone(),
                piece_count,
                self.pex_enabled,
                self.cancel.child_token(),
                self.cmd_tx.clone(),
                self.internal_tx.clone(),
            ));
        }
    }
}

async fn spawn_tracker_forwarder(
    info_hash: InfoHash,
    mut rx: mpsc::UnboundedReceiver<TrackerEvent>,
    tx: mpsc::UnboundedSender<Internal>,
) {
    while let Some(event) = rx.recv().await {
        if tx.send(Internal::Tracker { info_hash, event }).is_err() {
            break;
        }
    }
}

/// Heuristic event derivation: a real client tracks "have we already
/// sent `started` this session" explicitly; this infers it from the
/// current metrics, which misfires only if both counters happen to be
/// zero on a later announce.
fn build_announce_request(peer_id: [u8; 20], port: u16, session: &TorrentSession) -> AnnounceRequest {
    let downloaded = session.metrics.downloaded;
    let uploaded = session.metrics.uploaded;
    let left = session.metainfo.total_length.saturating_sub(downloaded);
    let event = if downloaded == 0 && uploaded == 0 {
        AnnounceEvent::Started
    } else if left == 0 {
        AnnounceEvent::Completed
    } else {
        AnnounceEvent::None
    };
    AnnounceRequest {
        info_hash: session.info_hash,
        peer_id,
        port,
        uploaded,
        downloaded,
        left,
        event,
        numwant: Some(50),
        key: u32::from_be_bytes([peer_id[0], peer_id[1], peer_id[2], peer_id[3]]),
    }
}

fn reserved_bytes(pex_enabled: bool) -> [u8; 8] {
    let mut reserved = [0u8; 8];
    if pex_enabled {
        reserved[5] |= crate::peer::handshake::RESERVED_EXTENSION_PROTOCOL;
    }
    reserved
}

#[allow(clippy::too_many_arguments)]
async fn connect_and_serve(
    addr: SocketAddr,
    key: PeerKey,
    mode: crate::peer::encryption::EncryptionMode,
    handshake: Handshake,
    piece_count: usize,
    pex_enabled: bool,
    cancel: CancellationToken,
    cmd_tx: mpsc::UnboundedSender<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
) {
    let (established, their_handshake) =
        match smart_connect(addr, mode, &handshake, piece_count, cancel.clone()).await {
            Ok(result) => result,
            Err(e) => {
                debug!(%addr, error = %e, "outbound connect failed");
                return;
            }
        };
    if their_handshake.info_hash != handshake.info_hash {
        return;
    }

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (reply, reply_rx) = oneshot::channel();
    if cmd_tx.send(Command::PeerLinked { key, outbound: outbound_tx, cancel: cancel.clone(), reply }).is_err() {
        return;
    }
    let Ok(Some(accepted)) = reply_rx.await else { return };

    spawn_peer_io(
        established.wire,
        key,
        their_handshake.supports_extension_protocol(),
        pex_enabled,
        accepted.have,
        outbound_rx,
        cancel,
        cmd_tx,
        internal_tx,
    )
    .await;
}

/// Inbound connections don't know which torrent they belong to until
/// the handshake's info hash is parsed, so registration happens before
/// `Wire` is even constructed — unlike the outbound path, which already
/// knows `piece_count` going in. Only plaintext inbound is supported;
/// an inbound MSE/PE responder isn't implemented.
#[allow(clippy::too_many_arguments)]
async fn serve_inbound(
    stream: tokio::net::TcpStream,
    addr: SocketAddr,
    peer_id: [u8; 20],
    pex_enabled: bool,
    cancel: CancellationToken,
    cmd_tx: mpsc::UnboundedSender<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
) {
    let mut connection = Connection::from_stream(stream, cancel.clone());
    let mut buf = [0u8; crate::peer::handshake::HANDSHAKE_LEN];
    if connection.read_exact(&mut buf).await.is_err() {
        return;
    }
    let their_handshake = match Handshake::parse(&buf) {
        Ok(h) => h,
        Err(_) => return,
    };
    let key = PeerKey { info_hash: their_handshake.info_hash, addr };

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (reply, reply_rx) = oneshot::channel();
    if cmd_tx.send(Command::PeerLinked { key, outbound: outbound_tx, cancel: cancel.clone(), reply }).is_err() {
        return;
    }
    let Ok(Some(accepted)) = reply_rx.await else { return };

    let our_handshake = Handshake::new(key.info_hash, peer_id).with_reserved(reserved_bytes(pex_enabled));
    if connection.write_all(&our_handshake.serialize()).await.is_err() {
        return;
    }
    let wire = Wire::new(connection, accepted.piece_count);

    spawn_peer_io(
        wire,
        key,
        their_handshake.supports_extension_protocol(),
        pex_enabled,
        accepted.have,
        outbound_rx,
        cancel,
        cmd_tx,
        internal_tx,
    )
    .await;
}

/// Shared tail for both inbound and outbound connections once a `Wire`
/// past its handshake exists and registration has succeeded: splits
/// it, spawns the writer task, and runs the reader loop inline,
/// translating every parsed message into a [`PeerEvent`].
#[allow(clippy::too_many_arguments)]
async fn spawn_peer_io(
    wire: Wire,
    key: PeerKey,
    peer_supports_extension: bool,
    pex_enabled: bool,
    have: Bitfield,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
    cancel: CancellationToken,
    cmd_tx: mpsc::UnboundedSender<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
) {
    let (mut reader, mut writer) = wire.split();

    if pex_enabled && peer_supports_extension {
        let mut handshake = ExtensionHandshake { listen_port: None, client_version: None, max_pending_requests: None, ..Default::default() };
        handshake.extensions.insert("ut_pex".to_string(), EXT_UT_PEX);
        let ext = ExtendedMessage { ext_id: 0, payload: handshake.to_value() };
        let _ = writer.send(&Message::Extended(ext)).await;
    }
    let _ = writer.send(&Message::Bitfield(have)).await;

    tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if writer.send(&message).await.is_err() {
                break;
            }
        }
        writer.close().await;
    });

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = reader.receive() => {
                match result {
                    Ok(message) => {
                        if let Some(event) = message_to_peer_event(key, message) {
                            if internal_tx.send(Internal::Peer(event)).is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        let reason = classify_disconnect(&e);
                        let _ = cmd_tx.send(Command::PeerDisconnected { key, reason });
                        break;
                    }
                }
            }
        }
    }
}

async fn accept_loop(
    port: u16,
    peer_id: [u8; 20],
    pex_enabled: bool,
    cmd_tx: mpsc::UnboundedSender<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    cancel: CancellationToken,
) {
    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!(port, error = %e, "failed to bind inbound listener");
            return;
        }
    };
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let Ok((stream, addr)) = accepted else { continue };
                tokio::spawn(serve_inbound(
                    stream,
                    addr,
                    peer_id,
                    pex_enabled,
                    cancel.child_token(),
                    cmd_tx.clone(),
                    internal_tx.clone(),
                ));
            }
        }
    }
}

fn message_to_peer_event(key: PeerKey, message: Message) -> Option<PeerEvent> {
    match message {
        Message::KeepAlive => None,
        Message::Choke => Some(PeerEvent::PeerChoked { key }),
        Message::Unchoke => Some(PeerEvent::PeerUnchoked { key }),
        Message::Interested => Some(PeerEvent::PeerInterested { key }),
        Message::NotInterested => Some(PeerEvent::PeerNotInterested { key }),
        Message::Have(index) => Some(PeerEvent::PeerHave { key, piece_index: index }),
        Message::Bitfield(bitfield) => Some(PeerEvent::PeerBitfield { key, bitfield }),
        Message::Request(request) => Some(PeerEvent::RequestReceived { key, request }),
        Message::Piece(block) => Some(PeerEvent::PieceReceived { key, block }),
        // We don't track our own outstanding upload obligations, so an
        // incoming cancel is simply ignored; worst case we send one
        // unwanted piece.
        Message::Cancel(_) => None,
        Message::Extended(ext) => extended_to_event(key, ext),
    }
}

fn extended_to_event(key: PeerKey, ext: ExtendedMessage) -> Option<PeerEvent> {
    if ext.ext_id == 0 {
        return None;
    }
    if ext.ext_id == EXT_UT_PEX {
        if let Ok(pex) = PexPeers::from_value(&ext.payload) {
            return Some(PeerEvent::PexPeers { key, peers: pex.added });
        }
    }
    None
}

fn classify_disconnect(error: &PeerError) -> DisconnectReason {
    match error {
        PeerError::IdleTimeout => DisconnectReason::Timeout,
        PeerError::Cancelled => DisconnectReason::Manual,
        PeerError::Io(_) => DisconnectReason::PeerClosed,
        _ => DisconnectReason::ProtocolError,
    }
}

fn peer_event_info_hash(event: &PeerEvent) -> InfoHash {
    match event {
        PeerEvent::PeerConnected { key }
        | PeerEvent::PeerDisconnected { key, .. }
        | PeerEvent::PeerBitfield { key, .. }
        | PeerEvent::PeerHave { key, .. }
        | PeerEvent::PeerChoked { key }
        | PeerEvent::PeerUnchoked { key }
        | PeerEvent::PeerInterested { key }
        | PeerEvent::PeerNotInterested { key }
        | PeerEvent::PieceReceived { key, .. }
        | PeerEvent::RequestReceived { key, .. }
        | PeerEvent::PexPeers { key, .. } => key.info_hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{self, Value};
    use crate::session::disk::InMemoryDisk;
    use sha1::{Digest, Sha1};
    use std::collections::BTreeMap;

    fn sample_metainfo() -> Metainfo {
        let data = vec![0u8; 16384];
        let hash = Sha1::digest(&data);
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), Value::string("x"));
        info.insert(b"piece length".to_vec(), Value::integer(16384));
        info.insert(b"pieces".to_vec(), Value::ByteString(hash.to_vec()));
        info.insert(b"length".to_vec(), Value::integer(16384));
        let mut root = BTreeMap::new();
        root.insert(b"info".to_vec(), Value::Dictionary(info));
        let bytes = bencode::encode(&Value::Dictionary(root));
        Metainfo::parse(&bytes).unwrap()
    }

    fn sample_metainfo_named(name: &str) -> Metainfo {
        let data = vec![0u8; 16384];
        let hash = Sha1::digest(&data);
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), Value::string(name));
        info.insert(b"piece length".to_vec(), Value::integer(16384));
        info.insert(b"pieces".to_vec(), Value::ByteString(hash.to_vec()));
        info.insert(b"length".to_vec(), Value::integer(16384));
        let mut root = BTreeMap::new();
        root.insert(b"info".to_vec(), Value::Dictionary(info));
        let bytes = bencode::encode(&Value::Dictionary(root));
        Metainfo::parse(&bytes).unwrap()
    }

    fn test_config() -> EngineConfig {
        EngineConfig { port: 0, start_on_add: false, verify_on_add: false, ..Default::default() }
    }

    #[tokio::test]
    async fn add_torrent_then_get_stats_reports_piece_count() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let engine = Engine::start(test_config(), events_tx);
        let metainfo = sample_metainfo();
        let piece_hash: [u8; 20] = metainfo.piece_hash(0).unwrap().try_into().unwrap();
        let disk = Box::new(InMemoryDisk::new(16384, vec![piece_hash]));

        let info_hash = engine.add_torrent(metainfo, disk).await.unwrap();
        let stats = engine.get_stats(info_hash).await.unwrap();
        assert_eq!(stats.piece_count, 1);
        assert_eq!(stats.state, SessionState::Queued);
        engine.shutdown();
    }

    #[tokio::test]
    async fn start_on_add_false_keeps_torrent_queued_until_start_torrent_called() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let engine = Engine::start(test_config(), events_tx);
        let metainfo = sample_metainfo();
        let piece_hash: [u8; 20] = metainfo.piece_hash(0).unwrap().try_into().unwrap();
        let disk = Box::new(InMemoryDisk::new(16384, vec![piece_hash]));

        let info_hash = engine.add_torrent(metainfo, disk).await.unwrap();
        assert_eq!(engine.get_stats(info_hash).await.unwrap().state, SessionState::Queued);

        assert!(engine.start_torrent(info_hash).await);
        assert_eq!(engine.get_stats(info_hash).await.unwrap().state, SessionState::Downloading);
        engine.shutdown();
    }

    #[tokio::test]
    async fn pause_then_stop_transitions_state() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let engine = Engine::start(test_config(), events_tx);
        let metainfo = sample_metainfo();
        let piece_hash: [u8; 20] = metainfo.piece_hash(0).unwrap().try_into().unwrap();
        let disk = Box::new(InMemoryDisk::new(16384, vec![piece_hash]));

        let info_hash = engine.add_torrent(metainfo, disk).await.unwrap();
        engine.start_torrent(info_hash).await;
        engine.pause_torrent(info_hash).await;
        assert_eq!(engine.get_stats(info_hash).await.unwrap().state, SessionState::Paused);

        engine.stop_torrent(info_hash).await;
        assert_eq!(engine.get_stats(info_hash).await.unwrap().state, SessionState::Stopped);
        engine.shutdown();
    }

    #[tokio::test]
    async fn pausing_an_active_torrent_promotes_the_next_queued_one() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let config = EngineConfig { max_active_torrents: 1, ..test_config() };
        let engine = Engine::start(config, events_tx);

        let a = sample_metainfo_named("a");
        let a_piece_hash: [u8; 20] = a.piece_hash(0).unwrap().try_into().unwrap();
        let a_hash = engine.add_torrent(a, Box::new(InMemoryDisk::new(16384, vec![a_piece_hash]))).await.unwrap();
        assert!(engine.start_torrent(a_hash).await);

        let b = sample_metainfo_named("b");
        let b_piece_hash: [u8; 20] = b.piece_hash(0).unwrap().try_into().unwrap();
        let b_hash = engine.add_torrent(b, Box::new(InMemoryDisk::new(16384, vec![b_piece_hash]))).await.unwrap();
        // The active-torrent cap is already full, so b starts out queued.
        assert!(!engine.start_torrent(b_hash).await);
        assert_eq!(engine.get_stats(b_hash).await.unwrap().state, SessionState::Queued);

        engine.pause_torrent(a_hash).await;
        assert_eq!(engine.get_stats(b_hash).await.unwrap().state, SessionState::Downloading);
        engine.shutdown();
    }

    #[tokio::test]
    async fn get_all_reports_every_added_torrent() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let engine = Engine::start(test_config(), events_tx);
        let metainfo = sample_metainfo();
        let piece_hash: [u8; 20] = metainfo.piece_hash(0).unwrap().try_into().unwrap();
        let disk = Box::new(InMemoryDisk::new(16384, vec![piece_hash]));
        engine.add_torrent(metainfo, disk).await.unwrap();

        let all = engine.get_all().await;
        assert_eq!(all.len(), 1);
        engine.shutdown();
    }
}
