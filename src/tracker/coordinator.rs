//! Tiered tracker coordinator (§4.5): BEP-12 tiers, shuffle-once within
//! each tier, parallel per-tracker announce fan-out, independent
//! per-tracker backoff on failure.
use super::{
    backoff_secs, http::HttpTracker, udp::UdpTracker, AnnounceRequest, AnnounceResponse, Protocol, TrackerError,
    TrackerState, TrackerStatus,
};
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Emitted to the owning session as announces complete, so peer
/// discovery and UI/metrics layers don't have to poll the coordinator.
#[derive(Debug, Clone)]
pub enum TrackerEvent {
    PeersDiscovered { tracker_url: String, peers: Vec<SocketAddr> },
    AnnounceFailed { tracker_url: String, error: String },
}

pub struct Coordinator {
    tiers: Vec<Vec<TrackerState>>,
    http: HttpTracker,
    events: mpsc::UnboundedSender<TrackerEvent>,
}

impl Coordinator {
    /// `tiers` is `Metainfo::tiers()` output. Each tier is shuffled once
    /// at construction per BEP-12, and never reshuffled afterward.
    pub fn new(tiers: Vec<Vec<String>>, events: mpsc::UnboundedSender<TrackerEvent>) -> Self {
        let mut rng = rand::rng();
        let tiers = tiers
            .into_iter()
            .map(|mut tier| {
                tier.shuffle(&mut rng);
                tier.into_iter().map(TrackerState::new).collect()
            })
            .collect();
        Self { tiers, http: HttpTracker::new(), events }
    }

    /// Announce to every tracker across every tier whose `next_announce_at`
    /// has elapsed, in parallel: each due tracker's announce runs on its own
    /// task so a slow or hung tracker never delays discovering peers from
    /// the others. Within a tier §4.5 prescribes first-success promotion;
    /// since replies can land in any order, `promote_to_front` is applied
    /// as each result comes back rather than in `due_indices` order, so the
    /// tracker whose response actually arrived first is the one moved to
    /// the tier's front for the next cycle.
    pub async fn announce_due(&mut self, req: &AnnounceRequest) {
        let now = Instant::now();
        let mut due_indices = Vec::new();
        for (tier_idx, tier) in self.tiers.iter().enumerate() {
            for (tracker_idx, state) in tier.iter().enumerate() {
                if state.next_announce_at <= now && state.protocol != Protocol::Unknown {
                    due_indices.push((tier_idx, tracker_idx));
                }
            }
        }
        if due_indices.is_empty() {
            return;
        }

        let mut set = JoinSet::new();
        for (tier_idx, tracker_idx) in due_indices {
            let url = self.tiers[tier_idx][tracker_idx].url.clone();
            let protocol = self.tiers[tier_idx][tracker_idx].protocol;
            self.tiers[tier_idx][tracker_idx].status = TrackerStatus::Announcing;

            let http = self.http.clone();
            let req = req.clone();
            set.spawn(async move {
                let result = match protocol {
                    Protocol::Http => http.announce(&url, &req).await,
                    Protocol::Udp => announce_udp(&url, &req).await,
                    Protocol::Unknown => unreachable!("filtered above"),
                };
                (tier_idx, tracker_idx, url, result)
            });
        }

        while let Some(joined) = set.join_next().await {
            let Ok((tier_idx, tracker_idx, url, result)) = joined else { continue };
            let state = &mut self.tiers[tier_idx][tracker_idx];
            match result {
                Ok(response) => {
                    state.status = TrackerStatus::Working;
                    state.failure_count = 0;
                    state.interval = response.interval.max(1);
                    state.min_interval = response.min_interval;
                    if response.tracker_id.is_some() {
                        state.tracker_id = response.tracker_id.clone();
                    }
                    state.next_announce_at = Instant::now() + Duration::from_secs(state.interval as u64);
                    promote_to_front(&mut self.tiers[tier_idx], tracker_idx);
                    let _ = self.events.send(TrackerEvent::PeersDiscovered { tracker_url: url, peers: response.peers });
                }
                Err(error) => {
                    state.status = TrackerStatus::Error;
                    state.failure_count += 1;
                    let wait = backoff_secs(state.interval, state.failure_count);
                    state.next_announce_at = Instant::now() + Duration::from_secs(wait as u64);
                    let _ = self.events.send(TrackerEvent::AnnounceFailed { tracker_url: url, error: error.to_string() });
                }
            }
        }
    }

    pub fn states(&self) -> impl Iterator<Item = &TrackerState> {
        self.tiers.iter().flatten()
    }
}

/// BEP-12: "move to the front of the tier" on a successful response.
fn promote_to_front(tier: &mut [TrackerState], index: usize) {
    tier[..=index].rotate_right(1);
}

async fn announce_udp(url: &str, req: &AnnounceRequest) -> Result<AnnounceResponse, TrackerError> {
    let addr = UdpTracker::resolve(url).await?;
    let mut client = UdpTracker::connect(addr).await?;
    client.announce(req).await
}
