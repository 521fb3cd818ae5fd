use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use whip_proto::AssetId;

use crate::mesh::peer::MeshPeer;

/// Hard deadline for any peer to answer a search.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs one first-found-wins search across `peers` (already filtered for
/// eligibility and shuffled for load balancing).
///
/// Exactly one of three outcomes resolves the search: the first positive
/// answer wins and the remaining queries are withdrawn locally; every peer
/// answers negatively; or the deadline fires. The winning peer is returned
/// so the caller can fetch the asset from it; at most one fetch follows a
/// search.
pub(crate) async fn run(id: AssetId, token: u64, peers: Vec<Arc<MeshPeer>>) -> Option<Arc<MeshPeer>> {
    if peers.is_empty() {
        return None;
    }

    let (reply_tx, mut replies) = mpsc::unbounded_channel();
    for peer in &peers {
        peer.submit_search(id, token, reply_tx.clone());
    }
    drop(reply_tx);

    let deadline = tokio::time::Instant::now() + QUERY_TIMEOUT;
    let mut answered: Vec<Arc<MeshPeer>> = Vec::new();

    let winner = loop {
        match tokio::time::timeout_at(deadline, replies.recv()).await {
            // Timeout: warn about the peers that never answered.
            Err(_) => {
                let unanswered: Vec<String> = peers
                    .iter()
                    .filter(|peer| !answered.iter().any(|a| Arc::ptr_eq(a, *peer)))
                    .map(|peer| peer.query_addr())
                    .collect();
                tracing::warn!(
                    %id,
                    canceled = unanswered.join(", "),
                    "timeout while waiting for intramesh search response"
                );
                break None;
            }
            // Every sender dropped without a positive answer.
            Ok(None) => break None,
            Ok(Some((peer, found))) => {
                if found {
                    break Some(peer);
                }
                answered.push(peer);
                if answered.len() == peers.len() {
                    break None;
                }
            }
        }
    };

    // Withdraw whatever is still registered; peers that already answered
    // (or the winner, which cleared its entry when responding) no-op.
    for peer in &peers {
        peer.cancel_search(&id, token);
    }

    winner
}
