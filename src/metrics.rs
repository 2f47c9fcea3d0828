//! Prometheus metrics for the node.
//!
//! Each node owns its own registry (multiple nodes share a process in
//! integration tests), rendered in text format for scraping.

use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,

    // Ingest
    pub txs_submitted: IntCounter,
    pub txs_rejected: IntCounter,
    /// Wire messages dropped for a bad envelope signature.
    pub envelopes_dropped: IntCounter,

    // Pipeline
    pub proposals_emitted: IntCounter,
    pub candidates_built: IntCounter,
    pub proposals_discarded: IntCounter,

    // Consensus
    pub votes_received: IntCounter,
    pub votes_rejected: IntCounter,
    pub decisions: IntCounter,

    // Commits
    pub blocks_committed: IntCounter,
    pub commit_height: IntGauge,
    pub catch_up_runs: IntCounter,
    pub catch_up_failures: IntCounter,

    // Loader
    pub ranges_served: IntCounter,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let r = Registry::new();
        macro_rules! int_counter {
            ($name:expr, $help:expr) => {{
                let c = IntCounter::with_opts(Opts::new($name, $help))?;
                r.register(Box::new(c.clone()))?;
                c
            }};
        }
        macro_rules! int_gauge {
            ($name:expr, $help:expr) => {{
                let g = IntGauge::with_opts(Opts::new($name, $help))?;
                r.register(Box::new(g.clone()))?;
                g
            }};
        }

        Ok(Self {
            txs_submitted: int_counter!("naru_txs_submitted_total", "Transactions accepted at the submit surface"),
            txs_rejected: int_counter!("naru_txs_rejected_total", "Transactions rejected at the submit surface"),
            envelopes_dropped: int_counter!("naru_envelopes_dropped_total", "Wire messages dropped for invalid envelope signatures"),

            proposals_emitted: int_counter!("naru_proposals_emitted_total", "Proposals emitted by the ordering gate"),
            candidates_built: int_counter!("naru_candidates_built_total", "Candidate blocks built by the simulator"),
            proposals_discarded: int_counter!("naru_proposals_discarded_total", "Proposals discarded because the node was behind"),

            votes_received: int_counter!("naru_votes_received_total", "Consensus votes received"),
            votes_rejected: int_counter!("naru_votes_rejected_total", "Consensus votes rejected (unknown voter or bad signature)"),
            decisions: int_counter!("naru_decisions_total", "Consensus decisions reached"),

            blocks_committed: int_counter!("naru_blocks_committed_total", "Blocks committed to storage"),
            commit_height: int_gauge!("naru_commit_height", "Latest committed block height"),
            catch_up_runs: int_counter!("naru_catch_up_runs_total", "Catch-up attempts started"),
            catch_up_failures: int_counter!("naru_catch_up_failures_total", "Catch-up attempts where every peer failed"),

            ranges_served: int_counter!("naru_ranges_served_total", "Block ranges served to peers"),

            registry: r,
        })
    }

    /// Render all registered metrics in Prometheus text format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut out = Vec::new();
        encoder.encode(&metric_families, &mut out).unwrap_or_default();
        String::from_utf8(out).unwrap_or_default()
    }
}
