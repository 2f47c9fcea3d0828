//! Catch-up and consensus-dissent scenarios: a lagging node pulls missing
//! blocks from peers; a node that proposed a losing candidate discards it
//! and adopts the network's block.

use naru::consensus::Vote;
use naru::crypto::ed25519::NodeKeypair;
use naru::crypto::NodeSigner;
use naru::metrics::Metrics;
use naru::net::inmem::InMemHub;
use naru::net::{Envelope, GossipPayload, PeerNetwork};
use naru::node::{Node, NodeParams};
use naru::ordering::OrderingConfig;
use naru::consensus::YacConfig;
use naru::storage::block_store::MemBlockStore;
use naru::storage::Storage;
use naru::types::{
    commit_sign_bytes, tx_merkle_root, Block, BlockHeader, BlockSignature, Command, Peer,
    Transaction, TxPayload, TxSignature,
};
use naru::wsv::genesis_block;
use std::sync::Arc;
use std::time::Duration;

fn node_keys(n: usize) -> Vec<NodeKeypair> {
    (1..=n as u8).map(|i| NodeKeypair::from_seed([i; 32])).collect()
}

fn user_key() -> NodeKeypair {
    NodeKeypair::from_seed([200; 32])
}

fn genesis_commands(ordered_peer_keys: &[&NodeKeypair]) -> Vec<Command> {
    let mut cmds = vec![
        Command::CreateDomain { domain: "wonderland".into() },
        Command::CreateAccount { account: "alice@wonderland".into(), pubkey: user_key().public_key() },
        Command::CreateAsset { asset: "rose#wonderland".into() },
        Command::AddAssetQuantity {
            account: "alice@wonderland".into(),
            asset: "rose#wonderland".into(),
            amount: 100,
        },
    ];
    for (i, k) in ordered_peer_keys.iter().enumerate() {
        cmds.push(Command::AddPeer {
            peer: Peer { address: format!("/mem/{i}"), pubkey: k.public_key() },
        });
    }
    cmds
}

fn open_storage(cmds: &[Command]) -> Arc<Storage> {
    Storage::open(Arc::new(MemBlockStore::default()), None, genesis_block(cmds.to_vec())).unwrap()
}

/// Extend `storage` with empty blocks up to `target`, each carrying a
/// quorum of signatures from `signers`.
fn extend_chain(storage: &Arc<Storage>, target: u64, signers: &[&NodeKeypair]) {
    let mut ms = storage.create_mutable_storage();
    for h in (ms.top_height().unwrap_or(0) + 1)..=target {
        let mut block = Block {
            header: BlockHeader {
                height: h,
                prev_hash: ms.top_hash(),
                merkle_root: tx_merkle_root(&[]),
                txs_number: 0,
                created_ms: h,
            },
            transactions: vec![],
            signatures: vec![],
        };
        let msg = commit_sign_bytes(h, &block.hash());
        for s in signers {
            block.signatures.push(BlockSignature { pubkey: s.public_key(), signature: s.sign(&msg) });
        }
        ms.apply_block(block).unwrap();
    }
    storage.commit(ms).unwrap();
}

fn fast_params() -> NodeParams {
    NodeParams {
        ordering: OrderingConfig { max_tx_per_proposal: 10, proposal_delay_ms: 400, queue_cap: 256 },
        yac: YacConfig { round_timeout_ms: 500, max_round_timeout_ms: 4_000 },
        fetch_timeout: Duration::from_secs(2),
        status_poll: Duration::from_millis(150),
    }
}

fn start_node(
    hub: &InMemHub,
    keypair: &NodeKeypair,
    storage: Arc<Storage>,
    p: NodeParams,
) -> Node {
    let (net, gossip_rx) = hub.register(keypair.public_key(), storage.clone());
    Node::init(
        p,
        keypair.clone(),
        storage,
        Arc::new(net),
        gossip_rx,
        Arc::new(Metrics::new().unwrap()),
    )
    .unwrap()
}

async fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

#[tokio::test]
async fn lagging_node_fetches_and_matches_peers() {
    let keys = node_keys(4);
    let ordered: Vec<&NodeKeypair> = keys.iter().collect();
    let cmds = genesis_commands(&ordered);

    // The rest of the network is at height 12.
    let cluster = open_storage(&cmds);
    extend_chain(&cluster, 12, &[&keys[1], &keys[2], &keys[3]]);

    let hub = InMemHub::new();
    // One committed replica is reachable, registered under a peer identity.
    let _serving = hub.register(keys[1].public_key(), cluster.clone());

    // The lagging node starts at height 5 along the same chain.
    let local = open_storage(&cmds);
    extend_chain(&local, 5, &[&keys[1], &keys[2], &keys[3]]);
    let node = start_node(&hub, &keys[0], local.clone(), fast_params());

    assert!(
        wait_for(|| local.block_query().top_height() == Some(12), Duration::from_secs(8)).await,
        "lagging node never reached height 12"
    );
    for h in 6..=12 {
        assert_eq!(
            local.block_query().get(h).unwrap().hash(),
            cluster.block_query().get(h).unwrap().hash(),
            "hash mismatch at height {h}"
        );
    }
    assert!(node.metrics().catch_up_runs.get() >= 1);

    node.shutdown().await;
}

#[tokio::test]
async fn catch_up_fails_over_to_next_peer() {
    let keys = node_keys(4);
    let ordered: Vec<&NodeKeypair> = keys.iter().collect();
    let cmds = genesis_commands(&ordered);

    let cluster = open_storage(&cmds);
    extend_chain(&cluster, 4, &[&keys[1], &keys[2], &keys[3]]);

    let hub = InMemHub::new();
    let _serving_a = hub.register(keys[1].public_key(), cluster.clone());
    let _serving_b = hub.register(keys[2].public_key(), cluster.clone());
    // First candidate peer is unreachable; the synchronizer must move on.
    hub.partition(&keys[1].public_key());

    let local = open_storage(&cmds);
    let node = start_node(&hub, &keys[0], local.clone(), fast_params());

    assert!(
        wait_for(|| local.block_query().top_height() == Some(4), Duration::from_secs(8)).await,
        "failover catch-up did not complete"
    );

    node.shutdown().await;
}

#[tokio::test]
async fn dissenting_node_adopts_network_block() {
    let keys = node_keys(4);
    // Peer order chosen so the node under test proposes height 1 itself.
    let ordered: Vec<&NodeKeypair> = vec![&keys[1], &keys[0], &keys[2], &keys[3]];
    let cmds = genesis_commands(&ordered);

    // The network committed an empty block at height 1 that the node under
    // test never built.
    let cluster = open_storage(&cmds);
    extend_chain(&cluster, 1, &[&keys[1], &keys[2], &keys[3]]);
    let network_block = cluster.block_query().get(1).unwrap();

    let hub = InMemHub::new();
    let (serving_net, _serving_gossip) = hub.register(keys[1].public_key(), cluster.clone());

    let local = open_storage(&cmds);
    let node = start_node(&hub, &keys[0], local.clone(), fast_params());

    // Give the node a transaction so it builds its own candidate B_local.
    let kp = user_key();
    let payload = TxPayload {
        creator: "alice@wonderland".into(),
        created_ms: 1,
        commands: vec![Command::TransferAsset {
            src: "alice@wonderland".into(),
            dest: "alice@wonderland".into(),
            asset: "rose#wonderland".into(),
            amount: 3,
        }],
    };
    let signature = kp.sign(&naru::types::tx_sign_bytes(&payload));
    let tx = Transaction { payload, signatures: vec![TxSignature { pubkey: kp.public_key(), signature }] };
    node.handle().submit_transaction(tx).await.unwrap();

    // Quorum votes for the network's block reach the node.
    for k in [&keys[1], &keys[2], &keys[3]] {
        let vote = Vote::sign(k, 1, network_block.hash());
        let env = Envelope::seal(&GossipPayload::Vote(vote), k).unwrap();
        serving_net.broadcast(env).await;
    }

    assert!(
        wait_for(
            || {
                local
                    .block_query()
                    .get(1)
                    .map_or(false, |b| b.hash() == network_block.hash())
            },
            Duration::from_secs(8)
        )
        .await,
        "node did not adopt the network's block"
    );

    node.shutdown().await;
}
