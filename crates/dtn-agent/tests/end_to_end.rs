//! Whole agents talking over the in-process transport.
//!
//! Each test builds its own [`VirtualNetwork`], starts real agents with
//! their adapters, routers and task queues, and drives contacts through
//! [`VirtualNetwork::contact`].

use std::time::{Duration, Instant};

use dtn_agent::cl::VirtualNetwork;
use dtn_agent::dlife::{DLifeRouter, DLifeState};
use dtn_agent::prophet::{ExchangeState, ProphetRouter};
use dtn_agent::timeout::outranks;
use dtn_agent::{Agent, AgentConfig, AgentState, Environment};
use dtn_wire::EidRegistry;

const WAIT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn node(net: &VirtualNetwork, eids: &EidRegistry, host: &str, kind: &str) -> Agent {
    let agent = Agent::new(Environment::virtual_network(eids.clone(), net));
    agent
        .load(AgentConfig::new(host).with_router(kind, kind))
        .unwrap();
    agent.start().unwrap();
    assert_eq!(agent.state(), AgentState::Started);
    agent
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    done()
}

/// Two host names where the first opens the exchange against the second.
fn initiating_pair(candidates: &[&'static str], against: &str) -> &'static str {
    let peer = format!("dtn://{against}");
    candidates
        .iter()
        .copied()
        .find(|host| {
            let local = format!("dtn://{host}");
            outranks(&local, &peer) && !outranks(&peer, &local)
        })
        .unwrap()
}

fn prophet_state(agent: &Agent, peer: &str) -> Option<ExchangeState> {
    let peer = agent.eids().host(peer).unwrap();
    agent
        .router::<ProphetRouter>("prophet")
        .and_then(|router| router.state_of(&peer))
}

fn dlife_state(agent: &Agent, peer: &str) -> Option<DLifeState> {
    let peer = agent.eids().host(peer).unwrap();
    agent
        .router::<DLifeRouter>("dlife")
        .and_then(|router| router.state_of(&peer))
}

#[test]
fn prophet_pair_finishes_and_delivers() {
    init_tracing();
    let net = VirtualNetwork::new();
    let eids = EidRegistry::new();
    let a = node(&net, &eids, "alpha", "prophet");
    let b = node(&net, &eids, "beta", "prophet");

    let payload = b"ping".to_vec();
    let id = a.send(&eids.host("beta").unwrap(), payload.clone(), 600).unwrap();

    net.contact("alpha", "beta");
    assert!(wait_until(|| {
        prophet_state(&a, "beta") == Some(ExchangeState::Finished)
            && prophet_state(&b, "alpha") == Some(ExchangeState::Finished)
    }));

    let inbox = b.delivered().unwrap();
    let bundle = inbox.recv_timeout(WAIT).unwrap();
    assert_eq!(bundle.id(), id);
    assert_eq!(bundle.payload().as_ref(), payload.as_slice());

    let router = a.router::<ProphetRouter>("prophet").unwrap();
    assert!(router.predictability(&eids.host("beta").unwrap()) > 0.0);

    a.shutdown();
    b.shutdown();
}

#[test]
fn prophet_relays_through_better_neighbor() {
    init_tracing();
    let relay_host = "relay";
    let src_host = initiating_pair(&["src", "source", "origin", "s1", "s2", "s3", "s4"], relay_host);
    let net = VirtualNetwork::new();
    let eids = EidRegistry::new();
    let src = node(&net, &eids, src_host, "prophet");
    let relay = node(&net, &eids, relay_host, "prophet");
    let dst = node(&net, &eids, "dst", "prophet");

    // relay learns dst
    net.contact(relay_host, "dst");
    assert!(wait_until(|| {
        prophet_state(&relay, "dst") == Some(ExchangeState::Finished)
            && prophet_state(&dst, relay_host) == Some(ExchangeState::Finished)
    }));

    let dst_eid = eids.host("dst").unwrap();
    let id = src.send(&dst_eid, b"via relay".to_vec(), 600).unwrap();

    // src is told relay is closer to dst and hands the bundle over
    net.contact(src_host, relay_host);
    assert!(wait_until(|| relay.contains_bundle(&id).unwrap_or(false)));
    let relay_eid = eids.host(relay_host).unwrap();
    let src_router = src.router::<ProphetRouter>("prophet").unwrap();
    assert!(src_router.predictability(&dst_eid) > 0.0);
    assert!(src.search_bundles(&relay_eid).unwrap().iter().any(|b| b.id() == id));

    // relay meets dst again and delivers
    net.contact(relay_host, "dst");
    let bundle = dst.delivered().unwrap().recv_timeout(WAIT).unwrap();
    assert_eq!(bundle.id(), id);
    assert_eq!(bundle.source().to_string(), format!("dtn://{src_host}"));

    for agent in [&src, &relay, &dst] {
        agent.shutdown();
    }
}

#[test]
fn dlife_pair_exchanges_social_records() {
    init_tracing();
    let net = VirtualNetwork::new();
    let eids = EidRegistry::new();
    let a = node(&net, &eids, "north", "dlife");
    let b = node(&net, &eids, "south", "dlife");

    let id = a.send(&eids.host("south").unwrap(), b"social".to_vec(), 600).unwrap();
    net.contact("north", "south");

    assert!(wait_until(|| {
        dlife_state(&a, "south") == Some(DLifeState::Finished)
            && dlife_state(&b, "north") == Some(DLifeState::Finished)
    }));
    let bundle = b.delivered().unwrap().recv_timeout(WAIT).unwrap();
    assert_eq!(bundle.id(), id);

    // the neighbor reported its importance, so it is enrolled in this slice
    let router = a.router::<DLifeRouter>("dlife").unwrap();
    let south = eids.host("south").unwrap();
    assert!(wait_until(|| router.social().weight(&south).is_some()));

    a.shutdown();
    b.shutdown();
}

#[test]
fn second_agent_cannot_reuse_an_address() {
    let net = VirtualNetwork::new();
    let eids = EidRegistry::new();
    let first = node(&net, &eids, "same", "prophet");
    let second = Agent::new(Environment::virtual_network(eids.clone(), &net));
    assert!(second.load(AgentConfig::new("same")).is_err());
    assert_eq!(second.state(), AgentState::Stopped);
    first.shutdown();
}
