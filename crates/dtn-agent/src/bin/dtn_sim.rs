//! # DTN simulator
//!
//! Runs several agents in one process over the in-process transport,
//! replays a scenario of contacts and bundle submissions, and prints what
//! every node received as JSON.
//!
//! ## Usage
//!
//! ```bash
//! dtn-sim scenario.toml
//! RUST_LOG=dtn_agent=debug dtn-sim --pretty scenario.toml
//! ```
//!
//! ## Scenario
//!
//! ```toml
//! settle_ms = 3000
//!
//! [[nodes]]
//! hostname = "a"
//! [[nodes.convergence_layers]]
//! kind = "virtual"
//! adapters = [{ name = "radio" }]
//! [[nodes.routers]]
//! kind = "prophet"
//! registration = "prophet"
//!
//! [[contacts]]
//! at_ms = 100
//! a = "a"
//! b = "b"
//!
//! [[bundles]]
//! at_ms = 0
//! from = "a"
//! to = "b"
//! payload = "hello"
//! ```

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use dtn_agent::cl::VirtualNetwork;
use dtn_agent::config::AgentConfigInput;
use dtn_agent::{Agent, Environment};
use dtn_wire::EidRegistry;
use quanta::Instant;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Scenario {
    /// Real time to wait after the last event before reporting.
    settle_ms: u64,
    nodes: Vec<AgentConfigInput>,
    contacts: Vec<ContactInput>,
    bundles: Vec<BundleInput>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ContactInput {
    at_ms: u64,
    a: String,
    b: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BundleInput {
    at_ms: u64,
    from: String,
    to: String,
    payload: String,
    lifetime: Option<u64>,
}

enum Event {
    Contact(ContactInput),
    Send(BundleInput),
}

#[derive(Debug, Serialize)]
struct DeliveredReport {
    id: String,
    source: String,
    payload: String,
}

#[derive(Debug, Serialize)]
struct NodeReport {
    hostname: String,
    delivered: Vec<DeliveredReport>,
    stored: usize,
}

const DEFAULT_LIFETIME_SECS: u64 = 3600;

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    let (path, pretty) = parse_args()?;
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading scenario {path}"))?;
    let scenario: Scenario = toml::from_str(&text).context("parsing scenario")?;
    tracing::info!(
        scenario = %path,
        nodes = scenario.nodes.len(),
        contacts = scenario.contacts.len(),
        bundles = scenario.bundles.len(),
        "dtn-sim starting"
    );

    // ── Nodes ───────────────────────────────────────────────────
    let eids = EidRegistry::new();
    let network = VirtualNetwork::new();
    let mut agents: Vec<(String, Agent)> = Vec::new();
    for input in scenario.nodes {
        let config = input.resolve().context("node configuration")?;
        let hostname = config.hostname.clone();
        let agent = Agent::new(Environment::virtual_network(eids.clone(), &network));
        agent
            .load(config)
            .with_context(|| format!("loading node {hostname}"))?;
        agent
            .start()
            .with_context(|| format!("starting node {hostname}"))?;
        agents.push((hostname, agent));
    }
    let by_host: HashMap<&str, &Agent> = agents.iter().map(|(h, a)| (h.as_str(), a)).collect();

    // ── Timeline ────────────────────────────────────────────────
    let start = Instant::now();
    for (at_ms, event) in timeline(scenario.contacts, scenario.bundles) {
        let due = Duration::from_millis(at_ms);
        let elapsed = start.elapsed();
        if due > elapsed {
            std::thread::sleep(due - elapsed);
        }
        match event {
            Event::Contact(c) => network.contact(&c.a, &c.b),
            Event::Send(b) => {
                let agent = by_host
                    .get(b.from.as_str())
                    .with_context(|| format!("bundle from unknown node {}", b.from))?;
                let destination = eids.host(&b.to).with_context(|| format!("bad destination {}", b.to))?;
                let lifetime = b.lifetime.unwrap_or(DEFAULT_LIFETIME_SECS);
                match agent.send(&destination, b.payload.into_bytes(), lifetime) {
                    Ok(id) => tracing::info!(%id, from = %b.from, to = %b.to, "bundle submitted"),
                    Err(e) => tracing::warn!(from = %b.from, to = %b.to, error = %e, "bundle not submitted"),
                }
            }
        }
    }
    std::thread::sleep(Duration::from_millis(scenario.settle_ms));

    // ── Report ──────────────────────────────────────────────────
    let mut report = Vec::with_capacity(agents.len());
    for (hostname, agent) in &agents {
        let delivered = agent
            .delivered()?
            .try_iter()
            .map(|bundle| DeliveredReport {
                id: bundle.id().to_string(),
                source: bundle.source().to_string(),
                payload: String::from_utf8_lossy(bundle.payload()).into_owned(),
            })
            .collect();
        report.push(NodeReport {
            hostname: hostname.clone(),
            delivered,
            stored: agent.bundles()?.len(),
        });
    }
    for (_, agent) in &agents {
        agent.shutdown();
    }

    let json = if pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{json}");
    Ok(())
}

/// Contacts and submissions merged by due time. Ties keep contacts first.
fn timeline(contacts: Vec<ContactInput>, bundles: Vec<BundleInput>) -> Vec<(u64, Event)> {
    let mut events: Vec<(u64, Event)> = contacts
        .into_iter()
        .map(|c| (c.at_ms, Event::Contact(c)))
        .chain(bundles.into_iter().map(|b| (b.at_ms, Event::Send(b))))
        .collect();
    events.sort_by_key(|(at, _)| *at);
    events
}

/// `(scenario path, pretty)` from `[--pretty] <scenario.toml>`.
fn parse_args() -> anyhow::Result<(String, bool)> {
    let mut scenario = None;
    let mut pretty = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--pretty" | "-p" => pretty = true,
            "--help" | "-h" => {
                eprintln!("usage: dtn-sim [--pretty] <scenario.toml>");
                std::process::exit(0);
            }
            _ if !arg.starts_with('-') && scenario.is_none() => scenario = Some(arg),
            other => anyhow::bail!("unknown argument '{other}'"),
        }
    }
    let scenario = scenario.ok_or_else(|| anyhow::anyhow!("a scenario file is required"))?;
    Ok((scenario, pretty))
}
