use std::io::{BufRead, BufReader};
use std::sync::Arc;

use kbshard::cluster::{ClusterState, NodeSpec};
use kbshard::config::{ClusterOverrides, ConfigOverrides, CoordinatorConfig, StorageOverrides};
use kbshard::index_node::MemoryIndexNode;
use kbshard::model::{BrokerMessage, KbId, KnowledgeBoxConfig};
use kbshard::{CoordError, Coordinator};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

/// One line of the input file.
#[derive(Debug, Deserialize)]
struct Delivery {
    #[serde(default)]
    partition: Option<String>,
    #[serde(default)]
    seqid: Option<u64>,
    message: BrokerMessage,
}

fn reader(path: Option<String>) -> anyhow::Result<Box<dyn BufRead>> {
    match path {
        Some(path) => Ok(Box::new(BufReader::new(std::fs::File::open(path)?))),
        None => Ok(Box::new(BufReader::new(std::io::stdin()))),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let node_count: usize = parse_arg("--nodes")
        .unwrap_or_else(|| "3".to_string())
        .parse()?;
    let overrides = ConfigOverrides {
        cluster: parse_arg("--replicas")
            .map(|value| value.parse::<usize>())
            .transpose()?
            .map(|replica_factor| ClusterOverrides {
                replica_factor: Some(replica_factor),
            }),
        storage: parse_arg("--data-dir").map(|dir| StorageOverrides {
            data_dir: Some(dir.into()),
        }),
        ..ConfigOverrides::default()
    };
    let config = CoordinatorConfig::load(parse_arg("--config").as_deref(), overrides)?;

    let cluster = Arc::new(ClusterState::new());
    for idx in 0..node_count {
        let id = format!("node-{idx}");
        cluster.add_node(
            NodeSpec::primary(id.as_str(), 100 * 1024 * 1024 * 1024),
            Arc::new(MemoryIndexNode::new(id.as_str())),
        );
    }
    let coordinator = Coordinator::open(config, cluster)?;

    if let Some(kbs) = parse_arg("--kb") {
        for kbid in kbs.split(',').filter(|kbid| !kbid.is_empty()) {
            match coordinator
                .create_knowledge_box(KnowledgeBoxConfig::new(KbId::from(kbid)))
                .await
            {
                Ok(shard) => println!(
                    "kb {kbid}: created, first shard {}",
                    shard.map(|s| s.shard.to_string()).unwrap_or_default()
                ),
                Err(CoordError::KnowledgeBoxExists(_)) => println!("kb {kbid}: exists"),
                Err(err) => return Err(err.into()),
            }
        }
    }

    let input = reader(parse_arg("--input"))?;
    let mut committed = 0usize;
    let mut failed = 0usize;
    for (line_no, line) in input.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let delivery: Delivery = match serde_json::from_str(&line) {
            Ok(delivery) => delivery,
            Err(err) => {
                eprintln!("line {}: invalid delivery: {err}", line_no + 1);
                failed += 1;
                continue;
            }
        };
        let partition = delivery.partition.unwrap_or_else(|| "0".to_string());
        let rid = delivery.message.uuid.clone();
        match coordinator
            .process(delivery.message, delivery.seqid, &partition)
            .await
        {
            Ok(outcome) => {
                committed += 1;
                println!("{rid}: {outcome:?}");
            }
            Err(err) => {
                failed += 1;
                println!("{rid}: {} ({err})", err.code());
            }
        }
    }

    if let Some(kbid) = parse_arg("--rollover") {
        let repaired = coordinator.rollover_kb(&KbId::from(kbid.as_str())).await?;
        println!("kb {kbid}: rollover complete, {} resources repaired", repaired.len());
    }

    println!("processed {} deliveries, {failed} failed", committed + failed);
    Ok(())
}
