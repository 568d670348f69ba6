use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context};
use colored::Colorize;
use rand::seq::SliceRandom;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;
use weft_comm::{Communicator, InMemoryGroup, SoloComm};
use weft_connector::{
    Connector, ConnectorConfig, CreateOptions, KeyCollector, ListOptions, ObjectMetadata,
};
use weft_store::InMemoryKvStore;
use weft_types::ObjectKind;

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let format = cli.format;
    match cli.command {
        Command::Demo(args) => match args.scenario {
            Scenario::Connect(args) => cmd_connect(args, format),
            Scenario::Alloc(args) => cmd_alloc(args, format),
            Scenario::List(args) => cmd_list(args, format),
        },
        Command::Config(args) => cmd_config(args, format),
    }
}

/// A fresh in-memory store holding one pool, and a config pointing at it.
fn demo_store() -> anyhow::Result<(Arc<InMemoryKvStore>, ConnectorConfig)> {
    let pool = Uuid::new_v4();
    let mut config = ConnectorConfig::default();
    config.apply_env()?;
    config.pool = pool;
    debug!(%pool, group = %config.group, "created demo store");
    Ok((Arc::new(InMemoryKvStore::with_pool(pool)), config))
}

fn cmd_connect(args: ConnectArgs, format: OutputFormat) -> anyhow::Result<()> {
    let (store, config) = demo_store()?;
    let connector = Connector::new(config, store, Arc::new(SoloComm))?;
    let file = connector.open_file(&args.label, true)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .context("failed to start runtime")?;
    let info = runtime.block_on(file.query_async())?;
    file.close()?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&info)?),
        OutputFormat::Text => {
            println!("{} Opened container {}", "✓".green().bold(), args.label.bold());
            println!("  Pool: {}", info.uuid.to_string().cyan());
            println!("  Group: {}", info.group.yellow());
            println!("  Containers: {}  Connections: {}", info.containers, info.connections);
        }
    }
    Ok(())
}

fn cmd_alloc(args: AllocArgs, format: OutputFormat) -> anyhow::Result<()> {
    if args.participants == 0 {
        return Err(anyhow!("at least one participant is required"));
    }
    let (store, config) = demo_store()?;
    let collective = !args.independent;

    let handles: Vec<_> = InMemoryGroup::new(args.participants)
        .into_iter()
        .map(|comm| {
            let store = store.clone();
            let config = config.clone();
            let count = args.count;
            thread::spawn(move || -> anyhow::Result<(usize, Vec<u64>)> {
                let rank = comm.rank();
                debug!(rank, count, collective, "participant allocating");
                let connector = Connector::new(config, store, Arc::new(comm))?;
                let file = connector.open_file("alloc", true)?;
                let indices = (0..count)
                    .map(|_| file.allocate_index(collective))
                    .collect::<Result<Vec<_>, _>>()?;
                file.close()?;
                Ok((rank, indices))
            })
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        let result = handle.join().map_err(|_| anyhow!("participant thread panicked"))??;
        results.push(result);
    }
    results.sort_by_key(|(rank, _)| *rank);

    match format {
        OutputFormat::Json => {
            let ranks: Vec<_> = results
                .iter()
                .map(|(rank, indices)| json!({ "rank": rank, "indices": indices }))
                .collect();
            println!("{}", serde_json::to_string_pretty(&json!({ "collective": collective, "participants": ranks }))?);
        }
        OutputFormat::Text => {
            let mode = if collective { "collective" } else { "independent" };
            println!("{} {} allocation, {} participant(s)", "✓".green().bold(), mode.cyan(), args.participants);
            for (rank, indices) in &results {
                let list: Vec<String> = indices.iter().map(u64::to_string).collect();
                println!("  rank {}: {}", rank.to_string().yellow(), list.join(" "));
            }
            if collective && results.windows(2).all(|w| w[0].1 == w[1].1) {
                println!("  {}", "all participants agree".green());
            }
        }
    }
    Ok(())
}

fn cmd_list(args: ListArgs, format: OutputFormat) -> anyhow::Result<()> {
    let (store, mut config) = demo_store()?;
    config.key_prefetch_size = args.page;
    let connector = Connector::new(config, store, Arc::new(SoloComm))?;
    let file = connector.open_file("list", true)?;

    let group = file.create_object(ObjectKind::Group, CreateOptions::default(), ObjectMetadata::for_kind(ObjectKind::Group))?;
    let mut names: Vec<String> = (0..args.keys).map(|i| format!("key-{i:04}")).collect();
    names.shuffle(&mut rand::thread_rng());
    for name in &names {
        file.write_metadata(&group, name.as_bytes(), vec![(b"v".to_vec(), name.clone().into_bytes())])?;
    }

    let collector = match args.limit {
        Some(limit) => KeyCollector::with_limit(limit),
        None => KeyCollector::new(),
    };
    let (collector, stats) = file.list_keys(&group, ListOptions::default(), collector)?;
    group.close()?;
    file.close()?;

    let keys: Vec<String> = collector
        .keys()
        .iter()
        .map(|k| String::from_utf8_lossy(k).into_owned())
        .collect();
    match format {
        OutputFormat::Json => {
            let out = json!({
                "keys": keys,
                "pages": stats.pages,
                "growths": stats.growths,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Text => {
            println!(
                "{} Listed {} key(s) in {} page(s)",
                "✓".green().bold(),
                stats.keys.to_string().bold(),
                stats.pages
            );
            for key in &keys {
                println!("  {}", key);
            }
        }
    }
    Ok(())
}

fn cmd_config(args: ConfigArgs, format: OutputFormat) -> anyhow::Result<()> {
    match args.action {
        ConfigAction::Show { file } => {
            let mut config = match &file {
                Some(path) => ConnectorConfig::load(path)
                    .with_context(|| format!("failed to load {}", path.display()))?,
                None => ConnectorConfig::default(),
            };
            config.apply_env()?;
            config.validate()?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
                OutputFormat::Text => print!("{}", config.to_toml_string()?),
            }
        }
    }
    Ok(())
}
