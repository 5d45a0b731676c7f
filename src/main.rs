//! Main binary entry point for pg-cutover.

use anyhow::{Result, bail};
use pg_cutover::args::{Args, Command, Strategy, get_args};
use pg_cutover::config::{PairId, ResolverRegistry, available_pairs, get_config};
use pg_cutover::fanout::{join_all, task};
use pg_cutover::orchestrator::MigrationOrchestrator;
use pg_cutover::validate::SampleStrategy;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::error;

fn run_pair(args: &Args, registry: &ResolverRegistry, db: &str) -> pg_cutover::Result<Value> {
    let (skip_src, skip_dst) = args.command.skipped_sides();
    let id = PairId::new(&args.dc, db);
    let config = get_config(&args.root, &id, registry, skip_src, skip_dst)?;
    let mut orchestrator = MigrationOrchestrator::new(config, &args.root);
    if let Command::Teardown { pause_secs, .. } = &args.command {
        orchestrator = orchestrator.with_teardown_pause(Duration::from_secs(*pause_secs));
    }

    let result = match &args.command {
        Command::CheckConnectivity => json!(orchestrator.check_connectivity()?),
        Command::Precheck => json!(orchestrator.precheck()?),
        Command::Setup { no_schema } => {
            orchestrator.setup(!no_schema)?;
            json!("configured")
        }
        Command::SetupBackReplication => json!(orchestrator.setup_back_replication()?),
        Command::Status => {
            let mut report = orchestrator.status()?;
            if !report.shows_progress() {
                report.progress = None;
            }
            json!(report)
        }
        Command::Sync { no_schema, stride } => {
            orchestrator.sync(*stride, *no_schema)?;
            json!("synced")
        }
        Command::SyncSequences { stride } => json!(orchestrator.sync_sequences(*stride)?),
        Command::DumpTables { tables } => json!(orchestrator.dump_tables(tables)?),
        Command::LoadTables { tables } => json!(orchestrator.load_tables(tables)?),
        Command::Analyze => {
            orchestrator.analyze()?;
            json!("analyzed")
        }
        Command::ValidateData { strategy, limit } => {
            let strategy = match strategy {
                Strategy::First => SampleStrategy::First(*limit),
                Strategy::Latest => SampleStrategy::Latest(*limit),
            };
            json!(orchestrator.validate(strategy)?)
        }
        Command::DumpSchema => {
            let artifacts = orchestrator.dump_schema()?;
            json!({
                "statements": artifacts.raw.len(),
                "base": artifacts.base.len(),
                "not_valid": artifacts.only_invalid.len(),
                "indexes": artifacts.only_indexes.len(),
            })
        }
        Command::LoadSchema => {
            orchestrator.load_schema()?;
            json!("loaded")
        }
        Command::LoadConstraints => json!({ "loaded": orchestrator.load_constraints()? }),
        Command::RemoveConstraints => json!({ "removed": orchestrator.remove_constraints()? }),
        Command::DumpDestinationConstraints => {
            json!({ "dumped": orchestrator.dump_destination_constraints()? })
        }
        Command::CreateIndexes => json!(orchestrator.create_indexes()?),
        Command::RemoveIndexes => json!({ "removed": orchestrator.remove_indexes()? }),
        Command::CompareSchema { strict } => json!(orchestrator.compare_schema(!strict)?),
        Command::RevokeLogins => json!(orchestrator.revoke_logins()?),
        Command::RestoreLogins => json!({ "restored": orchestrator.restore_logins()? }),
        Command::Reset => {
            orchestrator.reset()?;
            json!("reset")
        }
        Command::TeardownBackReplication => {
            orchestrator.teardown_back_replication()?;
            json!("removed")
        }
        Command::TeardownForwardReplication => {
            orchestrator.teardown_forward_replication()?;
            json!("removed")
        }
        Command::Teardown { full, .. } => {
            orchestrator.teardown(*full)?;
            json!("removed")
        }
    };
    Ok(json!({ "dc": args.dc, "db": db, "result": result }))
}

fn main() -> Result<()> {
    let args = get_args()?;
    pg_cutover::logging::init(&args.log_level)?;
    let registry = ResolverRegistry::with_defaults(&args.root);

    let dbs: Vec<String> = match &args.db {
        Some(db) => vec![db.clone()],
        None => available_pairs(&args.root, &args.dc)?.into_iter().collect(),
    };
    if dbs.is_empty() {
        bail!("no database pairs configured for {}", args.dc);
    }

    let outcomes = join_all(
        dbs.iter()
            .map(|db| {
                let (args, registry) = (&args, &registry);
                task(move || Ok(run_pair(args, registry, db)))
            })
            .collect(),
    )?;

    let mut failed = 0;
    for (db, outcome) in dbs.iter().zip(outcomes) {
        match outcome {
            Ok(output) => println!("{}", serde_json::to_string_pretty(&output)?),
            Err(e) => {
                error!("{}/{db} failed: {e}", args.dc);
                failed += 1;
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} pairs failed", dbs.len());
    }
    Ok(())
}
