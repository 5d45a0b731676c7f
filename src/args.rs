use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Lowest primary keys
    First,
    /// Highest primary keys
    Latest,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Datacenter of the database pairs
    #[arg(short, long)]
    pub dc: String,

    /// Database pair to act on. Every pair configured in the datacenter when omitted
    #[arg(short = 'b', long)]
    pub db: Option<String>,

    /// Directory holding configs/, remote-configs/ and the dump artifacts
    #[arg(short, long, default_value = ".")]
    pub root: PathBuf,

    /// Log level, overridden by RUST_LOG
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check that every configured credential can connect
    CheckConnectivity,
    /// Report server settings, tables and roles relevant to replication
    Precheck,
    /// Configure forward replication from source to destination
    Setup {
        /// Do not dump and load the source schema first
        #[arg(long, default_value = "false")]
        no_schema: bool,
    },
    /// Configure reverse replication from destination back to source
    SetupBackReplication,
    /// Show replication state, lag and initialization progress
    Status,
    /// Move sequences and non-replicated data over, then verify
    Sync {
        /// Skip loading constraints and creating indexes
        #[arg(long, default_value = "false")]
        no_schema: bool,

        /// Margin added to free-standing sequences
        #[arg(long, default_value_t = 1000)]
        stride: u64,
    },
    /// Advance destination sequences past the source
    SyncSequences {
        /// Margin added to free-standing sequences
        #[arg(long, default_value_t = 1000)]
        stride: u64,
    },
    /// Dump tables without a primary key from the source
    DumpTables {
        /// Tables to dump, defaults to every table without a primary key
        tables: Vec<String>,
    },
    /// Restore dumped tables into empty destination tables
    LoadTables {
        /// Tables to load, defaults to every dumped table
        tables: Vec<String>,
    },
    /// ANALYZE the destination
    Analyze,
    /// Compare a sample of rows between source and destination
    ValidateData {
        #[arg(long, value_enum, default_value_t = Strategy::First)]
        strategy: Strategy,

        /// Rows sampled per table
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
    /// Dump the source schema and split it into its artifacts
    DumpSchema,
    /// Load the base schema into the destination
    LoadSchema,
    /// Add the NOT VALID constraints to the destination
    LoadConstraints,
    /// Drop the NOT VALID constraints from the destination
    RemoveConstraints,
    /// Dump the NOT VALID constraints currently on the destination
    DumpDestinationConstraints,
    /// Create the deferred indexes on the destination
    CreateIndexes,
    /// Drop the deferred indexes from the destination
    RemoveIndexes,
    /// Diff source and destination schemas
    CompareSchema {
        /// Also compare NOT VALID constraints and deferred indexes
        #[arg(long, default_value = "false")]
        strict: bool,
    },
    /// Disable logins of application roles on the source
    RevokeLogins,
    /// Re-enable logins disabled by revoke-logins
    RestoreLogins,
    /// Empty the destination so setup can start over
    Reset,
    /// Remove the reverse subscription
    TeardownBackReplication,
    /// Remove the forward subscription
    TeardownForwardReplication,
    /// Remove all replication objects from both sides
    Teardown {
        /// Also drop grants, the replication role and the extension
        #[arg(long, default_value = "false")]
        full: bool,

        /// Seconds to wait between steps for pglogical workers to exit
        #[arg(long, default_value_t = 15)]
        pause_secs: u64,
    },
}

impl Command {
    /// Sides whose configuration is not needed, as `(skip_src, skip_dst)`.
    pub fn skipped_sides(&self) -> (bool, bool) {
        match self {
            Command::RevokeLogins | Command::RestoreLogins => (false, true),
            Command::DumpSchema => (false, true),
            Command::LoadSchema
            | Command::LoadConstraints
            | Command::RemoveConstraints
            | Command::DumpDestinationConstraints
            | Command::CreateIndexes
            | Command::RemoveIndexes
            | Command::Analyze => (true, false),
            _ => (false, false),
        }
    }
}

pub fn get_args() -> Result<Args, clap::Error> {
    Args::try_parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pair_and_subcommand() {
        let args = Args::try_parse_from([
            "pg-cutover", "--dc", "use1", "--db", "orders", "sync", "--stride", "250",
        ])
        .unwrap();
        assert_eq!(args.dc, "use1");
        assert_eq!(args.db.as_deref(), Some("orders"));
        match args.command {
            Command::Sync { no_schema, stride } => {
                assert!(!no_schema);
                assert_eq!(stride, 250);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn teardown_pause_is_configurable() {
        let args =
            Args::try_parse_from(["pg-cutover", "-d", "use1", "teardown", "--pause-secs", "0"])
                .unwrap();
        match args.command {
            Command::Teardown { full, pause_secs } => {
                assert!(!full);
                assert_eq!(pause_secs, 0);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn db_is_optional() {
        let args = Args::try_parse_from(["pg-cutover", "--dc", "use1", "status"]).unwrap();
        assert!(args.db.is_none());
        assert_eq!(args.command.skipped_sides(), (false, false));
    }

    #[test]
    fn validate_defaults_to_first_hundred() {
        let args = Args::try_parse_from(["pg-cutover", "-d", "use1", "validate-data"]).unwrap();
        match args.command {
            Command::ValidateData { strategy, limit } => {
                assert_eq!(strategy, Strategy::First);
                assert_eq!(limit, 100);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
