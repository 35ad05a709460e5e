// Procurement ETL - command line entry point
// Exit codes: 0 = healthy / clean success, 1 = issues or warnings, 2 = fatal error

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use procurement_etl::{
    copy_star_data, db, initialize_stores, CheckStatus, ConsistencyAuditor, ConsistencyReport,
    EtlConfig, SyncEngine,
};

#[derive(Parser, Debug)]
#[command(name = "procurement-etl")]
#[command(about = "Operational → analytics star-schema sync and consistency audit", long_about = None)]
#[command(version)]
struct Cli {
    /// Operational store (overrides OPERATIONAL_DB_PATH)
    #[arg(long, global = true)]
    operational_db: Option<PathBuf>,

    /// Analytics store (overrides ANALYTICS_DB_PATH)
    #[arg(long, global = true)]
    analytics_db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 🔄 Runs the daily sync (dimensions, then facts) in one transaction
    Sync,

    /// 🩺 Audits both stores without modifying them
    HealthCheck {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// 🌱 Copies star data from a backup store into the analytics store
    SeedCopy {
        /// Backup store (defaults to BACKUP_DB_PATH)
        #[arg(long)]
        backup_db: Option<PathBuf>,
    },

    /// 🏗️ Creates both schemas and fills the time dimension
    Init {
        /// First calendar day in dim_time
        #[arg(long, default_value = "2020-01-01")]
        start: NaiveDate,

        /// Last calendar day in dim_time
        #[arg(long, default_value = "2030-12-31")]
        end: NaiveDate,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = load_config(&cli).and_then(|config| {
        init_logging(&config);
        run(cli.command, &config)
    });

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("❌ {:#}", e);
            ExitCode::from(2)
        }
    }
}

/// RUST_LOG wins; otherwise the configured ETL_LOG_LEVEL. Logs go to
/// stderr so `health-check --json` keeps stdout clean.
fn init_logging(config: &EtlConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_filter(&config.etl.log_level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn log_filter(level: &str) -> &'static str {
    match level.trim().to_ascii_uppercase().as_str() {
        "TRACE" => "trace",
        "DEBUG" => "debug",
        "WARN" | "WARNING" => "warn",
        "ERROR" | "CRITICAL" => "error",
        _ => "info",
    }
}

fn load_config(cli: &Cli) -> Result<EtlConfig> {
    let mut config = EtlConfig::from_env().context("Invalid configuration")?;
    if let Some(path) = &cli.operational_db {
        config.database.operational_db_path = path.clone();
    }
    if let Some(path) = &cli.analytics_db {
        config.database.analytics_db_path = path.clone();
    }
    Ok(config)
}

fn run(command: Commands, config: &EtlConfig) -> Result<u8> {
    match command {
        Commands::Sync => run_sync(config),
        Commands::HealthCheck { json } => run_health_check(config, json),
        Commands::SeedCopy { backup_db } => run_seed_copy(config, backup_db),
        Commands::Init { start, end } => run_init(config, start, end),
    }
}

// ============================================================================
// COMMANDS
// ============================================================================

fn run_sync(config: &EtlConfig) -> Result<u8> {
    println!("🔄 Procurement ETL - Daily Sync");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for line in config.summary() {
        println!("   {}", line);
    }

    let report = SyncEngine::new(config).run().context("Sync failed, all changes rolled back")?;

    println!("\n✓ Vendors:     +{} ({} unchanged, {} drifted)",
        report.vendors.inserted, report.vendors.unchanged, report.vendors.drifted);
    println!("✓ Commodities: +{} ({} unchanged, {} drifted)",
        report.commodities.inserted, report.commodities.unchanged, report.commodities.drifted);
    println!("✓ Facts:       +{} ({} already loaded)",
        report.facts.inserted, report.facts.already_loaded);

    let excluded = &report.facts.excluded;
    if excluded.total() > 0 {
        println!("⚠️  Excluded {} transactions: {} invalid date, {} unknown vendor, {} unknown commodity, {} outside dim_time, {} invalid amount",
            excluded.total(),
            excluded.invalid_date,
            excluded.missing_vendor,
            excluded.missing_commodity,
            excluded.missing_time,
            excluded.invalid_amount);
    }
    if let Some(path) = &report.backup_path {
        println!("💾 Backup: {}", path.display());
    }

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    if report.has_warnings() {
        println!("⚠️  Sync committed with warnings (run {})", report.run_id);
        Ok(1)
    } else {
        println!("🎉 Sync complete (run {})", report.run_id);
        Ok(0)
    }
}

fn run_health_check(config: &EtlConfig, json: bool) -> Result<u8> {
    let report = ConsistencyAuditor::new(&config.database).run();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    Ok(report.exit_code() as u8)
}

fn run_seed_copy(config: &EtlConfig, backup_db: Option<PathBuf>) -> Result<u8> {
    let backup = backup_db
        .or_else(|| config.database.backup_db_path.clone())
        .ok_or_else(|| anyhow!("No backup store given (use --backup-db or BACKUP_DB_PATH)"))?;

    println!("🌱 Copying star data from {}", backup.display());
    let mut analytics = db::open_read_write(&config.database.analytics_db_path, &config.database)
        .context("Could not open analytics store")?;
    let copied = copy_star_data(&mut analytics, &backup).context("Seed copy failed, nothing copied")?;

    for (table, rows) in &copied {
        println!("✓ {}: {} rows", table, rows);
    }
    println!("✅ Seed copy complete");
    Ok(0)
}

fn run_init(config: &EtlConfig, start: NaiveDate, end: NaiveDate) -> Result<u8> {
    if end < start {
        return Err(anyhow!("--end ({}) is before --start ({})", end, start));
    }

    println!("🏗️  Initializing stores");
    let days = initialize_stores(&config.database, start, end).context("Initialization failed")?;
    println!("✓ Operational schema: {}", config.database.operational_db_path.display());
    println!("✓ Analytics schema:   {}", config.database.analytics_db_path.display());
    println!("✓ dim_time: {} new days ({} → {})", days, start, end);
    Ok(0)
}

// ============================================================================
// REPORT OUTPUT
// ============================================================================

fn icon(status: CheckStatus) -> &'static str {
    match status {
        CheckStatus::Passed => "✅",
        CheckStatus::Warning => "⚠️ ",
        CheckStatus::Failed => "❌",
    }
}

fn print_report(report: &ConsistencyReport) {
    println!("🩺 Procurement ETL - Health Check");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("   Timestamp:   {}", report.timestamp.to_rfc3339());

    let existence = &report.existence;
    println!("\n{} Stores exist (operational: {}, analytics: {})",
        icon(existence.status), existence.operational_exists, existence.analytics_exists);

    for info in [&report.operational_info, &report.analytics_info].into_iter().flatten() {
        println!("   📁 {} - {} tables, {:.2} MB", info.path.display(), info.total_tables, info.size_mb);
        for (table, count) in &info.table_counts {
            println!("      {}: {}", table, count);
        }
    }

    for check in [&report.operational_schema, &report.star_schema] {
        print!("{} {} schema", icon(check.status), check.store.as_str());
        if let Some(keys) = check.foreign_keys {
            print!(" ({} foreign keys)", keys);
        }
        println!();
        if let Some(reason) = &check.reason {
            println!("   {}", reason);
        }
    }

    let c = &report.consistency;
    println!("{} Consistency: vendors {} / {}, facts {} / {} transactions (ratio {:.3})",
        icon(c.status), c.analytics_vendors, c.operational_vendors,
        c.analytics_facts, c.operational_transactions, c.transaction_ratio);
    if let Some(reason) = &c.reason {
        println!("   {}", reason);
    }

    let i = &report.integrity;
    println!("{} Integrity: {} orphan facts, {} duplicate source ids, {} vendors / {} commodities with several current rows",
        icon(i.status), i.orphan_facts, i.duplicate_source_ids,
        i.vendors_with_multiple_current, i.commodities_with_multiple_current);
    if let Some(reason) = &i.reason {
        println!("   {}", reason);
    }

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    if report.is_healthy() {
        println!("🎉 Overall: {}", report.overall_status.as_str());
    } else {
        println!("🚨 Overall: {}", report.overall_status.as_str());
    }
}
