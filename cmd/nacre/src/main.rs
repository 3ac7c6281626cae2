mod cli;

use std::io::{BufRead, Read, Write};
use std::process::ExitCode;

use clap::Parser;
use nacre_common::{PayloadValue, Sample};
use nacre_db::{Database, DbConfig, DbError, WalConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cli::{Command, CLI};

fn init_tracing(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> ExitCode {
    let cli = CLI::parse();
    init_tracing(&cli.log_level);
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "command failed");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: CLI) -> Result<(), DbError> {
    match cli.command {
        Command::Create {
            volumes,
            volume_capacity,
            expandable,
            no_wal,
        } => {
            let config = DbConfig {
                nvolumes: volumes,
                volume_capacity,
                expandable,
                wal: (!no_wal).then(WalConfig::default),
            };
            let db = Database::create(&cli.db, &config)?;
            info!(dir = %cli.db.display(), "database ready");
            db.close()
        }
        Command::Info => {
            let db = Database::open(&cli.db)?;
            let (totals, volumes) = db.stats();
            println!(
                "blocks: {} / {} ({} bytes each)",
                totals.nblocks, totals.capacity, totals.block_size
            );
            for (path, stats) in volumes {
                println!("  {path}: {} / {} blocks", stats.nblocks, stats.capacity);
            }
            db.close()
        }
        Command::Ingest => {
            let db = Database::open(&cli.db)?;
            let mut session = db.session();
            let stdin = std::io::stdin();
            let mut accepted = 0u64;
            let mut rejected = 0u64;
            for line in stdin.lock().lines() {
                let line = line?;
                match parse_line(&line) {
                    Some((name, ts, value)) => {
                        let id = session.init_series_id(name)?;
                        match session.write(&Sample::float(id, ts, value)) {
                            Ok(()) => accepted += 1,
                            Err(DbError::Store(_)) => rejected += 1,
                            Err(other) => return Err(other),
                        }
                    }
                    None => rejected += 1,
                }
            }
            session.close()?;
            info!(accepted, rejected, "ingestion finished");
            db.close()
        }
        Command::Query => {
            let db = Database::open(&cli.db)?;
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text)?;
            let cursor = db.query_json(&text)?;
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            for sample in cursor.collect_all()? {
                write_sample(&mut out, &sample)?;
            }
            db.close()
        }
    }
}

/// `series-name timestamp value`, name may contain spaces in its tag
/// list, so split from the right.
fn parse_line(line: &str) -> Option<(&str, u64, f64)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let (rest, value) = line.rsplit_once(' ')?;
    let (name, ts) = rest.trim_end().rsplit_once(' ')?;
    Some((name.trim(), ts.parse().ok()?, value.parse().ok()?))
}

fn write_sample(out: &mut impl Write, sample: &Sample) -> Result<(), DbError> {
    match &sample.payload {
        PayloadValue::Float(x) => writeln!(out, "{}\t{}\t{x}", sample.id, sample.timestamp)?,
        PayloadValue::Tuple { bitmap, columns } => {
            write!(out, "{}\t{}\t[{bitmap:b}]", sample.id, sample.timestamp)?;
            for column in columns {
                write!(out, "\t{column}")?;
            }
            writeln!(out)?;
        }
        PayloadValue::Blob(bytes) => {
            writeln!(out, "{}\t{}\t<{} bytes>", sample.id, sample.timestamp, bytes.len())?
        }
    }
    Ok(())
}
