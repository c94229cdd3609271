use anyhow::Result;
use clap::Parser;
use micadb::{Database, DatabaseOptions, StmtResult};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tabled::builder::Builder;
use tabled::settings::Style;

/// micadb shell: run SQL against a database file, or in memory.
#[derive(Parser, Debug)]
#[command(name = "micadb-cli", version, about)]
struct Args {
    /// Database file; omitted means an ephemeral in-memory database.
    database: Option<PathBuf>,

    /// Execute this SQL and exit.
    #[arg(short = 'e', long = "execute")]
    sql: Option<String>,

    /// Query-result cache capacity (0 disables).
    #[arg(long, default_value_t = 64)]
    cache: usize,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut db = Database::open(DatabaseOptions {
        path: args.database.clone(),
        query_cache_capacity: (args.cache > 0).then_some(args.cache),
        histogram_buckets: 0,
    })?;

    if let Some(sql) = &args.sql {
        for result in db.run_sql(sql)? {
            render(&result);
        }
        db.close()?;
        return Ok(());
    }

    repl(&mut db)?;
    db.close()?;
    Ok(())
}

fn repl(db: &mut Database) -> Result<()> {
    let stdin = io::stdin();
    let mut buffer = String::new();
    prompt("micadb> ")?;
    for line in stdin.lock().lines() {
        let line = line?;
        let trimmed = line.trim();
        if buffer.is_empty() && matches!(trimmed, ".quit" | ".exit" | "\\q") {
            break;
        }
        buffer.push_str(&line);
        buffer.push('\n');
        if trimmed.ends_with(';') {
            // A trailing semicolon closes the statement buffer.
            match db.run_sql(&buffer) {
                Ok(results) => {
                    for result in results {
                        render(&result);
                    }
                }
                Err(e) => eprintln!("error: {e}"),
            }
            buffer.clear();
            prompt("micadb> ")?;
        } else if buffer.trim().is_empty() {
            buffer.clear();
            prompt("micadb> ")?;
        } else {
            prompt("   ...> ")?;
        }
    }
    Ok(())
}

fn prompt(text: &str) -> Result<()> {
    print!("{text}");
    io::stdout().flush()?;
    Ok(())
}

fn render(result: &StmtResult) {
    if result.columns.is_empty() {
        if result.rows_affected > 0 {
            println!("{} row(s) affected", result.rows_affected);
        }
        return;
    }
    let mut builder = Builder::default();
    builder.push_record(result.columns.clone());
    for row in &result.rows {
        builder.push_record(row.iter().map(|v| v.to_string()));
    }
    let mut table = builder.build();
    table.with(Style::sharp());
    println!("{table}");
    println!("{} row(s)", result.rows.len());
}
