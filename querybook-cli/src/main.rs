use clap::{Parser, Subcommand};
use querybook::{Project, ReportStyle};
use std::io::Write;
use std::path::PathBuf;
use std::process;

/// querybook: run a catalog of schema-checked document queries
#[derive(Parser)]
#[command(name = "querybook", version, about)]
struct Cli {
    /// Project directory (schema.yaml, catalog.yaml, data/)
    #[arg(long, env = "QUERYBOOK_DATA_DIR", default_value = ".")]
    data_dir: PathBuf,

    /// Use the bundled optical-store demo (in memory; --data-dir is ignored)
    #[arg(long)]
    demo: bool,

    /// Report style (overrides querybook.yaml)
    #[arg(long)]
    style: Option<ReportStyle>,

    /// Per store call timeout in milliseconds (overrides querybook.yaml)
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the whole catalog, or only the given query ids
    Run {
        /// Query ids, run in catalog order
        ids: Vec<String>,
    },

    /// List catalog entries
    List,

    /// Report catalog entries rejected at load
    Validate,

    /// Show the translated plan of one query
    Explain {
        /// Query id
        id: String,
    },

    /// Reload every fixture, discarding updates
    Reset,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("ERROR:{e}");
            process::exit(1);
        }
    }
}

/// Returns whether every requested entry succeeded.
fn run(cli: Cli) -> Result<bool, Box<dyn std::error::Error>> {
    let mut project = if cli.demo {
        Project::demo()?
    } else {
        Project::open(&cli.data_dir)?
    };
    project.override_config(cli.timeout_ms, cli.style)?;
    let style = project.config().style;

    match cli.command {
        Command::Run { ids } => {
            let executor = project.executor();
            let formatter = project.formatter();
            let stdout = std::io::stdout();
            let mut sink = stdout.lock();

            let report = if ids.is_empty() {
                project.catalog().run_all(&executor, &formatter, &mut sink)
            } else {
                project
                    .catalog()
                    .run_selected(&ids, &executor, &formatter, &mut sink)?
            };
            sink.flush()?;

            let failed: Vec<&str> = report.failed().map(|o| o.id.as_str()).collect();
            if !failed.is_empty() {
                eprintln!(
                    "ERROR:{} of {} queries failed: {}",
                    failed.len(),
                    report.outcomes.len(),
                    failed.join(", ")
                );
            }
            Ok(failed.is_empty())
        }

        Command::List => {
            let entries: Vec<serde_json::Value> = project
                .catalog()
                .iter()
                .map(|def| {
                    serde_json::json!({
                        "id": def.id,
                        "kind": def.kind(),
                        "collection": def.collection,
                        "title": def.title,
                    })
                })
                .collect();
            print_output(&serde_json::Value::Array(entries), style);
            Ok(true)
        }

        Command::Validate => {
            let rejected: Vec<serde_json::Value> = project
                .catalog()
                .rejected()
                .map(|r| serde_json::json!({ "id": r.id, "error": r.error.to_string() }))
                .collect();
            let ok = rejected.is_empty();
            print_output(
                &serde_json::json!({
                    "valid": project.catalog().len(),
                    "rejected": rejected,
                }),
                style,
            );
            Ok(ok)
        }

        Command::Explain { id } => {
            let definition = project
                .catalog()
                .get(&id)
                .ok_or_else(|| format!("unknown or rejected query id '{id}'"))?;
            let plan = project.executor().explain(definition)?;
            println!("{plan}");
            Ok(true)
        }

        Command::Reset => {
            let report = project.reset()?;
            let seeded: serde_json::Map<String, serde_json::Value> = report
                .seeded
                .into_iter()
                .map(|(collection, count)| (collection, count.into()))
                .collect();
            print_output(&serde_json::json!({ "ok": true, "seeded": seeded }), style);
            Ok(true)
        }
    }
}

fn print_output(value: &serde_json::Value, style: ReportStyle) {
    match style {
        ReportStyle::Structured => println!("{value}"),
        ReportStyle::Tabular => match serde_yaml::to_string(value) {
            Ok(yaml) => print!("{yaml}"),
            Err(e) => eprintln!("ERROR:{e}"),
        },
    }
}
