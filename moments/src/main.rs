use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate, NaiveDateTime};
use clap::{Args, Parser, Subcommand};
use moments::core::{Todos, WorkState, end_of_day, start_of_day};
use moments::instances::{Instance, generate_for_todos};
use moments::modify::{self, Partition};
use moments::{ParseConfig, format_todos};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "moments",
    about = "Tooling for indentation-based task files",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse task files and print their structure.
    Parse(ParseArgs),

    /// List concrete occurrences within a date window.
    Instances(InstancesArgs),

    /// Re-render task files in canonical form.
    Format(FormatArgs),

    /// Move done moments to the end of the file or into a trash file.
    Cleanup(CleanupArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Task files to parse.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of a debug representation.
    #[arg(long)]
    json: bool,
    /// Date recurrences are anchored to (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    today: Option<NaiveDate>,
}

#[derive(Debug, Args)]
struct InstancesArgs {
    /// Task file to expand.
    input: PathBuf,
    /// Inclusive start date (YYYY-MM-DD).
    #[arg(long)]
    from: NaiveDate,
    /// Inclusive end date (YYYY-MM-DD).
    #[arg(long)]
    to: NaiveDate,
    /// Only report top-level moments.
    #[arg(long)]
    no_subs: bool,
    /// Keep instances of done moments.
    #[arg(long)]
    include_done: bool,
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct FormatArgs {
    /// Task files to format.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

#[derive(Debug, Args)]
#[command(group(clap::ArgGroup::new("target").required(true).args(["to_end", "trash"])))]
struct CleanupArgs {
    /// Task file to clean up.
    input: PathBuf,
    /// Also move done moments nested under open ones.
    #[arg(long)]
    all_levels: bool,
    /// Append done moments to the end of the same file.
    #[arg(long)]
    to_end: bool,
    /// Append done moments to this trash file under a dated header.
    #[arg(long)]
    trash: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = cli.verbose;
    init_tracing(verbose);
    let config = ParseConfig::default();
    match cli.command {
        Commands::Parse(args) => handle_parse(&config, args),
        Commands::Instances(args) => handle_instances(&config, args),
        Commands::Format(args) => handle_format(&config, args),
        Commands::Cleanup(args) => handle_cleanup(&config, args),
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();
}

fn read_todos(config: &ParseConfig, path: &Path, today: Option<NaiveDate>) -> Result<Todos> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    let mut parser = moments::Parser::new(config);
    if let Some(today) = today {
        parser = parser.with_today(today);
    }
    let todos = parser
        .parse(&text)
        .with_context(|| format!("parsing {:?}", path))?;
    debug!(path = %path.display(), moments = todos.moments.len(), "loaded task file");
    Ok(todos)
}

fn handle_parse(config: &ParseConfig, args: ParseArgs) -> Result<()> {
    let ParseArgs {
        inputs,
        json,
        today,
    } = args;

    let mut parsed = Vec::new();
    for path in inputs {
        let todos = read_todos(config, &path, today)?;
        parsed.push((path, todos));
    }

    if json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            path: String,
            todos: &'a Todos,
        }

        let payload: Vec<JsonOutput<'_>> = parsed
            .iter()
            .map(|(path, todos)| JsonOutput {
                path: path.display().to_string(),
                todos,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (idx, (path, todos)) in parsed.iter().enumerate() {
            if parsed.len() > 1 {
                println!("== {} ==", path.display());
            }
            println!("{:#?}", todos);
            if parsed.len() > 1 && idx + 1 < parsed.len() {
                println!();
            }
        }
    }
    Ok(())
}

fn handle_instances(config: &ParseConfig, args: InstancesArgs) -> Result<()> {
    let InstancesArgs {
        input,
        from,
        to,
        no_subs,
        include_done,
        json,
    } = args;

    if to < from {
        anyhow::bail!("--to ({to}) is before --from ({from})");
    }

    let todos = read_todos(config, &input, None)?;
    let instances = generate_for_todos(
        &todos,
        start_of_day(from),
        end_of_day(to),
        !no_subs,
        |instance: &Instance| include_done || !instance.done,
    );

    if instances.is_empty() {
        eprintln!("No instances found between {from} and {to}.");
        return Ok(());
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&instances)?);
    } else {
        let mut lines = Vec::new();
        for instance in &instances {
            render_instance(&mut lines, instance, 0);
        }
        for line in lines {
            println!("{line}");
        }
    }
    Ok(())
}

fn render_instance(lines: &mut Vec<String>, instance: &Instance, depth: usize) {
    let state = match instance.state {
        WorkState::New => "    ",
        WorkState::Done => "DONE",
        WorkState::InProgress => "WIP ",
        WorkState::Waiting => "WAIT",
    };
    let when = match instance.time_of_day {
        Some(at) => at.format("%Y-%m-%d %H:%M").to_string(),
        None => instance.start.date().to_string(),
    };
    let until = if instance.ends_in_range && instance.end.date() != instance.start.date() {
        format!(" -> {}", instance.end.date())
    } else {
        String::new()
    };
    let category = instance
        .category
        .as_ref()
        .map(|c| format!(" [{}]", c.name))
        .unwrap_or_default();
    let priority = "!".repeat(instance.priority as usize);
    lines.push(format!(
        "{:<16} {} {}{}{}{}{}",
        when,
        state,
        "  ".repeat(depth),
        instance.name,
        priority,
        until,
        category
    ));
    for sub in &instance.sub_instances {
        render_instance(lines, sub, depth + 1);
    }
}

fn handle_format(config: &ParseConfig, args: FormatArgs) -> Result<()> {
    let FormatArgs { inputs, in_place } = args;
    let mut first = true;

    for path in &inputs {
        let todos = read_todos(config, path, None)?;
        let formatted = format_todos(config, &todos);

        if in_place {
            fs::write(path, formatted.as_bytes()).with_context(|| format!("writing {:?}", path))?;
            info!(path = %path.display(), "formatted in place");
        } else {
            if !first {
                println!();
                println!("== {} ==", path.display());
            } else if inputs.len() > 1 {
                println!("== {} ==", path.display());
            }
            first = false;
            print!("{formatted}");
        }
    }

    Ok(())
}

fn handle_cleanup(config: &ParseConfig, args: CleanupArgs) -> Result<()> {
    let CleanupArgs {
        input,
        all_levels,
        to_end,
        trash,
    } = args;
    let only_top_level = !all_levels;

    let text = fs::read_to_string(&input).with_context(|| format!("reading {:?}", input))?;
    if to_end {
        let updated = modify::move_done_to_end(config, &text, only_top_level)
            .with_context(|| format!("parsing {:?}", input))?;
        fs::write(&input, updated).with_context(|| format!("writing {:?}", input))?;
        info!(path = %input.display(), "moved done moments to the end");
        return Ok(());
    }

    let Some(trash_path) = trash else {
        anyhow::bail!("either --to-end or --trash must be given");
    };
    let now = Local::now().naive_local();
    let Partition { kept, deleted } = cleanup_into_trash(config, &text, &trash_path, only_top_level, now)?;
    fs::write(&trash_path, deleted).with_context(|| format!("writing {:?}", trash_path))?;
    fs::write(&input, kept).with_context(|| format!("writing {:?}", input))?;
    info!(path = %input.display(), trash = %trash_path.display(), "moved done moments to trash");
    Ok(())
}

fn cleanup_into_trash(
    config: &ParseConfig,
    text: &str,
    trash_path: &Path,
    only_top_level: bool,
    now: NaiveDateTime,
) -> Result<Partition> {
    let trash = if trash_path.exists() {
        fs::read_to_string(trash_path).with_context(|| format!("reading {:?}", trash_path))?
    } else {
        String::new()
    };
    modify::move_done_to_trash(config, text, &trash, only_top_level, now).context("separating done moments")
}
