use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use colored::Colorize;
use hashdir_index::{
    CreateOutcome, FlatLayout, HashLayout, Index, NameCodec, NameForm, NibbleLayout, ObjectCursor,
    RebalanceEngine, RebalanceStats, UnlinkOutcome,
};
use hashdir_store::{Backend, DirCursor, DiskBackend};
use hashdir_types::{DirPath, ObjectIdentity, Snap};
use serde_json::json;
use tracing::debug;

use crate::cli::*;
use crate::config::CliConfig;

/// Store, layout and settings shared by the index commands.
struct Session {
    backend: Arc<dyn Backend>,
    layout: Arc<dyn HashLayout>,
    config: CliConfig,
    format: OutputFormat,
}

impl Session {
    fn new(cli: &Cli) -> anyhow::Result<Self> {
        let mut config = CliConfig::load(cli.config.as_deref())?;
        if let Some(levels) = cli.levels {
            config.layout_levels = levels;
        }
        let layout: Arc<dyn HashLayout> = if config.layout_levels == 0 {
            Arc::new(FlatLayout)
        } else {
            Arc::new(NibbleLayout::new(config.layout_levels))
        };
        debug!(root = %cli.root.display(), levels = config.layout_levels, "opening store");
        let backend = DiskBackend::open(&cli.root)
            .with_context(|| format!("opening store at {}", cli.root.display()))?;
        Ok(Self {
            backend: Arc::new(backend),
            layout,
            config,
            format: cli.format,
        })
    }

    fn open(&self, base: &Path) -> anyhow::Result<Index> {
        Index::open(
            self.backend.clone(),
            base,
            self.layout.clone(),
            self.config.index.clone(),
        )
        .with_context(|| format!("opening index {}", base.display()))
    }

    fn json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }
}

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let session = || Session::new(&cli);
    match &cli.command {
        Command::Prepare(args) => cmd_prepare(&session()?, args),
        Command::Create(args) => cmd_create(&session()?, args),
        Command::Lookup(args) => cmd_lookup(&session()?, args),
        Command::Unlink(args) => cmd_unlink(&session()?, args),
        Command::List(args) => cmd_list(&session()?, args),
        Command::Split(args) => cmd_split(&session()?, args),
        Command::Merge(args) => cmd_merge(&session()?, args),
        Command::Resume(args) => cmd_resume(&session()?, args),
        Command::Mangle(args) => {
            let config = CliConfig::load(cli.config.as_deref())?;
            cmd_mangle(args, cli.format, &config)
        }
    }
}

fn identity(args: &ObjectArgs) -> anyhow::Result<ObjectIdentity> {
    let snap = match args.snap.as_str() {
        "head" => Snap::Head,
        "snapdir" => Snap::SnapDir,
        other => Snap::Id(
            u64::from_str_radix(other, 16).with_context(|| format!("invalid snap {other:?}"))?,
        ),
    };
    let mut oid = ObjectIdentity::new(args.pool, args.hash, args.key.clone())
        .with_namespace(args.namespace.clone())
        .with_locator(args.locator.clone())
        .with_snap(snap);
    if let Some(shard) = args.shard {
        oid = oid.with_shard(shard);
    }
    if let Some(generation) = args.generation {
        oid = oid.with_generation(generation);
    }
    Ok(oid)
}

fn parse_dir(raw: &str) -> anyhow::Result<DirPath> {
    let components: Vec<&str> = raw.split('/').filter(|c| !c.is_empty()).collect();
    Ok(DirPath::from_components(components)?)
}

fn cmd_prepare(ctx: &Session, args: &IndexArgs) -> anyhow::Result<()> {
    let index = ctx.open(&args.index)?;
    index.prepare()?;
    if ctx.json() {
        println!("{}", json!({ "prepared": args.index }));
    } else {
        println!("{} Prepared {}", "✓".green().bold(), args.index.display().to_string().bold());
    }
    Ok(())
}

fn cmd_create(ctx: &Session, args: &ObjectCommandArgs) -> anyhow::Result<()> {
    let index = ctx.open(&args.index)?;
    let oid = identity(&args.object)?;
    let outcome = index.create(&oid)?;
    if ctx.json() {
        println!(
            "{}",
            json!({ "object": oid, "created": outcome == CreateOutcome::Created })
        );
    } else {
        match outcome {
            CreateOutcome::Created => println!("{} Created {}", "✓".green().bold(), oid),
            CreateOutcome::AlreadyPresent => println!("{} already present", oid.to_string().yellow()),
        }
    }
    Ok(())
}

fn cmd_lookup(ctx: &Session, args: &ObjectCommandArgs) -> anyhow::Result<()> {
    let index = ctx.open(&args.index)?;
    let oid = identity(&args.object)?;
    let Some(found) = index.lookup(&oid)? else {
        bail!("{oid} not found in {}", args.index.display());
    };
    let path = index.object_path(&found.dir, &found.name.name);
    if ctx.json() {
        println!(
            "{}",
            json!({
                "object": oid,
                "dir": found.dir.to_string(),
                "path": path,
                "hashed": found.name.is_hashed(),
                "hardlinks": found.hardlinks,
            })
        );
    } else {
        println!("{}", path.display().to_string().bold());
        println!("  Dir: {}", found.dir.to_string().cyan());
        match found.name.form {
            NameForm::Direct => println!("  Form: direct"),
            NameForm::Hashed { index } => println!("  Form: hashed (candidate {index})"),
        }
        println!("  Links: {}", found.hardlinks);
    }
    Ok(())
}

fn cmd_unlink(ctx: &Session, args: &ObjectCommandArgs) -> anyhow::Result<()> {
    let index = ctx.open(&args.index)?;
    let oid = identity(&args.object)?;
    let outcome = index.unlink(&oid)?;
    if ctx.json() {
        println!(
            "{}",
            json!({ "object": oid, "removed": outcome == UnlinkOutcome::Removed })
        );
    } else {
        match outcome {
            UnlinkOutcome::Removed => println!("{} Removed {}", "✓".green().bold(), oid),
            UnlinkOutcome::NotFound => println!("{} not present", oid.to_string().yellow()),
        }
    }
    Ok(())
}

fn cmd_list(ctx: &Session, args: &ListArgs) -> anyhow::Result<()> {
    let index = ctx.open(&args.index)?;
    let mut rows: Vec<(DirPath, String, ObjectIdentity)> = Vec::new();
    match &args.dir {
        Some(raw) => {
            let dir = parse_dir(raw)?;
            let mut cursor = DirCursor::start();
            loop {
                let page = index.list(&dir, &cursor, 256)?;
                rows.extend(page.objects.into_iter().map(|(n, o)| (dir.clone(), n, o)));
                match page.next {
                    Some(next) if args.limit == 0 || rows.len() < args.limit => cursor = next,
                    _ => break,
                }
            }
        }
        None => {
            let mut cursor = ObjectCursor::start();
            loop {
                let page = index.list_range(&cursor, 256)?;
                rows.extend(page.entries.into_iter().map(|e| (e.dir, e.name, e.oid)));
                match page.next {
                    Some(next) if args.limit == 0 || rows.len() < args.limit => cursor = next,
                    _ => break,
                }
            }
        }
    }
    if args.limit > 0 {
        rows.truncate(args.limit);
    }

    if ctx.json() {
        let out: Vec<_> = rows
            .iter()
            .map(|(dir, name, oid)| json!({ "dir": dir.to_string(), "name": name, "object": oid }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        for (dir, _, oid) in &rows {
            println!("{}  {}", dir.to_string().dimmed(), oid);
        }
        println!("{} objects", rows.len().to_string().bold());
    }
    Ok(())
}

fn print_stats(ctx: &Session, verb: &str, stats: &RebalanceStats) {
    if ctx.json() {
        println!(
            "{}",
            json!({ "objects_moved": stats.objects_moved, "subdirs_moved": stats.subdirs_moved })
        );
    } else {
        println!(
            "{} {verb}: {} objects, {} directories moved",
            "✓".green().bold(),
            stats.objects_moved.to_string().bold(),
            stats.subdirs_moved.to_string().bold()
        );
    }
}

fn cmd_split(ctx: &Session, args: &SplitArgs) -> anyhow::Result<()> {
    let src = ctx.open(&args.pair.src)?;
    let dest = ctx.open(&args.pair.dest)?;
    let stats = RebalanceEngine::new(&src, &dest)?.split(args.matching, args.bits)?;
    print_stats(ctx, "Split", &stats);
    Ok(())
}

fn cmd_merge(ctx: &Session, args: &PairArgs) -> anyhow::Result<()> {
    let src = ctx.open(&args.src)?;
    let dest = ctx.open(&args.dest)?;
    let stats = RebalanceEngine::new(&src, &dest)?.merge()?;
    print_stats(ctx, "Merge", &stats);
    Ok(())
}

fn cmd_resume(ctx: &Session, args: &PairArgs) -> anyhow::Result<()> {
    let src = ctx.open(&args.src)?;
    let dest = ctx.open(&args.dest)?;
    match RebalanceEngine::new(&src, &dest)?.resume()? {
        Some(stats) => print_stats(ctx, "Resumed", &stats),
        None if ctx.json() => println!("{}", json!({ "pending": false })),
        None => println!("Nothing to resume."),
    }
    Ok(())
}

fn cmd_mangle(args: &ObjectArgs, format: OutputFormat, config: &CliConfig) -> anyhow::Result<()> {
    let oid = identity(args)?;
    let codec = NameCodec::new(config.index.version);
    let name = codec.encode(&oid)?;
    match format {
        OutputFormat::Json => println!(
            "{}",
            json!({ "object": oid, "name": name.name, "hashed": name.is_hashed() })
        ),
        OutputFormat::Text => {
            println!("{}", name.name);
            if name.is_hashed() {
                println!("  {} {}", codec.lfn_attr().dimmed(), codec.direct_name(&oid));
            }
        }
    }
    Ok(())
}
