use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "hashdir",
    about = "Hashed-directory object index",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Directory holding the indexes
    #[arg(long, global = true, default_value = ".")]
    pub root: PathBuf,

    /// TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory levels of the nibble layout (overrides the config file)
    #[arg(long, global = true)]
    pub levels: Option<usize>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create the bucket tree of an index
    Prepare(IndexArgs),
    /// Create an object
    Create(ObjectCommandArgs),
    /// Find the file of an object
    Lookup(ObjectCommandArgs),
    /// Remove an object
    Unlink(ObjectCommandArgs),
    /// List objects of one directory or of the whole index
    List(ListArgs),
    /// Move objects matching a hash predicate to another index
    Split(SplitArgs),
    /// Move every object to another index
    Merge(PairArgs),
    /// Finish an interrupted split or merge
    Resume(PairArgs),
    /// Show the filename an object maps to
    Mangle(ObjectArgs),
}

#[derive(Args)]
pub struct IndexArgs {
    /// Index directory, relative to --root
    pub index: PathBuf,
}

#[derive(Args)]
pub struct ObjectCommandArgs {
    /// Index directory, relative to --root
    pub index: PathBuf,
    #[command(flatten)]
    pub object: ObjectArgs,
}

#[derive(Args, Clone)]
pub struct ObjectArgs {
    /// Object name
    pub key: String,
    /// Placement hash, hex
    #[arg(long, value_parser = parse_hex_u32)]
    pub hash: u32,
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub pool: i64,
    #[arg(long, default_value = "")]
    pub namespace: String,
    #[arg(long, default_value = "")]
    pub locator: String,
    /// Snapshot: head, snapdir or a hex id
    #[arg(long, default_value = "head")]
    pub snap: String,
    #[arg(long)]
    pub shard: Option<u8>,
    #[arg(long)]
    pub generation: Option<u64>,
}

#[derive(Args)]
pub struct ListArgs {
    /// Index directory, relative to --root
    pub index: PathBuf,
    /// Only this directory, components separated by '/'
    #[arg(long)]
    pub dir: Option<String>,
    /// Maximum entries to print
    #[arg(short = 'n', long, default_value = "0")]
    pub limit: usize,
}

#[derive(Args)]
pub struct SplitArgs {
    #[command(flatten)]
    pub pair: PairArgs,
    /// Hash value to match, hex
    #[arg(long, value_parser = parse_hex_u32)]
    pub matching: u32,
    /// Number of low hash bits compared
    #[arg(long)]
    pub bits: u32,
}

#[derive(Args)]
pub struct PairArgs {
    /// Source index, relative to --root
    pub src: PathBuf,
    /// Destination index, relative to --root
    pub dest: PathBuf,
}

fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).map_err(|e| format!("invalid hex value {s:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_object_flags() {
        let cli = Cli::try_parse_from([
            "hashdir", "create", "pg1", "obj", "--hash", "0xdeadBEEF", "--pool", "-3",
            "--shard", "2",
        ])
        .unwrap();
        let Command::Create(args) = cli.command else {
            panic!("expected create");
        };
        assert_eq!(args.object.hash, 0xdead_beef);
        assert_eq!(args.object.pool, -3);
        assert_eq!(args.object.shard, Some(2));
        assert_eq!(args.object.snap, "head");
    }

    #[test]
    fn parses_split() {
        let cli = Cli::try_parse_from([
            "hashdir", "--levels", "2", "split", "a", "b", "--matching", "5", "--bits", "4",
        ])
        .unwrap();
        assert_eq!(cli.levels, Some(2));
        let Command::Split(args) = cli.command else {
            panic!("expected split");
        };
        assert_eq!((args.matching, args.bits), (5, 4));
        assert_eq!(args.pair.dest, PathBuf::from("b"));
    }

    #[test]
    fn rejects_bad_hash() {
        assert!(Cli::try_parse_from(["hashdir", "mangle", "k", "--hash", "xyz"]).is_err());
    }
}
