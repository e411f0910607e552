//! Command-line tool for building and inspecting tree files.
#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::ProgressBar;
use fractree::{
    admin::{verify_tree, VerifyFinding, VerifyLevel, VerifyReport, VerifySeverity},
    primitives::compress::CompressionMethod,
    storage::{
        ft::{bytewise, CacheTable, FtContext, FtTree, LeCursor, SimpleCacheTable},
        loader::{open_loader, reserve_loader_memory, IndexSpec, LoadReport},
        LoaderOptions,
    },
    types::{BlockNum, FileId},
};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod ui;

use ui::{Theme, Ui, PROGRESS_STEPS};

#[derive(Parser, Debug)]
#[command(
    name = "ft",
    version,
    about = "Build and inspect fractal tree files",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for reports"
    )]
    format: OutputFormat,

    #[arg(long, global = true, value_enum, default_value_t = Theme::Auto, help = "Color theme for text output")]
    theme: Theme,

    #[arg(long, short, global = true, help = "Plain output without icons or progress bars")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bulk load key,value rows from a CSV file into a new tree file.
    Load(LoadCmd),
    /// Print the header, translation table, and nodes of a tree file.
    Dump(DumpCmd),
    /// Check a tree file for corruption and ordering violations.
    Verify {
        #[arg(value_name = "TREE")]
        path: PathBuf,

        #[arg(long, value_enum, default_value_t = VerifyLevelArg::Full)]
        level: VerifyLevelArg,
    },
}

#[derive(Args, Debug)]
struct LoadCmd {
    #[arg(value_name = "CSV", help = "Input with one key,value record per line")]
    input: PathBuf,

    #[arg(value_name = "TREE", help = "Output tree file")]
    output: PathBuf,

    #[arg(long, value_name = "FILE", help = "TOML file with loader options")]
    config: Option<PathBuf>,

    #[arg(long, help = "Skip the first CSV record")]
    has_header: bool,

    #[arg(long, value_name = "BYTES", help = "Loader memory budget")]
    memory: Option<usize>,

    #[arg(
        long,
        value_name = "BYTES",
        help = "Take the memory budget from a cache table of this size"
    )]
    cache_size: Option<u64>,

    #[arg(
        long,
        value_name = "FRACTION",
        default_value_t = 0.5,
        help = "Share of --cache-size reserved for the load"
    )]
    cache_fraction: f64,

    #[arg(long, value_name = "DIR", help = "Directory for spill files")]
    temp_dir: Option<PathBuf>,

    #[arg(long, value_enum, help = "Node compression")]
    compression: Option<CompressionArg>,

    #[arg(long, value_enum, help = "Compress spill files with this codec")]
    compress_intermediates: Option<CompressionArg>,

    #[arg(long, value_name = "BYTES", help = "Target node size")]
    node_size: Option<u32>,

    #[arg(long, value_name = "BYTES", help = "Target basement size")]
    basement_size: Option<u32>,

    #[arg(long, help = "Children per internal node")]
    fanout: Option<u32>,

    #[arg(long, help = "Show a progress bar while loading")]
    progress: bool,
}

#[derive(Args, Debug)]
struct DumpCmd {
    #[arg(value_name = "TREE")]
    path: PathBuf,

    #[arg(long, help = "Also list every row through a leaf cursor")]
    scan: bool,

    #[arg(long, help = "Stop the scan after this many rows")]
    limit: Option<u64>,

    #[arg(long, help = "Print keys and values as hex")]
    hex: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum VerifyLevelArg {
    Fast,
    Full,
}

impl From<VerifyLevelArg> for VerifyLevel {
    fn from(level: VerifyLevelArg) -> Self {
        match level {
            VerifyLevelArg::Fast => VerifyLevel::Fast,
            VerifyLevelArg::Full => VerifyLevel::Full,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CompressionArg {
    None,
    Default,
    Fast,
    Small,
    Zlib,
    #[value(name = "quicklz")]
    QuickLz,
    Lzma,
    #[value(name = "zlib-no-checksum")]
    ZlibNoChecksum,
}

impl From<CompressionArg> for CompressionMethod {
    fn from(arg: CompressionArg) -> Self {
        match arg {
            CompressionArg::None => CompressionMethod::None,
            CompressionArg::Default => CompressionMethod::Default,
            CompressionArg::Fast => CompressionMethod::Fast,
            CompressionArg::Small => CompressionMethod::Small,
            CompressionArg::Zlib => CompressionMethod::Zlib,
            CompressionArg::QuickLz => CompressionMethod::QuickLz,
            CompressionArg::Lzma => CompressionMethod::Lzma,
            CompressionArg::ZlibNoChecksum => CompressionMethod::ZlibNoChecksum,
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fractree=info")),
        )
        .with_writer(std::io::stderr)
        .init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32, Box<dyn Error>> {
    let cli = Cli::parse();
    let ui = Ui::new(cli.theme, cli.quiet);
    match cli.command {
        Command::Load(cmd) => {
            let report = run_load(&cmd, &ui)?;
            emit(cli.format, &report, || print_load_text(&ui, &report))?;
        }
        Command::Dump(cmd) => {
            let report = run_dump(&cmd)?;
            emit(cli.format, &report, || print_dump_text(&ui, &report))?;
        }
        Command::Verify { path, level } => {
            let report = verify_tree(&path, bytewise(), level.into())?;
            emit(cli.format, &report, || print_verify_text(&ui, &report))?;
            if !report.success {
                return Ok(2);
            }
        }
    }
    Ok(0)
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn loader_options(cmd: &LoadCmd, bar: Option<&ProgressBar>) -> Result<LoaderOptions, Box<dyn Error>> {
    let mut opts = match &cmd.config {
        Some(path) => toml::from_str(&fs::read_to_string(path)?)?,
        None => LoaderOptions::default(),
    };
    if let Some(bytes) = cmd.memory {
        opts.memory_budget = bytes;
    }
    if let Some(dir) = &cmd.temp_dir {
        opts.temp_dir = Some(dir.clone());
    }
    if let Some(method) = cmd.compression {
        opts.tree.compression = method.into();
    }
    if let Some(method) = cmd.compress_intermediates {
        opts = opts.compress_intermediates(method.into());
    }
    if let Some(bytes) = cmd.node_size {
        opts.tree.node_size = bytes;
    }
    if let Some(bytes) = cmd.basement_size {
        opts.tree.basement_node_size = bytes;
    }
    if let Some(fanout) = cmd.fanout {
        opts.tree = opts.tree.fanout(fanout);
    }
    if let Some(bar) = bar {
        let bar = bar.clone();
        opts = opts.progress(Arc::new(move |fraction| {
            bar.set_position((fraction * PROGRESS_STEPS as f64) as u64);
            true
        }));
    }
    Ok(opts)
}

fn run_load(cmd: &LoadCmd, ui: &Ui) -> Result<LoadReport, Box<dyn Error>> {
    let bar = if cmd.progress {
        ui.load_bar(&cmd.output.display().to_string())
    } else {
        None
    };
    let result = load_csv(cmd, bar.as_ref());
    if let Some(bar) = bar {
        match &result {
            Ok(_) => bar.finish_and_clear(),
            Err(_) => bar.abandon(),
        }
    }
    result
}

fn load_csv(cmd: &LoadCmd, bar: Option<&ProgressBar>) -> Result<LoadReport, Box<dyn Error>> {
    let mut opts = loader_options(cmd, bar)?;
    let cache = cmd.cache_size.map(SimpleCacheTable::new);
    let reserved = match &cache {
        Some(ct) => {
            let bytes = reserve_loader_memory(ct, cmd.cache_fraction);
            opts.memory_budget = bytes as usize;
            bytes
        }
        None => 0,
    };
    debug!(?opts, "ft.load.options");

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(cmd.has_header)
        .flexible(false)
        .from_path(&cmd.input)?;
    let mut loader = open_loader(
        vec![IndexSpec::new(&cmd.output)],
        opts,
        Arc::new(FtContext::with_threads(0)?),
    )?;
    for (line, record) in reader.byte_records().enumerate() {
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                loader.abort()?;
                return Err(err.into());
            }
        };
        if record.len() != 2 {
            loader.abort()?;
            return Err(format!("record {} has {} fields, expected 2", line + 1, record.len()).into());
        }
        if let Err(err) = loader.put(&record[0], &record[1]) {
            loader.abort()?;
            return Err(err.into());
        }
    }
    let report = loader.close();
    if let Some(ct) = &cache {
        ct.release_reserved_memory(reserved);
    }
    Ok(report?)
}

fn print_load_text(ui: &Ui, report: &LoadReport) {
    ui.success(&format!(
        "loaded {} rows in {} ms ({} rowsets)",
        report.rows_put, report.elapsed_ms, report.rowsets
    ));
    for index in &report.indexes {
        ui.section(
            &index.path.display().to_string(),
            [
                ("rows", index.rows.to_string()),
                ("height", index.height.to_string()),
                ("leaves", index.leaves.to_string()),
                ("internal nodes", index.internal_nodes.to_string()),
                ("spill files", index.spill_files.to_string()),
                ("appended runs", index.appended_runs.to_string()),
                ("merge passes", index.merge_passes.to_string()),
                ("file size", index.file_size.to_string()),
            ],
        );
    }
}

#[derive(Debug, Serialize)]
struct DumpHeader {
    layout_version: u32,
    layout_version_original: u32,
    build_id: u32,
    file_size: u64,
    translation_offset: u64,
    translation_size: u64,
    root: Option<u64>,
    node_size: u32,
    basement_node_size: u32,
    compression: CompressionMethod,
    fanout: u32,
    max_msn: u64,
}

#[derive(Debug, Serialize)]
struct DumpBlock {
    blocknum: u64,
    offset: u64,
    size: u64,
}

#[derive(Debug, Serialize)]
struct DumpNode {
    blocknum: u64,
    height: u32,
    children: usize,
    layout_version: u32,
    layout_version_original: u32,
    max_msn: u64,
}

#[derive(Debug, Serialize)]
struct DumpRow {
    key: String,
    value: String,
}

#[derive(Debug, Serialize)]
struct DumpReport {
    path: PathBuf,
    header: DumpHeader,
    descriptor_version: u32,
    descriptor_len: usize,
    blocks: Vec<DumpBlock>,
    nodes: Vec<DumpNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rows: Option<Vec<DumpRow>>,
}

fn run_dump(cmd: &DumpCmd) -> Result<DumpReport, Box<dyn Error>> {
    let tree = FtTree::open(&cmd.path, FileId(1), bytewise(), Arc::new(FtContext::serial()))?;
    let h = tree.header();
    let header = DumpHeader {
        layout_version: h.layout_version,
        layout_version_original: h.layout_version_original,
        build_id: h.build_id,
        file_size: h.file_size,
        translation_offset: h.translation_offset,
        translation_size: h.translation_size,
        root: tree.root().map(|b| b.0),
        node_size: h.node_size,
        basement_node_size: h.basement_node_size,
        compression: h.compression,
        fanout: h.fanout,
        max_msn: h.max_msn.0,
    };
    let blocks = tree
        .translation()
        .iter()
        .map(|(b, loc)| DumpBlock {
            blocknum: b.0,
            offset: loc.offset,
            size: loc.size,
        })
        .collect();

    let mut nodes = Vec::new();
    let mut queue: VecDeque<BlockNum> = tree.root().into_iter().collect();
    while let Some(blocknum) = queue.pop_front() {
        let node = tree.read_node_header(blocknum)?;
        if !node.is_leaf() {
            queue.extend(node.children.iter().map(|c| c.blocknum));
        }
        nodes.push(DumpNode {
            blocknum: blocknum.0,
            height: node.height,
            children: node.n_children(),
            layout_version: node.layout_version,
            layout_version_original: node.layout_version_original,
            max_msn: node.max_msn_applied_on_disk.0,
        });
    }

    let rows = if cmd.scan {
        Some(scan_rows(&tree, cmd.limit, cmd.hex)?)
    } else {
        None
    };
    Ok(DumpReport {
        path: cmd.path.clone(),
        header,
        descriptor_version: tree.descriptor().version,
        descriptor_len: tree.descriptor().bytes.len(),
        blocks,
        nodes,
        rows,
    })
}

fn scan_rows(tree: &FtTree, limit: Option<u64>, hex: bool) -> Result<Vec<DumpRow>, Box<dyn Error>> {
    let render = |bytes: &[u8]| {
        if hex {
            hex::encode(bytes)
        } else {
            bytes.escape_ascii().to_string()
        }
    };
    let ct = SimpleCacheTable::new(64 << 20);
    let mut cursor = LeCursor::create(tree, &ct);
    let mut rows = Vec::new();
    while limit.map_or(true, |n| (rows.len() as u64) < n) && cursor.advance()? {
        let Some(entry) = cursor.current() else {
            break;
        };
        rows.push(DumpRow {
            key: render(entry.key()),
            value: entry.committed_value().map(render).unwrap_or_default(),
        });
    }
    cursor.close();
    Ok(rows)
}

fn print_dump_text(ui: &Ui, report: &DumpReport) {
    let h = &report.header;
    ui.section(
        &report.path.display().to_string(),
        [
            ("layout", format!("{} (original {})", h.layout_version, h.layout_version_original)),
            ("build", h.build_id.to_string()),
            ("file size", h.file_size.to_string()),
            ("node size", h.node_size.to_string()),
            ("basement size", h.basement_node_size.to_string()),
            ("compression", format!("{:?}", h.compression)),
            ("fanout", h.fanout.to_string()),
            ("root", h.root.map_or_else(|| "none".to_string(), |r| r.to_string())),
            ("max msn", h.max_msn.to_string()),
            (
                "descriptor",
                format!("version {} ({} bytes)", report.descriptor_version, report.descriptor_len),
            ),
        ],
    );
    ui.list(
        "Blocks",
        report
            .blocks
            .iter()
            .map(|b| format!("{:>6} @ {:>10} +{}", b.blocknum, b.offset, b.size)),
    );
    ui.list(
        "Nodes",
        report.nodes.iter().map(|n| {
            format!(
                "{:>6} height={} children={} layout={}/{} msn={}",
                n.blocknum, n.height, n.children, n.layout_version, n.layout_version_original, n.max_msn
            )
        }),
    );
    if let Some(rows) = &report.rows {
        ui.list("Rows", rows.iter().map(|row| format!("{} => {}", row.key, row.value)));
    }
}

fn print_verify_text(ui: &Ui, report: &VerifyReport) {
    let summary = format!("{} ({:?})", report.path.display(), report.level);
    if report.success {
        ui.success(&format!("{summary}: ok"));
    } else {
        ui.error(&format!("{summary}: FAILED"));
    }
    let c = &report.counts;
    ui.section(
        "Counts",
        [
            ("nodes", c.nodes),
            ("leaves", c.leaves),
            ("internal", c.internal_nodes),
            ("basements", c.basements),
            ("entries", c.entries),
            ("messages", c.messages),
            ("height", u64::from(c.height)),
            ("blocks", c.blocks_allocated),
        ],
    );
    let message = |finding: &VerifyFinding| match finding.blocknum {
        Some(b) => format!("block {b}: {}", finding.message),
        None => finding.message.clone(),
    };
    ui.list(
        "Notes",
        report
            .findings
            .iter()
            .filter(|f| f.severity == VerifySeverity::Info)
            .map(message),
    );
    for finding in &report.findings {
        match finding.severity {
            VerifySeverity::Info => {}
            VerifySeverity::Warning => ui.warn(&message(finding)),
            VerifySeverity::Error => ui.error(&message(finding)),
        }
    }
}
