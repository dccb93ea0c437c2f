use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use regex::Regex;
use std::path::{Path, PathBuf};

use jheap_analyzer::compare::{
    KeyConfig, Mode, SimpleRow, SimpleTable, TableInput, compare_tables,
};
use jheap_analyzer::progress::CancellationToken;
use jheap_analyzer::query::{
    DominatorQuery, Grouping, Node, PackageNode, PathGrouping, PathTreeNode, PathsFromRoots,
    multipath,
};
use jheap_analyzer::snapshot::{HeapDump, Snapshot, read_dump_file};
use jheap_analyzer::utils::{format_bytes, truncate_label};
use jheap_analyzer::{collection_histogram, ObjectId};

#[derive(Parser)]
#[command(name = "jheap-analyzer")]
#[command(about = "Analyze JVM heap dumps: collections, dominators, GC-root paths")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Per-class statistics over every recognized collection
    Histogram {
        /// Input dump file (JSON interchange format)
        input: PathBuf,
    },

    /// Browse the dominator tree
    Dominators {
        input: PathBuf,

        /// Grouping: none, class, classloader, package
        #[arg(short, long, default_value = "class")]
        group: String,

        /// Expansion depth
        #[arg(short, long, default_value_t = 2)]
        depth: usize,
    },

    /// Compare collection histograms of two dumps
    Compare {
        baseline: PathBuf,
        updated: PathBuf,

        /// Value mode: absolute, diff, ratio
        #[arg(short, long, default_value = "diff")]
        mode: String,
    },

    /// Merged paths from GC roots to all instances of a class
    Paths {
        input: PathBuf,

        /// Fully-qualified class name of the target objects
        class: String,

        /// Collapse path nodes of the same class
        #[arg(long)]
        by_class: bool,
    },
}

fn main() -> Result<()> {
    let args = Cli::parse();
    let token = CancellationToken::new();

    match args.command {
        Command::Histogram { input } => {
            let dump = load(&input)?;
            print_histogram(&dump, &token)
        }
        Command::Dominators {
            input,
            group,
            depth,
        } => {
            let dump = load(&input)?;
            print_dominators(&dump, &group, depth, &token)
        }
        Command::Compare {
            baseline,
            updated,
            mode,
        } => {
            let mode = match mode.as_str() {
                "absolute" => Mode::Absolute,
                "diff" => Mode::DiffToFirst,
                "ratio" => Mode::DiffRatioToFirst,
                other => bail!("unknown mode '{}'", other),
            };
            let base = load(&baseline)?;
            let new = load(&updated)?;
            print_comparison(&base, &new, mode, &token)
        }
        Command::Paths {
            input,
            class,
            by_class,
        } => {
            let dump = load(&input)?;
            print_paths(&dump, &class, by_class, &token)
        }
    }
}

fn load(path: &Path) -> Result<HeapDump> {
    let dump =
        read_dump_file(path).with_context(|| format!("loading dump {}", path.display()))?;
    let info = dump.info();
    println!(
        "{}: {} objects, {} used",
        path.display(),
        info.object_count,
        format_bytes(info.used_heap_size)
    );
    Ok(dump)
}

fn scan_spinner(message: &'static str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(ProgressStyle::with_template("{spinner} {msg}").expect("static template"));
    bar.set_message(message);
    bar.enable_steady_tick(std::time::Duration::from_millis(100));
    bar
}

fn print_histogram(dump: &HeapDump, token: &CancellationToken) -> Result<()> {
    let bar = scan_spinner("scanning collections");
    let rows = collection_histogram(dump, token)?;
    bar.finish_and_clear();

    println!();
    println!(
        "{:<48} {:>9} {:>12} {:>8} {:>8} {:>7}",
        "class", "instances", "entries", "avgfill", "unknown", "errors"
    );
    for row in rows {
        let fill = row
            .avg_fill_ratio
            .map(|f| format!("{:.2}", f))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<48} {:>9} {:>12} {:>8} {:>8} {:>7}",
            truncate_label(&row.class_name, 48),
            row.instances,
            row.total_entries,
            fill,
            row.unknown_sizes,
            row.extraction_errors
        );
    }
    Ok(())
}

fn print_dominators(
    dump: &HeapDump,
    group: &str,
    depth: usize,
    token: &CancellationToken,
) -> Result<()> {
    let grouping = match group {
        "none" => Grouping::None,
        "class" => Grouping::ByClass,
        "classloader" => Grouping::ByClassLoader,
        "package" => Grouping::ByPackage,
        other => bail!("unknown grouping '{}'", other),
    };
    let query = DominatorQuery::new(dump, grouping);

    if grouping == Grouping::ByPackage {
        let tree = query.package_tree(token)?;
        print_package_node(&tree, 0);
        return Ok(());
    }

    let mut top = query.top_level(token)?;
    sort_by_retained(&mut top);
    for node in &top {
        print_dominator_node(&query, node, 0, depth, token)?;
    }
    Ok(())
}

fn sort_by_retained(nodes: &mut [Node]) {
    nodes.sort_by_key(|n| std::cmp::Reverse(n.retained_size().unwrap_or(0)));
}

fn print_dominator_node(
    query: &DominatorQuery,
    node: &Node,
    indent: usize,
    depth: usize,
    token: &CancellationToken,
) -> Result<()> {
    println!(
        "{:indent$}{} ({} objects, retained {})",
        "",
        truncate_label(node.label(), 72),
        node.object_count(),
        format_bytes(node.retained_size()?),
        indent = indent * 2
    );
    if depth > 0 {
        let mut children = query.children_of(node, token)?;
        sort_by_retained(&mut children);
        for child in &children {
            print_dominator_node(query, child, indent + 1, depth - 1, token)?;
        }
    }
    Ok(())
}

fn print_package_node(node: &PackageNode, indent: usize) {
    println!(
        "{:indent$}{} ({} objects, {} shallow, {} retained)",
        "",
        node.name,
        node.object_count,
        format_bytes(node.shallow_size),
        format_bytes(node.retained_size),
        indent = indent * 2
    );
    for child in node.children.values() {
        print_package_node(child, indent + 1);
    }
    for (class, stats) in &node.classes {
        println!(
            "{:indent$}. {} ({} objects, {} shallow, {} retained)",
            "",
            class,
            stats.object_count,
            format_bytes(stats.shallow_size),
            format_bytes(stats.retained_size),
            indent = (indent + 1) * 2
        );
    }
}

/// Builds a comparable table from a histogram: key = class name, columns =
/// instance count and total entries.
fn histogram_table(dump: &HeapDump, token: &CancellationToken) -> Result<SimpleTable> {
    let mut table = SimpleTable::new(vec!["instances".to_string(), "entries".to_string()]);
    for row in collection_histogram(dump, token)? {
        table.push(SimpleRow {
            key: row.class_name,
            context: None,
            retained_size: None,
            object_ids: Vec::new(),
            values: vec![Some(row.instances as f64), Some(row.total_entries as f64)],
        });
    }
    Ok(table)
}

fn print_comparison(
    base: &HeapDump,
    new: &HeapDump,
    mode: Mode,
    token: &CancellationToken,
) -> Result<()> {
    let tables = [histogram_table(base, token)?, histogram_table(new, token)?];
    let inputs = [
        TableInput {
            table: &tables[0],
            snapshot: Some(base as &dyn Snapshot),
        },
        TableInput {
            table: &tables[1],
            snapshot: Some(new as &dyn Snapshot),
        },
    ];
    let key_config = KeyConfig {
        // strip any address decoration so rows line up across dumps
        mask: Some(Regex::new(r" @ 0x[0-9a-f]+").expect("static key mask")),
        replacement: String::new(),
    };
    let cmp = compare_tables(&inputs, &key_config, token)?;

    println!();
    println!(
        "{:<48} {:>12} {:>12} {:>12} {:>12}",
        "class", "instances", "entries", "instances'", "entries'"
    );
    for (i, row) in cmp.rows().iter().enumerate() {
        let cell = |table: usize, column: usize| match cmp.value(i, table, column, mode) {
            Some(v) => format!("{:.0}", v),
            None => "-".to_string(),
        };
        println!(
            "{:<48} {:>12} {:>12} {:>12} {:>12}",
            truncate_label(&row.key, 48),
            cell(0, 0),
            cell(0, 1),
            cell(1, 0),
            cell(1, 1)
        );
    }
    Ok(())
}

fn print_paths(
    dump: &HeapDump,
    class: &str,
    by_class: bool,
    token: &CancellationToken,
) -> Result<()> {
    let class_ids = dump.classes_by_name(class);
    if class_ids.is_empty() {
        bail!("no class named '{}' in the dump", class);
    }
    let mut targets: Vec<ObjectId> = Vec::new();
    for id in 0..dump.info().object_count as ObjectId {
        if !dump.is_class(id) && class_ids.contains(&dump.class_of(id)?) {
            targets.push(id);
        }
    }
    println!("{} target objects", targets.len());

    let paths = PathsFromRoots::compute(dump, &targets, token)?;
    println!("{} reachable", paths.paths().len());
    let grouping = if by_class {
        PathGrouping::FromGcRootsByClass
    } else {
        PathGrouping::FromGcRoots
    };
    let tree = paths.merge(grouping)?;
    for root in &tree.roots {
        print_path_node(dump, root, None, 0)?;
    }
    Ok(())
}

fn print_path_node(
    dump: &HeapDump,
    node: &PathTreeNode,
    parent: Option<ObjectId>,
    indent: usize,
) -> Result<()> {
    let label = if node.objects.len() == 1 {
        jheap_analyzer::snapshot::HeapObject::new(dump, node.objects[0]).display_name()
    } else {
        format!(
            "{} ({} objects)",
            dump.class_name(node.class_id)?,
            node.objects.len()
        )
    };
    let via = match parent {
        Some(parent) => match multipath::edge_label(dump, parent, node.objects[0])? {
            Some(field) => format!(".{} = ", field),
            None => String::new(),
        },
        None => String::new(),
    };
    println!(
        "{:indent$}{}{} [{} paths]",
        "",
        via,
        truncate_label(&label, 72),
        node.path_count,
        indent = indent * 2
    );
    for child in &node.children {
        print_path_node(dump, child, Some(node.objects[0]), indent + 1)?;
    }
    Ok(())
}
