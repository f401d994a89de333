//! avl-driver - fills a balanced tree with random keys and shows it
//!
//! # Usage
//!
//! ```bash
//! # 20 random keys, remove the first 10, write tree.dot and treeAfterRemove.dot
//! avl-driver
//!
//! # reproducible run, also converting the drawings with `dot -Tpng`
//! avl-driver --seed 7 --png --out-dir pics
//! ```

use anyhow::{bail, Context, Result};
use balanced_tree::{render, BalancedTree};
use clap::Parser;
use log::{debug, info, warn, LevelFilter};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Fill an AVL tree with random keys, remove some, and draw it before and after
#[derive(Parser, Debug)]
#[command(name = "avl-driver")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of random keys to draw
    #[arg(long, default_value_t = 20)]
    count: usize,

    /// Keys are drawn from 0 up to this bound (exclusive)
    #[arg(long, default_value_t = 100)]
    max_key: u32,

    /// Number of drawn keys removed again, in draw order
    #[arg(long, default_value_t = 10)]
    remove: usize,

    /// Seed for the random generator
    #[arg(long)]
    seed: Option<u64>,

    /// Directory receiving the .dot files
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,

    /// Convert each .dot file to .png with Graphviz
    #[arg(long)]
    png: bool,

    /// Verbose output (repeat for rotation tracing)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    TermLogger::init(level, Config::default(), TerminalMode::Mixed, ColorChoice::Auto)
        .context("failed to initialize logging")?;

    if cli.max_key == 0 {
        bail!("--max-key must be at least 1");
    }

    let mut rng = match cli.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };

    let keys: Vec<u32> = (0..cli.count)
        .map(|_| rng.random_range(0..cli.max_key))
        .collect();

    let mut tree: BalancedTree<u32, usize> = BalancedTree::new();
    tree.set_rotation_observer(|event| {
        debug!(
            "{} rotation: {} replaces {}",
            event.rotation, event.promoted, event.pivot
        )
    });

    for (value, key) in keys.iter().enumerate() {
        if !tree.insert(*key, value) {
            info!("key {key} drawn again, keeping its first value");
        }
    }

    draw(&tree, &cli.out_dir, "tree", cli.png)?;

    for key in keys.iter().take(cli.remove) {
        match tree.remove(key) {
            Some(_) => println!("Removed a node from the tree!"),
            None => info!("key {key} was already removed"),
        }

        if tree.is_balanced() {
            println!("This tree is balanced!");
        } else {
            println!("NOT BALANCED-------------------------");
        }
    }

    draw(&tree, &cli.out_dir, "treeAfterRemove", cli.png)?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    for (key, value) in &tree {
        writeln!(out, "{key}: {value}")?;
    }

    Ok(())
}

/// Writes `<dir>/<name>.dot` and optionally renders it to `<dir>/<name>.png`.
fn draw(tree: &BalancedTree<u32, usize>, dir: &Path, name: &str, png: bool) -> Result<()> {
    let dot_path = dir.join(format!("{name}.dot"));

    let file = File::create(&dot_path)
        .with_context(|| format!("failed to create {}", dot_path.display()))?;
    let mut writer = BufWriter::new(file);
    render::write_dot(tree, &mut writer)
        .with_context(|| format!("failed to write {}", dot_path.display()))?;
    writer.flush()?;

    if png {
        let png_path = dir.join(format!("{name}.png"));

        match Command::new("dot")
            .arg("-Tpng")
            .arg("-o")
            .arg(&png_path)
            .arg(&dot_path)
            .status()
        {
            Ok(status) if status.success() => info!("wrote {}", png_path.display()),
            Ok(status) => warn!("dot exited with {status} for {}", dot_path.display()),
            Err(err) => warn!("could not run dot: {err}"),
        }
    }

    Ok(())
}
