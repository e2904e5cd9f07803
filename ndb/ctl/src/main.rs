//! Inspection tool for package database homes.
//!
//! ```text
//! ndbctl stats <home>      engine counters for Packages.db and Index.db
//! ndbctl list <home>       live package ids in file order
//! ndbctl dump <home> <id>  write one header blob to stdout
//! ndbctl check <home>      verify every blob's framing and checksum
//! ```

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};

use ndb::idxdb::IdxDb;
use ndb::pkgdb::PkgDb;
use ndb::xdb::Xdb;

#[derive(Parser)]
#[command(about = "Inspect a package database home directory", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print engine counters
    Stats { home: Utf8PathBuf },
    /// Print all live package ids
    List { home: Utf8PathBuf },
    /// Write one package blob to stdout
    Dump { home: Utf8PathBuf, id: u32 },
    /// Verify every package blob
    Check { home: Utf8PathBuf },
}

fn open_pkgdb(home: &Utf8PathBuf) -> anyhow::Result<PkgDb> {
    let path = home.join("Packages.db");
    PkgDb::open(&path, false, true).with_context(|| format!("opening {path}"))
}

fn stats(home: &Utf8PathBuf) -> anyhow::Result<()> {
    let mut pkgdb = open_pkgdb(home)?;
    let s = pkgdb.stats()?;
    println!("--- package db");
    println!("file:           {}", s.path);
    println!("generation:     {}", s.generation);
    println!("slot pages:     {}", s.slot_pages);
    println!("used slots:     {}", s.used_slots);
    println!("free slots:     {}", s.free_slots);
    println!("blob area:      {} bytes", s.blob_area_bytes);
    println!("blob area used: {} bytes", s.blob_used_bytes);

    let xdb_path = home.join("Index.db");
    if !xdb_path.as_std_path().exists() {
        return Ok(());
    }
    let pkgdb = Rc::new(RefCell::new(pkgdb));
    let xdb = Xdb::open(pkgdb, &xdb_path, false, true)
        .with_context(|| format!("opening {xdb_path}"))?;
    let xdb = Rc::new(RefCell::new(xdb));
    let s = xdb.borrow_mut().stats()?;
    println!("--- index store");
    println!("file:           {}", s.path);
    println!("generation:     {}", s.generation);
    println!("slot pages:     {}", s.slot_pages);
    println!("blob pages:     {}", s.blob_pages);
    println!("free pages:     {}", s.free_pages);
    println!("page size:      {}", s.pagesize);
    for blob in &s.blobs {
        println!(
            "blob #{}: tag {}/{}, startpage {}, pagecnt {}",
            blob.id, blob.blobtag, blob.subtag, blob.startpage, blob.pagecnt
        );
    }
    for blob in &s.blobs {
        if blob.subtag != 0 {
            continue;
        }
        let mut idxdb = IdxDb::open(xdb.clone(), blob.blobtag)?;
        let s = idxdb.stats()?;
        println!("--- index tag {}", s.tag);
        println!("slots:          {} used {} dummy {}", s.nslots, s.usedslots, s.dummyslots);
        println!("key heap:       {} bytes, {} excess", s.keyend, s.keyexcess);
        println!("xmask:          {:#010x}", s.xmask);
    }
    Ok(())
}

fn list(home: &Utf8PathBuf) -> anyhow::Result<()> {
    let mut pkgdb = open_pkgdb(home)?;
    for id in pkgdb.list()? {
        println!("{id}");
    }
    Ok(())
}

fn dump(home: &Utf8PathBuf, id: u32) -> anyhow::Result<()> {
    let mut pkgdb = open_pkgdb(home)?;
    let blob = pkgdb.get(id).with_context(|| format!("package {id}"))?;
    std::io::stdout().write_all(&blob)?;
    Ok(())
}

fn check(home: &Utf8PathBuf) -> anyhow::Result<()> {
    let mut pkgdb = open_pkgdb(home)?;
    let n = pkgdb.list()?.len();
    pkgdb.verify()?;
    println!("{n} packages ok");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    match &cli.command {
        Command::Stats { home } => stats(home),
        Command::List { home } => list(home),
        Command::Dump { home, id } => dump(home, *id),
        Command::Check { home } => check(home),
    }
}
