use clap::Parser;
use log::info;
use prettytable::{color, row, Attr, Cell, Row, Table};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

use watchq::setup::{check_permission, raise_fd_limit};
use watchq::{
    ChangeEvent, DirSet, ManagedChangeEvent, ManagedFile, ManagedSetProvider, ManagedWatch,
    MountWatch, NoPendingChanges, StaticSet, WatchConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// file to put under watch
    #[arg(short, long)]
    file: Vec<String>,
    /// watch every file under this directory
    #[arg(short, long, default_value = "")]
    dir: String,
    /// if walk dir follow links
    #[arg(long, default_value_t = false)]
    follow_links: bool,
    /// observe the whole mount through the kernel channel instead of per-file watches
    #[arg(short, long, default_value_t = false)]
    mount: bool,
    /// seconds between polls
    #[arg(short, long, default_value_t = 5)]
    interval: u64,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    env_logger::init();
    let args = Args::parse();

    let mut files = Vec::new();
    for f in args.file {
        files.push(ManagedFile::new(f, "base", "local"));
    }
    if !args.dir.is_empty() {
        files.extend(DirSet::new(&args.dir, args.follow_links).list_managed()?);
    }
    if files.is_empty() {
        anyhow::bail!("nothing to watch, pass --file or --dir");
    }
    info!("{} file(s) under watch", files.len());

    let provider = StaticSet::new(files);
    let config = WatchConfig {
        interval_secs: args.interval.max(1),
    };

    match args.mount {
        true => {
            check_permission();
            raise_fd_limit();
            let watch = MountWatch::new(&provider)?;
            run_mount(watch, config).await
        }
        false => {
            let watch = ManagedWatch::new(&provider, Arc::new(NoPendingChanges))?;
            run_managed(watch, config).await
        }
    }
}

async fn run_mount(watch: MountWatch, config: WatchConfig) -> Result<(), anyhow::Error> {
    let mut ticker = tokio::time::interval(Duration::from_secs(config.interval_secs));
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let events = watch.poll(&config);
                if !events.is_empty() {
                    print_change_events(&events);
                }
            }
        }
    }
    info!("Exiting...");
    Ok(())
}

async fn run_managed(watch: ManagedWatch, config: WatchConfig) -> Result<(), anyhow::Error> {
    let mut ticker = tokio::time::interval(Duration::from_secs(config.interval_secs));
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let events = watch.poll(&config);
                if !events.is_empty() {
                    print_managed_events(&events);
                }
            }
        }
    }
    info!("Exiting...");
    Ok(())
}

fn print_change_events(events: &[ChangeEvent]) {
    let mut table = Table::new();
    table.set_titles(row!["path", "pid", "user", "program", "state"]);
    for event in events {
        let program = event
            .cmdline
            .as_ref()
            .and_then(|cmdline| cmdline.first().cloned())
            .unwrap_or_else(|| "-".to_string());
        let user = event.user.clone().unwrap_or_else(|| "-".to_string());
        table.add_row(Row::new(vec![
            Cell::new(&event.path.display().to_string())
                .with_style(Attr::ForegroundColor(color::BRIGHT_WHITE)),
            Cell::new(&event.pid.to_string()).with_style(Attr::ForegroundColor(color::BLUE)),
            Cell::new(&user).with_style(Attr::ForegroundColor(color::BRIGHT_YELLOW)),
            Cell::new(&program).with_style(Attr::ForegroundColor(color::BRIGHT_WHITE)),
            match event.deleted {
                true => Cell::new("deleted").with_style(Attr::ForegroundColor(color::RED)),
                false => Cell::new("modified").with_style(Attr::ForegroundColor(color::GREEN)),
            },
        ]));
    }
    table.printstd();
}

fn print_managed_events(events: &[ManagedChangeEvent]) {
    let mut table = Table::new();
    table.set_titles(row!["id", "path", "env", "rules", "pending diff"]);
    for event in events {
        let diff = match event.diff.is_empty() {
            true => "-".to_string(),
            false => event.diff.clone(),
        };
        table.add_row(Row::new(vec![
            Cell::new(&event.id).with_style(Attr::ForegroundColor(color::BRIGHT_YELLOW)),
            Cell::new(&event.path.display().to_string())
                .with_style(Attr::ForegroundColor(color::BRIGHT_WHITE)),
            Cell::new(&event.environment).with_style(Attr::ForegroundColor(color::BLUE)),
            Cell::new(&event.rule_set).with_style(Attr::ForegroundColor(color::BLUE)),
            Cell::new(&diff).with_style(Attr::ForegroundColor(color::GREEN)),
        ]));
    }
    table.printstd();
}
