use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use gridctl::config::{model, parse_page_list, ConfigError, ConfigRepo, PageFilter};
use gridctl::device::{Device, DeviceError, ModuleInfo};
use gridctl::serial::{self, DeviceInfo, Link, SerialError, SerialTransport};

const DISCOVERY_BUDGET: Duration = Duration::from_secs(3);

#[derive(Parser)]
#[command(name = "gridctl")]
#[command(version, about = "Manage configuration on Grid modular controllers")]
pub struct Cli {
    /// Increase output verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// List connected Grid devices
    Devices,

    /// Erase device non-volatile memory
    Clear {
        /// Serial port path; defaults to the first Grid device found
        #[arg(short = 'd', long = "device")]
        device: Option<String>,

        /// Show what would happen without touching the device
        #[arg(long)]
        dry_run: bool,
    },

    /// Pull the device-resident configuration into a directory tree
    Pull {
        /// Target directory
        dir: PathBuf,

        /// Serial port path; defaults to the first Grid device found
        #[arg(short = 'd', long = "device")]
        device: Option<String>,

        /// Overwrite an existing non-empty directory
        #[arg(short = 'f', long)]
        force: bool,

        /// Only these pages (e.g. "0,2-3")
        #[arg(long)]
        pages: Option<String>,

        /// All pages except these
        #[arg(long)]
        skip_pages: Option<String>,
    },

    /// Push a directory tree back to the device
    Push {
        /// Source directory
        dir: PathBuf,

        /// Serial port path; defaults to the first Grid device found
        #[arg(short = 'd', long = "device")]
        device: Option<String>,

        /// Validate and report without touching the device
        #[arg(long)]
        dry_run: bool,

        /// Erase device non-volatile memory before pushing
        #[arg(long)]
        clear: bool,

        /// Skip the store-to-flash after pushing
        #[arg(long)]
        no_store: bool,

        /// Only these pages (e.g. "0,2-3")
        #[arg(long)]
        pages: Option<String>,

        /// All pages except these
        #[arg(long)]
        skip_pages: Option<String>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Serial(#[from] SerialError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("No Grid device found")]
    NoDevice,

    #[error("No device at {0}")]
    NoSuchDevice(String),

    #[error("No modules discovered; is the chain powered?")]
    NoModules,

    #[error("{} is not empty; pass -f to overwrite", .0.display())]
    DirNotEmpty(PathBuf),

    #[error("No local module matches a connected module")]
    NothingToPush,
}

pub async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Command::Devices => devices(),
        Command::Clear { device, dry_run } => clear(device, dry_run).await,
        Command::Pull {
            dir,
            device,
            force,
            pages,
            skip_pages,
        } => pull(dir, device, force, page_filter(pages, skip_pages)?).await,
        Command::Push {
            dir,
            device,
            dry_run,
            clear,
            no_store,
            pages,
            skip_pages,
        } => {
            push(
                dir,
                device,
                dry_run,
                clear,
                no_store,
                page_filter(pages, skip_pages)?,
            )
            .await
        }
    }
}

fn page_filter(pages: Option<String>, skip_pages: Option<String>) -> Result<PageFilter, CliError> {
    let include: Option<BTreeSet<u8>> = pages.as_deref().map(parse_page_list).transpose()?;
    let exclude: Option<BTreeSet<u8>> = skip_pages.as_deref().map(parse_page_list).transpose()?;
    Ok(PageFilter::new(include, exclude)?)
}

fn devices() -> Result<(), CliError> {
    let devices = serial::enumerate_devices()?;
    if devices.is_empty() {
        println!("No Grid devices found");
        return Ok(());
    }
    for device in devices {
        println!(
            "{}  {:04x}:{:04x}  {}  {}",
            device.path,
            device.vid,
            device.pid,
            device.product.as_deref().unwrap_or("-"),
            device.serial_number.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

fn select_device(path: Option<&str>) -> Result<DeviceInfo, CliError> {
    let mut devices = serial::enumerate_devices()?;
    match path {
        Some(path) => devices
            .into_iter()
            .find(|d| d.path == path)
            .ok_or_else(|| CliError::NoSuchDevice(path.to_string())),
        None => {
            if devices.is_empty() {
                Err(CliError::NoDevice)
            } else {
                Ok(devices.remove(0))
            }
        }
    }
}

async fn connect(path: Option<&str>) -> Result<Device, CliError> {
    let info = select_device(path)?;
    log::info!("Connecting to {}", info.path);
    let transport = SerialTransport::open(&info.path)?;
    let link = Link::open(Box::new(transport));
    Ok(Device::new(link))
}

async fn clear(device: Option<String>, dry_run: bool) -> Result<(), CliError> {
    if dry_run {
        let info = select_device(device.as_deref())?;
        println!("Would erase non-volatile memory on {}", info.path);
        return Ok(());
    }

    let device = connect(device.as_deref()).await?;
    let result = device.erase_nvm().await;
    device.close().await;
    result?;
    println!("Non-volatile memory erased");
    Ok(())
}

async fn pull(
    dir: PathBuf,
    device_path: Option<String>,
    force: bool,
    pages: PageFilter,
) -> Result<(), CliError> {
    let repo = ConfigRepo::new(&dir);
    if !force && !repo.is_empty()? {
        return Err(CliError::DirNotEmpty(dir));
    }

    let device = connect(device_path.as_deref()).await?;
    let result = pull_inner(&device, &repo, &pages).await;
    device.close().await;
    result
}

async fn pull_inner(
    device: &Device,
    repo: &ConfigRepo,
    pages: &PageFilter,
) -> Result<(), CliError> {
    let modules = device.wait_for_modules(DISCOVERY_BUDGET).await;
    if modules.is_empty() {
        return Err(CliError::NoModules);
    }

    let mut configs = Vec::new();
    for module in &modules {
        log::info!(
            "Fetching {} at ({},{})",
            module.type_name,
            module.dx,
            module.dy
        );
        let name = module.type_name.clone();
        let config = device
            .fetch_module_config(module, pages, move |done, total| {
                log::debug!("{}: {}/{} events", name, done, total);
            })
            .await?;
        configs.push(config);
    }

    repo.write_modules(&configs)?;
    println!(
        "Pulled {} module(s) into {}",
        configs.len(),
        repo.base().display()
    );
    Ok(())
}

async fn push(
    dir: PathBuf,
    device_path: Option<String>,
    dry_run: bool,
    clear: bool,
    no_store: bool,
    pages: PageFilter,
) -> Result<(), CliError> {
    let repo = ConfigRepo::new(&dir);
    let mut configs = repo.read_modules()?;
    let keep = pages.pages();
    for config in &mut configs {
        config.retain_pages(&keep);
    }

    // all validation diagnostics surface before any device operation
    let mut diagnostics = Vec::new();
    for config in &configs {
        if let Err(ConfigError::Validation(mut more)) = model::validate(config) {
            diagnostics.append(&mut more);
        }
    }
    if !diagnostics.is_empty() {
        return Err(ConfigError::Validation(diagnostics).into());
    }

    if dry_run {
        for config in &configs {
            println!(
                "Would push {} at ({},{}): pages {:?}",
                config.module.type_name,
                config.module.dx,
                config.module.dy,
                config.pages.iter().map(|p| p.number).collect::<Vec<_>>()
            );
        }
        return Ok(());
    }

    let device = connect(device_path.as_deref()).await?;
    let result = push_inner(&device, &configs, clear, no_store).await;
    device.close().await;
    result
}

async fn push_inner(
    device: &Device,
    configs: &[model::ModuleConfig],
    clear: bool,
    no_store: bool,
) -> Result<(), CliError> {
    let modules = device.wait_for_modules(DISCOVERY_BUDGET).await;
    if modules.is_empty() {
        return Err(CliError::NoModules);
    }

    if clear {
        log::info!("Erasing non-volatile memory before push");
        device.erase_nvm().await?;
    }

    let mut pushed = 0usize;
    for config in configs {
        match find_target(&modules, &config.module) {
            Some(target) => {
                log::info!(
                    "Pushing {} onto {} at ({},{})",
                    config.module.type_name,
                    target.type_name,
                    target.dx,
                    target.dy
                );
                device.send_module_config(config, Some(target)).await?;
                pushed += 1;
            }
            None => {
                log::warn!(
                    "No connected module matches {} at ({},{}); skipped",
                    config.module.type_name,
                    config.module.dx,
                    config.module.dy
                );
            }
        }
    }
    if pushed == 0 {
        return Err(CliError::NothingToPush);
    }

    if no_store {
        log::info!("Skipping store-to-flash");
    } else {
        device.store_to_flash().await?;
    }

    println!("Pushed {} module(s)", pushed);
    Ok(())
}

/// Match a local config to a connected module: same position first, then
/// the first same-type module (a config recorded on a different chain).
fn find_target<'a>(modules: &'a [ModuleInfo], local: &ModuleInfo) -> Option<&'a ModuleInfo> {
    modules
        .iter()
        .find(|m| m.position() == local.position())
        .or_else(|| modules.iter().find(|m| m.type_name == local.type_name))
}
