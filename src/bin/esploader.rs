use std::{fs, path::PathBuf};

use clap::{Args, Parser, Subcommand};
use esploader::{
    cli::{config::Config, parse_offset, serial_port, BarObserver, ConnectArgs},
    connection::{probe, Connection},
    flasher::{read_flash, FlashOpts, FlashParams, Flasher},
    logging::initialize_logger,
};
use log::LevelFilter;
use miette::{IntoDiagnostic, Result, WrapErr};

/// Main CLI parser
#[derive(Debug, Parser)]
#[command(about, max_term_width = 100, version)]
struct Cli {
    #[command(subcommand)]
    subcommand: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Flash a directory of firmware images to a connected device
    ///
    /// Image files are named after their flash offset, e.g. 0x00000.bin;
    /// every file in the directory matching that pattern is written. The
    /// flash chip parameters of the firmware already on the device are
    /// preserved unless told otherwise.
    Flash(FlashArgs),
    /// Print the MAC address of a connected device
    BoardInfo(ConnectArgs),
    /// Read a region of SPI flash into a file
    ReadFlash(ReadFlashArgs),
}

#[derive(Debug, Args)]
struct FlashArgs {
    #[clap(flatten)]
    connect: ConnectArgs,
    /// Directory holding the 0x*.bin image files
    #[arg(value_name = "DIR")]
    dir: PathBuf,
    /// Flash parameter word to write into the boot image: a raw integer
    /// or a mode,size,freq triple such as dio,32m,40m
    #[arg(long, value_name = "PARAMS")]
    flash_params: Option<FlashParams>,
    /// Do not carry over the flash parameters of the firmware already on
    /// the device
    #[arg(long)]
    no_preserve_flash_params: bool,
    /// Trust the ROM's erase accounting instead of compensating for its
    /// double-erase defect
    #[arg(long)]
    no_erase_bug_workaround: bool,
    /// Provision a device identity registered with this host if the
    /// device has none yet
    #[arg(long, value_name = "HOST")]
    id_hostname: Option<String>,
}

#[derive(Debug, Args)]
struct ReadFlashArgs {
    #[clap(flatten)]
    connect: ConnectArgs,
    /// Flash offset to start reading at
    #[arg(value_name = "ADDR", value_parser = parse_offset)]
    addr: u32,
    /// Number of bytes to read
    #[arg(value_name = "SIZE", value_parser = parse_offset)]
    size: u32,
    /// File to write the data to
    #[arg(value_name = "FILE")]
    file: PathBuf,
}

fn main() -> Result<()> {
    miette::set_panic_hook();
    initialize_logger(LevelFilter::Info);

    let cli = Cli::parse();
    let config = Config::load();

    match cli.subcommand {
        Commands::Flash(args) => flash(args, &config),
        Commands::BoardInfo(args) => board_info(args, &config),
        Commands::ReadFlash(args) => read_flash_to_file(args, &config),
    }
}

fn flash(args: FlashArgs, config: &Config) -> Result<()> {
    let port = serial_port(&args.connect, config)?;
    let connection = Connection::open(&port)?;

    let opts = FlashOpts {
        preserve_flash_params: !args.no_preserve_flash_params,
        erase_bug_workaround: !args.no_erase_bug_workaround,
        override_flash_params: args.flash_params,
        id_hostname: args.id_hostname,
        ..FlashOpts::default()
    };

    let mut flasher = Flasher::new(connection, opts);
    flasher.load(&args.dir)?;

    let mut observer = BarObserver::new(flasher.total_blocks());
    let result = flasher.run(&mut observer);
    observer.finish();
    result?;

    println!("All done!");
    Ok(())
}

fn board_info(args: ConnectArgs, config: &Config) -> Result<()> {
    let port = serial_port(&args, config)?;
    let mac = probe(&port)?;
    println!("MAC address: {}", mac);
    Ok(())
}

fn read_flash_to_file(args: ReadFlashArgs, config: &Config) -> Result<()> {
    let port = serial_port(&args.connect, config)?;

    let mut connection = Connection::open(&port)?;
    connection.enter_bootloader()?;
    let data = read_flash(&mut connection, args.addr, args.size)?;

    fs::write(&args.file, &data)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to write {}", args.file.display()))?;

    println!(
        "Read {} bytes at {:#x} into {}",
        data.len(),
        args.addr,
        args.file.display()
    );
    Ok(())
}
