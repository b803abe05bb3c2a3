mod flash;

use std::{
    io::{self, Read as _, Write as _},
    path::PathBuf,
    process::ExitCode,
};

use clap::{Parser, Subcommand};
use fs_port::{boot, Attributes, Error, FileMode, FsPort, Options};
use log::{error, info};
use nor_fs::{BlockDevice, Filesystem};

use flash::{FileFlash, RamImage};

const CHUNK_SIZE: usize = 512;

/// Host side access to a NOR flash filesystem image.
#[derive(Parser, Debug)]
#[command(about, author, disable_version_flag = true)]
struct Args {
    /// Print version information.
    #[arg(short, long)]
    version: bool,

    /// Flash image, created erased if missing (default: use RAM).
    #[arg(short, long)]
    image: Option<PathBuf>,

    /// Refuse every change to the filesystem.
    #[arg(short, long)]
    read_only: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Increment and print the boot counter.
    Boot,
    /// Print geometry and usage.
    Info,
    /// List a directory.
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Print a file to stdout.
    Cat { path: String },
    /// Store a local file (default: stdin).
    Put {
        path: String,
        source: Option<PathBuf>,
    },
    Mkdir { path: String },
    /// Delete a file.
    Rm { path: String },
    /// Delete an empty directory.
    Rmdir { path: String },
    Mv { from: String, to: String },
    /// Erase the filesystem.
    Format,
}

#[derive(Debug)]
enum Failure {
    Fs(Error),
    Io(io::Error),
}

impl From<Error> for Failure {
    fn from(error: Error) -> Self {
        Self::Fs(error)
    }
}

impl From<nor_fs::Error> for Failure {
    fn from(error: nor_fs::Error) -> Self {
        Self::Fs(error.into())
    }
}

impl From<io::Error> for Failure {
    fn from(error: io::Error) -> Self {
        Self::Io(error)
    }
}

fn main() -> ExitCode {
    pretty_env_logger::init();

    let args = Args::parse();
    if args.version {
        print_version();
        return ExitCode::SUCCESS;
    }
    let Some(command) = args.command else {
        error!("no command given, see --help");
        return ExitCode::FAILURE;
    };

    let result = match &args.image {
        Some(path) => FileFlash::open(path)
            .map_err(Failure::from)
            .and_then(|flash| exec(flash, &command, args.read_only)),
        None => exec(RamImage::new(), &command, args.read_only),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            error!("{:?} failed: {:?}", command, failure);
            ExitCode::FAILURE
        }
    }
}

fn print_version() {
    let crate_name = clap::crate_name!();
    let crate_version = clap::crate_version!();
    println!("{} {}", crate_name, crate_version);
}

fn exec<D: BlockDevice>(mut device: D, command: &Command, read_only: bool) -> Result<(), Failure> {
    if let Command::Format = command {
        if read_only {
            return Err(Error::ReadOnly.into());
        }
        info!("formatting");
        Filesystem::<D>::format(&mut device)?;
        return Ok(());
    }

    let port = FsPort::<D>::init_with(device, Options { read_only })?;
    let result = run(&port, command);
    port.unmount();
    result
}

fn run<D: BlockDevice>(port: &FsPort<D>, command: &Command) -> Result<(), Failure> {
    match command {
        Command::Boot => {
            println!("{}", boot::bump_boot_count(port)?);
        }
        Command::Info => {
            let info = port.info()?;
            println!("block size:        {}", info.block_size);
            println!("block count:       {}", info.block_count);
            println!("blocks used:       {}", info.blocks_used);
            println!("revision:          {}", info.revision);
            println!("superblock erases: {}", info.superblock_erases);
            if info.worn {
                println!("superblock pair is worn");
            }
        }
        Command::Ls { path } => {
            let dir = port.open_dir(path)?;
            let result = list(port, dir);
            port.close_dir(dir)?;
            result?;
        }
        Command::Cat { path } => {
            let file = port.open_file(path, FileMode::READ)?;
            let result = cat(port, file);
            port.close_file(file)?;
            result?;
        }
        Command::Put { path, source } => {
            let mut data = Vec::new();
            match source {
                Some(source) => data = std::fs::read(source)?,
                None => {
                    io::stdin().read_to_end(&mut data)?;
                }
            }
            let mode = FileMode::WRITE | FileMode::CREATE | FileMode::TRUNC;
            let file = port.open_file(path, mode)?;
            let result = data
                .chunks(CHUNK_SIZE)
                .try_for_each(|chunk| port.write(file, chunk));
            port.close_file(file)?;
            result?;
            info!("stored {} bytes in {}", data.len(), path);
        }
        Command::Mkdir { path } => port.create_dir(path)?,
        Command::Rm { path } => port.delete(path)?,
        Command::Rmdir { path } => port.remove_dir(path)?,
        Command::Mv { from, to } => port.rename(from, to)?,
        // needs the bare device, handled in exec
        Command::Format => return Err(Error::InvalidParameter.into()),
    }
    Ok(())
}

fn list<D: BlockDevice>(port: &FsPort<D>, dir: fs_port::DirHandle) -> Result<(), Failure> {
    loop {
        match port.read_dir(dir) {
            Ok(entry) => {
                let kind = if entry.attributes.contains(Attributes::DIRECTORY) {
                    'd'
                } else {
                    '-'
                };
                println!("{} {:>10} {}", kind, entry.size, entry.name);
            }
            Err(Error::EndOfStream) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
}

fn cat<D: BlockDevice>(port: &FsPort<D>, file: fs_port::FileHandle) -> Result<(), Failure> {
    let mut stdout = io::stdout().lock();
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        match port.read(file, &mut buf) {
            Ok(n) => stdout.write_all(&buf[..n])?,
            Err(Error::EndOfFile) => break,
            Err(e) => return Err(e.into()),
        }
    }
    stdout.flush()?;
    Ok(())
}
