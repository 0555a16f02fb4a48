use clap::Subcommand;
use color_eyre::Result;

pub mod metadata;

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Print the filesystem metadata polybuild's fingerprinter reads for one
    /// file: mtime, size, executable bit.
    Metadata(metadata::Options),
}

pub async fn exec(command: Command) -> Result<u8> {
    match command {
        Command::Metadata(options) => metadata::exec(options).await,
    }
}
