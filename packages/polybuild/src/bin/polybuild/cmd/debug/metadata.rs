use clap::Args;
use color_eyre::Result;
use polybuild::{fs, path::SomeFilePath};

#[derive(Clone, Args, Debug)]
pub struct Options {
    /// File to inspect; resolved relative to the current directory.
    path: SomeFilePath,
}

pub async fn exec(options: Options) -> Result<u8> {
    let path = options.path.try_as_abs_file_using_cwd()?;
    match fs::Metadata::from_file(&path).await? {
        Some(metadata) => {
            println!("{metadata:?}");
            Ok(0)
        }
        None => {
            eprintln!("no such file: {path:?}");
            Ok(1)
        }
    }
}
