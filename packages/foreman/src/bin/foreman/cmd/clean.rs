use std::process::ExitCode;

use color_eyre::{Result, eyre::Context as _};

use crate::TopLevelFlags;

pub async fn exec(top: &TopLevelFlags) -> Result<ExitCode> {
    let config = top.load_config()?;
    match tokio::fs::remove_dir_all(&config.cache_dir).await {
        Ok(()) => println!("removed {}", config.cache_dir.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            println!("nothing to clean");
        }
        Err(err) => {
            return Err(err).context(format!("remove {:?}", config.cache_dir));
        }
    }
    Ok(ExitCode::SUCCESS)
}
