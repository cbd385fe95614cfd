use std::process::ExitCode;

use color_eyre::Result;

use crate::TopLevelFlags;

pub async fn exec(top: &TopLevelFlags) -> Result<ExitCode> {
    let config = top.load_config()?;
    config.init_layout()?;
    println!("initialized {}", config.cache_dir.display());
    Ok(ExitCode::SUCCESS)
}
