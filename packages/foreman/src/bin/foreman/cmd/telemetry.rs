use std::process::ExitCode;

use color_eyre::{Result, eyre::Context as _};

use foreman::context::CounterSnapshot;

use crate::TopLevelFlags;

pub async fn exec(top: &TopLevelFlags) -> Result<ExitCode> {
    let config = top.load_config()?;
    match CounterSnapshot::load(&config.telemetry_path())? {
        Some(snapshot) => {
            let rendered =
                serde_json::to_string_pretty(&snapshot).context("render telemetry")?;
            println!("{rendered}");
        }
        None => println!("no telemetry recorded yet; run a build first"),
    }
    Ok(ExitCode::SUCCESS)
}
