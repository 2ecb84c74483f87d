use std::path::PathBuf;

use anyhow::Result;

use crate::cli::actions::Action;
use crate::config::Config;

pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let path = matches
        .get_one::<PathBuf>("config")
        .ok_or_else(|| anyhow::anyhow!("a configuration file is required, use --config"))?;

    let config = Config::from_file(path)?;

    Ok(Action::Run {
        config: Box::new(config),
    })
}
