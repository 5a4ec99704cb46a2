//! Print or validate a broker configuration (`cbroker config`).

use super::load_config;
use compile_broker::config::default_compiler_counts;
use std::path::Path;

pub fn execute(path: Option<&Path>, check: bool) -> anyhow::Result<()> {
    let config = load_config(path)?;
    config.validate()?;

    if check {
        let enabled = config.tiers.iter().filter(|t| t.enabled).count();
        println!(
            "{}: ok ({} tiers, {} enabled)",
            path.map_or_else(|| "defaults".to_string(), |p| p.display().to_string()),
            config.tiers.len(),
            enabled
        );
        return Ok(());
    }

    let cpus = num_cpus::get();
    let (c1, c2) = default_compiler_counts(cpus);
    println!("# {} CPUs: default worker counts c1={} c2={}", cpus, c1, c2);
    print!("{}", config.to_toml_string()?);
    Ok(())
}
