use anyhow::bail;
use batchgrid_core::BatchConfig;

use super::Overrides;

pub fn init(overrides: &Overrides, force: bool) -> anyhow::Result<()> {
    if overrides.config.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", overrides.config.display());
    }
    let mut config = BatchConfig::default();
    config.apply_overrides(overrides.base_dir.as_deref(), overrides.engine.as_deref())?;
    let config = BatchConfig::scaffold(config.engine.kind, &config.engine.base_dir);

    std::fs::write(&overrides.config, config.to_toml_string()?)?;
    println!("✓ Generated {}", overrides.config.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchgrid_core::EngineKind;

    #[test]
    fn writes_a_loadable_scaffold() {
        let dir = tempfile::tempdir().unwrap();
        let overrides = Overrides {
            config: dir.path().join("batchgrid.toml"),
            engine: Some("sge".into()),
            base_dir: Some("/scratch/me".into()),
        };
        init(&overrides, false).unwrap();

        let config = BatchConfig::from_file(&overrides.config).unwrap();
        assert_eq!(config.engine.kind, EngineKind::Sge);
        assert_eq!(config.engine.base_dir, std::path::Path::new("/scratch/me"));

        assert!(init(&overrides, false).is_err());
        init(&overrides, true).unwrap();
    }
}
