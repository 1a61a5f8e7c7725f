use anyhow::Context;
use stagecraft_core::{
    config::{CommitterKind, Config},
    io, paths,
};
use std::path::Path;

pub fn run(root: &Path, chapters: Option<u32>, committer: Option<&str>) -> anyhow::Result<()> {
    println!("Initializing stagecraft in: {}", root.display());

    for dir in [paths::STAGECRAFT_DIR, paths::PROJECTS_DIR] {
        let p = root.join(dir);
        io::ensure_dir(&p).with_context(|| format!("failed to create {}", p.display()))?;
    }

    let config_path = paths::config_path(root);
    if config_path.exists() {
        println!("  exists:  {}", paths::CONFIG_FILE);
        return Ok(());
    }

    let mut cfg = Config::default();
    if let Some(n) = chapters {
        cfg.default_chapters = n;
    }
    if let Some(kind) = committer {
        cfg.committer = match kind {
            "snapshot" => CommitterKind::Snapshot,
            "git" => CommitterKind::Git,
            other => anyhow::bail!("unknown committer '{other}' (expected snapshot or git)"),
        };
    }
    cfg.save(root).context("failed to write config.yaml")?;
    println!("  created: {}", paths::CONFIG_FILE);
    Ok(())
}
