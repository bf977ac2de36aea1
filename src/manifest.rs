//! Ready-made entry point for artifacts whose tag table comes from the manifest tool's JSON output.

use crate::script::{Script, ScriptRegistry};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptManifest {
    #[serde(default)]
    pub scripts: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ScriptManifest {
    pub fn from_json(contents: &str) -> Result<Self> {
        serde_json::from_str(contents).context("parsing script manifest")
    }

    /// Type names per tag, in declaration order.
    pub fn tag_table(&self) -> BTreeMap<String, Vec<String>> {
        let mut table: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for entry in &self.scripts {
            for tag in &entry.tags {
                table.entry(tag.clone()).or_default().push(entry.type_name.clone());
            }
        }
        table
    }
}

pub type ScriptFactory = fn() -> Box<dyn Script>;

enum ManifestSource {
    Embedded(&'static str),
    File(PathBuf),
}

impl ManifestSource {
    fn read(&self) -> Result<String> {
        match self {
            ManifestSource::Embedded(contents) => Ok((*contents).to_string()),
            ManifestSource::File(path) => fs::read_to_string(path)
                .with_context(|| format!("reading script manifest '{}'", path.display())),
        }
    }
}

/// [`ScriptRegistry`] backed by a manifest plus a factory per script type.
pub struct ManifestRegistry {
    source: ManifestSource,
    factories: HashMap<String, ScriptFactory>,
    by_tag: BTreeMap<String, Vec<String>>,
}

impl ManifestRegistry {
    pub fn embedded(contents: &'static str) -> Self {
        Self::with_source(ManifestSource::Embedded(contents))
    }

    /// Reads the manifest from disk on every `reload`.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self::with_source(ManifestSource::File(path.into()))
    }

    fn with_source(source: ManifestSource) -> Self {
        Self { source, factories: HashMap::new(), by_tag: BTreeMap::new() }
    }

    pub fn with_factory(mut self, type_name: impl Into<String>, factory: ScriptFactory) -> Self {
        self.factories.insert(type_name.into(), factory);
        self
    }

    /// Reads the manifest for the first time. Artifact constructors call this before handing the
    /// registry to the host.
    pub fn build(mut self) -> Result<Self> {
        self.rebuild()?;
        Ok(self)
    }

    fn rebuild(&mut self) -> Result<()> {
        let manifest = ScriptManifest::from_json(&self.source.read()?)?;
        let table = manifest.tag_table();
        let unknown: Vec<&str> = manifest
            .scripts
            .iter()
            .map(|entry| entry.type_name.as_str())
            .filter(|name| !self.factories.contains_key(*name))
            .collect();
        if !unknown.is_empty() {
            bail!("manifest lists script types without a factory: {}", unknown.join(", "));
        }
        self.by_tag = table;
        Ok(())
    }
}

impl ScriptRegistry for ManifestRegistry {
    fn instantiate_scripts(&mut self, tag: &str) -> Result<Vec<Box<dyn Script>>> {
        let Some(types) = self.by_tag.get(tag) else {
            return Ok(Vec::new());
        };
        types
            .iter()
            .map(|name| {
                let factory =
                    self.factories.get(name).with_context(|| format!("no factory for script type '{name}'"))?;
                Ok(factory())
            })
            .collect()
    }

    fn reload(&mut self) -> Result<()> {
        self.rebuild()
    }

    fn tags(&self) -> Vec<String> {
        self.by_tag.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::ScriptContext;
    use tempfile::tempdir;

    struct Player;
    struct Camera;

    impl Script for Player {
        fn name(&self) -> &str {
            "game.Player"
        }

        fn load(&mut self, _ctx: &mut ScriptContext<'_>) -> Result<()> {
            Ok(())
        }

        fn update(&mut self, _ctx: &mut ScriptContext<'_>, _dt: f64) -> Result<()> {
            Ok(())
        }
    }

    impl Script for Camera {
        fn name(&self) -> &str {
            "game.Camera"
        }

        fn load(&mut self, _ctx: &mut ScriptContext<'_>) -> Result<()> {
            Ok(())
        }

        fn update(&mut self, _ctx: &mut ScriptContext<'_>, _dt: f64) -> Result<()> {
            Ok(())
        }
    }

    fn player() -> Box<dyn Script> {
        Box::new(Player)
    }

    fn camera() -> Box<dyn Script> {
        Box::new(Camera)
    }

    const MANIFEST: &str = r#"{
  "scripts": [
    { "type": "game.Player", "tags": ["player"] },
    { "type": "game.Camera", "tags": ["player", "camera"] }
  ]
}"#;

    #[test]
    fn scripts_come_back_in_manifest_order() {
        let mut registry = ManifestRegistry::embedded(MANIFEST)
            .with_factory("game.Player", player)
            .with_factory("game.Camera", camera)
            .build()
            .expect("manifest builds");
        let names: Vec<String> = registry
            .instantiate_scripts("player")
            .expect("instantiate")
            .iter()
            .map(|script| script.name().to_string())
            .collect();
        assert_eq!(names, vec!["game.Player".to_string(), "game.Camera".to_string()]);
        assert!(registry.instantiate_scripts("Player").expect("instantiate").is_empty(), "tags are case sensitive");
        assert_eq!(registry.tags(), vec!["camera".to_string(), "player".to_string()]);
    }

    #[test]
    fn unknown_types_fail_the_build() {
        let result = ManifestRegistry::embedded(MANIFEST).with_factory("game.Player", player).build();
        let err = result.err().expect("camera has no factory");
        assert!(err.to_string().contains("game.Camera"), "unexpected error: {err}");
    }

    #[test]
    fn reload_recomputes_tags_from_disk() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("scripts.json");
        fs::write(&path, r#"{ "scripts": [ { "type": "game.Player", "tags": ["player"] } ] }"#)
            .expect("manifest written");
        let mut registry = ManifestRegistry::from_path(&path)
            .with_factory("game.Player", player)
            .with_factory("game.Camera", camera)
            .build()
            .expect("manifest builds");
        assert!(registry.instantiate_scripts("camera").expect("instantiate").is_empty());

        fs::write(&path, MANIFEST).expect("manifest rewritten");
        registry.reload().expect("reload");
        assert_eq!(registry.instantiate_scripts("camera").expect("instantiate").len(), 1);
    }

    #[test]
    fn failed_reload_keeps_previous_table() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("scripts.json");
        fs::write(&path, MANIFEST).expect("manifest written");
        let mut registry = ManifestRegistry::from_path(&path)
            .with_factory("game.Player", player)
            .with_factory("game.Camera", camera)
            .build()
            .expect("manifest builds");
        fs::write(&path, "{ broken").expect("manifest corrupted");
        registry.reload().expect_err("broken manifest rejected");
        assert_eq!(registry.instantiate_scripts("player").expect("instantiate").len(), 2);
    }
}
