//! Directory <-> `ModuleConfig` tree.
//!
//! One subdirectory per module (`NN-<slug>`), each holding `module.json`
//! and one script file per page that carries any non-default event. Events
//! equal to the factory default are elided on write and re-expanded on
//! read.

use std::fs;
use std::path::{Path, PathBuf};

use crate::device::types::{self, EventType, ModuleInfo};

use super::manifest::{ModuleManifest, MANIFEST_FILE};
use super::model::{actions_eq, EventConfig, ModuleConfig, PageConfig};
use super::script_file::{self, ParsedEventBlock};
use super::{ConfigError, Result};

pub struct ConfigRepo {
    base: PathBuf,
}

impl ConfigRepo {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// True when the base directory holds no module directories yet.
    pub fn is_empty(&self) -> Result<bool> {
        if !self.base.exists() {
            return Ok(true);
        }
        Ok(self.module_dirs()?.is_empty())
    }

    /// Write every module, assigning 1-based directory indexes in order.
    pub fn write_modules(&self, configs: &[ModuleConfig]) -> Result<()> {
        for (i, config) in configs.iter().enumerate() {
            self.write_module(i + 1, config)?;
        }
        Ok(())
    }

    /// Write one module directory: collapsed page files plus the manifest.
    pub fn write_module(&self, index: usize, config: &ModuleConfig) -> Result<()> {
        let module = &config.module;
        let dir = self.safe_module_dir(index, &module.type_name)?;
        fs::create_dir_all(&dir)?;

        // the directory is rewritten wholesale; stale page files would
        // shadow collapsed pages on the next read
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if page_number_of(&path).is_some() {
                fs::remove_file(&path)?;
            }
        }

        let mut pages = Vec::new();
        for page in &config.pages {
            let overridden: Vec<&EventConfig> = page
                .events
                .iter()
                .filter(|event| !is_default_binding(module, event))
                .collect();
            if overridden.is_empty() {
                continue;
            }
            let rendered = script_file::render_page(module, page.number, &overridden);
            fs::write(dir.join(format!("page-{}.lua", page.number)), rendered)?;
            pages.push(page.number);
        }

        if pages.is_empty() {
            fs::write(dir.join("page-0.lua"), script_file::render_sentinel(module))?;
            pages.push(0);
        }

        let mut manifest = ModuleManifest::new(index, module, pages);
        let manifest_path = dir.join(MANIFEST_FILE);
        if let Ok(existing) = fs::read_to_string(&manifest_path) {
            if let Ok(existing) = serde_json::from_str::<ModuleManifest>(&existing) {
                manifest.created = existing.created;
            }
        }

        let tmp = dir.join(format!("{}.tmp", MANIFEST_FILE));
        fs::write(&tmp, serde_json::to_string_pretty(&manifest)? + "\n")?;
        fs::rename(&tmp, &manifest_path)?;

        log::info!(
            "Wrote {} page file(s) for {} at {}",
            manifest.pages.len(),
            module.type_name,
            dir.display()
        );
        Ok(())
    }

    /// Read every module directory back into configs, expanding defaults.
    pub fn read_modules(&self) -> Result<Vec<ModuleConfig>> {
        let mut configs = Vec::new();
        for dir in self.module_dirs()? {
            configs.push(self.read_module_dir(&dir)?);
        }
        Ok(configs)
    }

    fn module_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&self.base)? {
            let path = entry?.path();
            if path.is_dir() && path.join(MANIFEST_FILE).is_file() {
                dirs.push(path);
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    fn read_module_dir(&self, dir: &Path) -> Result<ModuleConfig> {
        let manifest_path = dir.join(MANIFEST_FILE);
        let manifest: ModuleManifest =
            serde_json::from_str(&fs::read_to_string(&manifest_path)?)?;
        let module = manifest.to_module_info();

        let mut pages = Vec::new();
        for &page_number in &manifest.pages {
            let file_name = format!("page-{}.lua", page_number);
            let path = dir.join(&file_name);
            if !path.is_file() {
                return Err(ConfigError::MissingPage {
                    dir: dir.display().to_string(),
                    page: page_number,
                });
            }
            let label = format!("{}/{}", dir.display(), file_name);
            let parsed = script_file::parse_page_file(&label, &fs::read_to_string(&path)?)?;

            check_front_matter(&label, &parsed, &module)?;
            let number = resolve_page_number(&label, parsed.page, page_number);

            let events = expand_events(&label, &module, parsed.events)?;
            pages.push(PageConfig { number, events });
        }

        Ok(ModuleConfig { module, pages })
    }

    fn safe_module_dir(&self, index: usize, type_name: &str) -> Result<PathBuf> {
        if type_name.contains('/') || type_name.contains('\\') || type_name.contains("..") {
            return Err(ConfigError::UnsafePath(type_name.to_string()));
        }
        let name = format!("{:02}-{}", index, slugify(type_name));
        safe_join(&self.base, &name)
    }
}

/// Lowercase the type name and collapse non-alphanumerics to `-`.
pub fn slugify(type_name: &str) -> String {
    let mut slug = String::with_capacity(type_name.len());
    let mut dash_pending = false;
    for c in type_name.chars() {
        if c.is_ascii_alphanumeric() {
            if dash_pending && !slug.is_empty() {
                slug.push('-');
            }
            dash_pending = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            dash_pending = true;
        }
    }
    if slug.is_empty() {
        slug.push_str("module");
    }
    slug
}

/// Resolve a single path component against the base, refusing separators
/// and parent references.
fn safe_join(base: &Path, name: &str) -> Result<PathBuf> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
    {
        return Err(ConfigError::UnsafePath(name.to_string()));
    }
    Ok(base.join(name))
}

fn page_number_of(path: &Path) -> Option<u8> {
    path.file_name()?
        .to_str()?
        .strip_prefix("page-")?
        .strip_suffix(".lua")?
        .parse()
        .ok()
}

fn is_default_binding(module: &ModuleInfo, event: &EventConfig) -> bool {
    let default = module
        .element_type(event.element)
        .and_then(|t| types::default_actions(t, event.event));
    match default {
        // events without a defined default expand back to an empty list
        Some(default) => actions_eq(&event.actions, &default),
        None => event.actions.is_empty(),
    }
}

fn check_front_matter(
    label: &str,
    parsed: &script_file::ParsedPage,
    module: &ModuleInfo,
) -> Result<()> {
    if let Some(name) = &parsed.module {
        if *name != module.type_name {
            return Err(ConfigError::ManifestMismatch {
                file: label.to_string(),
                detail: format!(
                    "front-matter module {:?} does not match manifest type {:?}",
                    name, module.type_name
                ),
            });
        }
    }
    if let Some(position) = parsed.position {
        if position != module.position() {
            return Err(ConfigError::ManifestMismatch {
                file: label.to_string(),
                detail: format!(
                    "front-matter position {:?} does not match manifest position {:?}",
                    position,
                    module.position()
                ),
            });
        }
    }
    Ok(())
}

/// The page number is taken from front-matter; the filename is a fallback
/// that only warns.
fn resolve_page_number(label: &str, front_matter: Option<u8>, file_name: u8) -> u8 {
    match front_matter {
        Some(page) => {
            if page != file_name {
                log::warn!(
                    "{}: front-matter page {} disagrees with filename page {}, using front-matter",
                    label,
                    page,
                    file_name
                );
            }
            page
        }
        None => {
            log::warn!(
                "{}: no page in front-matter, using filename page {}",
                label,
                file_name
            );
            file_name
        }
    }
}

/// Turn parsed blocks into the full event grid: every supported
/// (element, event) pair, overridden where the file says so, default (or
/// empty) everywhere else.
fn expand_events(
    label: &str,
    module: &ModuleInfo,
    blocks: Vec<ParsedEventBlock>,
) -> Result<Vec<EventConfig>> {
    let mut overrides = Vec::new();
    for block in blocks {
        let event = EventType::parse(&block.event).ok_or_else(|| ConfigError::UnknownEvent {
            file: label.to_string(),
            name: block.event.clone(),
        })?;
        let element_type =
            module
                .element_type(block.element)
                .ok_or_else(|| ConfigError::ManifestMismatch {
                    file: label.to_string(),
                    detail: format!("manifest has no element at index {}", block.element),
                })?;
        if let Some(declared) = &block.element_type {
            if declared != element_type.name() {
                log::warn!(
                    "{}: elementType {:?} disagrees with manifest {:?}, using manifest",
                    label,
                    declared,
                    element_type.name()
                );
            }
        }
        if !element_type.supported_events().contains(&event) {
            return Err(ConfigError::UnsupportedEvent {
                file: label.to_string(),
                element: block.element,
                event: block.event,
            });
        }
        overrides.push((block.element, event, block.actions));
    }

    let mut events = Vec::new();
    for entry in &module.elements {
        for &event in entry.element_type.supported_events() {
            let actions = overrides
                .iter()
                .find(|(element, e, _)| *element == entry.index && *e == event)
                .map(|(_, _, actions)| actions.clone())
                .or_else(|| types::default_actions(entry.element_type, event))
                .unwrap_or_default();
            events.push(EventConfig {
                element: entry.index,
                event,
                actions,
            });
        }
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_runs_and_lowercases() {
        assert_eq!(slugify("BU16"), "bu16");
        assert_eq!(slugify("EN16_ND"), "en16-nd");
        assert_eq!(slugify("Unknown(42)"), "unknown-42");
        assert_eq!(slugify("___"), "module");
    }

    #[test]
    fn safe_join_refuses_traversal() {
        let base = Path::new("/tmp/repo");
        assert!(safe_join(base, "01-bu16").is_ok());
        assert!(safe_join(base, "..").is_err());
        assert!(safe_join(base, "a/b").is_err());
        assert!(safe_join(base, "a\\b").is_err());
        assert!(safe_join(base, "").is_err());
    }

    #[test]
    fn page_file_names_parse() {
        assert_eq!(page_number_of(Path::new("x/page-0.lua")), Some(0));
        assert_eq!(page_number_of(Path::new("x/page-12.lua")), Some(12));
        assert_eq!(page_number_of(Path::new("x/module.json")), None);
        assert_eq!(page_number_of(Path::new("x/page-.lua")), None);
    }
}
