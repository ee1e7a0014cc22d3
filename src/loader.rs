//! Where template source comes from. Loaders differ only in I/O; the
//! engine always goes through this trait.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::UNIX_EPOCH;

use crate::errors::{Error, Result};

/// What a loader hands back for a template name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadedSource {
    pub source: String,
    /// Path or other origin description, for error messages
    pub filename: Option<String>,
    /// Modification time or etag; drives `auto_reload` freshness checks
    pub version: Option<String>,
}

/// The loader protocol.
pub trait Loader: Sync + Send {
    /// Fetches the source of a template, erroring with
    /// `TemplateNotFound` when the name is unknown.
    fn get_source(&self, name: &str) -> Result<LoadedSource>;

    /// Lists the templates this loader knows about, if enumerable.
    fn list_templates(&self) -> Option<Vec<String>> {
        None
    }
}

/// Loads templates from files under a root directory. The template name
/// is the path relative to the root, always with forward slashes.
#[derive(Debug)]
pub struct FileSystemLoader {
    root: PathBuf,
}

impl FileSystemLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileSystemLoader { root: root.into() }
    }

    fn resolve(&self, name: &str) -> Result<PathBuf> {
        // refuse traversal out of the root
        let relative = Path::new(name);
        if relative.is_absolute()
            || relative.components().any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(Error::template_not_found(name));
        }
        Ok(self.root.join(relative))
    }
}

impl Loader for FileSystemLoader {
    fn get_source(&self, name: &str) -> Result<LoadedSource> {
        let path = self.resolve(name)?;
        let source = match fs::read_to_string(&path) {
            Ok(source) => source,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::template_not_found(name));
            }
            Err(error) => {
                return Err(Error::chain(format!("Couldn't read template '{:?}'", path), error));
            }
        };

        let version = fs::metadata(&path)
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|mtime| mtime.duration_since(UNIX_EPOCH).ok())
            .map(|d| format!("{}.{}", d.as_secs(), d.subsec_nanos()));

        Ok(LoadedSource {
            source,
            filename: Some(path.to_string_lossy().into_owned()),
            version,
        })
    }

    fn list_templates(&self) -> Option<Vec<String>> {
        fn visit(dir: &Path, root: &Path, out: &mut Vec<String>) {
            let Ok(entries) = fs::read_dir(dir) else { return };
            for entry in entries.filter_map(|e| e.ok()) {
                let path = entry.path();
                if path.is_dir() {
                    visit(&path, root, out);
                } else if let Ok(relative) = path.strip_prefix(root) {
                    out.push(relative.to_string_lossy().replace('\\', "/"));
                }
            }
        }

        let mut names = Vec::new();
        visit(&self.root, &self.root, &mut names);
        names.sort();
        Some(names)
    }
}

/// An in-memory loader, used for tests, one-off strings and programs that
/// assemble their templates at run time.
#[derive(Debug, Default)]
pub struct MapLoader {
    templates: RwLock<HashMap<String, String>>,
}

impl MapLoader {
    pub fn new() -> Self {
        MapLoader::default()
    }

    pub fn from_templates(templates: Vec<(&str, &str)>) -> Self {
        let loader = MapLoader::new();
        for (name, source) in templates {
            loader.insert(name, source);
        }
        loader
    }

    pub fn insert(&self, name: impl Into<String>, source: impl Into<String>) {
        self.templates.write().expect("map loader lock").insert(name.into(), source.into());
    }

    pub fn remove(&self, name: &str) {
        self.templates.write().expect("map loader lock").remove(name);
    }
}

impl Loader for MapLoader {
    fn get_source(&self, name: &str) -> Result<LoadedSource> {
        let templates = self.templates.read().expect("map loader lock");
        match templates.get(name) {
            Some(source) => Ok(LoadedSource {
                source: source.clone(),
                filename: None,
                version: None,
            }),
            None => Err(Error::template_not_found(name)),
        }
    }

    fn list_templates(&self) -> Option<Vec<String>> {
        let templates = self.templates.read().expect("map loader lock");
        let mut names: Vec<String> = templates.keys().cloned().collect();
        names.sort();
        Some(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_map_loader() {
        let loader = MapLoader::from_templates(vec![("a.html", "hello")]);
        assert_eq!(loader.get_source("a.html").unwrap().source, "hello");
        assert!(matches!(
            loader.get_source("missing.html").unwrap_err().kind,
            crate::ErrorKind::TemplateNotFound(_)
        ));
        assert_eq!(loader.list_templates(), Some(vec!["a.html".to_string()]));
    }

    #[test]
    fn test_filesystem_loader() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("index.html")).unwrap();
        file.write_all(b"<p>hi</p>").unwrap();
        drop(file);

        let loader = FileSystemLoader::new(dir.path());
        let loaded = loader.get_source("index.html").unwrap();
        assert_eq!(loaded.source, "<p>hi</p>");
        assert!(loaded.filename.is_some());
        assert!(loaded.version.is_some());

        assert!(matches!(
            loader.get_source("missing.html").unwrap_err().kind,
            crate::ErrorKind::TemplateNotFound(_)
        ));
        // traversal is refused rather than resolved
        assert!(loader.get_source("../secrets.txt").is_err());
    }
}
