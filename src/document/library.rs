//! Macro lookup by file path or by name

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use thiserror::Error;

use crate::document::parse::{parse_macro, SchemaError};
use crate::document::schema::MacroDefinition;

const EXTENSIONS: &[&str] = &["yaml", "yml"];

/// Errors that can occur while locating or loading a macro
#[derive(Debug, Error)]
pub enum LibraryError {
    /// No macro with this name or path
    #[error("macro not found: {name}")]
    NotFound { name: String },

    /// A macro registered twice under the same name
    #[error("duplicate macro definition: {name}")]
    Duplicate { name: String },

    /// Error reading a macro file or directory
    #[error("error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The document was found but is malformed
    #[error("{}: {source}", .path.display())]
    Schema {
        path: PathBuf,
        #[source]
        source: SchemaError,
    },
}

/// One entry of [`MacroLibrary::list`]
#[derive(Debug, Clone, PartialEq)]
pub struct MacroSummary {
    pub name: String,
    pub description: String,
    pub path: Option<PathBuf>,
}

/// Registered macros plus an optional directory of macro documents
#[derive(Debug, Default)]
pub struct MacroLibrary {
    dir: Option<PathBuf>,
    registered: IndexMap<String, Arc<MacroDefinition>>,
}

impl MacroLibrary {
    /// Create an empty library with no directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a library backed by a macros directory
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            registered: IndexMap::new(),
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Register an in-memory macro; registered macros win over the directory
    pub fn register(&mut self, definition: MacroDefinition) -> Result<(), LibraryError> {
        if self.registered.contains_key(&definition.name) {
            return Err(LibraryError::Duplicate {
                name: definition.name,
            });
        }
        self.registered
            .insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    /// Register a macro from YAML text
    pub fn register_source(&mut self, source: &str) -> Result<(), LibraryError> {
        let definition = parse_macro(source).map_err(|source| LibraryError::Schema {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        self.register(definition)
    }

    /// Parse a macro document from disk
    pub fn load_file(path: &Path) -> Result<Arc<MacroDefinition>, LibraryError> {
        let source = fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => LibraryError::NotFound {
                name: path.display().to_string(),
            },
            _ => LibraryError::Io {
                path: path.to_path_buf(),
                source: e,
            },
        })?;
        let mut definition = parse_macro(&source).map_err(|source| LibraryError::Schema {
            path: path.to_path_buf(),
            source,
        })?;
        definition.source_path = Some(path.to_path_buf());
        Ok(Arc::new(definition))
    }

    /// Resolve a macro given either a file path or a name
    pub fn resolve(&self, target: &str) -> Result<Arc<MacroDefinition>, LibraryError> {
        if looks_like_path(target) {
            return Self::load_file(Path::new(target));
        }
        self.find(target)
    }

    /// Find a macro by name
    ///
    /// Looks at registered macros, then `<dir>/<name>.yaml` and
    /// `<dir>/<name>.yml`, then every document in the directory whose `name`
    /// matches.
    pub fn find(&self, name: &str) -> Result<Arc<MacroDefinition>, LibraryError> {
        if let Some(definition) = self.registered.get(name) {
            return Ok(Arc::clone(definition));
        }
        let not_found = || LibraryError::NotFound {
            name: name.to_string(),
        };
        let dir = self.dir.as_deref().ok_or_else(not_found)?;

        for ext in EXTENSIONS {
            let candidate = dir.join(format!("{}.{}", name, ext));
            if candidate.is_file() {
                return Self::load_file(&candidate);
            }
        }

        for path in self.documents()? {
            match Self::load_file(&path) {
                Ok(definition) if definition.name == name => return Ok(definition),
                Ok(_) => {}
                Err(e) => tracing::debug!(path = %path.display(), error = %e, "skipping macro file"),
            }
        }
        Err(not_found())
    }

    /// Summaries of every registered and on-disk macro, sorted by name
    ///
    /// Malformed documents are skipped with a warning.
    pub fn list(&self) -> Result<Vec<MacroSummary>, LibraryError> {
        let mut summaries: Vec<MacroSummary> = self
            .registered
            .values()
            .map(|definition| MacroSummary {
                name: definition.name.clone(),
                description: definition.description.clone(),
                path: None,
            })
            .collect();

        if self.dir.is_some() {
            for path in self.documents()? {
                match Self::load_file(&path) {
                    Ok(definition) => {
                        if summaries.iter().any(|s| s.name == definition.name) {
                            continue;
                        }
                        summaries.push(MacroSummary {
                            name: definition.name.clone(),
                            description: definition.description.clone(),
                            path: Some(path),
                        });
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping malformed macro")
                    }
                }
            }
        }

        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(summaries)
    }

    /// YAML documents in the macros directory, sorted by path
    fn documents(&self) -> Result<Vec<PathBuf>, LibraryError> {
        let Some(dir) = self.dir.as_deref() else {
            return Ok(Vec::new());
        };
        let io_err = |source| LibraryError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(e)),
        };

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry.map_err(io_err)?.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| EXTENSIONS.contains(&e));
            if is_yaml && path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

/// Targets with a separator or a YAML extension are paths, anything else a name
fn looks_like_path(target: &str) -> bool {
    target.contains('/')
        || target.contains(std::path::MAIN_SEPARATOR)
        || Path::new(target)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| EXTENSIONS.contains(&e))
}
