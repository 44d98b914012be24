//! Document model registry.
//!
//! Maps a document type to its model module (reducer, schema validator,
//! initial state) and holds upgrade manifests. Several versions of the same
//! type may be registered; lookups without a version return the latest.

use reactor_types::Action;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

use crate::document::{
    ActionValidator, Document, Reducer, ReducerError, Reduction, UpgradeTransform,
};

/// Registry errors. All of them are configuration mistakes and fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// No module for the type (and version)
    #[error("document model module not found for type: {document_type}{}", version_suffix(.version))]
    ModuleNotFound {
        /// Requested type
        document_type: String,
        /// Requested version, if any
        version: Option<u32>,
    },

    /// Type and version already registered
    #[error("document model module already registered for type: {document_type} (version {version})")]
    DuplicateModule {
        /// Type being registered
        document_type: String,
        /// Version being registered
        version: u32,
    },

    /// Module is missing a required part
    #[error("invalid document model module: {0}")]
    InvalidModule(String),

    /// A manifest for the type already exists
    #[error("upgrade manifest already registered for type: {0}")]
    DuplicateManifest(String),

    /// No manifest for the type
    #[error("upgrade manifest not found for type: {0}")]
    ManifestNotFound(String),

    /// Target version is older than the source version
    #[error("downgrade not supported for {document_type}: cannot go from version {from} to {to}")]
    DowngradeNotSupported {
        /// Document type
        document_type: String,
        /// Current version
        from: u32,
        /// Requested version
        to: u32,
    },

    /// A step of the upgrade chain is missing
    #[error("missing upgrade transition for {document_type}: v{from} to v{to}")]
    MissingUpgradeTransition {
        /// Document type
        document_type: String,
        /// Step source version
        from: u32,
        /// Step target version
        to: u32,
    },

    /// Single-step lookup asked for more than one version increment
    #[error("invalid upgrade step for {document_type}: must be single version increment, got v{from} to v{to}")]
    InvalidUpgradeStep {
        /// Document type
        document_type: String,
        /// Step source version
        from: u32,
        /// Step target version
        to: u32,
    },

    /// An upgrade transform returned an error; the document is unchanged
    #[error("upgrade of {document_type} from v{from} to v{to} failed: {source}")]
    UpgradeFailed {
        /// Document type
        document_type: String,
        /// Step source version
        from: u32,
        /// Step target version
        to: u32,
        /// Transform error
        source: ReducerError,
    },
}

fn version_suffix(version: &Option<u32>) -> String {
    version.map(|v| format!(" version {}", v)).unwrap_or_default()
}

/// A document model: reducer, schema validator and initial state for one
/// type at one model version.
#[derive(Clone)]
pub struct DocumentModelModule {
    document_type: String,
    version: u32,
    reducer: Option<Arc<dyn Reducer>>,
    validator: Option<Arc<dyn ActionValidator>>,
    initial_state: BTreeMap<String, Value>,
}

impl DocumentModelModule {
    /// Start building a module. It needs a reducer and a validator before
    /// the registry will accept it.
    pub fn new(document_type: impl Into<String>, version: u32) -> Self {
        Self {
            document_type: document_type.into(),
            version,
            reducer: None,
            validator: None,
            initial_state: BTreeMap::new(),
        }
    }

    /// Set the reducer.
    pub fn with_reducer(mut self, reducer: impl Reducer + 'static) -> Self {
        self.reducer = Some(Arc::new(reducer));
        self
    }

    /// Set the schema validator.
    pub fn with_validator(mut self, validator: impl ActionValidator + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Set the state a scope starts with.
    pub fn with_initial_state(mut self, scope: impl Into<String>, state: Value) -> Self {
        self.initial_state.insert(scope.into(), state);
        self
    }

    /// Document type this module handles.
    pub fn document_type(&self) -> &str {
        &self.document_type
    }

    /// Model version of this module.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Per-scope state of a new document.
    pub fn initial_state(&self) -> &BTreeMap<String, Value> {
        &self.initial_state
    }

    /// Validate an action's input against the schema.
    pub fn validate(&self, action: &Action) -> Result<(), ReducerError> {
        match &self.validator {
            Some(validator) => validator.validate(action),
            None => Ok(()),
        }
    }

    /// Run the reducer.
    pub fn reduce(&self, document: &Document, action: &Action) -> Result<Reduction, ReducerError> {
        match &self.reducer {
            Some(reducer) => reducer.reduce(document, action),
            None => Err(ReducerError::Failed(format!(
                "{} has no reducer",
                self.document_type
            ))),
        }
    }

    fn check(&self) -> Result<(), RegistryError> {
        if self.document_type.trim().is_empty() {
            return Err(RegistryError::InvalidModule("empty document type".into()));
        }
        if self.reducer.is_none() {
            return Err(RegistryError::InvalidModule(format!(
                "{} has no reducer",
                self.document_type
            )));
        }
        if self.validator.is_none() {
            return Err(RegistryError::InvalidModule(format!(
                "{} has no schema validator",
                self.document_type
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for DocumentModelModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentModelModule")
            .field("document_type", &self.document_type)
            .field("version", &self.version)
            .field("has_reducer", &self.reducer.is_some())
            .field("has_validator", &self.validator.is_some())
            .finish_non_exhaustive()
    }
}

/// Upgrade transforms for one document type, keyed by target version.
#[derive(Clone)]
pub struct UpgradeManifest {
    document_type: String,
    upgrades: BTreeMap<u32, Arc<dyn UpgradeTransform>>,
}

impl UpgradeManifest {
    /// Create an empty manifest.
    pub fn new(document_type: impl Into<String>) -> Self {
        Self {
            document_type: document_type.into(),
            upgrades: BTreeMap::new(),
        }
    }

    /// Add the transform that upgrades `to_version - 1` to `to_version`.
    pub fn with_step(mut self, to_version: u32, transform: impl UpgradeTransform + 'static) -> Self {
        self.upgrades.insert(to_version, Arc::new(transform));
        self
    }

    /// Document type of this manifest.
    pub fn document_type(&self) -> &str {
        &self.document_type
    }

    /// Highest version this manifest upgrades to.
    pub fn latest_version(&self) -> Option<u32> {
        self.upgrades.keys().next_back().copied()
    }
}

impl fmt::Debug for UpgradeManifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradeManifest")
            .field("document_type", &self.document_type)
            .field("versions", &self.upgrades.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// What the job processor needs from a registry.
pub trait DocumentModelResolver: Send + Sync {
    /// Latest module for `document_type`, or `None`.
    fn lookup(&self, document_type: &str) -> Option<Arc<DocumentModelModule>>;

    /// Bring `document` up to the latest version. The default is a no-op.
    fn upgrade_document(&self, document: &Document, _action: &Action) -> Result<Document, RegistryError> {
        Ok(document.clone())
    }
}

/// Resolver that knows no document types.
///
/// Used while bootstrapping, before models are registered: lookups report
/// not-found instead of failing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullResolver;

impl DocumentModelResolver for NullResolver {
    fn lookup(&self, _document_type: &str) -> Option<Arc<DocumentModelModule>> {
        None
    }
}

/// In-memory, version-aware registry.
#[derive(Debug, Default)]
pub struct DocumentModelRegistry {
    modules: RwLock<Vec<Arc<DocumentModelModule>>>,
    manifests: RwLock<HashMap<String, Arc<UpgradeManifest>>>,
}

impl DocumentModelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module.
    pub fn register(&self, module: DocumentModelModule) -> Result<(), RegistryError> {
        module.check()?;
        let mut modules = self.modules.write().unwrap_or_else(PoisonError::into_inner);
        if modules
            .iter()
            .any(|m| m.document_type == module.document_type && m.version == module.version)
        {
            return Err(RegistryError::DuplicateModule {
                document_type: module.document_type,
                version: module.version,
            });
        }
        modules.push(Arc::new(module));
        Ok(())
    }

    /// Remove every version of a type. Returns false if none was registered.
    pub fn unregister(&self, document_type: &str) -> bool {
        let mut modules = self.modules.write().unwrap_or_else(PoisonError::into_inner);
        let before = modules.len();
        modules.retain(|m| m.document_type != document_type);
        modules.len() != before
    }

    /// Latest module for a type.
    pub fn resolve(&self, document_type: &str) -> Result<Arc<DocumentModelModule>, RegistryError> {
        let modules = self.modules.read().unwrap_or_else(PoisonError::into_inner);
        modules
            .iter()
            .filter(|m| m.document_type == document_type)
            .max_by_key(|m| m.version)
            .cloned()
            .ok_or_else(|| RegistryError::ModuleNotFound {
                document_type: document_type.to_string(),
                version: None,
            })
    }

    /// Module for an exact type and version.
    pub fn resolve_version(
        &self,
        document_type: &str,
        version: u32,
    ) -> Result<Arc<DocumentModelModule>, RegistryError> {
        let modules = self.modules.read().unwrap_or_else(PoisonError::into_inner);
        modules
            .iter()
            .find(|m| m.document_type == document_type && m.version == version)
            .cloned()
            .ok_or_else(|| RegistryError::ModuleNotFound {
                document_type: document_type.to_string(),
                version: Some(version),
            })
    }

    /// Registered versions of a type, ascending.
    pub fn supported_versions(&self, document_type: &str) -> Result<Vec<u32>, RegistryError> {
        let modules = self.modules.read().unwrap_or_else(PoisonError::into_inner);
        let mut versions: Vec<u32> = modules
            .iter()
            .filter(|m| m.document_type == document_type)
            .map(|m| m.version)
            .collect();
        if versions.is_empty() {
            return Err(RegistryError::ModuleNotFound {
                document_type: document_type.to_string(),
                version: None,
            });
        }
        versions.sort_unstable();
        Ok(versions)
    }

    /// Highest registered version of a type.
    pub fn latest_version(&self, document_type: &str) -> Result<u32, RegistryError> {
        self.resolve(document_type).map(|m| m.version)
    }

    /// Every registered type, sorted and deduplicated.
    pub fn document_types(&self) -> Vec<String> {
        let modules = self.modules.read().unwrap_or_else(PoisonError::into_inner);
        let mut types: Vec<String> = modules.iter().map(|m| m.document_type.clone()).collect();
        types.sort();
        types.dedup();
        types
    }

    /// Register an upgrade manifest. One per type.
    pub fn register_manifest(&self, manifest: UpgradeManifest) -> Result<(), RegistryError> {
        let mut manifests = self.manifests.write().unwrap_or_else(PoisonError::into_inner);
        if manifests.contains_key(&manifest.document_type) {
            return Err(RegistryError::DuplicateManifest(manifest.document_type));
        }
        manifests.insert(manifest.document_type.clone(), Arc::new(manifest));
        Ok(())
    }

    /// Manifest for a type.
    pub fn manifest(&self, document_type: &str) -> Option<Arc<UpgradeManifest>> {
        let manifests = self.manifests.read().unwrap_or_else(PoisonError::into_inner);
        manifests.get(document_type).cloned()
    }

    /// Every transform needed to go from `from` to `to`, in order.
    ///
    /// Fails if any single step is missing: a chain is never returned partially.
    pub fn compute_upgrade_path(
        &self,
        document_type: &str,
        from: u32,
        to: u32,
    ) -> Result<Vec<(u32, Arc<dyn UpgradeTransform>)>, RegistryError> {
        if from == to {
            return Ok(Vec::new());
        }
        if to < from {
            return Err(RegistryError::DowngradeNotSupported {
                document_type: document_type.to_string(),
                from,
                to,
            });
        }
        let manifest = self
            .manifest(document_type)
            .ok_or_else(|| RegistryError::ManifestNotFound(document_type.to_string()))?;

        (from + 1..=to)
            .map(|version| {
                manifest
                    .upgrades
                    .get(&version)
                    .map(|transform| (version, Arc::clone(transform)))
                    .ok_or_else(|| RegistryError::MissingUpgradeTransition {
                        document_type: document_type.to_string(),
                        from: version - 1,
                        to: version,
                    })
            })
            .collect()
    }

    /// The single transform from `from` to `from + 1`.
    pub fn upgrade_step(
        &self,
        document_type: &str,
        from: u32,
        to: u32,
    ) -> Result<Arc<dyn UpgradeTransform>, RegistryError> {
        if to != from + 1 {
            return Err(RegistryError::InvalidUpgradeStep {
                document_type: document_type.to_string(),
                from,
                to,
            });
        }
        let mut path = self.compute_upgrade_path(document_type, from, to)?;
        path.pop()
            .map(|(_, transform)| transform)
            .ok_or_else(|| RegistryError::MissingUpgradeTransition {
                document_type: document_type.to_string(),
                from,
                to,
            })
    }
}

impl DocumentModelResolver for DocumentModelRegistry {
    fn lookup(&self, document_type: &str) -> Option<Arc<DocumentModelModule>> {
        self.resolve(document_type).ok()
    }

    /// Apply the whole upgrade chain to a copy of `document`.
    ///
    /// The copy is returned only when every step succeeded.
    fn upgrade_document(&self, document: &Document, action: &Action) -> Result<Document, RegistryError> {
        let latest = self.latest_version(&document.document_type)?;
        let path = self.compute_upgrade_path(&document.document_type, document.version, latest)?;

        let mut upgraded = document.clone();
        for (version, transform) in path {
            let from = upgraded.version;
            upgraded = transform
                .upgrade(upgraded, action)
                .map_err(|source| RegistryError::UpgradeFailed {
                    document_type: document.document_type.clone(),
                    from,
                    to: version,
                    source,
                })?;
            upgraded.version = version;
        }
        Ok(upgraded)
    }
}
