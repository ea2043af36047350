//! Library Registry & Version Resolution
//!
//! The registry deduplicates libraries across independent declarations.
//! Identity is the triple (owner, name, major version) plus the structural
//! identity of the source provider; within one identity the registered
//! version only ever moves up, so concurrent declarations converge on the
//! highest compatible release no matter the order they arrive in.

use crate::context::{Context, Ctx};
use crate::error::{Error, Result};
use crate::module::ModuleRef;
use crate::provider::SourceProvider;
use crate::specifier::{Identifier, LibraryTag};
use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use tracing::debug;

/// The self-description a library's initializer returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub owner: String,
    pub name: String,
    pub version: Version,
}

impl Manifest {
    pub fn new(owner: impl Into<String>, name: impl Into<String>, version: Version) -> Self {
        Manifest {
            owner: owner.into(),
            name: name.into(),
            version,
        }
    }

    /// The `@owner/name` identifier this manifest claims.
    pub fn identifier(&self) -> String {
        format!("@{}/{}", self.owner, self.name)
    }

    pub fn versioned_id(&self) -> VersionedId {
        VersionedId {
            owner: self.owner.clone(),
            name: self.name.clone(),
            major: self.version.major,
        }
    }

    /// A manifest missing its owner or name cannot be registered.
    pub fn validate(&self) -> Result<()> {
        if self.owner.is_empty() || self.name.is_empty() {
            return Err(Error::ManifestIncomplete {
                identifier: self.identifier(),
                message: "owner and name are both required".to_string(),
            });
        }
        Ok(())
    }
}

/// Registry identity of a library: identifier plus major version.
///
/// Different major versions of the same identifier coexist as distinct
/// libraries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionedId {
    pub owner: String,
    pub name: String,
    pub major: u32,
}

impl VersionedId {
    pub fn identifier(&self) -> String {
        format!("@{}/{}", self.owner, self.name)
    }
}

impl std::fmt::Display for VersionedId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}/{}#{}", self.owner, self.name, self.major)
    }
}

/// Options for one declaration.
#[derive(Clone)]
pub struct DeclareOptions {
    /// Local alias bound in the declaring scope once resolved.
    pub alias: Option<String>,
    /// Expected `@owner/name`; a manifest claiming anything else is
    /// rejected. Required when the provider serves no manifest.
    pub identifier: Option<String>,
    /// Version floor, not a pin: any resolved version at or above it
    /// passes.
    pub min_version: Option<Version>,
    pub provider: Rc<dyn SourceProvider>,
}

impl DeclareOptions {
    pub fn new(provider: Rc<dyn SourceProvider>) -> Self {
        DeclareOptions {
            alias: None,
            identifier: None,
            min_version: None,
            provider,
        }
    }

    /// Build options from an `@owner/name[#x.y.z]` specifier string.
    pub fn parse(specifier: &str, provider: Rc<dyn SourceProvider>) -> Result<Self> {
        let tag = LibraryTag::parse(specifier)?;
        Ok(DeclareOptions {
            alias: None,
            identifier: Some(tag.identifier.to_string()),
            min_version: tag.version,
            provider,
        })
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn with_min_version(mut self, version: Version) -> Self {
        self.min_version = Some(version);
        self
    }

    /// The declared identifier parsed, if one was given.
    pub fn parsed_identifier(&self) -> Result<Option<Identifier>> {
        match &self.identifier {
            Some(text) => Ok(Some(Identifier::parse(text)?)),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for DeclareOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeclareOptions")
            .field("alias", &self.alias)
            .field("identifier", &self.identifier)
            .field("min_version", &self.min_version)
            .field("provider", &self.provider.display_name())
            .finish()
    }
}

/// Shared handle to a registered library.
pub type LibraryRef = Rc<RefCell<Library>>;

/// A registered library: identity, the highest version seen so far, the
/// provider modules are fetched through, the defining scope module bodies
/// are parented to, and the cache of loaded modules.
pub struct Library {
    id: VersionedId,
    version: Version,
    provider: Rc<dyn SourceProvider>,
    scope: Ctx,
    modules: HashMap<String, ModuleRef>,
    requesters: Vec<Weak<Context>>,
}

impl Library {
    fn new(id: VersionedId, version: Version, provider: Rc<dyn SourceProvider>, scope: Ctx) -> Self {
        Library {
            id,
            version,
            provider,
            scope,
            modules: HashMap::new(),
            requesters: Vec::new(),
        }
    }

    pub fn id(&self) -> &VersionedId {
        &self.id
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn identifier(&self) -> String {
        self.id.identifier()
    }

    /// Fully-qualified tag at the currently registered version.
    pub fn tag(&self) -> String {
        format!("{}#{}", self.id.identifier(), self.version)
    }

    pub fn provider(&self) -> Rc<dyn SourceProvider> {
        self.provider.clone()
    }

    /// The scope module bodies of this library are parented to.
    pub fn scope(&self) -> Ctx {
        self.scope.clone()
    }

    pub(crate) fn module(&self, name: &str) -> Option<ModuleRef> {
        self.modules.get(name).cloned()
    }

    pub(crate) fn insert_module(&mut self, name: &str, module: ModuleRef) {
        self.modules.insert(name.to_string(), module);
    }

    pub(crate) fn remove_module(&mut self, name: &str) {
        self.modules.remove(name);
    }

    /// Module names currently cached, loaded or still loading.
    pub fn module_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.keys().cloned().collect();
        names.sort();
        names
    }

    fn add_requester(&mut self, ctx: &Ctx) {
        let already = self
            .requesters
            .iter()
            .any(|weak| weak.upgrade().is_some_and(|known| Rc::ptr_eq(&known, ctx)));
        if !already {
            self.requesters.push(Rc::downgrade(ctx));
        }
    }

    /// Whether `ctx` or any of its ancestors declared this library.
    pub fn is_requested_by(&self, ctx: &Ctx) -> bool {
        let mut scope = Some(ctx.clone());
        while let Some(current) = scope {
            let hit = self
                .requesters
                .iter()
                .any(|weak| weak.upgrade().is_some_and(|known| Rc::ptr_eq(&known, &current)));
            if hit {
                return true;
            }
            scope = current.parent().cloned();
        }
        false
    }
}

impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Library")
            .field("tag", &self.tag())
            .field("provider", &self.provider.display_name())
            .field("modules", &self.module_names())
            .finish()
    }
}

/// How a declaration landed in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// First declaration of this identity.
    Created,
    /// Same identity at a strictly higher version; the registered version
    /// moved up and the module cache was kept.
    Upgraded { from: Version },
    /// Same identity at an equal or lower version; the existing entry was
    /// shared unchanged.
    Joined,
}

/// The process-wide library table.
pub struct LibraryRegistry {
    entries: RefCell<Vec<LibraryRef>>,
}

impl LibraryRegistry {
    pub fn new() -> Self {
        LibraryRegistry {
            entries: RefCell::new(Vec::new()),
        }
    }

    /// Merge a validated manifest into the registry.
    ///
    /// `requester` is recorded against the entry either way; `scope`
    /// becomes the defining scope only when this creates the entry.
    pub fn resolve_manifest(
        &self,
        manifest: &Manifest,
        provider: &Rc<dyn SourceProvider>,
        requester: &Ctx,
        scope: Ctx,
    ) -> (LibraryRef, Registration) {
        let id = manifest.versioned_id();
        let existing = self.find(&id, provider.as_ref());

        if let Some(library) = existing {
            let registration = {
                let mut entry = library.borrow_mut();
                entry.add_requester(requester);
                if manifest.version > entry.version {
                    let from = entry.version;
                    entry.version = manifest.version;
                    debug!(library = %entry.tag(), %from, "library version upgraded");
                    Registration::Upgraded { from }
                } else {
                    Registration::Joined
                }
            };
            return (library, registration);
        }

        let mut entry = Library::new(id, manifest.version, provider.clone(), scope);
        entry.add_requester(requester);
        debug!(library = %entry.tag(), "library registered");
        let library = Rc::new(RefCell::new(entry));
        self.entries.borrow_mut().push(library.clone());
        (library, Registration::Created)
    }

    /// Find the entry with this exact identity and provider.
    pub fn find(&self, id: &VersionedId, provider: &dyn SourceProvider) -> Option<LibraryRef> {
        self.entries
            .borrow()
            .iter()
            .find(|entry| {
                let entry = entry.borrow();
                entry.id == *id && entry.provider.identity_eq(provider)
            })
            .cloned()
    }

    /// Resolve a library tag on behalf of `ctx`.
    ///
    /// Only entries requested by `ctx` or one of its ancestors are
    /// eligible; a versioned tag additionally pins the major version and
    /// sets a floor on the rest. Of the eligible entries the highest
    /// registered version wins.
    pub fn find_tag(&self, tag: &LibraryTag, ctx: &Ctx) -> Option<LibraryRef> {
        let mut best: Option<LibraryRef> = None;
        for entry in self.entries.borrow().iter() {
            {
                let candidate = entry.borrow();
                if candidate.id.owner != tag.identifier.owner
                    || candidate.id.name != tag.identifier.name
                {
                    continue;
                }
                if let Some(requested) = tag.version {
                    if candidate.id.major != requested.major || candidate.version < requested {
                        continue;
                    }
                }
                if !candidate.is_requested_by(ctx) {
                    continue;
                }
                if let Some(current) = &best {
                    if candidate.version <= current.borrow().version {
                        continue;
                    }
                }
            }
            best = Some(entry.clone());
        }
        best
    }

    /// Fully-qualified tags of every registered library, sorted.
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .entries
            .borrow()
            .iter()
            .map(|entry| entry.borrow().tag())
            .collect();
        tags.sort();
        tags
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Drop every entry. Intended for test isolation between scenarios.
    pub fn reset(&self) {
        self.entries.borrow_mut().clear();
    }
}

impl Default for LibraryRegistry {
    fn default() -> Self {
        LibraryRegistry::new()
    }
}
