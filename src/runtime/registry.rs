//! Versioned handler registries.
//!
//! A single generic [`Registry`] stores both orchestration and activity
//! handlers: a name maps to a semver-ordered set of versions. An
//! orchestration resolves through its [`VersionPolicy`] once, when the
//! instance starts, and the chosen version is recorded in history so
//! every later turn replays against the exact same handler. Activities
//! are unversioned in practice and resolve latest.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use semver::Version;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{ActivityContext, ActivityHandler, FnActivity, FnOrchestration, OrchestrationHandler};
use crate::OrchestrationContext;

/// Version assigned by the unversioned `register` calls.
pub const DEFAULT_VERSION: Version = Version::new(1, 0, 0);

/// How a name picks a version when an instance starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionPolicy {
    /// Highest registered version.
    Latest,
    /// A specific registered version.
    Exact(Version),
}

pub struct Registry<H: ?Sized> {
    inner: Arc<HashMap<String, BTreeMap<Version, Arc<H>>>>,
    policies: Arc<HashMap<String, VersionPolicy>>,
}

// H: ?Sized rules out the derived impl.
impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            policies: Arc::clone(&self.policies),
        }
    }
}

pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn OrchestrationHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
            policies: HashMap::new(),
        }
    }

    /// Resolve `name` through its version policy. Used at instance
    /// start; the returned version is what gets pinned in history.
    pub fn resolve(&self, name: &str) -> Option<(Version, Arc<H>)> {
        let versions = self.inner.get(name)?;
        match self.policies.get(name).unwrap_or(&VersionPolicy::Latest) {
            VersionPolicy::Latest => versions
                .iter()
                .next_back()
                .map(|(v, h)| (v.clone(), Arc::clone(h))),
            VersionPolicy::Exact(v) => versions.get(v).map(|h| (v.clone(), Arc::clone(h))),
        }
    }

    /// Resolve the exact version recorded in an instance's history.
    pub fn resolve_exact(&self, name: &str, version: &Version) -> Option<Arc<H>> {
        self.inner.get(name).and_then(|versions| versions.get(version)).map(Arc::clone)
    }
}

pub struct RegistryBuilder<H: ?Sized> {
    map: HashMap<String, BTreeMap<Version, Arc<H>>>,
    policies: HashMap<String, VersionPolicy>,
}

impl<H: ?Sized> RegistryBuilder<H> {
    /// Register a boxed handler under an explicit version. Registering
    /// the same name and version twice keeps the later handler.
    pub fn register_handler(mut self, name: impl Into<String>, version: Version, handler: Arc<H>) -> Self {
        self.map.entry(name.into()).or_default().insert(version, handler);
        self
    }

    /// Pin `name` to resolve an exact version at start instead of
    /// latest. Already-started instances are unaffected.
    pub fn pin_version(mut self, name: impl Into<String>, version: Version) -> Self {
        self.policies.insert(name.into(), VersionPolicy::Exact(version));
        self
    }

    pub fn build(self) -> Registry<H> {
        Registry {
            inner: Arc::new(self.map),
            policies: Arc::new(self.policies),
        }
    }
}

impl RegistryBuilder<dyn OrchestrationHandler> {
    /// Register an orchestration function at [`DEFAULT_VERSION`].
    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.register_versioned(name, DEFAULT_VERSION, f)
    }

    pub fn register_versioned<F, Fut>(self, name: impl Into<String>, version: Version, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.register_handler(name, version, Arc::new(FnOrchestration(f)))
    }
}

impl RegistryBuilder<dyn ActivityHandler> {
    /// Register an activity function over raw string payloads.
    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.register_handler(name, DEFAULT_VERSION, Arc::new(FnActivity(f)))
    }

    /// Register an activity whose input and output go through the JSON
    /// codec. Undecodable input fails the invocation.
    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
    {
        self.register(name, move |_ctx: ActivityContext, raw: String| {
            let call = crate::codec::decode::<In>(&raw).map(&f);
            async move {
                let out = call?.await?;
                crate::codec::encode(&out)
            }
        })
    }
}
