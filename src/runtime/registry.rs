//! Versioned handler registry shared by orchestrations and activities.
//!
//! Orchestrations register under explicit semver versions; an instance pins
//! the resolved version at start and replays under it forever. Activities are
//! unversioned and always stored at 1.0.0 with a Latest policy.

use semver::Version;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use super::{ActivityHandler, FnActivity, FnOrchestration, OrchestrationHandler};
use crate::OrchestrationContext;

const DEFAULT_VERSION: Version = Version::new(1, 0, 0);

/// How new starts of a name resolve to a version.
#[derive(Clone, Debug)]
pub enum VersionPolicy {
    Latest,
    Exact(Version),
}

pub struct Registry<H: ?Sized> {
    inner: Arc<HashMap<String, BTreeMap<Version, Arc<H>>>>,
    policy: Arc<Mutex<HashMap<String, VersionPolicy>>>,
}

impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            policy: Arc::clone(&self.policy),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
            policy: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

pub struct RegistryBuilder<H: ?Sized> {
    map: HashMap<String, BTreeMap<Version, Arc<H>>>,
    policy: HashMap<String, VersionPolicy>,
}

pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn OrchestrationHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
            policy: HashMap::new(),
        }
    }

    /// Resolve a name through its version policy.
    pub fn resolve_handler(&self, name: &str) -> Option<(Version, Arc<H>)> {
        let policy = self
            .policy
            .lock()
            .expect("registry lock")
            .get(name)
            .cloned()
            .unwrap_or(VersionPolicy::Latest);
        let result = match &policy {
            VersionPolicy::Latest => self
                .inner
                .get(name)
                .and_then(|versions| versions.iter().next_back())
                .map(|(v, h)| (v.clone(), Arc::clone(h))),
            VersionPolicy::Exact(v) => self
                .inner
                .get(name)
                .and_then(|versions| versions.get(v))
                .map(|h| (v.clone(), Arc::clone(h))),
        };
        if result.is_none() {
            tracing::debug!(
                target: "durakit::runtime::registry",
                name = %name,
                policy = ?policy,
                registered = ?self.list_names(),
                "registry lookup miss"
            );
        }
        result
    }

    /// Resolve a pinned version exactly; replay after a deploy must find the
    /// execution's original version or fail with a version mismatch.
    pub fn resolve_handler_exact(&self, name: &str, v: &Version) -> Option<Arc<H>> {
        self.inner.get(name).and_then(|versions| versions.get(v)).cloned()
    }

    pub fn set_version_policy(&self, name: &str, policy: VersionPolicy) {
        self.policy
            .lock()
            .expect("registry lock")
            .insert(name.to_string(), policy);
    }

    pub fn list_names(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }

    pub fn list_versions(&self, name: &str) -> Vec<Version> {
        self.inner
            .get(name)
            .map(|versions| versions.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }
}

impl<H: ?Sized> RegistryBuilder<H> {
    pub fn build(self) -> Registry<H> {
        Registry {
            inner: Arc::new(self.map),
            policy: Arc::new(Mutex::new(self.policy)),
        }
    }

    fn insert_versioned(&mut self, kind: &str, name: String, version: Version, handler: Arc<H>) {
        let entry = self.map.entry(name.clone()).or_default();
        if entry.contains_key(&version) {
            panic!("duplicate {kind} registration: {name}@{version}");
        }
        if let Some((latest, _)) = entry.iter().next_back() {
            if &version <= latest {
                panic!("non-monotonic {kind} version for {name}: {version} is not later than {latest}");
            }
        }
        entry.insert(version, handler);
    }
}

impl OrchestrationRegistryBuilder {
    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.register_versioned(name, "1.0.0", f)
    }

    pub fn register_versioned<F, Fut>(mut self, name: impl Into<String>, version: impl AsRef<str>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        let name = name.into();
        let v = match Version::parse(version.as_ref()) {
            Ok(v) => v,
            Err(e) => panic!("invalid semver for orchestration {name}: {e}"),
        };
        self.insert_versioned("orchestration", name, v, Arc::new(FnOrchestration(f)));
        self
    }

    /// JSON-typed registration; inputs decode and outputs encode through the
    /// crate codec.
    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let wrapper = move |ctx: OrchestrationContext, input_s: String| {
            let f = f.clone();
            async move {
                let input: In = crate::codec::decode(&input_s)?;
                let out: Out = f(ctx, input).await?;
                crate::codec::encode(&out)
            }
        };
        self.register(name, wrapper)
    }

    pub fn set_policy(mut self, name: impl Into<String>, policy: VersionPolicy) -> Self {
        self.policy.insert(name.into(), policy);
        self
    }
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(crate::ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        let name = name.into();
        self.insert_versioned("activity", name.clone(), DEFAULT_VERSION, Arc::new(FnActivity(f)));
        self.policy.insert(name, VersionPolicy::Latest);
        self
    }

    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(crate::ActivityContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let wrapper = move |ctx: crate::ActivityContext, input_s: String| {
            let f = f.clone();
            async move {
                let input: In = crate::codec::decode(&input_s)?;
                let out: Out = f(ctx, input).await?;
                crate::codec::encode(&out)
            }
        };
        self.register(name, wrapper)
    }
}
