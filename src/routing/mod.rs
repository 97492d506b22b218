pub mod dispatch;

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::config::AppConfig;

/// Public model name to upstream model id table.
///
/// Built once from config. Unknown names resolve to themselves, so an
/// unrecognised model is forwarded as-is rather than rejected.
#[derive(Debug, Clone, Default)]
pub struct ModelAliases {
    index: FxHashMap<Box<str>, Arc<str>>,
    /// Public names in sorted order, for the models listing.
    public_names: Vec<Arc<str>>,
}

impl ModelAliases {
    #[must_use]
    pub fn new(config: &AppConfig) -> Self {
        Self::from_pairs(
            config
                .model_aliases
                .iter()
                .map(|(public, upstream)| (public.as_str(), upstream.as_str())),
        )
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut index: FxHashMap<Box<str>, Arc<str>> = FxHashMap::default();
        let mut interned: FxHashMap<&'a str, Arc<str>> = FxHashMap::default();
        for (public, upstream) in pairs {
            let target = interned
                .entry(upstream)
                .or_insert_with(|| Arc::from(upstream))
                .clone();
            index.insert(Box::from(public), target);
        }

        let mut public_names: Vec<Arc<str>> = index.keys().map(|k| Arc::from(&**k)).collect();
        public_names.sort_unstable();
        Self {
            index,
            public_names,
        }
    }

    /// Upstream model id for `requested`, or `requested` itself.
    #[must_use]
    pub fn resolve<'a>(&'a self, requested: &'a str) -> &'a str {
        self.index.get(requested).map_or(requested, |target| &**target)
    }

    #[must_use]
    pub fn public_names(&self) -> &[Arc<str>] {
        &self.public_names
    }
}
