//! Class-tag registry used by graph persistence (§4.6) to reconstruct
//! modules from a saved `(class_tag, init_args)` pair.

use std::collections::BTreeMap;
use std::collections::HashMap;

use crate::error::{Result, RuntimeError};
use crate::meta::MetaValue;

use super::Module;

type Constructor = Box<dyn Fn(&BTreeMap<String, MetaValue>) -> Result<Box<dyn Module>> + Send + Sync>;

/// Maps a `class_tag` to a constructor closure. Host applications register
/// every concrete module type they want to be loadable from a `.rtc` file;
/// a module with no entry fails loading with `UnknownModuleClass`.
#[derive(Default)]
pub struct ModuleRegistry {
    constructors: HashMap<String, Constructor>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, class_tag: impl Into<String>, constructor: F)
    where
        F: Fn(&BTreeMap<String, MetaValue>) -> Result<Box<dyn Module>> + Send + Sync + 'static,
    {
        self.constructors.insert(class_tag.into(), Box::new(constructor));
    }

    pub fn construct(
        &self,
        class_tag: &str,
        init_args: &BTreeMap<String, MetaValue>,
    ) -> Result<Box<dyn Module>> {
        match self.constructors.get(class_tag) {
            Some(ctor) => ctor(init_args),
            None => Err(RuntimeError::UnknownModuleClass(class_tag.to_string())),
        }
    }

    pub fn contains(&self, class_tag: &str) -> bool {
        self.constructors.contains_key(class_tag)
    }
}
