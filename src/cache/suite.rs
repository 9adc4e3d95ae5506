//! Model suites: named compositions of base + refiner + VAE + adapters.
//!
//! Suite components are keyed `sdxl_<suite>_<component>`. Enumerating
//! suites is a derived view over the cache's entries — there is no
//! separate suite table, only a naming convention the cache groups by.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentRole {
    Base,
    Refiner,
    Vae,
    Controlnet,
    Lora,
}

impl ComponentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentRole::Base => "base",
            ComponentRole::Refiner => "refiner",
            ComponentRole::Vae => "vae",
            ComponentRole::Controlnet => "controlnet",
            ComponentRole::Lora => "lora",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "base" => Some(ComponentRole::Base),
            "refiner" => Some(ComponentRole::Refiner),
            "vae" => Some(ComponentRole::Vae),
            "controlnet" => Some(ComponentRole::Controlnet),
            "lora" => Some(ComponentRole::Lora),
            _ => None,
        }
    }

    pub const ALL: [ComponentRole; 5] = [
        ComponentRole::Base,
        ComponentRole::Refiner,
        ComponentRole::Vae,
        ComponentRole::Controlnet,
        ComponentRole::Lora,
    ];
}

/// A requested suite: the suite name plus the file path for each present
/// component. `base` is required; the rest are optional.
#[derive(Debug, Clone)]
pub struct SuiteSpec {
    pub name: String,
    pub components: HashMap<ComponentRole, std::path::PathBuf>,
}

impl SuiteSpec {
    pub fn component_id(&self, role: ComponentRole) -> String {
        format!("sdxl_{}_{}", self.name, role.as_str())
    }
}

/// Derived view synthesized by grouping cached entries whose id matches
/// the `sdxl_<suite>_<component>` pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteRecord {
    pub name: String,
    pub components: HashMap<String, String>,
}

/// Parses a cache entry id into `(suite_name, component)` if it matches
/// the suite naming convention.
pub fn parse_suite_component(model_id: &str) -> Option<(String, ComponentRole)> {
    let rest = model_id.strip_prefix("sdxl_")?;
    let (name, component) = rest.rsplit_once('_')?;
    let role = ComponentRole::from_str(component)?;
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), role))
}
