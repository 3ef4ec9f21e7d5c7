use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A named set of variables substituted into connection configs before an
/// adapter is constructed. At most one Environment in a workspace is marked
/// `default`; CM resolves configs against that one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Environment {
    pub name: String,
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub is_default: bool,
}

impl Environment {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), variables: HashMap::new(), is_default: false }
    }
}
