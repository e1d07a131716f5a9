use serde::{Deserialize, Serialize};

/// Limits and options of a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub max_text_size: usize,
    /// Call stack size of the instance, including the reserved area.
    pub stack_size: usize,
    /// Memory size limit of the instance.
    pub max_memory_size: usize,
    /// Entry function name.  Empty means the implicit `_start` function, if
    /// any.
    pub entry: String,
    pub want_instance: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            max_text_size: 16 * 1024 * 1024,
            stack_size: 64 * 1024,
            max_memory_size: 64 * 1024 * 1024,
            entry: String::new(),
            want_instance: false,
        }
    }
}

impl BuildConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
