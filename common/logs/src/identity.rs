use std::fmt;

use serde::{Deserialize, Serialize};

/// One raw log input as seen by one plugin. Adding a plugin gives every existing log a
/// new identity, which is how new plugins get to "reprocess" old files.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceIdentity {
    pub plugin_name: String,
    pub account: String,
    pub container: String,
    pub object_name: String,
}

impl SourceIdentity {
    pub fn new(
        plugin_name: impl Into<String>,
        account: impl Into<String>,
        container: impl Into<String>,
        object_name: impl Into<String>,
    ) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            account: account.into(),
            container: container.into(),
            object_name: object_name.into(),
        }
    }

    /// `account/container/object`, the form used in log lines
    pub fn object_path(&self) -> String {
        format!("{}/{}/{}", self.account, self.container, self.object_name)
    }

    pub fn is_compressed(&self) -> bool {
        self.object_name.ends_with(".gz")
    }
}

impl fmt::Display for SourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.object_path(), self.plugin_name)
    }
}
