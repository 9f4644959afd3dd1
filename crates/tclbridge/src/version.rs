//! Version information for a bridge session.

/// tclbridge version from Cargo.toml
pub const TCLBRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Versions on both ends of a session.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct VersionInfo {
    /// Controller library version.
    pub tclbridge: &'static str,
    /// Remote Tcl patchlevel, known after the handshake.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcl: Option<String>,
    /// Remote interpreter executable, known after the handshake.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            tclbridge: TCLBRIDGE_VERSION,
            tcl: None,
            executable: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tcl(mut self, patchlevel: String) -> Self {
        self.tcl = Some(patchlevel);
        self
    }

    pub fn with_executable(mut self, path: String) -> Self {
        self.executable = Some(path);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_info_has_library_version() {
        let info = VersionInfo::new();
        assert_eq!(info.tclbridge, TCLBRIDGE_VERSION);
        assert!(info.tcl.is_none());
        assert!(info.executable.is_none());
    }

    #[test]
    fn version_info_serializes_minimal() {
        let info = VersionInfo {
            tclbridge: "0.1.0",
            tcl: None,
            executable: None,
        };
        insta::assert_json_snapshot!(info, @r#"
        {
          "tclbridge": "0.1.0"
        }
        "#);
    }

    #[test]
    fn version_info_serializes_full() {
        let info = VersionInfo {
            tclbridge: "0.1.0",
            ..Default::default()
        }
        .with_tcl("8.6.13".to_string())
        .with_executable("/usr/bin/tclsh8.6".to_string());
        insta::assert_json_snapshot!(info, @r#"
        {
          "tclbridge": "0.1.0",
          "tcl": "8.6.13",
          "executable": "/usr/bin/tclsh8.6"
        }
        "#);
    }
}
