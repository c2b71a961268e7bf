//! Base toolchain skeleton
//!
//! The files and commands that turn a bare environment into a running
//! dev server before any generated code lands. Generated code may
//! overwrite any scaffold file, including the manifest.

/// Default dependency manifest. Overwritten when the generation ships
/// its own package.json.
pub const PACKAGE_MANIFEST: &str = r#"{
  "name": "preview-app",
  "version": "0.1.0",
  "private": true,
  "scripts": {
    "dev": "node index.js",
    "build": "node --check index.js",
    "test": "echo \"no tests\" && exit 0"
  }
}
"#;

/// Placeholder entry point so the dev server has something to serve
pub const ENTRY_POINT: &str = r#"const http = require('http');

const server = http.createServer((req, res) => {
  res.writeHead(200, { 'Content-Type': 'text/plain' });
  res.end('preview scaffold running\n');
});

server.listen(process.env.PORT || 3000);
"#;

/// Scaffold files written during setup, path -> content
pub fn base_files() -> Vec<(&'static str, &'static str)> {
    vec![("package.json", PACKAGE_MANIFEST), ("index.js", ENTRY_POINT)]
}

/// Install declared dependencies
pub const INSTALL_COMMAND: &str = "npm install --no-audit --no-fund";

/// Start the dev server in the background; the sleep gives it a moment
/// to bind before the next stage runs.
pub const START_DEV_COMMAND: &str = "sh -c 'nohup npm run dev > /tmp/dev.log 2>&1 & sleep 2'";

/// Build the application
pub const BUILD_COMMAND: &str = "npm run build";

/// Minimal functional smoke check
pub const SMOKE_COMMAND: &str = "npm test";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaffold_manifest_is_valid_json() {
        let manifest: serde_json::Value = serde_json::from_str(PACKAGE_MANIFEST).unwrap();
        assert!(manifest["scripts"]["dev"].is_string());
        assert!(manifest["scripts"]["build"].is_string());
    }

    #[test]
    fn test_base_files_include_manifest_and_entry() {
        let files = base_files();
        assert!(files.iter().any(|(p, _)| *p == "package.json"));
        assert!(files.iter().any(|(p, _)| *p == "index.js"));
    }
}
