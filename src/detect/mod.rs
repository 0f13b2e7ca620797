//! Framework detection for deployments.
//!
//! Detection is a pure mapping from a file listing (plus the contents of a
//! small whitelisted manifest set) to a build profile. Rules live in one
//! static registry: adding a framework means adding a table row, never a new
//! branch. A rule matches only when every one of its marker files is present;
//! the highest-priority fully-matched rule wins. Priorities are pairwise
//! distinct so ties cannot occur.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::fs;
use tracing::debug;

/// Manifests whose contents the detector is allowed to inspect.
const MANIFEST_WHITELIST: &[&str] = &[
    "package.json",
    "requirements.txt",
    "go.mod",
    "Cargo.toml",
    "composer.json",
    "Gemfile",
];

/// Closed set of known frameworks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framework {
    NextJs,
    Astro,
    SvelteKit,
    Nuxt,
    Vite,
    CreateReactApp,
    Express,
    NodeGeneric,
    Django,
    Flask,
    FastApi,
    Rails,
    Laravel,
    PythonGeneric,
    GoServer,
    RustServer,
    StaticSite,
}

impl Framework {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NextJs => "nextjs",
            Self::Astro => "astro",
            Self::SvelteKit => "sveltekit",
            Self::Nuxt => "nuxt",
            Self::Vite => "vite",
            Self::CreateReactApp => "create-react-app",
            Self::Express => "express",
            Self::NodeGeneric => "node",
            Self::Django => "django",
            Self::Flask => "flask",
            Self::FastApi => "fastapi",
            Self::Rails => "rails",
            Self::Laravel => "laravel",
            Self::PythonGeneric => "python",
            Self::GoServer => "go",
            Self::RustServer => "rust",
            Self::StaticSite => "static",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        PROFILES
            .iter()
            .find(|p| p.framework.as_str() == s)
            .map(|p| p.framework)
    }

    pub fn profile(&self) -> &'static FrameworkProfile {
        PROFILES
            .iter()
            .find(|p| p.framework == *self)
            .expect("every framework has a profile row")
    }
}

impl std::fmt::Display for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Language runtime a profile builds against. Drives the recipe's base image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    Node,
    Python,
    Go,
    Rust,
    Ruby,
    Php,
    Static,
}

/// How the synthesized recipe is shaped for this stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StackFamily {
    /// Build stage + slim runtime stage executing the start command.
    Server,
    /// Build stage + static-file-serving stage with SPA fallback.
    Static,
    /// Single stage: install, optionally build, exec the start command.
    SimpleServer,
}

/// Per-framework configuration: commands, output dir, default port, and the
/// marker rule that detects it.
#[derive(Debug)]
pub struct FrameworkProfile {
    pub framework: Framework,
    pub runtime: Runtime,
    pub family: StackFamily,
    pub install_command: Option<&'static str>,
    pub build_command: Option<&'static str>,
    pub start_command: Option<&'static str>,
    pub output_directory: Option<&'static str>,
    pub default_port: u16,
    /// Every marker must be present for the rule to match.
    pub markers: &'static [&'static str],
    /// Pairwise distinct across the table.
    pub priority: u8,
}

/// The framework registry. Extend by adding a row.
pub static PROFILES: &[FrameworkProfile] = &[
    FrameworkProfile {
        framework: Framework::NextJs,
        runtime: Runtime::Node,
        family: StackFamily::Server,
        install_command: Some("npm ci"),
        build_command: Some("npm run build"),
        start_command: Some("npm run start"),
        output_directory: Some(".next"),
        default_port: 3000,
        markers: &["package.json", "next.config.js"],
        priority: 90,
    },
    FrameworkProfile {
        framework: Framework::Astro,
        runtime: Runtime::Node,
        family: StackFamily::Static,
        install_command: Some("npm ci"),
        build_command: Some("npm run build"),
        start_command: None,
        output_directory: Some("dist"),
        default_port: 3000,
        markers: &["package.json", "astro.config.mjs"],
        priority: 88,
    },
    FrameworkProfile {
        framework: Framework::SvelteKit,
        runtime: Runtime::Node,
        family: StackFamily::Server,
        install_command: Some("npm ci"),
        build_command: Some("npm run build"),
        start_command: Some("node build"),
        output_directory: Some("build"),
        default_port: 3000,
        markers: &["package.json", "svelte.config.js"],
        priority: 86,
    },
    FrameworkProfile {
        framework: Framework::Nuxt,
        runtime: Runtime::Node,
        family: StackFamily::Server,
        install_command: Some("npm ci"),
        build_command: Some("npm run build"),
        start_command: Some("node .output/server/index.mjs"),
        output_directory: Some(".output"),
        default_port: 3000,
        markers: &["package.json", "nuxt.config.ts"],
        priority: 84,
    },
    FrameworkProfile {
        framework: Framework::Django,
        runtime: Runtime::Python,
        family: StackFamily::SimpleServer,
        install_command: Some("pip install -r requirements.txt"),
        build_command: None,
        start_command: Some("python manage.py runserver 0.0.0.0:8000"),
        output_directory: None,
        default_port: 8000,
        markers: &["manage.py", "requirements.txt"],
        priority: 80,
    },
    FrameworkProfile {
        framework: Framework::Rails,
        runtime: Runtime::Ruby,
        family: StackFamily::SimpleServer,
        install_command: Some("bundle install"),
        build_command: None,
        start_command: Some("bundle exec rails server -b 0.0.0.0"),
        output_directory: None,
        default_port: 3000,
        markers: &["Gemfile", "config.ru"],
        priority: 78,
    },
    FrameworkProfile {
        framework: Framework::Laravel,
        runtime: Runtime::Php,
        family: StackFamily::SimpleServer,
        install_command: Some("composer install --no-dev"),
        build_command: None,
        start_command: Some("php artisan serve --host=0.0.0.0"),
        output_directory: None,
        default_port: 8000,
        markers: &["composer.json", "artisan"],
        priority: 76,
    },
    FrameworkProfile {
        framework: Framework::Vite,
        runtime: Runtime::Node,
        family: StackFamily::Static,
        install_command: Some("npm ci"),
        build_command: Some("npm run build"),
        start_command: None,
        output_directory: Some("dist"),
        default_port: 3000,
        markers: &["package.json", "vite.config.js"],
        priority: 72,
    },
    FrameworkProfile {
        framework: Framework::CreateReactApp,
        runtime: Runtime::Node,
        family: StackFamily::Static,
        install_command: Some("npm ci"),
        build_command: Some("npm run build"),
        start_command: None,
        output_directory: Some("build"),
        default_port: 3000,
        markers: &["package.json", "public/index.html"],
        priority: 70,
    },
    FrameworkProfile {
        framework: Framework::GoServer,
        runtime: Runtime::Go,
        family: StackFamily::SimpleServer,
        install_command: Some("go mod download"),
        build_command: Some("go build -o app ."),
        start_command: Some("./app"),
        output_directory: None,
        default_port: 8080,
        markers: &["go.mod"],
        priority: 60,
    },
    FrameworkProfile {
        framework: Framework::RustServer,
        runtime: Runtime::Rust,
        family: StackFamily::SimpleServer,
        install_command: None,
        build_command: Some("cargo build --release"),
        start_command: Some("./target/release/app"),
        output_directory: None,
        default_port: 8080,
        markers: &["Cargo.toml"],
        priority: 58,
    },
    FrameworkProfile {
        framework: Framework::Express,
        runtime: Runtime::Node,
        family: StackFamily::SimpleServer,
        install_command: Some("npm ci"),
        build_command: None,
        start_command: Some("npm start"),
        output_directory: None,
        default_port: 3000,
        // Only reachable via the content pass.
        markers: &[],
        priority: 44,
    },
    FrameworkProfile {
        framework: Framework::Flask,
        runtime: Runtime::Python,
        family: StackFamily::SimpleServer,
        install_command: Some("pip install -r requirements.txt"),
        build_command: None,
        start_command: Some("flask run --host=0.0.0.0"),
        output_directory: None,
        default_port: 5000,
        markers: &[],
        priority: 42,
    },
    FrameworkProfile {
        framework: Framework::FastApi,
        runtime: Runtime::Python,
        family: StackFamily::SimpleServer,
        install_command: Some("pip install -r requirements.txt"),
        build_command: None,
        start_command: Some("uvicorn main:app --host 0.0.0.0"),
        output_directory: None,
        default_port: 8000,
        markers: &[],
        priority: 40,
    },
    FrameworkProfile {
        framework: Framework::NodeGeneric,
        runtime: Runtime::Node,
        family: StackFamily::SimpleServer,
        install_command: Some("npm ci"),
        build_command: None,
        start_command: Some("npm start"),
        output_directory: None,
        default_port: 3000,
        markers: &["package.json"],
        priority: 30,
    },
    FrameworkProfile {
        framework: Framework::PythonGeneric,
        runtime: Runtime::Python,
        family: StackFamily::SimpleServer,
        install_command: Some("pip install -r requirements.txt"),
        build_command: None,
        start_command: Some("python main.py"),
        output_directory: None,
        default_port: 8000,
        markers: &["requirements.txt"],
        priority: 28,
    },
    FrameworkProfile {
        framework: Framework::StaticSite,
        runtime: Runtime::Static,
        family: StackFamily::Static,
        install_command: None,
        build_command: None,
        start_command: None,
        output_directory: Some("."),
        default_port: 80,
        markers: &["index.html"],
        priority: 10,
    },
];

/// Package manager suggested from lock files, independent of the framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Npm,
    Yarn,
    Pnpm,
    Bun,
}

impl PackageManager {
    pub fn install_command(&self) -> &'static str {
        match self {
            Self::Npm => "npm ci",
            Self::Yarn => "yarn install --frozen-lockfile",
            Self::Pnpm => "pnpm install --frozen-lockfile",
            Self::Bun => "bun install --frozen-lockfile",
        }
    }

    pub fn build_command(&self) -> &'static str {
        match self {
            Self::Npm => "npm run build",
            Self::Yarn => "yarn build",
            Self::Pnpm => "pnpm build",
            Self::Bun => "bun run build",
        }
    }
}

/// Snapshot of a workspace the detector runs against: relative paths (root
/// level plus one directory deep) and the contents of whitelisted manifests.
#[derive(Debug, Default, Clone)]
pub struct FileListing {
    pub files: Vec<String>,
    pub manifests: HashMap<String, String>,
}

impl FileListing {
    pub fn from_paths(files: Vec<String>) -> Self {
        Self {
            files,
            manifests: HashMap::new(),
        }
    }

    pub fn with_manifest(mut self, name: &str, content: &str) -> Self {
        self.manifests.insert(name.to_string(), content.to_string());
        self
    }

    /// Walk a workspace root level plus one directory deep, reading the
    /// whitelisted manifests along the way.
    pub async fn scan(root: &Path) -> anyhow::Result<Self> {
        let mut listing = FileListing::default();
        let mut entries = fs::read_dir(root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(".git") {
                continue;
            }
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                let mut sub = fs::read_dir(entry.path()).await?;
                while let Some(child) = sub.next_entry().await? {
                    let child_name = child.file_name().to_string_lossy().to_string();
                    listing.files.push(format!("{}/{}", name, child_name));
                }
            } else {
                if MANIFEST_WHITELIST.contains(&name.as_str()) {
                    if let Ok(content) = fs::read_to_string(entry.path()).await {
                        listing.manifests.insert(name.clone(), content);
                    }
                }
                listing.files.push(name);
            }
        }
        Ok(listing)
    }

    /// Marker lookup: exact relative path, or basename anywhere in the
    /// (one-level-deep) listing.
    fn has_marker(&self, marker: &str) -> bool {
        self.files.iter().any(|f| {
            f == marker || f.rsplit('/').next() == Some(marker)
        })
    }
}

/// Result of a detection pass.
#[derive(Debug, Clone, Serialize)]
pub struct Detection {
    pub framework: Framework,
    pub confidence: f32,
    pub package_manager: Option<PackageManager>,
}

impl Detection {
    pub fn profile(&self) -> &'static FrameworkProfile {
        self.framework.profile()
    }
}

/// Confidence is a function of the winning rule's priority band.
fn confidence_for(priority: u8) -> f32 {
    match priority {
        70..=u8::MAX => 0.9,
        40..=69 => 0.7,
        _ => 0.5,
    }
}

/// Detect the framework for a file listing. Pure and deterministic:
/// identical listings always produce identical results.
pub fn detect(listing: &FileListing) -> Option<Detection> {
    let marker_match = PROFILES
        .iter()
        .filter(|p| !p.markers.is_empty() && p.markers.iter().all(|m| listing.has_marker(m)))
        .max_by_key(|p| p.priority);

    let package_manager = suggest_package_manager(listing);

    // The content pass refines a generic match into a specific framework and
    // always wins over the marker pass when both apply.
    if let Some(refined) = refine_from_manifests(listing) {
        debug!(framework = %refined, "Framework refined from manifest contents");
        return Some(Detection {
            framework: refined,
            confidence: 0.95,
            package_manager,
        });
    }

    marker_match.map(|p| {
        debug!(framework = %p.framework, priority = p.priority, "Framework matched by markers");
        Detection {
            framework: p.framework,
            confidence: confidence_for(p.priority),
            package_manager,
        }
    })
}

/// Inspect dependency manifests to upgrade a generic runtime match into a
/// specific framework.
fn refine_from_manifests(listing: &FileListing) -> Option<Framework> {
    if let Some(pkg) = listing.manifests.get("package.json") {
        if let Ok(json) = serde_json::from_str::<serde_json::Value>(pkg) {
            let deps = json.get("dependencies").and_then(|d| d.as_object());
            let dev_deps = json.get("devDependencies").and_then(|d| d.as_object());
            let has_dep = |name: &str| -> bool {
                deps.map_or(false, |d| d.contains_key(name))
                    || dev_deps.map_or(false, |d| d.contains_key(name))
            };

            if has_dep("next") {
                return Some(Framework::NextJs);
            }
            if has_dep("astro") {
                return Some(Framework::Astro);
            }
            if has_dep("@sveltejs/kit") {
                return Some(Framework::SvelteKit);
            }
            if has_dep("nuxt") {
                return Some(Framework::Nuxt);
            }
            if has_dep("react-scripts") {
                return Some(Framework::CreateReactApp);
            }
            if has_dep("vite") {
                return Some(Framework::Vite);
            }
            if has_dep("express") {
                return Some(Framework::Express);
            }
        }
    }

    if let Some(reqs) = listing.manifests.get("requirements.txt") {
        let has_req = |name: &str| -> bool {
            reqs.lines().any(|l| {
                let pkg = l
                    .split(&['=', '<', '>', '~', '[', ' '][..])
                    .next()
                    .unwrap_or("")
                    .trim()
                    .to_lowercase();
                pkg == name
            })
        };
        if has_req("django") {
            return Some(Framework::Django);
        }
        if has_req("flask") {
            return Some(Framework::Flask);
        }
        if has_req("fastapi") {
            return Some(Framework::FastApi);
        }
    }

    None
}

/// Lock-file presence independently suggests a package manager.
pub fn suggest_package_manager(listing: &FileListing) -> Option<PackageManager> {
    let checks = [
        ("bun.lockb", PackageManager::Bun),
        ("pnpm-lock.yaml", PackageManager::Pnpm),
        ("yarn.lock", PackageManager::Yarn),
        ("package-lock.json", PackageManager::Npm),
    ];
    checks
        .iter()
        .find(|(lock, _)| listing.has_marker(lock))
        .map(|(_, pm)| *pm)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(files: &[&str]) -> FileListing {
        FileListing::from_paths(files.iter().map(|f| f.to_string()).collect())
    }

    #[test]
    fn priorities_are_pairwise_distinct() {
        let mut seen = std::collections::HashSet::new();
        for p in PROFILES {
            assert!(seen.insert(p.priority), "duplicate priority {}", p.priority);
        }
    }

    #[test]
    fn every_framework_has_a_profile() {
        for p in PROFILES {
            assert_eq!(p.framework.profile().priority, p.priority);
            assert_eq!(Framework::from_str(p.framework.as_str()), Some(p.framework));
        }
    }

    #[test]
    fn plain_html_detects_static() {
        let result = detect(&listing(&["index.html", "styles.css"])).unwrap();
        assert_eq!(result.framework, Framework::StaticSite);
        assert_eq!(result.profile().family, StackFamily::Static);
    }

    #[test]
    fn empty_listing_detects_nothing() {
        assert!(detect(&FileListing::default()).is_none());
    }

    #[test]
    fn never_matches_with_missing_markers() {
        // next.config.js alone (no package.json) must not match Next.js
        let result = detect(&listing(&["next.config.js"]));
        assert!(result.map_or(true, |d| d.framework != Framework::NextJs));
    }

    #[test]
    fn highest_priority_rule_wins() {
        let result = detect(&listing(&["package.json", "next.config.js", "index.html"])).unwrap();
        assert_eq!(result.framework, Framework::NextJs);
        assert!(result.confidence >= 0.9);
    }

    #[test]
    fn generic_node_when_only_package_json() {
        let result = detect(&listing(&["package.json", "server.js"])).unwrap();
        assert_eq!(result.framework, Framework::NodeGeneric);
        assert!(result.confidence < 0.7);
    }

    #[test]
    fn content_pass_upgrades_generic_node() {
        let files = listing(&["package.json", "server.js"])
            .with_manifest("package.json", r#"{"dependencies": {"express": "^4.18.0"}}"#);
        let result = detect(&files).unwrap();
        assert_eq!(result.framework, Framework::Express);
        assert_eq!(result.confidence, 0.95);
    }

    #[test]
    fn content_pass_beats_marker_pass() {
        // vite.config.js marker would say Vite, but the dependency says Next
        let files = listing(&["package.json", "vite.config.js"])
            .with_manifest("package.json", r#"{"dependencies": {"next": "14.0.0"}}"#);
        let result = detect(&files).unwrap();
        assert_eq!(result.framework, Framework::NextJs);
    }

    #[test]
    fn requirements_refine_python() {
        let files = listing(&["requirements.txt", "main.py"])
            .with_manifest("requirements.txt", "fastapi==0.110.0\nuvicorn\n");
        let result = detect(&files).unwrap();
        assert_eq!(result.framework, Framework::FastApi);
    }

    #[test]
    fn detection_is_deterministic() {
        let files = listing(&["package.json", "astro.config.mjs"]);
        let a = detect(&files).unwrap();
        let b = detect(&files).unwrap();
        assert_eq!(a.framework, b.framework);
        assert_eq!(a.confidence, b.confidence);
    }

    #[test]
    fn lockfile_suggests_package_manager() {
        let files = listing(&["package.json", "pnpm-lock.yaml"]);
        assert_eq!(suggest_package_manager(&files), Some(PackageManager::Pnpm));
        let files = listing(&["package.json"]);
        assert_eq!(suggest_package_manager(&files), None);
    }

    #[test]
    fn one_level_deep_markers_match() {
        let result = detect(&listing(&["package.json", "public/index.html"])).unwrap();
        assert_eq!(result.framework, Framework::CreateReactApp);
    }

    #[tokio::test]
    async fn scan_reads_whitelisted_manifests() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("package.json"), r#"{"name":"t"}"#).unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src").join("index.js"), "").unwrap();

        let files = FileListing::scan(dir.path()).await.unwrap();
        assert!(files.has_marker("package.json"));
        assert!(files.files.contains(&"src/index.js".to_string()));
        assert!(files.manifests.contains_key("package.json"));
    }
}
