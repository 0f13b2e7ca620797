//! Build recipe synthesis.
//!
//! Turns a resolved build profile into a Dockerfile (and an nginx config for
//! static stacks). Output is deterministic: the same inputs always yield the
//! same bytes. A Dockerfile committed to the repository always wins; the
//! synthesizer never overwrites one.

use crate::db::EnvVar;
use crate::detect::{Runtime, StackFamily};
use anyhow::Result;
use std::path::Path;
use tokio::fs;
use tracing::info;

pub const NGINX_CONF_NAME: &str = "slipway-nginx.conf";

/// Everything the synthesizer needs, already merged from the framework
/// profile and per-deployment overrides.
#[derive(Debug, Clone)]
pub struct RecipeSpec {
    pub runtime: Runtime,
    pub family: StackFamily,
    pub install_command: Option<String>,
    pub build_command: Option<String>,
    pub start_command: Option<String>,
    pub output_directory: String,
    pub port: u16,
    pub build_env: Vec<EnvVar>,
}

impl RecipeSpec {
    fn base_image(&self) -> &'static str {
        match self.runtime {
            Runtime::Node => "node:20-alpine",
            Runtime::Python => "python:3.12-slim",
            Runtime::Go => "golang:1.22-alpine",
            Runtime::Rust => "rust:1.79-slim",
            Runtime::Ruby => "ruby:3.3-slim",
            Runtime::Php => "php:8.3-cli",
            Runtime::Static => "nginx:alpine",
        }
    }
}

/// Synthesized files, ready to be written into the workspace.
#[derive(Debug)]
pub struct Recipe {
    pub dockerfile: String,
    pub nginx_conf: Option<String>,
}

/// Build args mirror the deployment's env vars so build tools can see them,
/// each promoted to an ENV for the commands that follow.
fn push_build_env(out: &mut String, env: &[EnvVar]) {
    for var in env {
        out.push_str(&format!("ARG {}\n", var.key));
        out.push_str(&format!("ENV {}=${}\n", var.key, var.key));
    }
}

fn shell_cmd(cmd: &str) -> String {
    format!("CMD [\"sh\", \"-c\", \"{}\"]\n", cmd)
}

pub fn synthesize(spec: &RecipeSpec) -> Recipe {
    match spec.family {
        StackFamily::Server => Recipe {
            dockerfile: server_dockerfile(spec),
            nginx_conf: None,
        },
        StackFamily::Static => Recipe {
            dockerfile: static_dockerfile(spec),
            nginx_conf: Some(nginx_config(spec.port)),
        },
        StackFamily::SimpleServer => Recipe {
            dockerfile: simple_dockerfile(spec),
            nginx_conf: None,
        },
    }
}

/// Build stage plus a slim runtime stage that carries only the production
/// artifact and runs the start command.
fn server_dockerfile(spec: &RecipeSpec) -> String {
    let base = spec.base_image();
    let mut df = String::new();
    df.push_str(&format!("FROM {} AS build\n", base));
    df.push_str("WORKDIR /app\n");
    push_build_env(&mut df, &spec.build_env);
    df.push_str("COPY . .\n");
    if let Some(install) = &spec.install_command {
        df.push_str(&format!("RUN {}\n", install));
    }
    if let Some(build) = &spec.build_command {
        df.push_str(&format!("RUN {}\n", build));
    }
    df.push('\n');
    df.push_str(&format!("FROM {}\n", base));
    df.push_str("WORKDIR /app\n");
    df.push_str("ENV NODE_ENV=production\n");
    df.push_str("COPY --from=build /app/package*.json ./\n");
    df.push_str("COPY --from=build /app/node_modules ./node_modules\n");
    df.push_str(&format!(
        "COPY --from=build /app/{} ./{}\n",
        spec.output_directory, spec.output_directory
    ));
    df.push_str(&format!("EXPOSE {}\n", spec.port));
    if let Some(start) = &spec.start_command {
        df.push_str(&shell_cmd(start));
    }
    df
}

/// Static stacks serve the build output through nginx with an SPA fallback.
/// Without a build command the sources are shipped as-is in a single stage.
fn static_dockerfile(spec: &RecipeSpec) -> String {
    let mut df = String::new();
    if let Some(build) = &spec.build_command {
        df.push_str(&format!("FROM {} AS build\n", spec.base_image()));
        df.push_str("WORKDIR /app\n");
        push_build_env(&mut df, &spec.build_env);
        df.push_str("COPY . .\n");
        if let Some(install) = &spec.install_command {
            df.push_str(&format!("RUN {}\n", install));
        }
        df.push_str(&format!("RUN {}\n", build));
        df.push('\n');
        df.push_str("FROM nginx:alpine\n");
        df.push_str(&format!(
            "COPY {} /etc/nginx/conf.d/default.conf\n",
            NGINX_CONF_NAME
        ));
        df.push_str(&format!(
            "COPY --from=build /app/{} /usr/share/nginx/html\n",
            spec.output_directory
        ));
    } else {
        df.push_str("FROM nginx:alpine\n");
        df.push_str(&format!(
            "COPY {} /etc/nginx/conf.d/default.conf\n",
            NGINX_CONF_NAME
        ));
        let src = if spec.output_directory == "." {
            "."
        } else {
            spec.output_directory.as_str()
        };
        df.push_str(&format!("COPY {} /usr/share/nginx/html\n", src));
    }
    df.push_str(&format!("EXPOSE {}\n", spec.port));
    df
}

/// Single stage: install, optionally build, exec the start command.
fn simple_dockerfile(spec: &RecipeSpec) -> String {
    let mut df = String::new();
    df.push_str(&format!("FROM {}\n", spec.base_image()));
    df.push_str("WORKDIR /app\n");
    push_build_env(&mut df, &spec.build_env);
    df.push_str("COPY . .\n");
    if let Some(install) = &spec.install_command {
        df.push_str(&format!("RUN {}\n", install));
    }
    if let Some(build) = &spec.build_command {
        df.push_str(&format!("RUN {}\n", build));
    }
    df.push_str(&format!("EXPOSE {}\n", spec.port));
    if let Some(start) = &spec.start_command {
        df.push_str(&shell_cmd(start));
    }
    df
}

/// nginx listens on the deployment's own port so the host binding can mirror
/// the container port exactly.
fn nginx_config(port: u16) -> String {
    format!(
        r#"server {{
    listen {port};
    server_name _;
    root /usr/share/nginx/html;
    index index.html;

    location / {{
        try_files $uri $uri/ /index.html;
    }}

    gzip on;
    gzip_types text/css application/javascript application/json image/svg+xml;
}}
"#
    )
}

/// Write the recipe into the workspace. Returns false without touching
/// anything when the repository ships its own Dockerfile.
pub async fn write_recipe(workspace: &Path, spec: &RecipeSpec) -> Result<bool> {
    let dockerfile_path = workspace.join("Dockerfile");
    if fs::try_exists(&dockerfile_path).await? {
        info!("Repository provides a Dockerfile, skipping recipe synthesis");
        return Ok(false);
    }

    let recipe = synthesize(spec);
    fs::write(&dockerfile_path, &recipe.dockerfile).await?;
    if let Some(conf) = &recipe.nginx_conf {
        fs::write(workspace.join(NGINX_CONF_NAME), conf).await?;
    }
    info!(family = ?spec.family, "Synthesized build recipe");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_spec() -> RecipeSpec {
        RecipeSpec {
            runtime: Runtime::Node,
            family: StackFamily::Server,
            install_command: Some("npm ci".into()),
            build_command: Some("npm run build".into()),
            start_command: Some("npm run start".into()),
            output_directory: ".next".into(),
            port: 3000,
            build_env: vec![],
        }
    }

    #[test]
    fn server_recipe_has_two_stages() {
        let recipe = synthesize(&server_spec());
        assert!(recipe.dockerfile.contains("FROM node:20-alpine AS build"));
        assert!(recipe.dockerfile.contains("COPY --from=build /app/.next ./.next"));
        assert!(recipe.dockerfile.contains("EXPOSE 3000"));
        assert!(recipe.nginx_conf.is_none());
    }

    #[test]
    fn static_recipe_serves_through_nginx_with_spa_fallback() {
        let spec = RecipeSpec {
            runtime: Runtime::Node,
            family: StackFamily::Static,
            install_command: Some("npm ci".into()),
            build_command: Some("npm run build".into()),
            start_command: None,
            output_directory: "dist".into(),
            port: 3000,
            build_env: vec![],
        };
        let recipe = synthesize(&spec);
        assert!(recipe.dockerfile.contains("FROM nginx:alpine"));
        assert!(recipe.dockerfile.contains("COPY --from=build /app/dist /usr/share/nginx/html"));
        let conf = recipe.nginx_conf.unwrap();
        assert!(conf.contains("listen 3000;"));
        assert!(conf.contains("try_files $uri $uri/ /index.html"));
    }

    #[test]
    fn plain_html_site_builds_in_one_stage() {
        let spec = RecipeSpec {
            runtime: Runtime::Static,
            family: StackFamily::Static,
            install_command: None,
            build_command: None,
            start_command: None,
            output_directory: ".".into(),
            port: 80,
            build_env: vec![],
        };
        let recipe = synthesize(&spec);
        assert!(!recipe.dockerfile.contains("AS build"));
        assert!(recipe.dockerfile.contains("COPY . /usr/share/nginx/html"));
    }

    #[test]
    fn env_vars_become_build_args() {
        let mut spec = server_spec();
        spec.build_env = vec![EnvVar {
            key: "API_URL".into(),
            value: "https://api.example.com".into(),
        }];
        let recipe = synthesize(&spec);
        assert!(recipe.dockerfile.contains("ARG API_URL"));
        assert!(recipe.dockerfile.contains("ENV API_URL=$API_URL"));
        // values never land in the recipe
        assert!(!recipe.dockerfile.contains("api.example.com"));
    }

    #[test]
    fn synthesis_is_deterministic() {
        let spec = server_spec();
        assert_eq!(synthesize(&spec).dockerfile, synthesize(&spec).dockerfile);
    }

    #[tokio::test]
    async fn existing_dockerfile_is_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();

        let written = write_recipe(dir.path(), &server_spec()).await.unwrap();
        assert!(!written);
        let content = std::fs::read_to_string(dir.path().join("Dockerfile")).unwrap();
        assert_eq!(content, "FROM scratch\n");
    }

    #[tokio::test]
    async fn write_recipe_emits_nginx_conf_for_static() {
        let dir = tempfile::tempdir().unwrap();
        let spec = RecipeSpec {
            runtime: Runtime::Static,
            family: StackFamily::Static,
            install_command: None,
            build_command: None,
            start_command: None,
            output_directory: ".".into(),
            port: 80,
            build_env: vec![],
        };
        assert!(write_recipe(dir.path(), &spec).await.unwrap());
        assert!(dir.path().join("Dockerfile").exists());
        assert!(dir.path().join(NGINX_CONF_NAME).exists());
    }
}
