//! Config Renderer
//!
//! Fills the client configuration template with the gateway endpoint and
//! writes the result readable by its owner only.

use std::fs::OpenOptions;
use std::io::Write;
use std::net::IpAddr;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use tera::{Context, Tera};
use tracing::info;

use crate::error::{describe, Error, Result};

/// Permission bits of the rendered file
pub const OUTPUT_MODE: u32 = 0o400;

/// Render `template_path` with `endpoint = "host:port"` into `output_path`.
/// The output must not exist yet.
pub fn render(
    endpoint_host: &str,
    endpoint_port: u16,
    template_path: &Path,
    output_path: &Path,
) -> Result<()> {
    let failed = |path: &Path, reason: String| Error::Render {
        path: path.display().to_string(),
        reason,
    };

    let template = std::fs::read_to_string(template_path)
        .map_err(|e| failed(template_path, e.to_string()))?;
    let name = template_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "template".to_string());

    let mut tera = Tera::default();
    tera.add_raw_template(&name, &template)
        .map_err(|e| failed(template_path, describe(&e)))?;
    let mut context = Context::new();
    context.insert("endpoint", &endpoint(endpoint_host, endpoint_port));
    let rendered = tera
        .render(&name, &context)
        .map_err(|e| failed(template_path, describe(&e)))?;

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(OUTPUT_MODE)
        .open(output_path)
        .map_err(|e| failed(output_path, e.to_string()))?;
    file.write_all(rendered.as_bytes())
        .and_then(|_| file.sync_all())
        .map_err(|e| failed(output_path, e.to_string()))?;

    info!("Rendered {}", output_path.display());
    Ok(())
}

/// `host:port`, with IPv6 literals bracketed
fn endpoint(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => format!("[{}]:{}", v6, port),
        _ => format!("{}:{}", host, port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn template(dir: &Path, content: &str) -> std::path::PathBuf {
        let path = dir.join("client.toml.tera");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_render_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let tpl = template(dir.path(), "[[peers]]\nendpoint = \"{{ endpoint }}\"\n");
        let out = dir.path().join("client.toml");

        render("localhost", 49161, &tpl, &out).unwrap();
        assert_eq!(
            std::fs::read_to_string(&out).unwrap(),
            "[[peers]]\nendpoint = \"localhost:49161\"\n"
        );
        let mode = std::fs::metadata(&out).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, OUTPUT_MODE);
    }

    #[test]
    fn test_render_bundled_template() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("wgnet.toml");
        let tpl = crate::config::CheckConfig::default().tunnel.template;

        render("10.1.2.3", 51820, &tpl, &out).unwrap();
        let config = wgnet::Config::load(&out).unwrap();
        assert_eq!(config.peers[0].endpoint.as_deref(), Some("10.1.2.3:51820"));
    }

    #[test]
    fn test_ipv6_endpoint() {
        assert_eq!(endpoint("::1", 51820), "[::1]:51820");
        assert_eq!(endpoint("10.0.0.1", 51820), "10.0.0.1:51820");
        assert_eq!(endpoint("docker.internal", 1), "docker.internal:1");
    }

    #[test]
    fn test_render_failures() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.toml");

        let missing = dir.path().join("missing.tera");
        assert!(matches!(render("h", 1, &missing, &out), Err(Error::Render { .. })));

        let broken = template(dir.path(), "endpoint = \"{{ endpoint \"\n");
        assert!(matches!(render("h", 1, &broken, &out), Err(Error::Render { .. })));
        assert!(!out.exists());

        let unknown = template(dir.path(), "endpoint = \"{{ gateway }}\"\n");
        assert!(matches!(render("h", 1, &unknown, &out), Err(Error::Render { .. })));

        // Rendering never replaces an existing file
        let ok = template(dir.path(), "x = 1\n");
        render("h", 1, &ok, &out).unwrap();
        assert!(matches!(render("h", 1, &ok, &out), Err(Error::Render { .. })));
    }
}
