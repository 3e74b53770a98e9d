//! `--init` scaffolding: a minimal working site.

use std::path::Path;

use basil::error::BasilError;

const CONFIG_TEMPLATE: &str = r#"server:
  host: 127.0.0.1
  port: 8080

site: site

session:
  store: cookie
  max_age: 86400

logging:
  level: info
  format: text
"#;

const INDEX_TEMPLATE: &str = r#"// The handler for every path under /.
let title = "Welcome to basil"

<html>
    <head>
        <title>{title}</title>
    </head>
    <body>
        <h1>{title}</h1>
        <p>Edit site/index.pars and reload.</p>
    </body>
</html>
"#;

pub fn scaffold(dir: &Path) -> Result<(), BasilError> {
    let site = dir.join("site");
    std::fs::create_dir_all(&site)?;
    let config_path = dir.join("basil.yaml");
    if config_path.exists() {
        return Err(BasilError::Config(format!(
            "{} already exists",
            config_path.display()
        )));
    }
    std::fs::write(&config_path, CONFIG_TEMPLATE)?;
    let index = site.join("index.pars");
    if !index.exists() {
        std::fs::write(&index, INDEX_TEMPLATE)?;
    }
    std::fs::create_dir_all(dir.join("lib"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaffold_creates_config_site_and_lib() {
        let dir = tempfile::tempdir().unwrap();
        scaffold(dir.path()).unwrap();
        assert!(dir.path().join("basil.yaml").is_file());
        assert!(dir.path().join("site/index.pars").is_file());
        assert!(dir.path().join("lib").is_dir());
        // Re-running refuses to clobber.
        assert!(scaffold(dir.path()).is_err());
    }
}
